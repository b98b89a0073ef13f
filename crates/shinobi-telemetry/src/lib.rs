//! # shinobi-telemetry
//!
//! Installs the global `tracing` subscriber: an `EnvFilter` built from the
//! configured level plus per-module overrides (`RUST_LOG` wins), a json or
//! compact fmt layer on stderr, and an optional [`SinkLayer`] forwarding
//! structured records to a [`LogSink`].

#![deny(unsafe_code)]

mod sink;

pub use sink::{LogRecord, LogSink, MemoryLogSink, SinkLayer};

use std::str::FromStr;
use std::sync::Arc;

use shinobi_settings::TelemetrySettings;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

#[derive(Clone)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by `RUST_LOG`.
    pub log_level: Level,
    /// Per-module level overrides (e.g. `shinobi_engine::clan` => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    pub json: bool,
    pub sink: Option<Arc<dyn LogSink>>,
    /// Lowest level forwarded to `sink`.
    pub sink_level: Level,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: false,
            sink: None,
            sink_level: Level::WARN,
        }
    }
}

impl std::fmt::Debug for TelemetryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryConfig")
            .field("log_level", &self.log_level)
            .field("module_levels", &self.module_levels)
            .field("json", &self.json)
            .field("sink", &self.sink.is_some())
            .field("sink_level", &self.sink_level)
            .finish()
    }
}

impl TelemetryConfig {
    /// Unparseable levels fall back to INFO; unparseable module entries are dropped.
    pub fn from_settings(settings: &TelemetrySettings) -> Self {
        Self {
            log_level: Level::from_str(&settings.level).unwrap_or(Level::INFO),
            module_levels: settings
                .modules
                .iter()
                .filter_map(|(module, level)| {
                    Level::from_str(level).ok().map(|l| (module.clone(), l))
                })
                .collect(),
            json: settings.json,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn LogSink>, level: Level) -> Self {
        self.sink = Some(sink);
        self.sink_level = level;
        self
    }

    /// Filter directive string, e.g. `info,shinobi_engine=debug`.
    pub fn filter_directives(&self) -> String {
        let mut filter = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter
    }
}

/// Holds the sink installed by [`init_telemetry`], if any.
pub struct TelemetryGuard {
    sink: Option<Arc<dyn LogSink>>,
    installed: bool,
}

impl TelemetryGuard {
    pub fn sink(&self) -> Option<&Arc<dyn LogSink>> {
        self.sink.as_ref()
    }

    /// False when another global subscriber was already set.
    pub fn installed(&self) -> bool {
        self.installed
    }
}

/// Install the global subscriber. Safe to call more than once; later calls
/// leave the first subscriber in place.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directives()));

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_writer(std::io::stderr)
            .with_filter(env_filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .compact()
            .with_target(true)
            .with_writer(std::io::stderr)
            .with_filter(env_filter)
            .boxed()
    };

    let sink_layer = config
        .sink
        .clone()
        .map(|sink| SinkLayer::new(sink, config.sink_level));

    let installed = tracing_subscriber::registry()
        .with(fmt_layer)
        .with(sink_layer)
        .try_init()
        .is_ok();

    TelemetryGuard {
        sink: config.sink,
        installed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_include_modules() {
        let config = TelemetryConfig {
            log_level: Level::WARN,
            module_levels: vec![("shinobi_engine".into(), Level::DEBUG)],
            ..TelemetryConfig::default()
        };
        assert_eq!(config.filter_directives(), "warn,shinobi_engine=debug");
    }

    #[test]
    fn from_settings_parses_levels() {
        let settings = TelemetrySettings {
            level: "debug".into(),
            json: true,
            modules: vec![
                ("shinobi_llm".into(), "trace".into()),
                ("bogus".into(), "loudest".into()),
            ],
        };
        let config = TelemetryConfig::from_settings(&settings);
        assert_eq!(config.log_level, Level::DEBUG);
        assert!(config.json);
        assert_eq!(config.module_levels, vec![("shinobi_llm".to_string(), Level::TRACE)]);
    }

    #[test]
    fn init_is_idempotent() {
        let sink: Arc<dyn LogSink> = Arc::new(MemoryLogSink::new(8));
        let first = init_telemetry(TelemetryConfig::default().with_sink(sink, Level::INFO));
        let second = init_telemetry(TelemetryConfig::default());
        assert!(first.sink().is_some());
        assert!(!second.installed() || !first.installed());
    }
}
