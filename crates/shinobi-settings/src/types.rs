//! Settings sections. Field names are camelCase in JSON; every section is
//! `#[serde(default)]` so partial files are accepted.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ShinobiSettings {
    pub version: String,
    pub specialist: SpecialistSettings,
    pub clan: ClanSettings,
    pub dojo: DojoSettings,
    pub graph: GraphSettings,
    pub gateway: GatewaySettings,
    pub telemetry: TelemetrySettings,
}

impl Default for ShinobiSettings {
    fn default() -> Self {
        Self {
            version: "0.1.0".to_string(),
            specialist: SpecialistSettings::default(),
            clan: ClanSettings::default(),
            dojo: DojoSettings::default(),
            graph: GraphSettings::default(),
            gateway: GatewaySettings::default(),
            telemetry: TelemetrySettings::default(),
        }
    }
}

impl ShinobiSettings {
    /// Reject values that would make the runtime unable to progress.
    pub fn validate(&self) -> Result<()> {
        let checks = [
            (self.specialist.max_turns == 0, "specialist.maxTurns must be >= 1"),
            (
                self.specialist.max_consecutive_failures == 0,
                "specialist.maxConsecutiveFailures must be >= 1",
            ),
            (self.clan.max_concurrency == 0, "clan.maxConcurrency must be >= 1"),
            (self.graph.max_concurrency == 0, "graph.maxConcurrency must be >= 1"),
            (
                !(0.0..=1.0).contains(&self.gateway.jitter_factor),
                "gateway.jitterFactor must be within 0.0..=1.0",
            ),
        ];
        match checks.iter().find(|(bad, _)| *bad) {
            Some((_, message)) => Err(SettingsError::InvalidValue((*message).to_string())),
            None => Ok(()),
        }
    }
}

/// Limits for one Specialist's tool-calling loop.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SpecialistSettings {
    /// Hard cap on model turns, independent of capability failures.
    pub max_turns: u32,
    pub max_consecutive_failures: u32,
    pub capability_timeout_ms: u64,
    pub max_tool_output_bytes: usize,
}

impl Default for SpecialistSettings {
    fn default() -> Self {
        Self {
            max_turns: 10,
            max_consecutive_failures: 3,
            capability_timeout_ms: 120_000,
            max_tool_output_bytes: 100_000,
        }
    }
}

impl SpecialistSettings {
    pub fn capability_timeout(&self) -> Duration {
        Duration::from_millis(self.capability_timeout_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClanSettings {
    pub max_concurrency: usize,
    pub timeout_ms: u64,
    /// How long cancelled branches get to unwind before they are aborted.
    pub cancel_grace_ms: u64,
}

impl Default for ClanSettings {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            timeout_ms: 300_000,
            cancel_grace_ms: 2_000,
        }
    }
}

impl ClanSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DojoSettings {
    pub max_retries: u32,
}

impl Default for DojoSettings {
    fn default() -> Self {
        Self { max_retries: 2 }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphExecutionMode {
    #[default]
    Sequential,
    Concurrent,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GraphSettings {
    pub execution: GraphExecutionMode,
    /// Upper bound on modules running at once in concurrent mode.
    pub max_concurrency: usize,
}

impl Default for GraphSettings {
    fn default() -> Self {
        Self {
            execution: GraphExecutionMode::Sequential,
            max_concurrency: 4,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewaySettings {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_factor: f64,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_cooldown_ms: u64,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            jitter_factor: 0.2,
            circuit_breaker_threshold: 5,
            circuit_breaker_cooldown_ms: 60_000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TelemetrySettings {
    /// Default level directive; `RUST_LOG` takes precedence.
    pub level: String,
    pub json: bool,
    /// Per-target overrides, e.g. `("shinobi_engine::clan", "debug")`.
    pub modules: Vec<(String, String)>,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            modules: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let s = ShinobiSettings::default();
        assert_eq!(s.specialist.max_turns, 10);
        assert_eq!(s.specialist.max_consecutive_failures, 3);
        assert_eq!(s.specialist.capability_timeout(), Duration::from_secs(120));
        assert_eq!(s.clan.max_concurrency, 4);
        assert_eq!(s.clan.cancel_grace(), Duration::from_secs(2));
        assert_eq!(s.dojo.max_retries, 2);
        assert_eq!(s.graph.execution, GraphExecutionMode::Sequential);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let s: ShinobiSettings =
            serde_json::from_str(r#"{"clan": {"maxConcurrency": 2}}"#).unwrap();
        assert_eq!(s.clan.max_concurrency, 2);
        assert_eq!(s.clan.timeout_ms, 300_000);
        assert_eq!(s.specialist.max_turns, 10);
    }

    #[test]
    fn camel_case_wire_format() {
        let json = serde_json::to_value(ShinobiSettings::default()).unwrap();
        assert_eq!(json["specialist"]["maxConsecutiveFailures"], 3);
        assert_eq!(json["graph"]["execution"], "sequential");
    }

    #[test]
    fn zero_concurrency_is_invalid() {
        let mut s = ShinobiSettings::default();
        s.clan.max_concurrency = 0;
        let err = s.validate().unwrap_err();
        assert!(err.to_string().contains("clan.maxConcurrency"));
    }
}
