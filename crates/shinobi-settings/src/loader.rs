//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`ShinobiSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `SHINOBI_*` environment overrides (highest priority)
//! 4. Validate ranges

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::{GraphExecutionMode, ShinobiSettings};

/// `~/.shinobi/settings.json`, or `SHINOBI_SETTINGS` when set.
pub fn settings_path() -> PathBuf {
    if let Some(explicit) = read_env_string("SHINOBI_SETTINGS") {
        return PathBuf::from(explicit);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".shinobi").join("settings.json")
}

pub fn load_settings() -> Result<ShinobiSettings> {
    load_settings_from_path(&settings_path())
}

/// A missing file yields defaults; a malformed one is an error.
pub fn load_settings_from_path(path: &Path) -> Result<ShinobiSettings> {
    load_with_env(path, |name| std::env::var(name).ok())
}

pub(crate) fn load_with_env<F>(path: &Path, env: F) -> Result<ShinobiSettings>
where
    F: Fn(&str) -> Option<String>,
{
    let defaults = serde_json::to_value(ShinobiSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: ShinobiSettings = serde_json::from_value(merged)?;
    apply_env_overrides_with(&mut settings, env);
    settings.validate()?;
    Ok(settings)
}

/// Objects merge per key; arrays and primitives are replaced; nulls in
/// `source` are skipped.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

pub fn apply_env_overrides(settings: &mut ShinobiSettings) {
    apply_env_overrides_with(settings, |name| std::env::var(name).ok());
}

/// Invalid or out-of-range values are logged and ignored.
pub fn apply_env_overrides_with<F>(settings: &mut ShinobiSettings, env: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader(env);

    // ── Specialist ──────────────────────────────────────────────────
    if let Some(v) = env.u64("SHINOBI_MAX_TURNS", 1, 1_000) {
        settings.specialist.max_turns = v as u32;
    }
    if let Some(v) = env.u64("SHINOBI_MAX_CONSECUTIVE_FAILURES", 1, 100) {
        settings.specialist.max_consecutive_failures = v as u32;
    }
    if let Some(v) = env.u64("SHINOBI_CAPABILITY_TIMEOUT_MS", 100, 3_600_000) {
        settings.specialist.capability_timeout_ms = v;
    }
    if let Some(v) = env.u64("SHINOBI_MAX_TOOL_OUTPUT_BYTES", 256, 100_000_000) {
        settings.specialist.max_tool_output_bytes = v as usize;
    }

    // ── Clan / Dojo / Graph ─────────────────────────────────────────
    if let Some(v) = env.u64("SHINOBI_CLAN_MAX_CONCURRENCY", 1, 1_024) {
        settings.clan.max_concurrency = v as usize;
    }
    if let Some(v) = env.u64("SHINOBI_CLAN_TIMEOUT_MS", 1, 86_400_000) {
        settings.clan.timeout_ms = v;
    }
    if let Some(v) = env.u64("SHINOBI_DOJO_MAX_RETRIES", 0, 100) {
        settings.dojo.max_retries = v as u32;
    }
    if let Some(v) = env.string("SHINOBI_GRAPH_EXECUTION") {
        match serde_json::from_value::<GraphExecutionMode>(Value::String(v.clone())) {
            Ok(mode) => settings.graph.execution = mode,
            Err(_) => tracing::warn!(key = "SHINOBI_GRAPH_EXECUTION", value = %v, "invalid env var, ignoring"),
        }
    }

    // ── Gateway ─────────────────────────────────────────────────────
    if let Some(v) = env.u64("SHINOBI_GATEWAY_MAX_RETRIES", 0, 20) {
        settings.gateway.max_retries = v as u32;
    }

    // ── Telemetry ───────────────────────────────────────────────────
    if let Some(v) = env.string("SHINOBI_LOG_LEVEL") {
        settings.telemetry.level = v;
    }
    if let Some(v) = env.bool("SHINOBI_LOG_JSON") {
        settings.telemetry.json = v;
    }
}

/// Accepts (case-insensitive) `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

struct EnvReader<F>(F);

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.0)(name).filter(|v| !v.is_empty())
    }

    fn bool(&self, name: &str) -> Option<bool> {
        let val = self.string(name)?;
        let parsed = parse_bool(&val);
        if parsed.is_none() {
            tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        parsed
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = self.string(name)?;
        let parsed = parse_u64_range(&val, min, max);
        if parsed.is_none() {
            tracing::warn!(key = name, value = %val, min, max, "invalid integer env var, ignoring");
        }
        parsed
    }
}
