//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`DuplexSettings::default()`]
//! 2. If the settings file exists, deep-merge user values over defaults
//! 3. Apply `DUPLEX_*` environment overrides (highest priority)
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{Result, SettingsError};
use crate::types::{DuplexSettings, EngineSettings};

/// Resolve the path to the settings file (`~/.duplex/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".duplex").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<DuplexSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// If the file does not exist, returns defaults. If the file contains
/// invalid JSON, returns an error.
pub fn load_settings_from_path(path: &Path) -> Result<DuplexSettings> {
    let mut settings = load_file_layers(path)?;
    apply_overrides(&mut settings, |name| std::env::var(name).ok());
    Ok(settings)
}

fn load_file_layers(path: &Path) -> Result<DuplexSettings> {
    let defaults = serde_json::to_value(DuplexSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `DUPLEX_*` overrides read through `lookup`.
///
/// Integers must parse and fall inside the listed range, enums must match a
/// serialized variant name. Anything else is logged and ignored, leaving the
/// file or default value in place.
pub fn apply_overrides<F>(settings: &mut DuplexSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader { lookup };

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = env.string("DUPLEX_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.u16("DUPLEX_PORT", 1, 65535) {
        settings.server.port = v;
    }
    if let Some(v) = env.usize("DUPLEX_MAX_CONNECTIONS", 1, 100_000) {
        settings.server.max_connections = v;
    }
    if let Some(v) = env.usize("DUPLEX_MAX_MESSAGE_SIZE", 1024, 64 * 1024 * 1024) {
        settings.server.max_message_size = v;
    }
    if let Some(v) = env.u64("DUPLEX_HANDSHAKE_TIMEOUT_MS", 0, 60_000) {
        settings.server.handshake_acquire_timeout_ms = v;
    }
    if let Some(v) = env.u64("DUPLEX_IDLE_TIMEOUT_SECS", 1, 86_400) {
        settings.server.idle_timeout_secs = v;
    }
    if let Some(v) = env.u16("DUPLEX_IDLE_CLOSE_CODE", 4000, 4999) {
        settings.server.idle_close_code = v;
    }
    if let Some(v) = env.u64("DUPLEX_SEND_TIMEOUT_MS", 100, 600_000) {
        settings.server.send_timeout_ms = v;
    }

    // ── Auth ────────────────────────────────────────────────────────
    if let Some(v) = env.string("DUPLEX_API_KEYS") {
        settings.auth.api_keys = v
            .split(',')
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string)
            .collect();
    }

    // ── Protocol ────────────────────────────────────────────────────
    if let Some(v) = env.string("DUPLEX_CANCEL_SENTINEL") {
        settings.protocol.cancel_sentinel = v;
    }
    if let Some(v) = env.string("DUPLEX_END_SENTINEL") {
        settings.protocol.end_sentinel = v;
    }

    // ── Orchestrator ────────────────────────────────────────────────
    if let Some(v) = env.variant("DUPLEX_ORCHESTRATOR_MODE") {
        settings.orchestrator.mode = v;
    }
    if let Some(v) = env.u64("DUPLEX_TOOL_HARD_TIMEOUT_MS", 1, 60_000) {
        settings.orchestrator.tool_hard_timeout_ms = v;
    }
    if let Some(v) = env.usize("DUPLEX_PREBUFFER_MAX_CHARS", 1, 1_000_000) {
        settings.orchestrator.prebuffer_max_chars = v;
    }
    if let Some(v) = env.u64("DUPLEX_ENGINE_IDLE_TIMEOUT_MS", 100, 600_000) {
        settings.orchestrator.engine_idle_timeout_ms = v;
    }

    // ── Sessions ────────────────────────────────────────────────────
    if let Some(v) = env.u64("DUPLEX_SESSION_TTL_SECS", 1, 7 * 86_400) {
        settings.sessions.idle_ttl_secs = v;
    }
    if let Some(v) = env.usize("DUPLEX_MAX_SESSIONS", 1, 10_000_000) {
        settings.sessions.max_sessions = v;
    }

    // ── Engines ─────────────────────────────────────────────────────
    env.engine("CHAT", &mut settings.engines.chat);
    env.engine("TOOL", &mut settings.engines.tool);

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = env.string("DUPLEX_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.variant("DUPLEX_LOG_FORMAT") {
        settings.logging.format = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a lowercase enum variant name (`"json"`, `"sequential"`, ...).
pub fn parse_variant<T: serde::de::DeserializeOwned>(val: &str) -> Option<T> {
    serde_json::from_value(Value::String(val.trim().to_lowercase())).ok()
}

// ── Env readers (thin wrappers) ─────────────────────────────────────────────

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
    }

    fn string(&self, name: &str) -> Option<String> {
        self.raw(name).filter(|v| !v.is_empty())
    }

    fn checked<T>(&self, name: &str, kind: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
        let val = self.raw(name)?;
        let result = parse(&val);
        if result.is_none() {
            warn!(key = name, value = %val, kind, "invalid env var, ignoring");
        }
        result
    }

    fn u16(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        self.checked(name, "u16", |v| parse_u16_range(v, min, max))
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        self.checked(name, "u64", |v| parse_u64_range(v, min, max))
    }

    fn usize(&self, name: &str, min: usize, max: usize) -> Option<usize> {
        self.checked(name, "usize", |v| parse_usize_range(v, min, max))
    }

    fn variant<T: serde::de::DeserializeOwned>(&self, name: &str) -> Option<T> {
        self.checked(name, "variant", parse_variant::<T>)
    }

    fn engine(&self, role: &str, engine: &mut EngineSettings) {
        if let Some(v) = self.variant(&format!("DUPLEX_{role}_ENGINE_KIND")) {
            engine.kind = v;
        }
        if let Some(v) = self.string(&format!("DUPLEX_{role}_ENGINE_URL")) {
            engine.base_url = v;
        }
        if let Some(v) = self.string(&format!("DUPLEX_{role}_ENGINE_MODEL")) {
            engine.model = v;
        }
        if let Some(v) = self.string(&format!("DUPLEX_{role}_ENGINE_API_KEY")) {
            engine.api_key = Some(v);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde_json::json;

    use super::*;
    use crate::types::{EngineKind, LogFormat, OrchestratorMode};

    fn overrides(pairs: &[(&str, &str)]) -> DuplexSettings {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        let mut settings = DuplexSettings::default();
        apply_overrides(&mut settings, |name| vars.get(name).cloned());
        settings
    }

    // ── deep_merge ──────────────────────────────────────────────────

    #[test]
    fn merge_nested_override() {
        let target = json!({"server": {"port": 8765, "host": "0.0.0.0"}});
        let source = json!({"server": {"port": 9000}});
        let result = deep_merge(target, source);
        assert_eq!(result, json!({"server": {"port": 9000, "host": "0.0.0.0"}}));
    }

    #[test]
    fn merge_array_replace() {
        let target = json!({"keys": ["a", "b"]});
        let source = json!({"keys": ["c"]});
        assert_eq!(deep_merge(target, source), json!({"keys": ["c"]}));
    }

    #[test]
    fn merge_null_preserves_target() {
        let target = json!({"port": 8765});
        let source = json!({"port": null});
        assert_eq!(deep_merge(target, source), json!({"port": 8765}));
    }

    #[test]
    fn merge_new_keys_added() {
        let target = json!({"a": 1});
        let source = json!({"b": 2});
        assert_eq!(deep_merge(target, source), json!({"a": 1, "b": 2}));
    }

    #[test]
    fn merge_primitive_replaces_object() {
        let target = json!({"a": {"nested": true}});
        let source = json!({"a": 5});
        assert_eq!(deep_merge(target, source), json!({"a": 5}));
    }

    // ── file loading ────────────────────────────────────────────────

    #[test]
    fn load_missing_file_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_file_layers(&dir.path().join("missing.json")).unwrap();
        assert_eq!(settings.server.port, 8765);
        assert_eq!(settings.sessions.max_sessions, 10_000);
    }

    #[test]
    fn load_partial_json_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{
                "server": {"maxConnections": 2},
                "auth": {"apiKeys": ["k1"]},
                "rateLimits": {"cancels": {"limit": 3}},
                "orchestrator": {"mode": "sequential"}
            }"#,
        )
        .unwrap();

        let settings = load_file_layers(&path).unwrap();
        assert_eq!(settings.server.max_connections, 2);
        assert_eq!(settings.server.port, 8765);
        assert_eq!(settings.auth.api_keys, vec!["k1".to_string()]);
        assert_eq!(settings.rate_limits.cancels.limit, 3);
        assert_eq!(settings.rate_limits.cancels.window_secs, 10);
        assert_eq!(settings.orchestrator.mode, OrchestratorMode::Sequential);
        assert_eq!(settings.orchestrator.tool_hard_timeout_ms, 300);
    }

    #[test]
    fn load_invalid_json_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = load_file_layers(&path).unwrap_err();
        assert!(matches!(err, SettingsError::Json(_)));
    }

    #[test]
    fn load_wrong_type_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"server": {"port": "high"}}"#).unwrap();
        assert!(load_file_layers(&path).is_err());
    }

    // ── overrides ───────────────────────────────────────────────────

    #[test]
    fn override_server_values() {
        let settings = overrides(&[
            ("DUPLEX_HOST", "127.0.0.1"),
            ("DUPLEX_PORT", "9100"),
            ("DUPLEX_MAX_CONNECTIONS", "3"),
            ("DUPLEX_IDLE_CLOSE_CODE", "4100"),
        ]);
        assert_eq!(settings.server.host, "127.0.0.1");
        assert_eq!(settings.server.port, 9100);
        assert_eq!(settings.server.max_connections, 3);
        assert_eq!(settings.server.idle_close_code, 4100);
    }

    #[test]
    fn override_out_of_range_is_ignored() {
        let settings = overrides(&[
            ("DUPLEX_PORT", "0"),
            ("DUPLEX_MAX_CONNECTIONS", "lots"),
            ("DUPLEX_IDLE_CLOSE_CODE", "1000"),
        ]);
        assert_eq!(settings.server.port, 8765);
        assert_eq!(settings.server.max_connections, 8);
        assert_eq!(settings.server.idle_close_code, 4000);
    }

    #[test]
    fn override_api_keys_splits_commas() {
        let settings = overrides(&[("DUPLEX_API_KEYS", " a , b,,c ")]);
        assert_eq!(settings.auth.api_keys, vec!["a", "b", "c"]);
    }

    #[test]
    fn override_enums() {
        let settings = overrides(&[
            ("DUPLEX_ORCHESTRATOR_MODE", "Sequential"),
            ("DUPLEX_LOG_FORMAT", "json"),
            ("DUPLEX_TOOL_ENGINE_KIND", "http"),
            ("DUPLEX_TOOL_ENGINE_URL", "http://tool:8000"),
        ]);
        assert_eq!(settings.orchestrator.mode, OrchestratorMode::Sequential);
        assert_eq!(settings.logging.format, LogFormat::Json);
        assert_eq!(settings.engines.tool.kind, EngineKind::Http);
        assert_eq!(settings.engines.tool.base_url, "http://tool:8000");
        assert_eq!(settings.engines.chat.kind, EngineKind::Scripted);
    }

    #[test]
    fn override_unknown_variant_is_ignored() {
        let settings = overrides(&[("DUPLEX_ORCHESTRATOR_MODE", "parallel")]);
        assert_eq!(settings.orchestrator.mode, OrchestratorMode::Concurrent);
    }

    #[test]
    fn empty_string_override_is_ignored() {
        let settings = overrides(&[("DUPLEX_HOST", "")]);
        assert_eq!(settings.server.host, "0.0.0.0");
    }

    // ── parse helpers ───────────────────────────────────────────────

    #[test]
    fn parse_ranges() {
        assert_eq!(parse_u16_range("8080", 1, 65535), Some(8080));
        assert_eq!(parse_u16_range("70000", 1, 65535), None);
        assert_eq!(parse_u64_range("5", 10, 20), None);
        assert_eq!(parse_usize_range("15", 10, 20), Some(15));
        assert_eq!(parse_usize_range("-1", 0, 20), None);
    }

    #[test]
    fn parse_variant_is_case_insensitive() {
        assert_eq!(parse_variant::<LogFormat>(" JSON "), Some(LogFormat::Json));
        assert_eq!(parse_variant::<LogFormat>("yaml"), None);
    }
}
