//! Settings sections for the gateway.
//!
//! Every struct uses `camelCase` keys and `#[serde(default)]` so a settings
//! file only needs to name the values it changes.

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DuplexSettings {
    /// Listener, capacity and connection lifecycle.
    pub server: ServerSettings,
    /// Handshake authentication.
    pub auth: AuthSettings,
    /// Plain-text control sentinels.
    pub protocol: ProtocolSettings,
    /// Sliding-window rate limits.
    pub rate_limits: RateLimitSettings,
    /// Turn orchestration.
    pub orchestrator: OrchestratorSettings,
    /// Session store maintenance.
    pub sessions: SessionSettings,
    /// Chat and tool generation engines.
    pub engines: EnginesSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl DuplexSettings {
    /// Reject combinations the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        let server = &self.server;
        if server.max_connections == 0 {
            return Err(SettingsError::invalid("server.maxConnections", "must be at least 1"));
        }
        if server.max_message_size == 0 {
            return Err(SettingsError::invalid("server.maxMessageSize", "must be at least 1"));
        }
        if server.send_queue_capacity == 0 {
            return Err(SettingsError::invalid("server.sendQueueCapacity", "must be at least 1"));
        }
        if server.send_timeout_ms == 0 {
            return Err(SettingsError::invalid("server.sendTimeoutMs", "must be at least 1"));
        }
        if !(4000..=4999).contains(&server.idle_close_code) {
            return Err(SettingsError::invalid(
                "server.idleCloseCode",
                format!("{} is outside the application range 4000-4999", server.idle_close_code),
            ));
        }
        let protocol = &self.protocol;
        if protocol.cancel_sentinel.trim().is_empty() || protocol.end_sentinel.trim().is_empty() {
            return Err(SettingsError::invalid("protocol", "sentinels must not be empty"));
        }
        if protocol.cancel_sentinel == protocol.end_sentinel {
            return Err(SettingsError::invalid(
                "protocol.endSentinel",
                "must differ from protocol.cancelSentinel",
            ));
        }
        if self.sessions.max_sessions == 0 {
            return Err(SettingsError::invalid("sessions.maxSessions", "must be at least 1"));
        }
        for (key, engine) in [
            ("engines.chat.baseUrl", &self.engines.chat),
            ("engines.tool.baseUrl", &self.engines.tool),
        ] {
            if engine.kind == EngineKind::Http && engine.base_url.trim().is_empty() {
                return Err(SettingsError::invalid(key, "required for http engines"));
            }
        }
        Ok(())
    }
}

/// Listener and connection lifecycle settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Listen port.
    pub port: u16,
    /// Largest accepted inbound frame in bytes.
    pub max_message_size: usize,
    /// Connection slots.
    pub max_connections: usize,
    /// How long a handshake waits for a free slot.
    pub handshake_acquire_timeout_ms: u64,
    /// Inactivity budget before the server closes a connection.
    pub idle_timeout_secs: u64,
    /// Close code sent on idle timeout.
    pub idle_close_code: u16,
    /// Outbound frames buffered per connection.
    pub send_queue_capacity: usize,
    /// Longest a single socket write may take before the client counts as stalled.
    pub send_timeout_ms: u64,
    /// How long shutdown waits for connections to drain.
    pub shutdown_grace_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8765,
            max_message_size: 1024 * 1024,
            max_connections: 8,
            handshake_acquire_timeout_ms: 2_000,
            idle_timeout_secs: 150,
            idle_close_code: 4000,
            send_queue_capacity: 1024,
            send_timeout_ms: 5_000,
            shutdown_grace_secs: 10,
        }
    }
}

/// Handshake authentication settings.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthSettings {
    /// Accepted API keys. An empty list rejects every handshake.
    pub api_keys: Vec<String>,
}

/// Plain-text control sentinels.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProtocolSettings {
    /// Text frame that cancels the active turn.
    pub cancel_sentinel: String,
    /// Text frame that ends the connection.
    pub end_sentinel: String,
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            cancel_sentinel: "__CANCEL__".to_string(),
            end_sentinel: "__END__".to_string(),
        }
    }
}

/// A single sliding-window limit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WindowLimit {
    /// Events allowed inside one window. Zero disables the limit.
    pub limit: u32,
    /// Window length in seconds. Zero disables the limit.
    pub window_secs: u64,
}

impl WindowLimit {
    /// Build a limit.
    pub const fn new(limit: u32, window_secs: u64) -> Self {
        Self { limit, window_secs }
    }

    /// Whether this limit is switched off.
    pub const fn is_disabled(&self) -> bool {
        self.limit == 0 || self.window_secs == 0
    }
}

impl Default for WindowLimit {
    fn default() -> Self {
        Self::new(0, 0)
    }
}

/// Rate limits per category.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimitSettings {
    /// General inbound messages, per connection.
    pub messages: WindowLimit,
    /// Cancel requests, per connection.
    pub cancels: WindowLimit,
    /// Persona changes, per session.
    pub persona_updates: WindowLimit,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            messages: WindowLimit::new(60, 60),
            cancels: WindowLimit::new(20, 10),
            persona_updates: WindowLimit::new(5, 60),
        }
    }
}

/// How the tool and chat engines are scheduled within a turn.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrchestratorMode {
    /// Tool and chat run side by side; chat tokens wait behind the toolcall gate.
    #[default]
    Concurrent,
    /// Tool runs first, chat starts after the toolcall frame.
    Sequential,
}

/// Turn orchestration settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OrchestratorSettings {
    /// Scheduling mode.
    pub mode: OrchestratorMode,
    /// Hard cap on the tool decision.
    pub tool_hard_timeout_ms: u64,
    /// Characters of chat output held while the toolcall gate is closed.
    pub prebuffer_max_chars: usize,
    /// Maximum gap between two engine events.
    pub engine_idle_timeout_ms: u64,
    /// Token budget for the tool decision.
    pub tool_max_tokens: u32,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            mode: OrchestratorMode::Concurrent,
            tool_hard_timeout_ms: 300,
            prebuffer_max_chars: 1000,
            engine_idle_timeout_ms: 30_000,
            tool_max_tokens: 16,
        }
    }
}

/// Session store maintenance settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    /// Sessions unseen for this long are evicted.
    pub idle_ttl_secs: u64,
    /// How often the sweeper runs.
    pub sweep_interval_secs: u64,
    /// Upper bound on stored sessions.
    pub max_sessions: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            idle_ttl_secs: 1_800,
            sweep_interval_secs: 60,
            max_sessions: 10_000,
        }
    }
}

/// Engine implementation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Deterministic in-process engine.
    #[default]
    Scripted,
    /// OpenAI-compatible streaming HTTP endpoint.
    Http,
}

/// One generation engine.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineSettings {
    /// Implementation.
    pub kind: EngineKind,
    /// Base URL for `http` engines, e.g. `http://127.0.0.1:8000`.
    pub base_url: String,
    /// Model name sent with each request.
    pub model: String,
    /// Bearer token for the engine endpoint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Connect and first-byte timeout.
    pub request_timeout_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            kind: EngineKind::Scripted,
            base_url: String::new(),
            model: "default".to_string(),
            api_key: None,
            request_timeout_ms: 10_000,
        }
    }
}

/// Chat and tool engines.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EnginesSettings {
    /// Produces the streamed reply.
    pub chat: EngineSettings,
    /// Produces the tool decision.
    pub tool: EngineSettings,
}

/// Log output format.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// Logging settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(DuplexSettings::default()).unwrap();
        assert_eq!(json["server"]["maxConnections"], 8);
        assert_eq!(json["server"]["handshakeAcquireTimeoutMs"], 2000);
        assert_eq!(json["rateLimits"]["personaUpdates"]["windowSecs"], 60);
        assert_eq!(json["orchestrator"]["mode"], "concurrent");
        assert_eq!(json["engines"]["chat"]["kind"], "scripted");
        assert!(json["engines"]["chat"].get("apiKey").is_none());
    }

    #[test]
    fn partial_section_fills_defaults() {
        let settings: DuplexSettings =
            serde_json::from_str(r#"{"server":{"port":9000}}"#).unwrap();
        assert_eq!(settings.server.port, 9000);
        assert_eq!(settings.server.max_connections, 8);
        assert_eq!(settings.rate_limits.cancels, WindowLimit::new(20, 10));
    }

    #[test]
    fn window_limit_disabled() {
        assert!(WindowLimit::new(0, 60).is_disabled());
        assert!(WindowLimit::new(5, 0).is_disabled());
        assert!(!WindowLimit::new(5, 60).is_disabled());
    }

    #[test]
    fn validate_rejects_zero_connections() {
        let mut settings = DuplexSettings::default();
        settings.server.max_connections = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn validate_rejects_non_application_idle_code() {
        let mut settings = DuplexSettings::default();
        settings.server.idle_close_code = 1000;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("idleCloseCode"));
    }

    #[test]
    fn validate_rejects_zero_send_timeout() {
        let mut settings = DuplexSettings::default();
        settings.server.send_timeout_ms = 0;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("sendTimeoutMs"));
    }

    #[test]
    fn validate_rejects_equal_sentinels() {
        let mut settings = DuplexSettings::default();
        settings.protocol.end_sentinel = settings.protocol.cancel_sentinel.clone();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn validate_requires_base_url_for_http() {
        let mut settings = DuplexSettings::default();
        settings.engines.tool.kind = EngineKind::Http;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("engines.tool.baseUrl"));

        settings.engines.tool.base_url = "http://127.0.0.1:8000".into();
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn orchestrator_mode_parses_lowercase() {
        let mode: OrchestratorMode = serde_json::from_str(r#""sequential""#).unwrap();
        assert_eq!(mode, OrchestratorMode::Sequential);
    }
}
