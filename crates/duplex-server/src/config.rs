//! Runtime configuration for the gateway, derived from [`DuplexSettings`].

use std::time::Duration;

use duplex_core::protocol::{Sentinels, close_code};
use duplex_settings::{DuplexSettings, RateLimitSettings};

use crate::orchestrator::OrchestratorConfig;
use crate::session_store::SessionStoreConfig;

/// Configuration for [`DuplexServer`](crate::server::DuplexServer).
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Max `WebSocket` message size in bytes.
    pub max_message_size: usize,
    /// Admission slots.
    pub max_connections: usize,
    /// How long a handshake may wait for a slot.
    pub handshake_acquire_timeout: Duration,
    /// Close a connection after this long without inbound activity.
    pub idle_timeout: Duration,
    /// Close code used for idle timeouts.
    pub idle_close_code: u16,
    /// Outbound frames buffered per connection.
    pub send_queue_capacity: usize,
    /// Bound on a single socket write; a slower client is dropped.
    pub send_timeout: Duration,
    /// How long shutdown waits for connections to drain.
    pub shutdown_grace: Duration,
    /// Accepted API keys.
    pub api_keys: Vec<String>,
    /// Plain-text control sentinels.
    pub sentinels: Sentinels,
    /// Sliding-window limits.
    pub rate_limits: RateLimitSettings,
    /// Turn orchestration.
    pub orchestrator: OrchestratorConfig,
    /// Session store maintenance.
    pub sessions: SessionStoreConfig,
}

impl ServerConfig {
    /// Build from loaded settings.
    pub fn from_settings(settings: &DuplexSettings) -> Self {
        let server = &settings.server;
        Self {
            host: server.host.clone(),
            port: server.port,
            max_message_size: server.max_message_size,
            max_connections: server.max_connections,
            handshake_acquire_timeout: Duration::from_millis(server.handshake_acquire_timeout_ms),
            idle_timeout: Duration::from_secs(server.idle_timeout_secs),
            idle_close_code: server.idle_close_code,
            send_queue_capacity: server.send_queue_capacity,
            send_timeout: Duration::from_millis(server.send_timeout_ms),
            shutdown_grace: Duration::from_secs(server.shutdown_grace_secs),
            api_keys: settings.auth.api_keys.clone(),
            sentinels: Sentinels {
                cancel: settings.protocol.cancel_sentinel.clone(),
                end: settings.protocol.end_sentinel.clone(),
            },
            rate_limits: settings.rate_limits.clone(),
            orchestrator: OrchestratorConfig::from_settings(&settings.orchestrator),
            sessions: SessionStoreConfig::from_settings(&settings.sessions),
        }
    }

    /// `host:port` for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_message_size: 1024 * 1024,
            max_connections: 8,
            handshake_acquire_timeout: Duration::from_secs(2),
            idle_timeout: Duration::from_secs(150),
            idle_close_code: close_code::IDLE_TIMEOUT,
            send_queue_capacity: 1024,
            send_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(10),
            api_keys: Vec::new(),
            sentinels: Sentinels::default(),
            rate_limits: RateLimitSettings::default(),
            orchestrator: OrchestratorConfig::default(),
            sessions: SessionStoreConfig::default(),
        }
    }
}
