//! # duplex-gateway
//!
//! Gateway binary: loads settings, builds the tool and chat engines and
//! serves the duplex `WebSocket` endpoint until interrupted.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use duplex_engine::{GenerationEngine, HttpEngine, HttpEngineConfig, ScriptedEngine, ScriptedReply};
use duplex_server::config::ServerConfig;
use duplex_server::server::DuplexServer;
use duplex_settings::{DuplexSettings, EngineKind, EngineSettings};

/// Echo delay for the scripted chat engine.
const SCRIPTED_TOKEN_DELAY: Duration = Duration::from_millis(20);

/// Duplex voice-agent gateway.
#[derive(Parser, Debug)]
#[command(name = "duplex-gateway", about = "Duplex voice-agent gateway")]
struct Cli {
    /// Settings file (defaults to `~/.duplex/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Admission slots (overrides settings).
    #[arg(long)]
    max_connections: Option<usize>,
}

impl Cli {
    fn apply(&self, settings: &mut DuplexSettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(max) = self.max_connections {
            settings.server.max_connections = max;
        }
    }
}

fn build_engine(
    role: &str,
    settings: &EngineSettings,
    scripted: impl FnOnce() -> ScriptedEngine,
) -> Result<Arc<dyn GenerationEngine>> {
    match settings.kind {
        EngineKind::Scripted => {
            tracing::info!(role, "using scripted engine");
            Ok(Arc::new(scripted()))
        }
        EngineKind::Http => {
            let config = HttpEngineConfig {
                api_key: settings.api_key.clone(),
                request_timeout: Duration::from_millis(settings.request_timeout_ms),
                ..HttpEngineConfig::new(settings.base_url.clone(), settings.model.clone())
            };
            let engine = HttpEngine::new(config)
                .with_context(|| format!("Failed to build {role} engine"))?;
            tracing::info!(
                role,
                base_url = settings.base_url.as_str(),
                model = settings.model.as_str(),
                "using http engine"
            );
            Ok(Arc::new(engine))
        }
    }
}

#[cfg(unix)]
async fn terminate_signal() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut term = signal(SignalKind::terminate()).context("Failed to listen for SIGTERM")?;
    let _ = term.recv().await;
    Ok(())
}

#[cfg(not(unix))]
async fn terminate_signal() -> Result<()> {
    std::future::pending().await
}

async fn wait_for_signal() -> Result<()> {
    tokio::select! {
        res = tokio::signal::ctrl_c() => res.context("Failed to listen for ctrl-c"),
        res = terminate_signal() => res,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Settings come first: the log level lives there
    let settings_path = cli
        .config
        .clone()
        .unwrap_or_else(duplex_settings::settings_path);
    let mut settings = duplex_settings::load_settings_from_path(&settings_path)
        .with_context(|| format!("Failed to load settings from {}", settings_path.display()))?;
    cli.apply(&mut settings);
    settings.validate().context("Invalid settings")?;

    duplex_logging::init_subscriber(&settings.logging);
    tracing::info!(path = %settings_path.display(), "settings loaded");

    if settings.auth.api_keys.is_empty() {
        tracing::warn!("no API keys configured, every connection will be rejected");
    }

    let tool = build_engine("tool", &settings.engines.tool, || {
        ScriptedEngine::new(ScriptedReply::tokens(["no"]))
    })?;
    let chat = build_engine("chat", &settings.engines.chat, || {
        ScriptedEngine::echo(SCRIPTED_TOKEN_DELAY)
    })?;

    let metrics = match duplex_server::metrics::install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(error = %e, "metrics recorder unavailable, /metrics disabled");
            None
        }
    };

    let config = ServerConfig::from_settings(&settings);
    let grace = config.shutdown_grace;
    let server = DuplexServer::new(config, tool, chat, metrics);
    let (addr, _handle) = server
        .listen()
        .await
        .context("Failed to bind server")?;

    tracing::info!(
        mode = ?settings.orchestrator.mode,
        max_connections = settings.server.max_connections,
        "duplex gateway listening on ws://{addr}/ws"
    );

    wait_for_signal().await?;

    tracing::info!("Shutting down...");
    server.shutdown().shutdown();
    if !server.drain(grace).await {
        tracing::warn!(?grace, "connections still open after grace period");
    }
    if !server.shutdown().graceful_shutdown(grace).await {
        tracing::warn!("background tasks did not stop in time");
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
