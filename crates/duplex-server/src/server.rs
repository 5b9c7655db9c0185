//! `DuplexServer`: Axum HTTP + `WebSocket` assembly.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use duplex_engine::GenerationEngine;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::admission::AdmissionController;
use crate::auth::{Authenticator, StaticKeys, extract_api_key};
use crate::config::ServerConfig;
use crate::health::{self, HealthResponse, StatusResponse};
use crate::metrics;
use crate::orchestrator::Orchestrator;
use crate::rate_limit::RateLimiter;
use crate::session_store::SessionStore;
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::ws_handler;

/// Shared state handed to every handler and connection actor.
#[derive(Clone)]
pub struct GatewayState {
    /// Runtime configuration.
    pub config: Arc<ServerConfig>,
    /// Global slot pool.
    pub admission: Arc<AdmissionController>,
    /// Rate-limit policy and per-session windows.
    pub rate_limiter: Arc<RateLimiter>,
    /// Session map.
    pub sessions: Arc<SessionStore>,
    /// Engine coordination.
    pub orchestrator: Arc<Orchestrator>,
    /// API key check.
    pub auth: Arc<dyn Authenticator>,
    /// Shutdown signal.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// When the server was built.
    pub start_time: Instant,
    /// Prometheus handle, when a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
}

/// The gateway server.
pub struct DuplexServer {
    state: GatewayState,
}

impl DuplexServer {
    /// Assemble the shared singletons around two engines.
    pub fn new(
        config: ServerConfig,
        tool: Arc<dyn GenerationEngine>,
        chat: Arc<dyn GenerationEngine>,
        metrics: Option<PrometheusHandle>,
    ) -> Self {
        let orchestrator = Orchestrator::new(tool, chat, config.orchestrator.clone());
        let state = GatewayState {
            admission: Arc::new(AdmissionController::new(config.max_connections)),
            rate_limiter: Arc::new(RateLimiter::new(config.rate_limits.clone())),
            sessions: Arc::new(SessionStore::new(config.sessions.clone())),
            orchestrator: Arc::new(orchestrator),
            auth: Arc::new(StaticKeys::new(config.api_keys.clone())),
            shutdown: Arc::new(ShutdownCoordinator::new()),
            start_time: Instant::now(),
            metrics,
            config: Arc::new(config),
        };
        Self { state }
    }

    /// Replace the API key check.
    #[must_use]
    pub fn with_authenticator(mut self, auth: Arc<dyn Authenticator>) -> Self {
        self.state.auth = auth;
        self
    }

    /// Build the router.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/status", get(status_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http())
    }

    /// Bind, start the session sweeper and serve until shutdown.
    ///
    /// Returns the bound address and the server task.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(self.state.config.bind_addr()).await?;
        let addr = listener.local_addr()?;

        let shutdown = &self.state.shutdown;
        let token = shutdown.token();
        let _ = shutdown.spawn(Arc::clone(&self.state.sessions).run_sweeper(
            Arc::clone(&self.state.rate_limiter),
            token.clone(),
        ));

        let router = self.router();
        let handle = shutdown.spawn(async move {
            let served = axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = served {
                error!(error = %e, "server error");
            }
        });

        info!(
            %addr,
            max_connections = self.state.admission.max(),
            mode = ?self.state.config.orchestrator.mode,
            "duplex gateway listening"
        );
        Ok((addr, handle))
    }

    /// Shared state.
    pub fn state(&self) -> &GatewayState {
        &self.state
    }

    /// Runtime configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.state.config
    }

    /// Shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.state.shutdown
    }

    /// Wait until every admission slot is released, up to `grace`.
    pub async fn drain(&self, grace: Duration) -> bool {
        let admission = Arc::clone(&self.state.admission);
        let drained = tokio::time::timeout(grace, async move {
            while admission.snapshot().active > 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .is_ok();
        info!(drained, capacity = ?self.state.admission.snapshot(), "connections drained");
        drained
    }
}

/// GET /health
async fn health_handler(State(state): State<GatewayState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.admission.snapshot().active,
        state.sessions.len(),
        state.shutdown.is_shutting_down(),
    ))
}

/// GET /status
async fn status_handler(
    State(state): State<GatewayState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    if let Err(err) = state.auth.authenticate(extract_api_key(&query, &headers)) {
        return (StatusCode::UNAUTHORIZED, Json(err.to_frame())).into_response();
    }
    Json(StatusResponse {
        capacity: state.admission.snapshot(),
        shutting_down: state.shutdown.is_shutting_down(),
    })
    .into_response()
}

/// GET /metrics
async fn metrics_handler(State(state): State<GatewayState>) -> Response {
    match &state.metrics {
        Some(handle) => metrics::render(handle).into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}
