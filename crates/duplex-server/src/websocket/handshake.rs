//! `GET /ws`: authentication and admission before the connection actor starts.

use std::collections::HashMap;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use duplex_core::errors::GatewayError;
use duplex_core::protocol::close_code;
use metrics::counter;
use tracing::{debug, warn};

use crate::auth::extract_api_key;
use crate::metrics::HANDSHAKE_REJECTIONS_TOTAL;
use crate::server::GatewayState;

use super::connection;

/// Upgrade handler.
///
/// The API key is checked before any capacity is consumed. The admission
/// slot is acquired with a bounded wait and moved into the actor, whose
/// finalizer releases it.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    State(state): State<GatewayState>,
) -> Response {
    let ws = ws.max_message_size(state.config.max_message_size);

    if let Err(err) = state.auth.authenticate(extract_api_key(&query, &headers)) {
        warn!(error = %err, "handshake rejected");
        counter!(HANDSHAKE_REJECTIONS_TOTAL, "reason" => "authentication").increment(1);
        return ws.on_upgrade(move |socket| reject(socket, err, close_code::POLICY_VIOLATION));
    }

    match state
        .admission
        .acquire(state.config.handshake_acquire_timeout)
        .await
    {
        Ok(slot) => {
            debug!(snapshot = ?state.admission.snapshot(), "admission slot acquired");
            ws.on_upgrade(move |socket| connection::run(socket, state, slot))
        }
        Err(snapshot) => {
            warn!(active = snapshot.active, max = snapshot.max, "handshake rejected: at capacity");
            counter!(HANDSHAKE_REJECTIONS_TOTAL, "reason" => "capacity").increment(1);
            let err = GatewayError::CapacityExceeded { snapshot };
            ws.on_upgrade(move |socket| reject(socket, err, close_code::TRY_AGAIN_LATER))
        }
    }
}

/// Send the error frame and close. No actor runs and no slot is held.
async fn reject(mut socket: WebSocket, err: GatewayError, code: u16) {
    let frame = err.to_frame().to_json();
    if socket.send(Message::Text(frame.into())).await.is_err() {
        return;
    }
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: err.error_code().into(),
        })))
        .await;
}
