//! Gateway error taxonomy.
//!
//! | variant | `error_code` | effect |
//! |---|---|---|
//! | `Authentication` | `authentication_failed` | handshake closed, no slot consumed |
//! | `CapacityExceeded` | `server_at_capacity` | handshake closed, client retries with backoff |
//! | `RateLimited` | `rate_limited` | message dropped, connection stays open |
//! | `MalformedMessage` | `malformed_message` | reported, connection stays open |
//! | `GenerationEngine` | `generation_failed` | turn resolved with a `done` frame |
//! | `IdleTimeout` | `idle_timeout` | connection closed with the idle close code |

use serde::Serialize;
use std::fmt;
use thiserror::Error;

use crate::protocol::inbound::ProtocolError;
use crate::protocol::outbound::{DoneError, ErrorFrame, ServerFrame};

/// Point-in-time view of the admission slot pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct CapacitySnapshot {
    /// Slots currently held.
    pub active: usize,
    /// Pool size.
    pub max: usize,
    /// Slots free right now.
    pub available: usize,
    /// `available == 0`.
    pub at_capacity: bool,
}

impl CapacitySnapshot {
    /// Build a snapshot from the active count and pool size.
    pub fn new(active: usize, max: usize) -> Self {
        let available = max.saturating_sub(active);
        Self {
            active,
            max,
            available,
            at_capacity: available == 0,
        }
    }
}

/// Which kind of event a rate limit counts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitCategory {
    /// Any client message.
    Message,
    /// Cancel messages.
    Cancel,
    /// Persona changes on a session.
    PersonaUpdate,
}

impl RateLimitCategory {
    /// Wire / metric label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Cancel => "cancel",
            Self::PersonaUpdate => "persona_update",
        }
    }
}

impl fmt::Display for RateLimitCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whose window a rate limit is tracked against.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitScope {
    /// One transport connection.
    Connection,
    /// One `session_id`, across connections.
    Session,
}

impl fmt::Display for RateLimitScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connection => "connection",
            Self::Session => "session",
        })
    }
}

/// Errors surfaced to clients.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// Missing or invalid API key.
    #[error("authentication failed: {reason}")]
    Authentication {
        /// Why the key was rejected.
        reason: String,
    },

    /// No admission slot became free within the handshake timeout.
    #[error("server at capacity ({}/{} slots in use)", snapshot.active, snapshot.max)]
    CapacityExceeded {
        /// Pool state at rejection time.
        snapshot: CapacitySnapshot,
    },

    /// A sliding-window limit was exceeded.
    #[error("rate limit exceeded for {category} ({scope}); retry in {retry_after_ms}ms")]
    RateLimited {
        /// What was being counted.
        category: RateLimitCategory,
        /// Whose window.
        scope: RateLimitScope,
        /// Time until the oldest event leaves the window.
        retry_after_ms: u64,
    },

    /// Unparseable message or unknown type.
    #[error("malformed message: {reason}")]
    MalformedMessage {
        /// What was wrong.
        reason: String,
    },

    /// A generation backend failed or timed out.
    #[error("generation failed ({engine}): {message}")]
    GenerationEngine {
        /// Engine name.
        engine: String,
        /// Failure description.
        message: String,
    },

    /// No inbound activity within the idle timeout.
    #[error("connection idle for {idle_secs}s")]
    IdleTimeout {
        /// Configured timeout.
        idle_secs: u64,
    },
}

impl GatewayError {
    /// Stable machine-readable code.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Authentication { .. } => "authentication_failed",
            Self::CapacityExceeded { .. } => "server_at_capacity",
            Self::RateLimited { .. } => "rate_limited",
            Self::MalformedMessage { .. } => "malformed_message",
            Self::GenerationEngine { .. } => "generation_failed",
            Self::IdleTimeout { .. } => "idle_timeout",
        }
    }

    /// Whether the error ends the handshake (no connection actor is started).
    pub fn is_handshake_fatal(&self) -> bool {
        matches!(
            self,
            Self::Authentication { .. } | Self::CapacityExceeded { .. }
        )
    }

    /// Whether a client may reasonably retry the same action later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::CapacityExceeded { .. } | Self::RateLimited { .. } | Self::GenerationEngine { .. }
        )
    }

    /// Render as an `error` frame.
    pub fn to_frame(&self) -> ServerFrame {
        self.to_frame_for(None)
    }

    /// Render as an `error` frame tied to a turn's `request_id`.
    pub fn to_frame_for(&self, request_id: Option<String>) -> ServerFrame {
        let mut frame = ErrorFrame {
            error_code: self.error_code().to_owned(),
            message: self.to_string(),
            category: None,
            scope: None,
            retry_after_ms: None,
            capacity: None,
            request_id,
        };
        match self {
            Self::RateLimited {
                category,
                scope,
                retry_after_ms,
            } => {
                frame.category = Some(*category);
                frame.scope = Some(*scope);
                frame.retry_after_ms = Some(*retry_after_ms);
            }
            Self::CapacityExceeded { snapshot } => {
                frame.capacity = Some(*snapshot);
            }
            _ => {}
        }
        ServerFrame::Error(frame)
    }

    /// Detail attached to the `done` frame of a failed turn.
    pub fn to_done_error(&self) -> DoneError {
        DoneError {
            error_code: self.error_code().to_owned(),
            message: self.to_string(),
        }
    }
}

impl From<ProtocolError> for GatewayError {
    fn from(e: ProtocolError) -> Self {
        Self::MalformedMessage {
            reason: e.to_string(),
        }
    }
}
