//! Frames the server writes to clients.
//!
//! Within one turn the order is always
//! `toolcall → token* → done`, or a single `done{cancelled:true}`.

use serde::Serialize;

use crate::errors::{CapacitySnapshot, RateLimitCategory, RateLimitScope};

/// Outcome of the tool-call classifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    /// The utterance calls for a tool.
    Yes,
    /// No tool call.
    No,
}

impl ToolStatus {
    /// Parse a classifier completion.
    ///
    /// `yes` when the first word is "yes" (case-insensitive) or the text
    /// contains a `<tool_call>` marker.
    pub fn from_completion(raw: &str) -> Self {
        if raw.contains("<tool_call>") {
            return Self::Yes;
        }
        let first_word = raw
            .split(|c: char| !c.is_alphanumeric())
            .find(|w| !w.is_empty())
            .unwrap_or_default();
        if first_word.eq_ignore_ascii_case("yes") {
            Self::Yes
        } else {
            Self::No
        }
    }
}

/// Why a `toolcall` frame was synthesised instead of decided.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolcallReason {
    /// The hard timeout fired before the classifier answered.
    Timeout,
    /// The classifier failed.
    Error,
}

/// `{"type":"toolcall", ...}`
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ToolcallFrame {
    /// Decision.
    pub status: ToolStatus,
    /// Raw classifier text.
    pub raw: String,
    /// Present only when no real decision was made.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<ToolcallReason>,
    /// Echo of the turn's `request_id`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// Aggregate counters reported on `done`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TurnUsage {
    /// Chat tokens streamed to the client.
    pub chat_tokens: u32,
    /// Prompt tokens reported by the chat engine.
    pub prompt_tokens: u32,
    /// Tokens produced by the tool-call engine.
    pub tool_tokens: u32,
    /// Milliseconds from turn start to the toolcall frame.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub toolcall_ms: Option<u64>,
    /// Milliseconds from turn start to the first chat token frame.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttft_ms: Option<u64>,
    /// Milliseconds from turn start to `done`.
    pub total_ms: u64,
    /// Chat tokens held back while waiting for the tool decision.
    pub prebuffered_tokens: u32,
    /// Whether the tool decision hit the hard timeout.
    pub tool_timed_out: bool,
}

/// Error detail attached to a `done` frame when generation failed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DoneError {
    /// Stable error code.
    pub error_code: String,
    /// Human-readable description.
    pub message: String,
}

/// `{"type":"done", ...}`
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DoneFrame {
    /// Usage counters (absent on cancellation).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TurnUsage>,
    /// `true` when the turn was cancelled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancelled: Option<bool>,
    /// Echo of the client's `request_id`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Engine failure detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<DoneError>,
}

impl DoneFrame {
    /// Normal completion.
    pub fn completed(usage: TurnUsage, request_id: Option<String>) -> Self {
        Self {
            usage: Some(usage),
            request_id,
            ..Self::default()
        }
    }

    /// Cancellation acknowledgement.
    pub fn cancelled(request_id: Option<String>) -> Self {
        Self {
            cancelled: Some(true),
            request_id,
            ..Self::default()
        }
    }

    /// Terminal frame for a turn whose engine failed.
    pub fn failed(usage: TurnUsage, request_id: Option<String>, error: DoneError) -> Self {
        Self {
            usage: Some(usage),
            request_id,
            error: Some(error),
            ..Self::default()
        }
    }
}

/// `{"type":"error", ...}`
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ErrorFrame {
    /// Stable error code (see `GatewayError::error_code`).
    pub error_code: String,
    /// Human-readable description.
    pub message: String,
    /// Rate-limit category.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<RateLimitCategory>,
    /// Rate-limit scope.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<RateLimitScope>,
    /// Suggested wait before retrying.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    /// Capacity snapshot for `server_at_capacity`.
    #[serde(flatten, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<CapacitySnapshot>,
    /// Echo of the turn's `request_id` for generation errors.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// Reason carried by `connection_closed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// The client sent `end`.
    ClientRequest,
    /// No inbound activity within the idle timeout.
    IdleTimeout,
    /// The server is shutting down.
    ServerShutdown,
}

/// Which cache a `warm_*` message primed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarmTarget {
    /// Persona prefix.
    Persona,
    /// History prefix.
    History,
}

/// Every frame the server can send.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Tool-call decision; always first in a turn.
    Toolcall(ToolcallFrame),
    /// One chat token.
    Token {
        /// Token text.
        text: String,
        /// Echo of the turn's `request_id`.
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    /// Terminal frame of a turn.
    Done(DoneFrame),
    /// Sent right before a server-initiated or requested close.
    ConnectionClosed {
        /// Why the connection is closing.
        reason: CloseReason,
    },
    /// Reply to `ping`.
    Pong,
    /// Acknowledges a `warm_persona` / `warm_history`.
    WarmAck {
        /// Which fingerprint was updated.
        target: WarmTarget,
        /// The new fingerprint.
        fingerprint: String,
        /// Whether the fingerprint was already warm.
        reused: bool,
    },
    /// A rejected message or failed operation.
    Error(ErrorFrame),
}

impl ServerFrame {
    /// Serialize to the JSON text written on the socket.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"type":"error","error_code":"internal","message":"frame serialization failed"}"#
                .to_owned()
        })
    }
}
