//! Inbound message decoding.
//!
//! Accepted shapes:
//! - JSON objects tagged by `"type"`: `start`, `cancel`, `end`, `ping`, `pong`,
//!   `warm_persona`, `warm_history`
//! - `{"cancel": true}` without a `type`
//! - the raw cancel / end sentinel strings (configurable, defaults
//!   `__CANCEL__` / `__END__`)
//!
//! A well-formed object with an unrecognised `type` decodes to
//! [`InboundMessage::Unknown`] so the caller can report it without closing
//! the connection.

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::ids::SessionId;
use crate::sampling::SamplingOverrides;

/// Raw-text sentinels that stand in for JSON control messages.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sentinels {
    /// Text that means `{"type":"cancel"}`.
    pub cancel: String,
    /// Text that means `{"type":"end"}`.
    pub end: String,
}

impl Default for Sentinels {
    fn default() -> Self {
        Self {
            cancel: "__CANCEL__".into(),
            end: "__END__".into(),
        }
    }
}

/// Payload of a `start` message.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct StartRequest {
    /// Session key; sessions survive across turns and reconnects.
    pub session_id: SessionId,
    /// Optional client correlation ID echoed on terminal frames.
    #[serde(default)]
    pub request_id: Option<String>,
    /// Persona description text.
    #[serde(default)]
    pub persona_text: Option<String>,
    /// Persona speaking style.
    #[serde(default)]
    pub persona_style: Option<String>,
    /// Persona gender.
    #[serde(default)]
    pub gender: Option<String>,
    /// Opaque user identity tag.
    #[serde(default)]
    pub user_identity: Option<String>,
    /// Conversation history text.
    #[serde(default)]
    pub history_text: Option<String>,
    /// The user's utterance for this turn.
    pub user_utterance: String,
    /// Sampling overrides layered over the session's current values.
    #[serde(default)]
    pub sampling: Option<SamplingOverrides>,
}

/// A decoded client message.
#[derive(Clone, Debug, PartialEq)]
pub enum InboundMessage {
    /// Begin a new turn (barging in on any active one).
    Start(Box<StartRequest>),
    /// Cancel the active turn.
    Cancel {
        /// Optional correlation ID to echo.
        request_id: Option<String>,
    },
    /// Close the connection.
    End,
    /// Liveness probe; answered with `pong`.
    Ping,
    /// Client acknowledgement of a server pong; no-op.
    Pong,
    /// Prime the persona prefix cache.
    WarmPersona {
        /// Full chat prompt the persona was rendered into.
        chat_prompt: String,
        /// Target session; defaults to the connection's bound session.
        session_id: Option<SessionId>,
    },
    /// Prime the history prefix cache.
    WarmHistory {
        /// History text to warm.
        history_text: String,
        /// Target session; defaults to the connection's bound session.
        session_id: Option<SessionId>,
    },
    /// Well-formed JSON with an unrecognised `type`.
    Unknown {
        /// The `type` value the client sent.
        kind: String,
    },
}

impl InboundMessage {
    /// Short name used in logs and metrics.
    pub fn kind(&self) -> &str {
        match self {
            Self::Start(_) => "start",
            Self::Cancel { .. } => "cancel",
            Self::End => "end",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::WarmPersona { .. } => "warm_persona",
            Self::WarmHistory { .. } => "warm_history",
            Self::Unknown { kind } => kind,
        }
    }
}

/// Why an inbound frame could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// The frame was empty or whitespace.
    #[error("empty message")]
    Empty,
    /// The frame was not valid JSON (and not a sentinel).
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    /// The JSON value was not an object.
    #[error("message must be a JSON object")]
    NotAnObject,
    /// The object had no string `type` field.
    #[error("message is missing a \"type\" field")]
    MissingType,
    /// A known message type had missing or invalid fields.
    #[error("invalid {kind} message: {reason}")]
    InvalidMessage {
        /// The message type.
        kind: String,
        /// What was wrong.
        reason: String,
    },
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Tagged {
    Start(Box<StartRequest>),
    Cancel {
        #[serde(default)]
        request_id: Option<String>,
    },
    End,
    Ping,
    Pong,
    WarmPersona {
        chat_prompt: String,
        #[serde(default)]
        session_id: Option<SessionId>,
    },
    WarmHistory {
        history_text: String,
        #[serde(default)]
        session_id: Option<SessionId>,
    },
}

const KNOWN_TYPES: &[&str] = &[
    "start",
    "cancel",
    "end",
    "ping",
    "pong",
    "warm_persona",
    "warm_history",
];

/// Decode one inbound text frame.
pub fn decode(text: &str, sentinels: &Sentinels) -> Result<InboundMessage, ProtocolError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(ProtocolError::Empty);
    }
    if trimmed == sentinels.cancel {
        return Ok(InboundMessage::Cancel { request_id: None });
    }
    if trimmed == sentinels.end {
        return Ok(InboundMessage::End);
    }

    let value: Value =
        serde_json::from_str(trimmed).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
    let Value::Object(map) = &value else {
        return Err(ProtocolError::NotAnObject);
    };

    let Some(kind) = map.get("type").and_then(Value::as_str) else {
        if map.get("cancel").and_then(Value::as_bool) == Some(true) {
            let request_id = map
                .get("request_id")
                .and_then(Value::as_str)
                .map(str::to_owned);
            return Ok(InboundMessage::Cancel { request_id });
        }
        return Err(ProtocolError::MissingType);
    };

    if !KNOWN_TYPES.contains(&kind) {
        return Ok(InboundMessage::Unknown {
            kind: kind.to_owned(),
        });
    }
    let kind = kind.to_owned();

    let tagged: Tagged = serde_json::from_value(value).map_err(|e| ProtocolError::InvalidMessage {
        kind: kind.clone(),
        reason: e.to_string(),
    })?;

    let message = match tagged {
        Tagged::Start(start) => {
            if start.session_id.is_empty() {
                return Err(ProtocolError::InvalidMessage {
                    kind,
                    reason: "session_id must not be empty".into(),
                });
            }
            if let Some(sampling) = &start.sampling {
                sampling
                    .validate()
                    .map_err(|reason| ProtocolError::InvalidMessage { kind, reason })?;
            }
            InboundMessage::Start(start)
        }
        Tagged::Cancel { request_id } => InboundMessage::Cancel { request_id },
        Tagged::End => InboundMessage::End,
        Tagged::Ping => InboundMessage::Ping,
        Tagged::Pong => InboundMessage::Pong,
        Tagged::WarmPersona {
            chat_prompt,
            session_id,
        } => InboundMessage::WarmPersona {
            chat_prompt,
            session_id,
        },
        Tagged::WarmHistory {
            history_text,
            session_id,
        } => InboundMessage::WarmHistory {
            history_text,
            session_id,
        },
    };
    Ok(message)
}
