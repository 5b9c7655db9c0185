//! Engine error types.

/// Result alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors raised while submitting to or streaming from an engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The engine cannot take requests right now.
    #[error("engine unavailable: {message}")]
    Unavailable {
        /// Error description.
        message: String,
    },

    /// Transport failure talking to the backend.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Backend answered with a non-success status.
    #[error("engine returned status {status}: {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body excerpt.
        message: String,
    },

    /// Backend output could not be decoded.
    #[error("decode error: {message}")]
    Decode {
        /// Error description.
        message: String,
    },

    /// No response within the allowed time.
    #[error("engine timed out after {after_ms}ms")]
    Timeout {
        /// Elapsed budget in milliseconds.
        after_ms: u64,
    },

    /// The request was cancelled by the caller.
    #[error("generation cancelled")]
    Cancelled,

    /// Engine-specific failure.
    #[error("{message}")]
    Other {
        /// Error description.
        message: String,
    },
}

impl EngineError {
    /// Whether retrying the same request might succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.status().is_some_and(|s| {
                        s == reqwest::StatusCode::TOO_MANY_REQUESTS || s.is_server_error()
                    })
            }
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            Self::Unavailable { .. } | Self::Timeout { .. } => true,
            Self::Decode { .. } | Self::Cancelled | Self::Other { .. } => false,
        }
    }

    /// Short category label for logs and metrics.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Unavailable { .. } => "unavailable",
            Self::Http(_) => "network",
            Self::Status { .. } => "api",
            Self::Decode { .. } => "parse",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled => "cancelled",
            Self::Other { .. } => "unknown",
        }
    }

    /// Whether this error only reflects the caller's own cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_retryable_only_for_throttle_and_server_errors() {
        let throttled = EngineError::Status {
            status: 429,
            message: String::new(),
        };
        let bad_request = EngineError::Status {
            status: 400,
            message: String::new(),
        };
        let unavailable = EngineError::Status {
            status: 503,
            message: String::new(),
        };
        assert!(throttled.is_retryable());
        assert!(!bad_request.is_retryable());
        assert!(unavailable.is_retryable());
    }

    #[test]
    fn cancelled_is_not_retryable() {
        assert!(!EngineError::Cancelled.is_retryable());
        assert!(EngineError::Cancelled.is_cancelled());
        assert_eq!(EngineError::Cancelled.category(), "cancelled");
    }

    #[test]
    fn display_messages() {
        assert_eq!(
            EngineError::Timeout { after_ms: 300 }.to_string(),
            "engine timed out after 300ms"
        );
        assert_eq!(
            EngineError::Other {
                message: "boom".into()
            }
            .to_string(),
            "boom"
        );
    }
}
