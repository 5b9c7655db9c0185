//! The [`GenerationEngine`] trait and its request/event types.

use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use duplex_core::sampling::SamplingOverrides;
use duplex_core::{ConnectionId, Epoch};
use futures::Stream;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::EngineResult;

/// Boxed stream of engine events returned by [`GenerationEngine::submit`].
pub type TokenStream = Pin<Box<dyn Stream<Item = EngineResult<EngineEvent>> + Send>>;

/// Identifies one in-flight generation: the turn `epoch` on one connection.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EngineRequestKey {
    /// Owning connection.
    pub connection_id: ConnectionId,
    /// Turn epoch on that connection.
    pub epoch: Epoch,
}

impl EngineRequestKey {
    /// Build a key.
    pub fn new(connection_id: ConnectionId, epoch: Epoch) -> Self {
        Self {
            connection_id,
            epoch,
        }
    }
}

impl fmt::Display for EngineRequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.connection_id, self.epoch)
    }
}

/// Which half of a turn a request serves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineRole {
    /// Fast tool-call classifier.
    Tool,
    /// Conversational reply.
    Chat,
}

impl EngineRole {
    /// Lowercase label used in logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tool => "tool",
            Self::Chat => "chat",
        }
    }
}

/// One generation request.
#[derive(Clone, Debug)]
pub struct GenerationRequest {
    /// Connection and epoch this request belongs to.
    pub key: EngineRequestKey,
    /// Tool classifier or chat reply.
    pub role: EngineRole,
    /// Persona text, style and gender, already joined.
    pub persona: Option<String>,
    /// Conversation history.
    pub history: Option<String>,
    /// Opaque user identity tag.
    pub user_identity: Option<String>,
    /// The user's utterance.
    pub utterance: String,
    /// Session sampling overrides.
    pub sampling: SamplingOverrides,
    /// Output token budget.
    pub max_tokens: Option<u32>,
    /// Fires when the owning turn is cancelled or superseded.
    pub cancel: CancellationToken,
}

/// Token accounting reported at the end of a generation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EngineUsage {
    /// Prompt tokens consumed.
    pub prompt_tokens: u32,
    /// Tokens generated.
    pub completion_tokens: u32,
}

/// Events yielded by a [`TokenStream`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EngineEvent {
    /// A chunk of generated text.
    Token {
        /// Text delta.
        text: String,
    },
    /// Generation finished normally. Always the last event.
    Finished {
        /// Token accounting.
        usage: EngineUsage,
    },
}

/// A token-generation backend.
///
/// `submit` returns once the backend has accepted the request; tokens then
/// arrive on the stream. Cancellation is cooperative: callers fire
/// `request.cancel` or call [`cancel`](Self::cancel), and must still guard
/// their own emission since an engine may yield a few more events.
#[async_trait]
pub trait GenerationEngine: Send + Sync {
    /// Short engine name for logs.
    fn name(&self) -> &str;

    /// Start a generation.
    async fn submit(&self, request: GenerationRequest) -> EngineResult<TokenStream>;

    /// Best-effort abort of the generation identified by `key`.
    fn cancel(&self, key: &EngineRequestKey);
}

/// Registry of in-flight generations, keyed by connection and epoch.
///
/// Engines register a child of the request's cancel token on submit so that
/// [`GenerationEngine::cancel`] can abort a stream without holding the
/// request. The returned [`InFlightGuard`] unregisters on drop.
#[derive(Debug, Default)]
pub struct InFlight {
    inner: Mutex<InFlightInner>,
}

#[derive(Debug, Default)]
struct InFlightInner {
    next_id: u64,
    tokens: HashMap<EngineRequestKey, (u64, CancellationToken)>,
}

impl InFlight {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request and return its stream-side token and guard.
    ///
    /// A previous registration under the same key is cancelled.
    pub fn register(
        self: &Arc<Self>,
        key: EngineRequestKey,
        parent: &CancellationToken,
    ) -> (CancellationToken, InFlightGuard) {
        let token = parent.child_token();
        let id = {
            let mut inner = self.inner.lock();
            inner.next_id += 1;
            let id = inner.next_id;
            if let Some((_, previous)) = inner.tokens.insert(key.clone(), (id, token.clone())) {
                previous.cancel();
            }
            id
        };
        let guard = InFlightGuard {
            registry: Arc::clone(self),
            key,
            id,
        };
        (token, guard)
    }

    /// Cancel and forget the generation for `key`. Returns whether one was found.
    pub fn cancel(&self, key: &EngineRequestKey) -> bool {
        let removed = self.inner.lock().tokens.remove(key);
        match removed {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Number of registered generations.
    pub fn len(&self) -> usize {
        self.inner.lock().tokens.len()
    }

    /// Whether nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().tokens.is_empty()
    }
}

/// Removes a registration from [`InFlight`] when the stream is dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    registry: Arc<InFlight>,
    key: EngineRequestKey,
    id: u64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut inner = self.registry.inner.lock();
        // a newer registration under the same key stays
        if inner.tokens.get(&self.key).is_some_and(|(id, _)| *id == self.id) {
            let _ = inner.tokens.remove(&self.key);
        }
    }
}
