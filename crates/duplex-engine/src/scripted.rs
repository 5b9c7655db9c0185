//! Deterministic in-process engine.
//!
//! Each submit asks a responder for a [`ScriptedReply`] and plays it back with
//! the configured delays, honouring cancellation between tokens. Used by the
//! test suites and by `kind = "scripted"` deployments.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::engine::{
    EngineEvent, EngineRequestKey, EngineUsage, GenerationEngine, GenerationRequest, InFlight,
    TokenStream,
};
use crate::error::{EngineError, EngineResult};

/// What a scripted engine produces for one request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScriptedReply {
    /// Text deltas, in order.
    pub tokens: Vec<String>,
    /// Wait before the first token.
    pub initial_delay: Duration,
    /// Wait before every token.
    pub token_delay: Duration,
    /// Yield an error once this many tokens have been sent.
    pub fail_after: Option<usize>,
    /// Refuse the request at submit time.
    pub reject: bool,
    /// Prompt tokens reported on completion.
    pub prompt_tokens: u32,
}

impl ScriptedReply {
    /// Reply with the given tokens and no delays.
    pub fn tokens<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Set the delay before the first token.
    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the delay before each token.
    #[must_use]
    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }

    /// Fail the stream after `count` tokens.
    #[must_use]
    pub fn failing_after(mut self, count: usize) -> Self {
        self.fail_after = Some(count);
        self
    }

    /// Refuse the request at submit time.
    #[must_use]
    pub fn rejecting(mut self) -> Self {
        self.reject = true;
        self
    }
}

type Responder = dyn Fn(&GenerationRequest) -> ScriptedReply + Send + Sync;

/// In-process [`GenerationEngine`] that plays back scripted replies.
pub struct ScriptedEngine {
    responder: Box<Responder>,
    in_flight: Arc<InFlight>,
    submitted: AtomicUsize,
    cancelled: Mutex<Vec<EngineRequestKey>>,
}

impl ScriptedEngine {
    /// Engine that answers every request with the same reply.
    pub fn new(reply: ScriptedReply) -> Self {
        Self::from_fn(move |_| reply.clone())
    }

    /// Engine whose reply depends on the request.
    pub fn from_fn<F>(responder: F) -> Self
    where
        F: Fn(&GenerationRequest) -> ScriptedReply + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            in_flight: Arc::new(InFlight::new()),
            submitted: AtomicUsize::new(0),
            cancelled: Mutex::new(Vec::new()),
        }
    }

    /// Chat engine that repeats the utterance back word by word.
    pub fn echo(token_delay: Duration) -> Self {
        Self::from_fn(move |request| {
            let text = format!("You said: {}", request.utterance.trim());
            ScriptedReply::tokens(text.split_inclusive(' ')).with_token_delay(token_delay)
        })
    }

    /// Requests accepted or rejected so far.
    pub fn submitted(&self) -> usize {
        self.submitted.load(Ordering::SeqCst)
    }

    /// Keys passed to [`GenerationEngine::cancel`], in call order.
    pub fn cancelled(&self) -> Vec<EngineRequestKey> {
        self.cancelled.lock().clone()
    }

    /// Generations currently streaming.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

impl std::fmt::Debug for ScriptedEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedEngine")
            .field("submitted", &self.submitted())
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

/// Sleep for `delay` unless `token` fires first. Returns `false` if cancelled.
async fn wait(token: &CancellationToken, delay: Duration) -> bool {
    if delay.is_zero() {
        return !token.is_cancelled();
    }
    tokio::select! {
        () = token.cancelled() => false,
        () = tokio::time::sleep(delay) => true,
    }
}

#[async_trait]
impl GenerationEngine for ScriptedEngine {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn submit(&self, request: GenerationRequest) -> EngineResult<TokenStream> {
        let _ = self.submitted.fetch_add(1, Ordering::SeqCst);
        let reply = (self.responder)(&request);
        debug!(
            key = %request.key,
            role = request.role.as_str(),
            tokens = reply.tokens.len(),
            "scripted submit"
        );
        if reply.reject {
            return Err(EngineError::Unavailable {
                message: "scripted engine rejected the request".into(),
            });
        }

        let (token, guard) = self.in_flight.register(request.key.clone(), &request.cancel);
        let stream = async_stream::stream! {
            let _guard = guard;
            let total = reply.tokens.len();

            if !wait(&token, reply.initial_delay).await {
                yield Err(EngineError::Cancelled);
                return;
            }

            let mut completion_tokens = 0u32;
            for (index, text) in reply.tokens.into_iter().enumerate() {
                if reply.fail_after == Some(index) {
                    yield Err(scripted_failure(index));
                    return;
                }
                if !wait(&token, reply.token_delay).await {
                    yield Err(EngineError::Cancelled);
                    return;
                }
                completion_tokens += 1;
                yield Ok(EngineEvent::Token { text });
            }

            if reply.fail_after.is_some_and(|n| n >= total) {
                yield Err(scripted_failure(total));
                return;
            }

            yield Ok(EngineEvent::Finished {
                usage: EngineUsage {
                    prompt_tokens: reply.prompt_tokens,
                    completion_tokens,
                },
            });
        };
        Ok(Box::pin(stream))
    }

    fn cancel(&self, key: &EngineRequestKey) {
        self.cancelled.lock().push(key.clone());
        if self.in_flight.cancel(key) {
            debug!(%key, "scripted generation cancelled");
        }
    }
}

fn scripted_failure(after: usize) -> EngineError {
    EngineError::Other {
        message: format!("scripted failure after {after} tokens"),
    }
}
