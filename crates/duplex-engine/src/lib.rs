//! # duplex-engine
//!
//! The seam between the gateway and the token-generation backends.
//!
//! A [`GenerationEngine`] accepts a [`GenerationRequest`] and returns a
//! [`TokenStream`] of [`EngineEvent`]s. Requests are keyed by connection and
//! epoch so a superseded turn can be aborted with [`GenerationEngine::cancel`].
//!
//! Two implementations ship with the crate:
//! - [`ScriptedEngine`]: deterministic, in-process, used by tests and demos
//! - [`HttpEngine`]: OpenAI-compatible `/v1/chat/completions` over SSE

#![deny(unsafe_code)]

pub mod engine;
pub mod error;
pub mod http;
pub mod prompt;
pub mod scripted;
pub mod sse;

pub use engine::{
    EngineEvent, EngineRequestKey, EngineRole, EngineUsage, GenerationEngine, GenerationRequest,
    InFlight, InFlightGuard, TokenStream,
};
pub use error::{EngineError, EngineResult};
pub use http::{HttpEngine, HttpEngineConfig};
pub use scripted::{ScriptedEngine, ScriptedReply};
