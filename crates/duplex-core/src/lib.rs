//! # duplex-core
//!
//! Shared vocabulary for the duplex gateway:
//!
//! - **Identifiers**: [`ConnectionId`], [`SessionId`] and the per-connection [`Epoch`]
//! - **Protocol**: the closed [`InboundMessage`](protocol::InboundMessage) enum decoded
//!   once at the transport boundary, and the [`ServerFrame`](protocol::ServerFrame)
//!   family written back to clients
//! - **Sampling**: per-session [`SamplingOverrides`](sampling::SamplingOverrides)
//! - **Errors**: the gateway error taxonomy with stable wire `error_code`s

#![deny(unsafe_code)]

pub mod errors;
pub mod ids;
pub mod protocol;
pub mod sampling;

pub use errors::{CapacitySnapshot, GatewayError, RateLimitCategory, RateLimitScope};
pub use ids::{ConnectionId, Epoch, SessionId};
