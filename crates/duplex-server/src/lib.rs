//! # duplex-server
//!
//! Axum `WebSocket` gateway that streams two cooperating generation engines
//! over one socket per client.
//!
//! - Admission: a bounded slot pool acquired at handshake, released exactly once
//! - Rate limiting: sliding windows per connection and per session
//! - Sessions: persona/history/sampling state with cache-warm fingerprints
//! - Turns: one active generation per connection, superseded by the next `start`
//! - Cancellation: per-connection epoch register guarding every emission
//! - Orchestration: `toolcall → token* → done` ordering in sequential and
//!   concurrent mode
//! - HTTP: `/health`, `/status`, `/metrics`
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod admission;
pub mod auth;
pub mod cancel;
pub mod config;
pub mod health;
pub mod metrics;
pub mod orchestrator;
pub mod rate_limit;
pub mod server;
pub mod session_store;
pub mod shutdown;
pub mod turn;
pub mod websocket;
