//! `WebSocket` gateway: handshake, per-connection actor and idle watchdog.

pub mod connection;
pub mod handshake;
pub mod watchdog;

pub use handshake::ws_handler;
