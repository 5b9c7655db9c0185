//! Client/server wire protocol.
//!
//! Inbound frames are decoded exactly once, at the transport boundary, into
//! the closed [`InboundMessage`] enum. Everything the server writes back is a
//! [`ServerFrame`].

pub mod inbound;
pub mod outbound;

pub use inbound::{InboundMessage, ProtocolError, Sentinels, StartRequest, decode};
pub use outbound::{
    CloseReason, DoneError, DoneFrame, ErrorFrame, ServerFrame, ToolStatus, ToolcallFrame,
    ToolcallReason, TurnUsage, WarmTarget,
};

/// WebSocket close codes used by the gateway.
pub mod close_code {
    /// Normal closure (client asked to end).
    pub const NORMAL: u16 = 1000;
    /// Server going away (shutdown).
    pub const GOING_AWAY: u16 = 1001;
    /// Policy violation (authentication failed).
    pub const POLICY_VIOLATION: u16 = 1008;
    /// Try again later (no capacity).
    pub const TRY_AGAIN_LATER: u16 = 1013;
    /// Default application close code for idle timeout.
    pub const IDLE_TIMEOUT: u16 = 4000;
}
