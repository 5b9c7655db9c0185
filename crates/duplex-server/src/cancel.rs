//! Per-connection epoch register: the single emission point for turn frames.
//!
//! Every frame a turn writes goes through [`EpochRegister::emit`]. A writer
//! first reserves queue space without holding the register lock, then checks
//! the epoch and enqueues under the lock, which is never held across an
//! await. Retiring an epoch takes the same lock, so once
//! [`retire_with`](EpochRegister::retire_with) returns no frame for that
//! epoch can reach the wire, whatever the engines are still doing.

use duplex_core::Epoch;
use duplex_core::protocol::ServerFrame;
use tokio::sync::{Mutex, mpsc};

/// An item for the connection's writer task.
#[derive(Clone, Debug, PartialEq)]
pub enum Outbound {
    /// Serialize and send as a text frame.
    Frame(ServerFrame),
    /// Send a close frame, then stop writing.
    Close {
        /// `WebSocket` close code.
        code: u16,
        /// Close reason text.
        reason: String,
    },
}

#[derive(Debug)]
struct EpochState {
    current: Option<Epoch>,
    last: Epoch,
}

impl Default for EpochState {
    fn default() -> Self {
        Self {
            current: None,
            last: Epoch::new(0),
        }
    }
}

/// Current-epoch register plus the connection's outbound queue.
#[derive(Debug)]
pub struct EpochRegister {
    state: Mutex<EpochState>,
    outbound: mpsc::Sender<Outbound>,
}

impl EpochRegister {
    /// Create a register writing to `outbound`.
    pub fn new(outbound: mpsc::Sender<Outbound>) -> Self {
        Self {
            state: Mutex::new(EpochState::default()),
            outbound,
        }
    }

    /// Allocate the next epoch and make it current.
    ///
    /// Any previous epoch is implicitly invalidated.
    pub async fn begin(&self) -> Epoch {
        let mut state = self.state.lock().await;
        state.last = state.last.next();
        state.current = Some(state.last);
        state.last
    }

    /// Enqueue `frame` if `epoch` is current. Stale frames are dropped.
    ///
    /// Waits for queue space when the writer is behind; returns `false` once
    /// the writer is gone.
    pub async fn emit(&self, epoch: Epoch, frame: ServerFrame) -> bool {
        let Ok(permit) = self.outbound.reserve().await else {
            return false;
        };
        let state = self.state.lock().await;
        if state.current != Some(epoch) {
            return false;
        }
        permit.send(Outbound::Frame(frame));
        true
    }

    /// Invalidate `epoch` and enqueue its terminal frame in one step.
    ///
    /// Returns `false` without sending if the epoch was already retired or
    /// superseded, so each turn gets exactly one terminal frame. If the
    /// writer is gone the epoch is still retired.
    pub async fn retire_with(&self, epoch: Epoch, frame: ServerFrame) -> bool {
        let permit = self.outbound.reserve().await.ok();
        let mut state = self.state.lock().await;
        if state.current != Some(epoch) {
            return false;
        }
        state.current = None;
        if let Some(permit) = permit {
            permit.send(Outbound::Frame(frame));
        }
        true
    }

    /// Enqueue a frame that belongs to no turn (pong, warm_ack, errors).
    pub async fn send(&self, frame: ServerFrame) -> bool {
        self.enqueue(Outbound::Frame(frame)).await
    }

    /// Enqueue a close frame.
    pub async fn close(&self, code: u16, reason: impl Into<String>) -> bool {
        self.enqueue(Outbound::Close {
            code,
            reason: reason.into(),
        })
        .await
    }

    async fn enqueue(&self, item: Outbound) -> bool {
        let Ok(permit) = self.outbound.reserve().await else {
            return false;
        };
        let _state = self.state.lock().await;
        permit.send(item);
        true
    }
}
