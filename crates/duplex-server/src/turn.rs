//! Per-connection turn state machine.
//!
//! `Idle → Generating → {Done, Cancelled} → Idle`. At most one turn is
//! active; a `start` while generating must first take the active turn (the
//! barge-in), then begin the new one. The machine is owned by the connection
//! actor, so it needs no locking.

use std::fmt;

use duplex_core::Epoch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TurnState {
    /// Ready for `start`.
    Idle,
    /// A turn is streaming.
    Generating,
    /// The last turn completed (or failed with a terminal `done`).
    Done,
    /// The last turn was cancelled.
    Cancelled,
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Generating => "generating",
            Self::Done => "done",
            Self::Cancelled => "cancelled",
        })
    }
}

/// How an orchestrated turn ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TurnOutcome {
    /// `done` with usage.
    Completed,
    /// An engine failed; `error` and `done` with error detail were sent.
    Failed,
    /// The epoch was retired by someone else before the turn could finish.
    Cancelled,
}

impl TurnOutcome {
    fn terminal_state(self) -> TurnState {
        match self {
            Self::Completed | Self::Failed => TurnState::Done,
            Self::Cancelled => TurnState::Cancelled,
        }
    }
}

/// The generating turn.
#[derive(Debug)]
pub struct ActiveTurn {
    /// Epoch allocated at `start`.
    pub epoch: Epoch,
    /// Client correlation ID.
    pub request_id: Option<String>,
    /// Aborts both engine calls.
    pub cancel: CancellationToken,
    /// Orchestrator task.
    pub handle: JoinHandle<()>,
    /// When the turn started.
    pub started: Instant,
}

/// Turn lifecycle for one connection.
#[derive(Debug)]
pub struct TurnMachine {
    state: TurnState,
    active: Option<ActiveTurn>,
    last_terminal: Option<TurnState>,
}

impl TurnMachine {
    /// A machine in `Idle`.
    pub fn new() -> Self {
        Self {
            state: TurnState::Idle,
            active: None,
            last_terminal: None,
        }
    }

    /// Terminal state of the most recent turn.
    pub fn last_terminal(&self) -> Option<TurnState> {
        self.last_terminal
    }

    /// Whether a turn is generating.
    pub fn is_generating(&self) -> bool {
        self.state == TurnState::Generating
    }

    /// Enter `Generating` with `turn`.
    ///
    /// Returns the turn back if one is already active; callers barge in with
    /// [`cancel_active`](Self::cancel_active) first.
    pub fn begin(&mut self, turn: ActiveTurn) -> Result<(), ActiveTurn> {
        if self.active.is_some() {
            return Err(turn);
        }
        debug!(epoch = %turn.epoch, from = %self.state, "turn generating");
        self.active = Some(turn);
        self.state = TurnState::Generating;
        Ok(())
    }

    /// Take the active turn out, moving through `Cancelled` back to `Idle`.
    ///
    /// The caller is responsible for cancelling its token and sending the
    /// terminal frame.
    pub fn cancel_active(&mut self) -> Option<ActiveTurn> {
        let turn = self.active.take()?;
        self.settle(TurnState::Cancelled);
        Some(turn)
    }

    /// Record that the orchestrator for `epoch` finished.
    ///
    /// Ignored (returns `None`) if `epoch` is no longer the active turn,
    /// which happens when it was cancelled or superseded first.
    pub fn finish(&mut self, epoch: Epoch, outcome: TurnOutcome) -> Option<ActiveTurn> {
        if self.active.as_ref().map(|t| t.epoch) != Some(epoch) {
            return None;
        }
        let turn = self.active.take();
        self.settle(outcome.terminal_state());
        turn
    }

    fn settle(&mut self, terminal: TurnState) {
        self.state = terminal;
        self.last_terminal = Some(terminal);
        debug!(terminal = %terminal, "turn settled");
        self.state = TurnState::Idle;
    }
}

impl Default for TurnMachine {
    fn default() -> Self {
        Self::new()
    }
}
