//! Per-connection actor.
//!
//! One task per socket owns the turn state machine, the idle watchdog and the
//! connection's rate windows, and processes inbound frames strictly in
//! arrival order. A separate writer task drains the outbound queue. Every
//! exit path runs through [`ConnectionActor::finalize`], which releases the
//! admission slot exactly once.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use duplex_core::errors::GatewayError;
use duplex_core::protocol::{
    CloseReason, DoneFrame, InboundMessage, ServerFrame, StartRequest, WarmTarget, close_code,
    decode,
};
use duplex_core::{ConnectionId, Epoch, SessionId};
use duplex_engine::EngineRequestKey;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::admission::AdmissionSlot;
use crate::cancel::{EpochRegister, Outbound};
use crate::metrics::{
    CONNECTIONS_ACTIVE, CONNECTIONS_TOTAL, TURNS_CANCELLED_TOTAL, TURNS_STARTED_TOTAL,
};
use crate::orchestrator::TurnRequest;
use crate::rate_limit::ConnectionLimits;
use crate::server::GatewayState;
use crate::turn::{ActiveTurn, TurnMachine, TurnOutcome};

use super::watchdog::IdleWatchdog;

/// How long the finalizer waits for queued frames to flush.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Why the actor loop ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Exit {
    /// The client sent `end`.
    ClientEnd,
    /// The client closed the socket.
    ClientClosed,
    /// Reading from or writing to the socket failed.
    TransportError,
    /// The idle watchdog fired.
    Idle,
    /// Server shutdown.
    Shutdown,
}

impl Exit {
    fn as_str(self) -> &'static str {
        match self {
            Self::ClientEnd => "client_end",
            Self::ClientClosed => "client_closed",
            Self::TransportError => "transport_error",
            Self::Idle => "idle_timeout",
            Self::Shutdown => "server_shutdown",
        }
    }
}

/// Why an active turn was cancelled.
#[derive(Clone, Copy, Debug)]
enum CancelCause {
    BargeIn,
    Client,
    Closing,
}

impl CancelCause {
    fn as_str(self) -> &'static str {
        match self {
            Self::BargeIn => "barge_in",
            Self::Client => "client_cancel",
            Self::Closing => "connection_closing",
        }
    }
}

/// Run a connection to completion on an upgraded socket.
pub async fn run(socket: WebSocket, state: GatewayState, slot: AdmissionSlot) {
    let (sink, stream) = socket.split();
    let (out_tx, out_rx) = mpsc::channel(state.config.send_queue_capacity.max(1));
    let writer_gone = CancellationToken::new();
    let writer = tokio::spawn(write_loop(
        sink,
        out_rx,
        state.config.send_timeout,
        writer_gone.clone(),
    ));
    let actor = ConnectionActor::new(state, slot, Arc::new(EpochRegister::new(out_tx)));
    actor.run(stream, writer, writer_gone).await;
}

/// Drain the outbound queue into the socket.
///
/// Each write is bounded by `send_timeout`. `gone` fires whenever this task
/// stops, which also closes the queue so no sender waits on it.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Outbound>,
    send_timeout: Duration,
    gone: CancellationToken,
) {
    let _gone = gone.drop_guard();
    while let Some(item) = rx.recv().await {
        let (message, last) = match item {
            Outbound::Frame(frame) => (Message::Text(frame.to_json().into()), false),
            Outbound::Close { code, reason } => (
                Message::Close(Some(CloseFrame {
                    code,
                    reason: reason.into(),
                })),
                true,
            ),
        };
        match tokio::time::timeout(send_timeout, sink.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(error = %e, "socket write failed");
                break;
            }
            Err(_) => {
                warn!(?send_timeout, "client stopped reading, dropping connection");
                break;
            }
        }
        if last {
            break;
        }
    }
}

struct ConnectionActor {
    id: ConnectionId,
    state: GatewayState,
    slot: AdmissionSlot,
    register: Arc<EpochRegister>,
    turns: TurnMachine,
    limits: ConnectionLimits,
    watchdog: IdleWatchdog,
    session: Option<SessionId>,
    finished_tx: mpsc::UnboundedSender<(Epoch, TurnOutcome)>,
    finished_rx: mpsc::UnboundedReceiver<(Epoch, TurnOutcome)>,
}

impl ConnectionActor {
    fn new(state: GatewayState, slot: AdmissionSlot, register: Arc<EpochRegister>) -> Self {
        let (finished_tx, finished_rx) = mpsc::unbounded_channel();
        Self {
            id: ConnectionId::new(),
            limits: state.rate_limiter.connection_limits(),
            watchdog: IdleWatchdog::new(state.config.idle_timeout),
            state,
            slot,
            register,
            turns: TurnMachine::new(),
            session: None,
            finished_tx,
            finished_rx,
        }
    }

    #[instrument(skip_all, fields(connection_id = %self.id))]
    async fn run<S>(
        mut self,
        mut inbound: S,
        writer: JoinHandle<()>,
        writer_gone: CancellationToken,
    ) where
        S: futures::Stream<Item = Result<Message, axum::Error>> + Unpin,
    {
        counter!(CONNECTIONS_TOTAL).increment(1);
        gauge!(CONNECTIONS_ACTIVE).increment(1.0);
        info!(
            idle_timeout_secs = self.watchdog.timeout().as_secs(),
            "connection accepted"
        );

        let shutdown = self.state.shutdown.token();
        let exit = loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break Exit::Shutdown,
                () = writer_gone.cancelled() => break Exit::TransportError,
                () = self.watchdog.expired() => break Exit::Idle,
                Some((epoch, outcome)) = self.finished_rx.recv() => {
                    self.on_turn_finished(epoch, outcome);
                }
                frame = inbound.next() => match frame {
                    None => break Exit::ClientClosed,
                    Some(Err(e)) => {
                        debug!(error = %e, "socket read failed");
                        break Exit::TransportError;
                    }
                    Some(Ok(message)) => {
                        self.watchdog.reset();
                        if let Some(exit) = self.on_message(message).await {
                            break exit;
                        }
                    }
                },
            }
        };

        self.finalize(exit, writer).await;
    }

    /// Handle one socket message. Returns `Some` to end the connection.
    async fn on_message(&mut self, message: Message) -> Option<Exit> {
        match message {
            Message::Text(text) => self.on_text(text.as_str()).await,
            Message::Binary(bytes) => match std::str::from_utf8(&bytes) {
                Ok(text) => self.on_text(text).await,
                Err(_) => {
                    self.reject(GatewayError::MalformedMessage {
                        reason: "binary frame is not UTF-8".into(),
                    })
                    .await;
                    None
                }
            },
            Message::Ping(_) | Message::Pong(_) => None,
            Message::Close(_) => Some(Exit::ClientClosed),
        }
    }

    async fn on_text(&mut self, text: &str) -> Option<Exit> {
        let message = match decode(text, &self.state.config.sentinels) {
            Ok(message) => message,
            Err(e) => {
                let err = match self.limits.check_message() {
                    Ok(()) => GatewayError::from(e),
                    Err(limited) => limited,
                };
                self.reject(err).await;
                return None;
            }
        };

        let admitted = match &message {
            InboundMessage::Cancel { .. } => self.limits.check_cancel(),
            InboundMessage::End | InboundMessage::Ping | InboundMessage::Pong => Ok(()),
            _ => self.limits.check_message(),
        };
        if let Err(err) = admitted {
            self.reject(err).await;
            return None;
        }

        debug!(kind = message.kind(), "inbound message");
        match message {
            InboundMessage::Start(request) => self.on_start(*request).await,
            InboundMessage::Cancel { request_id } => self.on_cancel(request_id).await,
            InboundMessage::End => return Some(Exit::ClientEnd),
            InboundMessage::Ping => {
                let _ = self.register.send(ServerFrame::Pong).await;
            }
            InboundMessage::Pong => {}
            InboundMessage::WarmPersona {
                chat_prompt,
                session_id,
            } => {
                self.on_warm(WarmTarget::Persona, &chat_prompt, session_id)
                    .await;
            }
            InboundMessage::WarmHistory {
                history_text,
                session_id,
            } => {
                self.on_warm(WarmTarget::History, &history_text, session_id)
                    .await;
            }
            InboundMessage::Unknown { kind } => {
                self.reject(GatewayError::MalformedMessage {
                    reason: format!("unknown message type: {kind}"),
                })
                .await;
            }
        }
        None
    }

    async fn on_start(&mut self, request: StartRequest) {
        let sessions = Arc::clone(&self.state.sessions);
        if sessions.persona_would_change(&request) {
            if let Err(err) = self
                .state
                .rate_limiter
                .check_persona_update(&request.session_id)
            {
                self.reject(err).await;
                return;
            }
        }

        let barge_in = self.turns.is_generating();
        let _ = self.cancel_active(CancelCause::BargeIn, None).await;

        let context = sessions.apply_start(&self.id, &request);
        let persona_changed = context.persona_changed;
        self.session = Some(request.session_id.clone());
        let epoch = self.register.begin().await;
        let cancel = CancellationToken::new();
        let turn = TurnRequest {
            connection_id: self.id.clone(),
            epoch,
            request_id: request.request_id.clone(),
            utterance: request.user_utterance,
            context,
            cancel: cancel.clone(),
        };

        let orchestrator = Arc::clone(&self.state.orchestrator);
        let register = Arc::clone(&self.register);
        let finished = self.finished_tx.clone();
        let handle = tokio::spawn(async move {
            let outcome = orchestrator.run_turn(turn, &register).await;
            let _ = finished.send((epoch, outcome));
        });

        counter!(TURNS_STARTED_TOTAL).increment(1);
        info!(
            %epoch,
            session_id = %request.session_id,
            request_id = request.request_id.as_deref(),
            persona_changed,
            barge_in,
            "turn started"
        );
        let active = ActiveTurn {
            epoch,
            request_id: request.request_id,
            cancel,
            handle,
            started: Instant::now(),
        };
        if let Err(orphan) = self.turns.begin(active) {
            warn!(epoch = %orphan.epoch, "turn still active after barge-in, aborting new turn");
            orphan.cancel.cancel();
        }
    }

    /// Cancel the active turn, or acknowledge a cancel that found none.
    ///
    /// The acknowledgement is a bare `done{cancelled}` echoing only the
    /// cancel's own `request_id`. It is not a turn terminal: a turn that
    /// already wrote its `done` but whose finish is not yet processed still
    /// had exactly one terminal frame.
    async fn on_cancel(&mut self, request_id: Option<String>) {
        if !self
            .cancel_active(CancelCause::Client, request_id.clone())
            .await
        {
            debug!(
                request_id = request_id.as_deref(),
                last_turn = ?self.turns.last_terminal(),
                "no live turn, acknowledging cancel"
            );
            let _ = self
                .register
                .send(ServerFrame::Done(DoneFrame::cancelled(request_id)))
                .await;
        }
    }

    /// Barge in on the active turn, if any.
    ///
    /// Returns `true` if a `done{cancelled}` frame was written for it. The
    /// epoch is retired before the engines are told to stop, so nothing the
    /// engines still produce reaches the client.
    async fn cancel_active(&mut self, cause: CancelCause, request_id: Option<String>) -> bool {
        let Some(turn) = self.turns.cancel_active() else {
            return false;
        };
        let request_id = request_id.or_else(|| turn.request_id.clone());
        let done = ServerFrame::Done(DoneFrame::cancelled(request_id));
        let retired = self.register.retire_with(turn.epoch, done).await;

        turn.cancel.cancel();
        self.state
            .orchestrator
            .cancel_engines(&EngineRequestKey::new(self.id.clone(), turn.epoch));

        if retired {
            counter!(TURNS_CANCELLED_TOTAL).increment(1);
            info!(
                epoch = %turn.epoch,
                cause = cause.as_str(),
                elapsed_ms = u64::try_from(turn.started.elapsed().as_millis()).unwrap_or(u64::MAX),
                "turn cancelled"
            );
        } else {
            debug!(epoch = %turn.epoch, "turn had already finished");
        }
        retired
    }

    fn on_turn_finished(&mut self, epoch: Epoch, outcome: TurnOutcome) {
        if let Some(turn) = self.turns.finish(epoch, outcome) {
            debug!(
                %epoch,
                ?outcome,
                elapsed_ms = u64::try_from(turn.started.elapsed().as_millis()).unwrap_or(u64::MAX),
                "turn finished"
            );
        }
    }

    async fn on_warm(&mut self, target: WarmTarget, text: &str, session_id: Option<SessionId>) {
        let Some(session_id) = session_id.or_else(|| self.session.clone()) else {
            self.reject(GatewayError::MalformedMessage {
                reason: "warm requires a session_id or a prior start".into(),
            })
            .await;
            return;
        };

        let sessions = &self.state.sessions;
        let outcome = match target {
            WarmTarget::Persona => {
                if sessions.persona_warm_would_change(&session_id, text) {
                    if let Err(err) = self.state.rate_limiter.check_persona_update(&session_id) {
                        self.reject(err).await;
                        return;
                    }
                }
                sessions.warm_persona(&self.id, &session_id, text)
            }
            WarmTarget::History => sessions.warm_history(&self.id, &session_id, text),
        };
        debug!(%session_id, ?target, reused = outcome.reused, "cache warmed");
        let _ = self
            .register
            .send(ServerFrame::WarmAck {
                target,
                fingerprint: outcome.fingerprint,
                reused: outcome.reused,
            })
            .await;
    }

    /// Report a per-message error; the connection stays open.
    async fn reject(&self, err: GatewayError) {
        if matches!(err, GatewayError::RateLimited { .. }) {
            debug!(error = %err, "message rate limited");
        } else {
            warn!(error = %err, "message rejected");
        }
        let _ = self.register.send(err.to_frame()).await;
    }

    /// Single exit path: cancel the turn, say goodbye, flush, release the slot.
    async fn finalize(mut self, exit: Exit, writer: JoinHandle<()>) {
        let _ = self.cancel_active(CancelCause::Closing, None).await;

        let goodbye = match exit {
            Exit::ClientEnd => Some((CloseReason::ClientRequest, close_code::NORMAL)),
            Exit::Idle => Some((CloseReason::IdleTimeout, self.state.config.idle_close_code)),
            Exit::Shutdown => Some((CloseReason::ServerShutdown, close_code::GOING_AWAY)),
            Exit::ClientClosed | Exit::TransportError => None,
        };
        match goodbye {
            Some((reason, code)) => {
                if exit == Exit::Idle {
                    let err = GatewayError::IdleTimeout {
                        idle_secs: self.watchdog.timeout().as_secs(),
                    };
                    info!(error = %err, "closing idle connection");
                }
                let _ = self
                    .register
                    .send(ServerFrame::ConnectionClosed { reason })
                    .await;
                let _ = self.register.close(code, exit.as_str()).await;
            }
            None => {
                let _ = self.register.close(close_code::NORMAL, exit.as_str()).await;
            }
        }

        let abort = writer.abort_handle();
        if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
            abort.abort();
        }

        let released = self.slot.release();
        self.state.sessions.release_connection(&self.id);
        gauge!(CONNECTIONS_ACTIVE).decrement(1.0);
        info!(
            reason = exit.as_str(),
            slot_released = released,
            capacity = ?self.state.admission.snapshot(),
            "connection closed"
        );
    }
}
