//! Dual-engine orchestrator.
//!
//! Runs the tool-call classifier and the chat engine for one turn and writes
//! `toolcall → token* → done` through the connection's [`EpochRegister`].
//!
//! - **Sequential**: the tool decision is awaited, the `toolcall` frame is
//!   written, then the chat engine is submitted and streamed.
//! - **Concurrent**: both engines start together. Chat tokens collect in a
//!   closed [`ChatGate`]; when the decision (or the hard timeout) arrives the
//!   `toolcall` frame is written and the gate is flushed and opened. A full
//!   gate stops pulling from the chat stream until it opens, so nothing is
//!   dropped or reordered.
//!
//! Engine failures always end the turn with an `error` frame followed by a
//! `done` frame carrying the error detail.

pub mod gate;
pub mod sanitize;
pub mod usage;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use duplex_core::errors::GatewayError;
use duplex_core::protocol::{DoneFrame, ServerFrame, ToolStatus, ToolcallFrame, ToolcallReason};
use duplex_core::{ConnectionId, Epoch};
use duplex_engine::{
    EngineError, EngineEvent, EngineRequestKey, EngineResult, EngineRole, GenerationEngine,
    GenerationRequest,
};
use duplex_settings::{OrchestratorMode, OrchestratorSettings};
use futures::{Stream, StreamExt, TryStreamExt, stream};
use metrics::{counter, histogram};
use tokio::time::{Instant, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::cancel::EpochRegister;
use crate::metrics::{
    TOOL_GATE_TIMEOUTS_TOTAL, TTFT_SECONDS, TURN_DURATION_SECONDS, TURNS_COMPLETED_TOTAL,
    TURNS_FAILED_TOTAL,
};
use crate::session_store::TurnContext;
use crate::turn::TurnOutcome;

use self::gate::ChatGate;
use self::sanitize::sanitize_token;
use self::usage::UsageTracker;

type ChatStream = Pin<Box<dyn Stream<Item = EngineResult<EngineEvent>> + Send>>;

/// Orchestration limits.
#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    /// Scheduling mode.
    pub mode: OrchestratorMode,
    /// Hard cap on the tool decision.
    pub tool_hard_timeout: Duration,
    /// Characters of chat output held while the gate is closed.
    pub prebuffer_max_chars: usize,
    /// Maximum gap between two chat engine events.
    pub engine_idle_timeout: Duration,
    /// Token budget for the tool decision.
    pub tool_max_tokens: u32,
}

impl OrchestratorConfig {
    /// Build from settings.
    pub fn from_settings(settings: &OrchestratorSettings) -> Self {
        Self {
            mode: settings.mode,
            tool_hard_timeout: Duration::from_millis(settings.tool_hard_timeout_ms),
            prebuffer_max_chars: settings.prebuffer_max_chars,
            engine_idle_timeout: Duration::from_millis(settings.engine_idle_timeout_ms),
            tool_max_tokens: settings.tool_max_tokens,
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::from_settings(&OrchestratorSettings::default())
    }
}

/// Everything the orchestrator needs for one turn.
#[derive(Clone, Debug)]
pub struct TurnRequest {
    /// Owning connection.
    pub connection_id: ConnectionId,
    /// Epoch allocated for this turn.
    pub epoch: Epoch,
    /// Client correlation ID echoed on frames.
    pub request_id: Option<String>,
    /// The user's utterance.
    pub utterance: String,
    /// Session state captured at `start`.
    pub context: TurnContext,
    /// Fires on barge-in, cancel, end or shutdown.
    pub cancel: CancellationToken,
}

/// Result of the tool-call classifier.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ToolDecision {
    /// The classifier finished.
    Decided {
        /// Full completion text.
        raw: String,
        /// Tokens produced.
        tokens: u32,
    },
    /// The hard timeout fired first.
    TimedOut,
    /// The classifier failed.
    Failed,
}

impl ToolDecision {
    fn into_frame(self, request_id: Option<String>) -> ToolcallFrame {
        match self {
            Self::Decided { raw, .. } => ToolcallFrame {
                status: ToolStatus::from_completion(&raw),
                raw,
                reason: None,
                request_id,
            },
            Self::TimedOut => ToolcallFrame {
                status: ToolStatus::No,
                raw: String::new(),
                reason: Some(ToolcallReason::Timeout),
                request_id,
            },
            Self::Failed => ToolcallFrame {
                status: ToolStatus::No,
                raw: String::new(),
                reason: Some(ToolcallReason::Error),
                request_id,
            },
        }
    }

    fn tokens(&self) -> u32 {
        match self {
            Self::Decided { tokens, .. } => *tokens,
            Self::TimedOut | Self::Failed => 0,
        }
    }
}

/// Coordinates the tool-call and chat engines.
pub struct Orchestrator {
    tool: Arc<dyn GenerationEngine>,
    chat: Arc<dyn GenerationEngine>,
    config: OrchestratorConfig,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("tool", &self.tool.name())
            .field("chat", &self.chat.name())
            .field("config", &self.config)
            .finish()
    }
}

impl Orchestrator {
    /// Create an orchestrator over two engines.
    pub fn new(
        tool: Arc<dyn GenerationEngine>,
        chat: Arc<dyn GenerationEngine>,
        config: OrchestratorConfig,
    ) -> Self {
        Self { tool, chat, config }
    }

    /// Orchestration limits.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Best-effort abort of both engine calls for `key`.
    pub fn cancel_engines(&self, key: &EngineRequestKey) {
        self.tool.cancel(key);
        self.chat.cancel(key);
    }

    /// Run one turn to a terminal state.
    ///
    /// Returns [`TurnOutcome::Cancelled`] whenever the epoch was retired by
    /// someone else; in that case this turn wrote no terminal frame.
    #[instrument(skip_all, fields(connection_id = %turn.connection_id, epoch = %turn.epoch))]
    pub async fn run_turn(&self, turn: TurnRequest, register: &EpochRegister) -> TurnOutcome {
        let key = EngineRequestKey::new(turn.connection_id.clone(), turn.epoch);
        let mut run = TurnRun {
            register,
            epoch: turn.epoch,
            request_id: turn.request_id.clone(),
            usage: UsageTracker::new(Instant::now()),
            sanitize: turn.context.sampling.sanitize(),
        };

        let tool = decide_tool(
            Arc::clone(&self.tool),
            self.request(&turn, &key, EngineRole::Tool),
            self.config.tool_hard_timeout,
        );
        let chat_engine = Arc::clone(&self.chat);
        let chat_request = self.request(&turn, &key, EngineRole::Chat);
        let mut chat: ChatStream = Box::pin(
            stream::once(async move { chat_engine.submit(chat_request).await }).try_flatten(),
        );

        debug!(mode = ?self.config.mode, "turn dispatched");
        let outcome = match self.config.mode {
            OrchestratorMode::Sequential => {
                let decision = tokio::select! {
                    biased;
                    () = turn.cancel.cancelled() => return TurnOutcome::Cancelled,
                    decision = tool => decision,
                };
                if !run.emit_toolcall(decision).await {
                    return TurnOutcome::Cancelled;
                }
                let mut gate = ChatGate::opened();
                let no_tool: Option<std::future::Pending<ToolDecision>> = None;
                self.drive(&mut run, &mut gate, no_tool, &mut chat, &turn.cancel)
                    .await
            }
            OrchestratorMode::Concurrent => {
                let mut gate = ChatGate::closed(self.config.prebuffer_max_chars);
                self.drive(&mut run, &mut gate, Some(tool), &mut chat, &turn.cancel)
                    .await
            }
        };

        match outcome {
            Drive::Cancelled => TurnOutcome::Cancelled,
            Drive::Finished => run.complete().await,
            Drive::ChatFailed(err) => run.fail(self.chat.name(), &err).await,
        }
    }

    /// Pump the chat stream through `gate`, opening it when `tool` resolves.
    ///
    /// Ends only once the chat stream is finished and the gate is open, so
    /// the toolcall frame is always written before the terminal frame.
    async fn drive<T>(
        &self,
        run: &mut TurnRun<'_>,
        gate: &mut ChatGate,
        tool: Option<T>,
        chat: &mut ChatStream,
        cancel: &CancellationToken,
    ) -> Drive
    where
        T: Future<Output = ToolDecision>,
    {
        let tool = async move {
            match tool {
                Some(tool) => tool.await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(tool);

        let idle = self.config.engine_idle_timeout;
        let mut chat_done = false;
        let mut chat_error = None;

        while !(chat_done && gate.is_open()) {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Drive::Cancelled,
                decision = &mut tool, if !gate.is_open() => {
                    if !run.emit_toolcall(decision).await {
                        return Drive::Cancelled;
                    }
                    run.usage.set_prebuffered(gate.prebuffered_tokens());
                    for text in gate.open() {
                        if !run.emit_token(text).await {
                            return Drive::Cancelled;
                        }
                    }
                }
                next = timeout(idle, chat.next()), if !chat_done && !gate.is_saturated() => {
                    match next {
                        Err(_) => {
                            chat_error = Some(EngineError::Timeout {
                                after_ms: u64::try_from(idle.as_millis()).unwrap_or(u64::MAX),
                            });
                            chat_done = true;
                        }
                        Ok(None) => chat_done = true,
                        Ok(Some(Ok(EngineEvent::Token { text }))) => {
                            let text = run.clean(text);
                            if text.is_empty() {
                                continue;
                            }
                            if let Some(text) = gate.push(text) {
                                if !run.emit_token(text).await {
                                    return Drive::Cancelled;
                                }
                            }
                        }
                        Ok(Some(Ok(EngineEvent::Finished { usage }))) => {
                            run.usage.record_chat_usage(usage);
                        }
                        Ok(Some(Err(err))) => {
                            if err.is_cancelled() && cancel.is_cancelled() {
                                return Drive::Cancelled;
                            }
                            chat_error = Some(err);
                            chat_done = true;
                        }
                    }
                }
            }
        }

        match chat_error {
            Some(err) => Drive::ChatFailed(err),
            None => Drive::Finished,
        }
    }

    fn request(
        &self,
        turn: &TurnRequest,
        key: &EngineRequestKey,
        role: EngineRole,
    ) -> GenerationRequest {
        GenerationRequest {
            key: key.clone(),
            role,
            persona: turn.context.persona.clone(),
            history: turn.context.history.clone(),
            user_identity: turn.context.user_identity.clone(),
            utterance: turn.utterance.clone(),
            sampling: turn.context.sampling.clone(),
            max_tokens: match role {
                EngineRole::Tool => Some(self.config.tool_max_tokens),
                EngineRole::Chat => None,
            },
            cancel: turn.cancel.clone(),
        }
    }
}

enum Drive {
    Finished,
    ChatFailed(EngineError),
    Cancelled,
}

/// Collect the classifier's full completion, bounded by `hard_timeout`.
async fn decide_tool(
    engine: Arc<dyn GenerationEngine>,
    request: GenerationRequest,
    hard_timeout: Duration,
) -> ToolDecision {
    let key = request.key.clone();
    let collect = async {
        let mut stream = engine.submit(request).await?;
        let mut raw = String::new();
        let mut tokens = 0u32;
        while let Some(event) = stream.next().await {
            match event? {
                EngineEvent::Token { text } => {
                    raw.push_str(&text);
                    tokens += 1;
                }
                EngineEvent::Finished { usage } => tokens = tokens.max(usage.completion_tokens),
            }
        }
        Ok::<_, EngineError>((raw, tokens))
    };

    match timeout(hard_timeout, collect).await {
        Ok(Ok((raw, tokens))) => ToolDecision::Decided { raw, tokens },
        Ok(Err(err)) => {
            warn!(engine = engine.name(), error = %err, category = err.category(), "tool decision failed");
            ToolDecision::Failed
        }
        Err(_) => {
            engine.cancel(&key);
            counter!(TOOL_GATE_TIMEOUTS_TOTAL).increment(1);
            ToolDecision::TimedOut
        }
    }
}

/// Emission state of one running turn.
struct TurnRun<'a> {
    register: &'a EpochRegister,
    epoch: Epoch,
    request_id: Option<String>,
    usage: UsageTracker,
    sanitize: bool,
}

impl TurnRun<'_> {
    fn clean(&self, text: String) -> String {
        if self.sanitize { sanitize_token(&text) } else { text }
    }

    async fn emit_toolcall(&mut self, decision: ToolDecision) -> bool {
        let tokens = decision.tokens();
        let timed_out = decision == ToolDecision::TimedOut;
        let frame = decision.into_frame(self.request_id.clone());
        info!(status = ?frame.status, reason = ?frame.reason, "tool gate opened");
        if !self.register.emit(self.epoch, ServerFrame::Toolcall(frame)).await {
            return false;
        }
        self.usage.record_toolcall(tokens, timed_out);
        true
    }

    async fn emit_token(&mut self, text: String) -> bool {
        let frame = ServerFrame::Token {
            text,
            request_id: self.request_id.clone(),
        };
        if !self.register.emit(self.epoch, frame).await {
            return false;
        }
        self.usage.record_chat_token();
        true
    }

    async fn complete(self) -> TurnOutcome {
        let usage = self.usage.snapshot();
        let done = ServerFrame::Done(DoneFrame::completed(usage.clone(), self.request_id.clone()));
        if !self.register.retire_with(self.epoch, done).await {
            return TurnOutcome::Cancelled;
        }
        counter!(TURNS_COMPLETED_TOTAL).increment(1);
        histogram!(TURN_DURATION_SECONDS).record(self.usage.elapsed().as_secs_f64());
        if let Some(ttft) = self.usage.ttft() {
            histogram!(TTFT_SECONDS).record(ttft.as_secs_f64());
        }
        info!(
            chat_tokens = usage.chat_tokens,
            ttft_ms = usage.ttft_ms,
            total_ms = usage.total_ms,
            "turn completed"
        );
        TurnOutcome::Completed
    }

    async fn fail(self, engine: &str, err: &EngineError) -> TurnOutcome {
        warn!(engine, error = %err, category = err.category(), "chat generation failed");
        let error = GatewayError::GenerationEngine {
            engine: engine.to_owned(),
            message: err.to_string(),
        };
        if !self
            .register
            .emit(self.epoch, error.to_frame_for(self.request_id.clone()))
            .await
        {
            return TurnOutcome::Cancelled;
        }
        let done = DoneFrame::failed(
            self.usage.snapshot(),
            self.request_id.clone(),
            error.to_done_error(),
        );
        if !self.register.retire_with(self.epoch, ServerFrame::Done(done)).await {
            return TurnOutcome::Cancelled;
        }
        counter!(TURNS_FAILED_TOTAL, "engine" => engine.to_owned()).increment(1);
        histogram!(TURN_DURATION_SECONDS).record(self.usage.elapsed().as_secs_f64());
        TurnOutcome::Failed
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;
    use duplex_core::sampling::SamplingOverrides;
    use duplex_engine::{ScriptedEngine, ScriptedReply};
    use tokio::sync::mpsc;

    use super::*;
    use crate::cancel::Outbound;

    fn context() -> TurnContext {
        TurnContext {
            persona: None,
            history: None,
            user_identity: None,
            sampling: SamplingOverrides::default(),
            persona_changed: false,
        }
    }

    fn orchestrator(
        mode: OrchestratorMode,
        tool: ScriptedReply,
        chat: ScriptedReply,
    ) -> (Orchestrator, Arc<ScriptedEngine>, Arc<ScriptedEngine>) {
        let tool = Arc::new(ScriptedEngine::new(tool));
        let chat = Arc::new(ScriptedEngine::new(chat));
        let config = OrchestratorConfig {
            mode,
            tool_hard_timeout: Duration::from_millis(300),
            prebuffer_max_chars: 1000,
            engine_idle_timeout: Duration::from_secs(5),
            tool_max_tokens: 16,
        };
        let orch = Orchestrator::new(
            Arc::clone(&tool) as Arc<dyn GenerationEngine>,
            Arc::clone(&chat) as Arc<dyn GenerationEngine>,
            config,
        );
        (orch, tool, chat)
    }

    async fn turn(register: &EpochRegister, request_id: &str) -> TurnRequest {
        TurnRequest {
            connection_id: ConnectionId::from_string("conn_t"),
            epoch: register.begin().await,
            request_id: Some(request_id.into()),
            utterance: "hello".into(),
            context: context(),
            cancel: CancellationToken::new(),
        }
    }

    fn frames(rx: &mut mpsc::Receiver<Outbound>) -> Vec<ServerFrame> {
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            if let Outbound::Frame(frame) = item {
                out.push(frame);
            }
        }
        out
    }

    fn kinds(frames: &[ServerFrame]) -> Vec<&'static str> {
        frames
            .iter()
            .map(|f| match f {
                ServerFrame::Toolcall(_) => "toolcall",
                ServerFrame::Token { .. } => "token",
                ServerFrame::Done(_) => "done",
                ServerFrame::Error(_) => "error",
                _ => "other",
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_holds_tokens_until_decision() {
        let (orch, _, _) = orchestrator(
            OrchestratorMode::Concurrent,
            ScriptedReply::tokens(["yes"]).with_initial_delay(Duration::from_millis(100)),
            ScriptedReply::tokens(["Hi", " there"]),
        );
        let (tx, mut rx) = mpsc::channel(64);
        let register = EpochRegister::new(tx);
        let req = turn(&register, "r1").await;

        let outcome = orch.run_turn(req, &register).await;
        assert_eq!(outcome, TurnOutcome::Completed);

        let frames = frames(&mut rx);
        assert_eq!(kinds(&frames), ["toolcall", "token", "token", "done"]);
        assert_matches!(&frames[0], ServerFrame::Toolcall(f) if f.status == ToolStatus::Yes && f.reason.is_none());
        assert_matches!(&frames[3], ServerFrame::Done(d) => {
            let usage = d.usage.as_ref().unwrap();
            assert_eq!(usage.chat_tokens, 2);
            assert_eq!(usage.prebuffered_tokens, 2);
            assert_eq!(usage.toolcall_ms, Some(100));
            assert!(d.cancelled.is_none());
            assert_eq!(d.request_id.as_deref(), Some("r1"));
        });
    }

    #[tokio::test(start_paused = true)]
    async fn sequential_starts_chat_after_toolcall() {
        let (orch, _, chat) = orchestrator(
            OrchestratorMode::Sequential,
            ScriptedReply::tokens(["no"]).with_initial_delay(Duration::from_millis(50)),
            ScriptedReply::tokens(["a", "b"]),
        );
        let (tx, mut rx) = mpsc::channel(64);
        let register = EpochRegister::new(tx);
        let req = turn(&register, "r1").await;

        assert_eq!(orch.run_turn(req, &register).await, TurnOutcome::Completed);
        assert_eq!(chat.submitted(), 1);
        let frames = frames(&mut rx);
        assert_eq!(kinds(&frames), ["toolcall", "token", "token", "done"]);
        assert_matches!(&frames[3], ServerFrame::Done(d) if d.usage.as_ref().unwrap().prebuffered_tokens == 0);
    }

    #[tokio::test(start_paused = true)]
    async fn tool_hard_timeout_synthesizes_no() {
        let (orch, tool, _) = orchestrator(
            OrchestratorMode::Concurrent,
            ScriptedReply::tokens(["yes"]).with_initial_delay(Duration::from_secs(10)),
            ScriptedReply::tokens(["ok"]),
        );
        let (tx, mut rx) = mpsc::channel(64);
        let register = EpochRegister::new(tx);
        let req = turn(&register, "r1").await;

        assert_eq!(orch.run_turn(req, &register).await, TurnOutcome::Completed);
        let frames = frames(&mut rx);
        assert_eq!(kinds(&frames), ["toolcall", "token", "done"]);
        assert_matches!(&frames[0], ServerFrame::Toolcall(f) => {
            assert_eq!(f.status, ToolStatus::No);
            assert_eq!(f.reason, Some(ToolcallReason::Timeout));
            assert!(f.raw.is_empty());
        });
        assert_matches!(&frames[2], ServerFrame::Done(d) if d.usage.as_ref().unwrap().tool_timed_out);
        assert_eq!(tool.cancelled().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn tool_failure_still_streams_chat() {
        let (orch, _, _) = orchestrator(
            OrchestratorMode::Concurrent,
            ScriptedReply::default().rejecting(),
            ScriptedReply::tokens(["fine"]),
        );
        let (tx, mut rx) = mpsc::channel(64);
        let register = EpochRegister::new(tx);
        let req = turn(&register, "r1").await;

        assert_eq!(orch.run_turn(req, &register).await, TurnOutcome::Completed);
        let frames = frames(&mut rx);
        assert_eq!(kinds(&frames), ["toolcall", "token", "done"]);
        assert_matches!(&frames[0], ServerFrame::Toolcall(f) if f.reason == Some(ToolcallReason::Error));
    }

    #[tokio::test(start_paused = true)]
    async fn chat_failure_sends_error_then_done() {
        let (orch, _, _) = orchestrator(
            OrchestratorMode::Concurrent,
            ScriptedReply::tokens(["no"]),
            ScriptedReply::tokens(["a", "b", "c"]).failing_after(1),
        );
        let (tx, mut rx) = mpsc::channel(64);
        let register = EpochRegister::new(tx);
        let req = turn(&register, "r1").await;

        assert_eq!(orch.run_turn(req, &register).await, TurnOutcome::Failed);
        let frames = frames(&mut rx);
        assert_eq!(kinds(&frames), ["toolcall", "token", "error", "done"]);
        assert_matches!(&frames[2], ServerFrame::Error(e) => {
            assert_eq!(e.error_code, "generation_failed");
            assert_eq!(e.request_id.as_deref(), Some("r1"));
        });
        assert_matches!(&frames[3], ServerFrame::Done(d) => {
            assert_eq!(d.error.as_ref().unwrap().error_code, "generation_failed");
            assert!(d.usage.is_some());
        });
    }

    #[tokio::test(start_paused = true)]
    async fn chat_rejection_fails_turn_after_toolcall() {
        let (orch, _, _) = orchestrator(
            OrchestratorMode::Sequential,
            ScriptedReply::tokens(["no"]),
            ScriptedReply::default().rejecting(),
        );
        let (tx, mut rx) = mpsc::channel(64);
        let register = EpochRegister::new(tx);
        let req = turn(&register, "r1").await;

        assert_eq!(orch.run_turn(req, &register).await, TurnOutcome::Failed);
        assert_eq!(kinds(&frames(&mut rx)), ["toolcall", "error", "done"]);
    }

    #[tokio::test(start_paused = true)]
    async fn saturated_gate_applies_backpressure_without_loss() {
        let (mut orch, _, _) = orchestrator(
            OrchestratorMode::Concurrent,
            ScriptedReply::tokens(["no"]).with_initial_delay(Duration::from_millis(200)),
            ScriptedReply::tokens(["aaaa", "bbbb", "cccc", "dddd"]),
        );
        orch.config.prebuffer_max_chars = 6;
        let (tx, mut rx) = mpsc::channel(64);
        let register = EpochRegister::new(tx);
        let req = turn(&register, "r1").await;

        assert_eq!(orch.run_turn(req, &register).await, TurnOutcome::Completed);
        let frames = frames(&mut rx);
        assert_eq!(kinds(&frames), ["toolcall", "token", "token", "token", "token", "done"]);
        let text: String = frames
            .iter()
            .filter_map(|f| match f {
                ServerFrame::Token { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "aaaabbbbccccdddd");
        assert_matches!(&frames[5], ServerFrame::Done(d) if d.usage.as_ref().unwrap().prebuffered_tokens == 2);
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_epoch_emits_nothing_more() {
        let (orch, _, _) = orchestrator(
            OrchestratorMode::Concurrent,
            ScriptedReply::tokens(["no"]),
            ScriptedReply::tokens(["a", "b", "c"]).with_token_delay(Duration::from_millis(100)),
        );
        let (tx, mut rx) = mpsc::channel(64);
        let register = Arc::new(EpochRegister::new(tx));
        let req = turn(&register, "r1").await;
        let orch = Arc::new(orch);

        let task = {
            let orch = Arc::clone(&orch);
            let register = Arc::clone(&register);
            tokio::spawn(async move { orch.run_turn(req, &register).await })
        };
        tokio::time::sleep(Duration::from_millis(150)).await;
        let _ = register.begin().await;

        assert_eq!(task.await.unwrap(), TurnOutcome::Cancelled);
        let frames = frames(&mut rx);
        assert_eq!(kinds(&frames), ["toolcall", "token"]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_token_stops_turn() {
        let (orch, _, _) = orchestrator(
            OrchestratorMode::Concurrent,
            ScriptedReply::tokens(["no"]),
            ScriptedReply::tokens(["a", "b"]).with_token_delay(Duration::from_secs(1)),
        );
        let (tx, mut rx) = mpsc::channel(64);
        let register = EpochRegister::new(tx);
        let req = turn(&register, "r1").await;
        let cancel = req.cancel.clone();

        let (outcome, ()) = tokio::join!(orch.run_turn(req, &register), async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            cancel.cancel();
        });
        assert_eq!(outcome, TurnOutcome::Cancelled);
        assert_eq!(kinds(&frames(&mut rx)), ["toolcall"]);
    }

    #[tokio::test(start_paused = true)]
    async fn sanitize_flag_cleans_tokens() {
        let (orch, _, _) = orchestrator(
            OrchestratorMode::Concurrent,
            ScriptedReply::tokens(["no"]),
            ScriptedReply::tokens(["hi", "<|eot_id|>"]),
        );
        let (tx, mut rx) = mpsc::channel(64);
        let register = EpochRegister::new(tx);
        let mut req = turn(&register, "r1").await;
        req.context.sampling.sanitize_output = Some(true);

        assert_eq!(orch.run_turn(req, &register).await, TurnOutcome::Completed);
        assert_eq!(kinds(&frames(&mut rx)), ["toolcall", "token", "done"]);
    }

    #[tokio::test(start_paused = true)]
    async fn chat_idle_timeout_fails_turn() {
        let (mut orch, _, _) = orchestrator(
            OrchestratorMode::Concurrent,
            ScriptedReply::tokens(["no"]),
            ScriptedReply::tokens(["slow"]).with_initial_delay(Duration::from_secs(60)),
        );
        orch.config.engine_idle_timeout = Duration::from_secs(1);
        let (tx, mut rx) = mpsc::channel(64);
        let register = EpochRegister::new(tx);
        let req = turn(&register, "r1").await;

        assert_eq!(orch.run_turn(req, &register).await, TurnOutcome::Failed);
        assert_eq!(kinds(&frames(&mut rx)), ["toolcall", "error", "done"]);
    }

    #[test]
    fn decision_frames() {
        let yes = ToolDecision::Decided {
            raw: "Yes, search".into(),
            tokens: 2,
        }
        .into_frame(None);
        assert_eq!(yes.status, ToolStatus::Yes);
        assert_eq!(yes.raw, "Yes, search");
        let failed = ToolDecision::Failed.into_frame(Some("r".into()));
        assert_eq!(failed.reason, Some(ToolcallReason::Error));
        assert_eq!(failed.request_id.as_deref(), Some("r"));
    }
}
