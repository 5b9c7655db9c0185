//! Per-turn usage accounting.

use std::time::Duration;

use duplex_core::protocol::TurnUsage;
use duplex_engine::EngineUsage;
use tokio::time::Instant;

/// Accumulates the counters reported on `done`.
#[derive(Debug)]
pub struct UsageTracker {
    started: Instant,
    chat_tokens: u32,
    prompt_tokens: u32,
    tool_tokens: u32,
    toolcall_at: Option<Duration>,
    first_token_at: Option<Duration>,
    prebuffered_tokens: u32,
    tool_timed_out: bool,
}

impl UsageTracker {
    /// Start measuring from `started`.
    pub fn new(started: Instant) -> Self {
        Self {
            started,
            chat_tokens: 0,
            prompt_tokens: 0,
            tool_tokens: 0,
            toolcall_at: None,
            first_token_at: None,
            prebuffered_tokens: 0,
            tool_timed_out: false,
        }
    }

    /// The toolcall frame was emitted.
    pub fn record_toolcall(&mut self, tool_tokens: u32, timed_out: bool) {
        self.toolcall_at = Some(self.started.elapsed());
        self.tool_tokens = tool_tokens;
        self.tool_timed_out = timed_out;
    }

    /// A chat token frame was emitted.
    pub fn record_chat_token(&mut self) {
        if self.first_token_at.is_none() {
            self.first_token_at = Some(self.started.elapsed());
        }
        self.chat_tokens += 1;
    }

    /// The chat engine reported final usage.
    pub fn record_chat_usage(&mut self, usage: EngineUsage) {
        self.prompt_tokens = usage.prompt_tokens;
    }

    /// Tokens held behind the toolcall gate.
    pub fn set_prebuffered(&mut self, tokens: u32) {
        self.prebuffered_tokens = tokens;
    }

    /// Time to first chat token, if one was sent.
    pub fn ttft(&self) -> Option<Duration> {
        self.first_token_at
    }

    /// Time since the turn started.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Snapshot for the `done` frame.
    pub fn snapshot(&self) -> TurnUsage {
        TurnUsage {
            chat_tokens: self.chat_tokens,
            prompt_tokens: self.prompt_tokens,
            tool_tokens: self.tool_tokens,
            toolcall_ms: self.toolcall_at.map(millis),
            ttft_ms: self.first_token_at.map(millis),
            total_ms: millis(self.started.elapsed()),
            prebuffered_tokens: self.prebuffered_tokens,
            tool_timed_out: self.tool_timed_out,
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
