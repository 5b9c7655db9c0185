//! Sliding-window rate limiting.
//!
//! Each window keeps the timestamps of accepted events inside the trailing
//! window. A check evicts expired timestamps, compares the remainder with the
//! limit and only records the event when it is accepted, so a rejected
//! message leaves no trace. `limit = 0` or `window = 0` disables a window.
//!
//! Per-connection windows (messages, cancels) live in [`ConnectionLimits`],
//! owned by the connection actor. Per-session persona windows live in the
//! shared [`RateLimiter`].

use std::collections::VecDeque;
use std::time::Duration;

use dashmap::DashMap;
use duplex_core::{GatewayError, RateLimitCategory, RateLimitScope, SessionId};
use duplex_settings::{RateLimitSettings, WindowLimit};
use metrics::counter;
use tokio::time::Instant;
use tracing::debug;

use crate::metrics::RATE_LIMIT_REJECTIONS_TOTAL;

/// A continuous sliding window over event timestamps.
#[derive(Clone, Debug)]
pub struct SlidingWindow {
    limit: usize,
    window: Duration,
    events: VecDeque<Instant>,
}

impl SlidingWindow {
    /// Create a window from configured limits.
    pub fn new(limit: WindowLimit) -> Self {
        Self {
            limit: limit.limit as usize,
            window: Duration::from_secs(limit.window_secs),
            events: VecDeque::new(),
        }
    }

    /// Whether this window never rejects.
    pub fn is_disabled(&self) -> bool {
        self.limit == 0 || self.window.is_zero()
    }

    /// Record an event at `now` if the window has room.
    ///
    /// On rejection returns how long until the oldest event leaves the window.
    pub fn check_and_record(&mut self, now: Instant) -> Result<(), Duration> {
        if self.is_disabled() {
            return Ok(());
        }
        self.evict(now);
        if self.events.len() >= self.limit {
            let retry_after = self
                .events
                .front()
                .map_or(self.window, |oldest| (*oldest + self.window).saturating_duration_since(now));
            return Err(retry_after);
        }
        self.events.push_back(now);
        Ok(())
    }

    /// Events currently inside the window.
    pub fn len(&mut self, now: Instant) -> usize {
        self.evict(now);
        self.events.len()
    }

    fn evict(&mut self, now: Instant) {
        while let Some(oldest) = self.events.front() {
            if now.saturating_duration_since(*oldest) >= self.window {
                let _ = self.events.pop_front();
            } else {
                break;
            }
        }
    }
}

fn rejection(category: RateLimitCategory, scope: RateLimitScope, retry_after: Duration) -> GatewayError {
    counter!(RATE_LIMIT_REJECTIONS_TOTAL, "category" => category.as_str()).increment(1);
    debug!(%category, %scope, retry_after_ms = retry_after.as_millis(), "rate limit exceeded");
    GatewayError::RateLimited {
        category,
        scope,
        // round up so a client waiting exactly this long is admitted
        retry_after_ms: u64::try_from(retry_after.as_micros().div_ceil(1000)).unwrap_or(u64::MAX),
    }
}

/// Per-connection windows, owned by one connection actor.
#[derive(Clone, Debug)]
pub struct ConnectionLimits {
    messages: SlidingWindow,
    cancels: SlidingWindow,
}

impl ConnectionLimits {
    /// Check the general message window.
    pub fn check_message(&mut self) -> Result<(), GatewayError> {
        self.messages
            .check_and_record(Instant::now())
            .map_err(|retry| rejection(RateLimitCategory::Message, RateLimitScope::Connection, retry))
    }

    /// Check the cancel window.
    pub fn check_cancel(&mut self) -> Result<(), GatewayError> {
        self.cancels
            .check_and_record(Instant::now())
            .map_err(|retry| rejection(RateLimitCategory::Cancel, RateLimitScope::Connection, retry))
    }
}

/// Shared limiter: hands out connection windows and owns session windows.
#[derive(Debug)]
pub struct RateLimiter {
    policy: RateLimitSettings,
    persona_windows: DashMap<SessionId, SlidingWindow>,
}

impl RateLimiter {
    /// Create a limiter for the given policy.
    pub fn new(policy: RateLimitSettings) -> Self {
        Self {
            policy,
            persona_windows: DashMap::new(),
        }
    }

    /// Fresh windows for a new connection.
    pub fn connection_limits(&self) -> ConnectionLimits {
        ConnectionLimits {
            messages: SlidingWindow::new(self.policy.messages),
            cancels: SlidingWindow::new(self.policy.cancels),
        }
    }

    /// Check and record a persona change for `session_id`.
    pub fn check_persona_update(&self, session_id: &SessionId) -> Result<(), GatewayError> {
        if self.policy.persona_updates.is_disabled() {
            return Ok(());
        }
        let mut window = self
            .persona_windows
            .entry(session_id.clone())
            .or_insert_with(|| SlidingWindow::new(self.policy.persona_updates));
        window
            .check_and_record(Instant::now())
            .map_err(|retry| rejection(RateLimitCategory::PersonaUpdate, RateLimitScope::Session, retry))
    }

    /// Drop the persona window of an evicted session.
    pub fn forget_session(&self, session_id: &SessionId) {
        let _ = self.persona_windows.remove(session_id);
    }

    /// Sessions with a persona window.
    pub fn tracked_sessions(&self) -> usize {
        self.persona_windows.len()
    }
}
