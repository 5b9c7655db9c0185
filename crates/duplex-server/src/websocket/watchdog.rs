//! Per-connection idle deadline.

use std::time::Duration;

use tokio::time::Instant;

/// Deadline pushed forward by every inbound frame.
///
/// Outbound traffic never resets it. A zero timeout disables the watchdog.
#[derive(Debug)]
pub struct IdleWatchdog {
    timeout: Duration,
    deadline: Instant,
}

impl IdleWatchdog {
    /// Arm the watchdog starting now.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            deadline: Instant::now() + timeout,
        }
    }

    /// Configured timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn is_enabled(&self) -> bool {
        !self.timeout.is_zero()
    }

    /// Record inbound activity.
    pub fn reset(&mut self) {
        self.deadline = Instant::now() + self.timeout;
    }

    /// Resolve at the deadline, or never when disabled.
    pub async fn expired(&self) {
        if self.is_enabled() {
            tokio::time::sleep_until(self.deadline).await;
        } else {
            std::future::pending::<()>().await;
        }
    }
}
