//! Shutdown signalling and background-task tracking.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

/// Owns the process-wide shutdown token and the gateway's background tasks.
///
/// Connection actors select on [`token`](Self::token); when it fires they
/// cancel their active turn, send `connection_closed{server_shutdown}` and
/// close with 1001. The listener and the session sweeper are spawned through
/// [`spawn`](Self::spawn) so shutdown can wait for them.
#[derive(Debug)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    tasks: TaskTracker,
}

impl ShutdownCoordinator {
    /// Create a coordinator with no tracked tasks.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// A clone of the shutdown token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Initiate shutdown. Logs only the first call.
    pub fn shutdown(&self) {
        if !self.token.is_cancelled() {
            info!("shutdown initiated");
        }
        self.token.cancel();
    }

    /// Whether shutdown has been initiated.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Spawn a background task that shutdown waits for.
    pub fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tasks.spawn(task)
    }

    /// Tracked tasks still running.
    pub fn running_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Signal shutdown and wait up to `grace` for every tracked task.
    ///
    /// Returns `false` if the grace period elapsed first.
    pub async fn graceful_shutdown(&self, grace: Duration) -> bool {
        self.shutdown();
        let _ = self.tasks.close();
        info!(
            task_count = self.tasks.len(),
            grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
            "waiting for background tasks"
        );
        if tokio::time::timeout(grace, self.tasks.wait()).await.is_ok() {
            return true;
        }
        warn!(
            still_running = self.tasks.len(),
            "shutdown grace elapsed with background tasks still running"
        );
        false
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_idle() {
        let coord = ShutdownCoordinator::new();
        assert!(!coord.is_shutting_down());
        assert_eq!(coord.running_tasks(), 0);
    }

    #[test]
    fn shutdown_is_idempotent_and_reaches_child_tokens() {
        let coord = ShutdownCoordinator::new();
        let child = coord.token().child_token();
        coord.shutdown();
        coord.shutdown();
        assert!(coord.is_shutting_down());
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn waits_for_tasks_that_watch_the_token() {
        let coord = ShutdownCoordinator::new();
        let token = coord.token();
        let _ = coord.spawn(async move { token.cancelled().await });
        assert_eq!(coord.running_tasks(), 1);

        assert!(coord.graceful_shutdown(Duration::from_secs(5)).await);
        assert_eq!(coord.running_tasks(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reports_tasks_that_ignore_the_token() {
        let coord = ShutdownCoordinator::new();
        let _ = coord.spawn(tokio::time::sleep(Duration::from_secs(3600)));

        assert!(!coord.graceful_shutdown(Duration::from_millis(100)).await);
        assert_eq!(coord.running_tasks(), 1);
    }
}
