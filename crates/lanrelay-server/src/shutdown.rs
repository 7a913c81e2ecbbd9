//! Graceful shutdown coordination via `CancellationToken`.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

/// Coordinates graceful shutdown across the accept loop and every session.
///
/// Two tokens: `token` asks everything to wind down; `force_token` fires
/// once the grace period has elapsed and abandons whatever is still
/// draining.
pub struct ShutdownCoordinator {
    token: CancellationToken,
    force: CancellationToken,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            force: CancellationToken::new(),
        }
    }

    /// Get a clone of the graceful cancellation token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Get a clone of the forced-termination token.
    pub fn force_token(&self) -> CancellationToken {
        self.force.clone()
    }

    /// Initiate graceful shutdown.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Abandon in-flight work. Implies [`shutdown`](Self::shutdown).
    pub fn force(&self) {
        self.token.cancel();
        self.force.cancel();
    }

    /// Perform a graceful shutdown of all tracked tasks.
    ///
    /// 1. Cancel the shutdown token (signals all tasks)
    /// 2. Wait up to `grace` for every tracked task to complete
    /// 3. Fire the force token if any task is still running
    ///
    /// Returns `true` when everything drained within the grace period.
    pub async fn graceful_shutdown(&self, tracker: &TaskTracker, grace: Duration) -> bool {
        self.shutdown();
        let _ = tracker.close();
        info!(
            task_count = tracker.len(),
            grace_ms = grace.as_millis() as u64,
            "waiting for tasks to complete"
        );

        if tokio::time::timeout(grace, tracker.wait()).await.is_ok() {
            true
        } else {
            warn!(
                remaining = tracker.len(),
                "shutdown grace period of {grace:?} elapsed, forcing termination"
            );
            self.force();
            false
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
