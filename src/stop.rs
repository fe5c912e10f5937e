//! Cooperative cancellation of an orchestrator and its workers.

use std::future::Future;

use tokio::sync::watch;

/// A cancellation flag shared by an orchestrator and every worker it spawns.
///
/// Once stopped, a stopper never resets.
#[derive(Debug, Clone)]
pub struct Stopper {
    stopped: watch::Sender<bool>,
}

impl Default for Stopper {
    fn default() -> Self {
        Self::new()
    }
}

impl Stopper {
    /// Creates a stopper that is not yet stopped.
    pub fn new() -> Self {
        let (stopped, _) = watch::channel(false);
        Self { stopped }
    }

    /// Stops the protocol, waking up everyone awaiting [`Stopper::stopped`].
    pub fn stop(&self) {
        self.stopped.send_if_modified(|stopped| !std::mem::replace(stopped, true));
    }

    /// Whether the protocol was stopped.
    pub fn is_stopped(&self) -> bool {
        *self.stopped.borrow()
    }

    /// Completes once the protocol is stopped.
    pub async fn stopped(&self) {
        let mut stopped = self.stopped.subscribe();
        // the sender lives in `self`, so the channel cannot close while we wait
        let _ = stopped.wait_for(|stopped| *stopped).await;
    }

    /// Runs `fut` to completion unless the protocol is stopped first.
    ///
    /// Returns `None` if the stopper won the race or was already set.
    pub async fn run_until_stopped<T>(&self, fut: impl Future<Output = T>) -> Option<T> {
        if self.is_stopped() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.stopped() => None,
            out = fut => Some(out),
        }
    }
}
