//! Auto-reconnect supervision
//!
//! After an unexpected socket closure the session hands the supervisor a
//! reconnect attempt. The supervisor holds it back for a fixed delay and then
//! runs it, unless the user disconnected in the meantime. At most one attempt
//! is pending at any time; each failed attempt schedules the next one itself.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Fixed delay before each reconnect attempt
pub const RECONNECT_DELAY: Duration = Duration::from_millis(1000);

struct PendingAttempt {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Reconnect supervisor
pub struct ReconnectSupervisor {
    delay: Duration,
    should_reconnect: AtomicBool,
    pending: Mutex<Option<PendingAttempt>>,
    attempts: AtomicU32,
}

impl ReconnectSupervisor {
    /// Create a disarmed supervisor with the standard delay
    pub fn new() -> Arc<Self> {
        Self::with_delay(RECONNECT_DELAY)
    }

    /// Create a disarmed supervisor with a custom delay
    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            should_reconnect: AtomicBool::new(false),
            pending: Mutex::new(None),
            attempts: AtomicU32::new(0),
        })
    }

    /// Enable reconnection after a successful socket open
    pub fn arm(&self) {
        self.should_reconnect.store(true, Ordering::Release);
    }

    /// Disable reconnection and drop any pending attempt
    pub fn disarm(&self) {
        self.should_reconnect.store(false, Ordering::Release);
        self.cancel_pending();
    }

    /// Drop the pending attempt without changing the armed state
    pub fn cancel_pending(&self) {
        if let Some(pending) = self.pending.lock().take() {
            debug!("Cancelling pending reconnect");
            pending.cancel.cancel();
            pending.handle.abort();
        }
    }

    /// Whether an unexpected closure should be followed by a reconnect
    pub fn should_reconnect(&self) -> bool {
        self.should_reconnect.load(Ordering::Acquire)
    }

    /// Whether an attempt is waiting on its timer
    pub fn is_pending(&self) -> bool {
        self.pending.lock().is_some()
    }

    /// Attempts started since the last successful connect
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Reset the attempt counter after a successful connect
    pub fn reset_attempts(&self) {
        self.attempts.store(0, Ordering::Relaxed);
    }

    /// Schedule one attempt after the delay
    ///
    /// Returns `false` when disarmed or when an attempt is already pending.
    pub fn schedule<F>(self: &Arc<Self>, attempt: F) -> bool
    where
        F: FnOnce() -> BoxFuture<'static, ()> + Send + 'static,
    {
        if !self.should_reconnect() {
            return false;
        }

        let mut pending = self.pending.lock();
        if pending.is_some() {
            debug!("Reconnect already pending");
            return false;
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let supervisor = Arc::downgrade(self);
        let delay = self.delay;

        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            let Some(supervisor) = supervisor.upgrade() else {
                return;
            };
            {
                let mut pending = supervisor.pending.lock();
                if token.is_cancelled() {
                    return;
                }
                pending.take();
            }
            if !supervisor.should_reconnect() {
                return;
            }

            let n = supervisor.attempts.fetch_add(1, Ordering::Relaxed) + 1;
            info!("Reconnect attempt {}", n);
            attempt().await;
        });

        *pending = Some(PendingAttempt { cancel, handle });
        true
    }
}

impl Drop for ReconnectSupervisor {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.get_mut().take() {
            pending.cancel.cancel();
            pending.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::AtomicUsize;

    fn counting(
        counter: &Arc<AtomicUsize>,
    ) -> impl FnOnce() -> BoxFuture<'static, ()> + Send + 'static {
        let counter = counter.clone();
        move || {
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_runs_after_delay() {
        let supervisor = ReconnectSupervisor::new();
        let runs = Arc::new(AtomicUsize::new(0));
        supervisor.arm();

        assert!(supervisor.schedule(counting(&runs)));
        assert!(supervisor.is_pending());

        tokio::time::sleep(Duration::from_millis(999)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!supervisor.is_pending());
        assert_eq!(supervisor.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_one_pending() {
        let supervisor = ReconnectSupervisor::new();
        let runs = Arc::new(AtomicUsize::new(0));
        supervisor.arm();

        assert!(supervisor.schedule(counting(&runs)));
        assert!(!supervisor.schedule(counting(&runs)));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disarm_cancels_pending() {
        let supervisor = ReconnectSupervisor::new();
        let runs = Arc::new(AtomicUsize::new(0));
        supervisor.arm();

        assert!(supervisor.schedule(counting(&runs)));
        tokio::time::sleep(Duration::from_millis(500)).await;
        supervisor.disarm();
        assert!(!supervisor.is_pending());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert!(!supervisor.schedule(counting(&runs)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disarmed_does_not_schedule() {
        let supervisor = ReconnectSupervisor::new();
        let runs = Arc::new(AtomicUsize::new(0));

        assert!(!supervisor.schedule(counting(&runs)));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_can_reschedule() {
        let supervisor = ReconnectSupervisor::with_delay(Duration::from_millis(100));
        let runs = Arc::new(AtomicUsize::new(0));
        supervisor.arm();

        let again = supervisor.clone();
        let counter = runs.clone();
        let inner = counting(&runs);
        supervisor.schedule(move || {
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                again.schedule(inner);
            }
            .boxed()
        });

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(supervisor.attempts(), 2);
    }
}
