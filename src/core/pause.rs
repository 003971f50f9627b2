//! Shared pause flag
//!
//! The read loop, the send-queue drain loop and the transfer loop each hold a
//! clone and consult it at their own checkpoints. Every pause also bumps a
//! generation counter so a loop can tell that a pause happened in between two
//! checks even if the session was resumed since. Tasks that sit on a write can
//! instead wait for [`PauseFlag::paused`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct PauseState {
    paused: AtomicBool,
    generation: AtomicU64,
    notify: Notify,
}

/// Cloneable handle to the session pause state
#[derive(Debug, Clone, Default)]
pub struct PauseFlag {
    state: Arc<PauseState>,
}

impl PauseFlag {
    /// Create an unpaused flag
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the session is paused right now
    pub fn is_paused(&self) -> bool {
        self.state.paused.load(Ordering::Acquire)
    }

    /// Pause; returns `false` if already paused
    pub fn pause(&self) -> bool {
        if self.state.paused.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.state.generation.fetch_add(1, Ordering::AcqRel);
        self.state.notify.notify_waiters();
        true
    }

    /// Resume; returns `false` if not paused
    pub fn resume(&self) -> bool {
        self.state.paused.swap(false, Ordering::AcqRel)
    }

    /// Number of pauses so far
    pub fn generation(&self) -> u64 {
        self.state.generation.load(Ordering::Acquire)
    }

    /// Resolve once the session is paused (immediately if it already is)
    pub async fn paused(&self) {
        loop {
            let notified = self.state.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a pause in between is not missed.
            notified.as_mut().enable();
            if self.is_paused() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pause_resume() {
        let flag = PauseFlag::new();
        let other = flag.clone();
        assert!(!other.is_paused());

        assert!(flag.pause());
        assert!(!flag.pause());
        assert!(other.is_paused());
        assert_eq!(other.generation(), 1);

        assert!(other.resume());
        assert!(!flag.resume());
        assert!(!flag.is_paused());
        assert_eq!(flag.generation(), 1);
    }

    #[tokio::test]
    async fn test_paused_wakes_waiter() {
        let flag = PauseFlag::new();
        let waiter = {
            let flag = flag.clone();
            tokio::spawn(async move { flag.paused().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        flag.pause();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();

        // Already paused resolves at once.
        flag.paused().await;
    }
}
