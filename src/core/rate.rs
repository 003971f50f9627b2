//! Received-line frequency sampler
//!
//! Appends only bump a counter; a timer task folds the counter into the
//! published rate once per period, whether or not anything was appended.

use super::logger::LogBuffer;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Sampling period for [`LineRate`]
pub const SAMPLE_PERIOD: Duration = Duration::from_secs(1);

/// Lines-per-second metric over received data
///
/// The sampling task is aborted when the value is dropped.
pub struct LineRate {
    current: Arc<AtomicU64>,
    task: JoinHandle<()>,
}

impl LineRate {
    /// Start sampling `buffer` once per second
    pub fn start(buffer: &LogBuffer) -> Self {
        Self::with_period(buffer, SAMPLE_PERIOD)
    }

    /// Start sampling with a custom period
    pub fn with_period(buffer: &LogBuffer, period: Duration) -> Self {
        let pending = buffer.line_counter();
        let current = Arc::new(AtomicU64::new(0));
        let published = current.clone();

        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                published.store(pending.swap(0, Ordering::Relaxed), Ordering::Relaxed);
            }
        });

        Self { current, task }
    }

    /// Lines counted during the last complete period
    pub fn lines_per_period(&self) -> u64 {
        self.current.load(Ordering::Relaxed)
    }

    /// Stop sampling
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for LineRate {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::logger::EntryKind;
    use bytes::Bytes;

    #[tokio::test(start_paused = true)]
    async fn test_rate_resets_each_period() {
        let buffer = LogBuffer::default();
        let rate = LineRate::start(&buffer);

        buffer.append(EntryKind::Received, Bytes::from_static(b"a\nb\n"), "a\nb\n");
        buffer.append(EntryKind::Received, Bytes::from_static(b"c\n"), "c\n");
        assert_eq!(rate.lines_per_period(), 0);

        tokio::time::sleep(Duration::from_millis(1050)).await;
        assert_eq!(rate.lines_per_period(), 3);

        // No appends during the next period: the sampler still resets it.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(rate.lines_per_period(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_freezes_rate() {
        let buffer = LogBuffer::default();
        let rate = LineRate::start(&buffer);
        rate.stop();

        buffer.append(EntryKind::Received, Bytes::from_static(b"x\n"), "x\n");
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(rate.lines_per_period(), 0);
    }
}
