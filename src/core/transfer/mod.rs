//! Raw chunked file transfer
//!
//! Streams a byte payload to the link in fixed-size chunks, optionally paced by
//! a delay between chunks. There is no protocol framing: the receiver sees the
//! file bytes verbatim. The loop checks the session pause flag before every
//! chunk and stops for good if a pause happened; it never resumes by itself.
//! A pause that lands while a chunk is still queued takes that chunk back.

use super::logger::LogBuffer;
use super::pause::PauseFlag;
use super::send_queue::{ChunkWrite, SendQueue};
use super::transport::{Capabilities, TransportError};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Chunking and pacing settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferOptions {
    /// Bytes per write
    pub chunk_size: usize,
    /// Pause between two chunks
    pub inter_chunk_delay: Duration,
}

impl TransferOptions {
    /// Create options
    pub fn new(chunk_size: usize, inter_chunk_delay: Duration) -> Self {
        Self {
            chunk_size,
            inter_chunk_delay,
        }
    }
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self::new(256, Duration::from_millis(10))
    }
}

/// Progress after a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    /// Bytes written so far
    pub sent: usize,
    /// Payload size
    pub total: usize,
    /// `round(sent / total * 100)`
    pub percent: u8,
}

impl TransferProgress {
    fn new(sent: usize, total: usize) -> Self {
        let percent = if total == 0 {
            100
        } else {
            ((sent as f64 / total as f64) * 100.0).round() as u8
        };
        Self {
            sent,
            total,
            percent,
        }
    }
}

/// How a transfer ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Every byte was written
    Completed {
        /// Payload size
        total: usize,
        /// Writes issued
        chunks: usize,
    },
    /// The session was paused; the rest was not sent
    Aborted {
        /// Bytes written before the pause
        sent: usize,
        /// Payload size
        total: usize,
    },
    /// The session went away (disconnect or link loss)
    Cancelled {
        /// Bytes written before cancellation
        sent: usize,
        /// Payload size
        total: usize,
    },
    /// A chunk write failed
    Failed {
        /// Bytes written before the failure
        sent: usize,
        /// Payload size
        total: usize,
        /// The write error
        error: TransportError,
    },
}

/// One file transfer
pub struct TransferJob {
    name: String,
    data: Bytes,
    sent: usize,
    chunk_size: usize,
    delay: Duration,
    on_progress: Box<dyn FnMut(TransferProgress) + Send>,
}

impl TransferJob {
    /// Create a job; a zero chunk size is rejected
    pub fn new(
        name: impl Into<String>,
        data: Bytes,
        options: TransferOptions,
    ) -> Result<Self, TransportError> {
        if options.chunk_size == 0 {
            return Err(TransportError::Configuration(
                "chunk size must be at least 1".into(),
            ));
        }
        Ok(Self {
            name: name.into(),
            data,
            sent: 0,
            chunk_size: options.chunk_size,
            delay: options.inter_chunk_delay,
            on_progress: Box::new(|_| {}),
        })
    }

    /// Report progress after every chunk
    #[must_use]
    pub fn on_progress(mut self, f: impl FnMut(TransferProgress) + Send + 'static) -> Self {
        self.on_progress = Box::new(f);
        self
    }

    /// Payload size
    pub fn total(&self) -> usize {
        self.data.len()
    }

    /// Transfer name
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// What the transfer loop needs from the session
#[derive(Clone)]
pub struct TransferContext {
    /// Write path
    pub queue: Arc<SendQueue>,
    /// Session pause flag
    pub paused: PauseFlag,
    /// Log for the completion / abort entries
    pub log: Arc<LogBuffer>,
    /// Cancelled on disconnect
    pub cancel: CancellationToken,
    /// Capabilities of the active link
    pub capabilities: Capabilities,
}

/// Run a transfer to completion, pause, cancellation or failure
///
/// Only one transfer may run at a time; callers enforce that.
pub async fn send_file(mut job: TransferJob, ctx: &TransferContext) -> TransferOutcome {
    let total = job.total();
    let chunk_size = ctx.capabilities.clamp_chunk(job.chunk_size).max(1);
    let pause_generation = ctx.paused.generation();
    let mut chunks = 0;

    debug!(
        "Transfer '{}': {} bytes in chunks of {} ({:?} apart)",
        job.name, total, chunk_size, job.delay
    );

    if total == 0 {
        (job.on_progress)(TransferProgress::new(0, 0));
    }

    while job.sent < total {
        if ctx.paused.is_paused() || ctx.paused.generation() != pause_generation {
            return abort(&job, ctx);
        }
        if ctx.cancel.is_cancelled() {
            return cancelled(&job, ctx);
        }

        let end = (job.sent + chunk_size).min(total);
        let chunk = job.data.slice(job.sent..end);

        let write = tokio::select! {
            _ = ctx.cancel.cancelled() => return cancelled(&job, ctx),
            result = ctx.queue.submit_chunk(chunk) => result,
        };
        match write {
            Ok(ChunkWrite::Written) => {}
            Ok(ChunkWrite::Withdrawn) => return abort(&job, ctx),
            Err(error) => {
                warn!(
                    "Transfer '{}' failed at {}/{}: {}",
                    job.name, job.sent, total, error
                );
                ctx.log.error(format!(
                    "File transfer failed: {} ({} of {} bytes sent): {}",
                    job.name, job.sent, total, error
                ));
                return TransferOutcome::Failed {
                    sent: job.sent,
                    total,
                    error,
                };
            }
        }

        job.sent = end;
        chunks += 1;
        (job.on_progress)(TransferProgress::new(job.sent, total));

        if job.sent < total && !job.delay.is_zero() {
            tokio::select! {
                _ = ctx.cancel.cancelled() => return cancelled(&job, ctx),
                _ = tokio::time::sleep(job.delay) => {}
            }
        }
    }

    if ctx.paused.is_paused() {
        return abort(&job, ctx);
    }

    info!(
        "Transfer '{}' complete: {} bytes in {} chunks",
        job.name, total, chunks
    );
    ctx.log
        .info(format!("File transfer complete: {} ({} bytes)", job.name, total));
    TransferOutcome::Completed { total, chunks }
}

fn abort(job: &TransferJob, ctx: &TransferContext) -> TransferOutcome {
    let total = job.total();
    warn!(
        "Transfer '{}' aborted by pause at {}/{}",
        job.name, job.sent, total
    );
    ctx.log.error(format!(
        "File transfer aborted (paused): {} ({} of {} bytes sent)",
        job.name, job.sent, total
    ));
    TransferOutcome::Aborted {
        sent: job.sent,
        total,
    }
}

fn cancelled(job: &TransferJob, ctx: &TransferContext) -> TransferOutcome {
    let total = job.total();
    debug!("Transfer '{}' cancelled at {}/{}", job.name, job.sent, total);
    ctx.log.info(format!(
        "File transfer cancelled: {} ({} of {} bytes sent)",
        job.name, job.sent, total
    ));
    TransferOutcome::Cancelled {
        sent: job.sent,
        total,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::logger::EntryKind;
    use crate::core::send_queue::SendItem;
    use crate::core::transport::{memory, SendMode, TransportKind};
    use parking_lot::Mutex;

    fn context(caps: Capabilities) -> (TransferContext, memory::MemoryPeer) {
        let log = Arc::new(LogBuffer::default());
        let paused = PauseFlag::new();
        let queue = SendQueue::new(log.clone(), paused.clone());
        let (open, peer) = memory::pair(TransportKind::Serial, caps);
        queue.attach(open.link);
        let ctx = TransferContext {
            queue,
            paused,
            log,
            cancel: CancellationToken::new(),
            capabilities: caps,
        };
        (ctx, peer)
    }

    fn make_job(name: &str, len: usize, chunk: usize, delay_ms: u64) -> TransferJob {
        let options = TransferOptions::new(chunk, Duration::from_millis(delay_ms));
        TransferJob::new(name, Bytes::from(vec![0u8; len]), options).unwrap()
    }

    fn entries(ctx: &TransferContext, kind: EntryKind) -> Vec<String> {
        ctx.log
            .entries()
            .into_iter()
            .filter(|e| e.kind == kind)
            .map(|e| e.text)
            .collect()
    }

    #[tokio::test]
    async fn test_chunk_count_and_final_progress() {
        let (ctx, peer) = context(Capabilities::STREAM);
        let progress = Arc::new(Mutex::new(Vec::new()));
        let seen = progress.clone();

        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let options = TransferOptions::new(128, Duration::ZERO);
        let job = TransferJob::new("blob.bin", Bytes::from(data.clone()), options)
            .unwrap()
            .on_progress(move |p| seen.lock().push(p.percent));

        let outcome = send_file(job, &ctx).await;

        assert_eq!(outcome, TransferOutcome::Completed { total: 10_000, chunks: 79 });
        assert_eq!(peer.writes().len(), 79);
        assert_eq!(peer.written_bytes(), data);

        let progress = progress.lock();
        assert_eq!(progress.len(), 79);
        assert_eq!(*progress.last().unwrap(), 100);
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));

        assert_eq!(entries(&ctx, EntryKind::Info).len(), 1);
    }

    #[tokio::test]
    async fn test_ble_chunk_clamped() {
        let caps = Capabilities {
            notify: true,
            max_write_chunk: Some(20),
        };
        let (ctx, peer) = context(caps);
        let job = make_job("x", 100, 64, 0);

        let outcome = send_file(job, &ctx).await;
        assert_eq!(outcome, TransferOutcome::Completed { total: 100, chunks: 5 });
        assert!(peer.writes().iter().all(|w| w.len() == 20));
    }

    #[tokio::test]
    async fn test_pause_halts_transfer() {
        let (ctx, peer) = context(Capabilities::STREAM);
        let paused = ctx.paused.clone();

        let job = make_job("big", 1000, 100, 10).on_progress(move |p| {
            if p.sent == 300 {
                paused.pause();
            }
        });

        let outcome = send_file(job, &ctx).await;
        assert_eq!(outcome, TransferOutcome::Aborted { sent: 300, total: 1000 });
        assert_eq!(peer.written_bytes().len(), 300);

        // Resuming does not restart the abandoned job.
        ctx.paused.resume();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(peer.written_bytes().len(), 300);

        let errors = entries(&ctx, EntryKind::Error);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("aborted"));
    }

    #[tokio::test]
    async fn test_pause_and_resume_between_chunks_still_aborts() {
        let (ctx, peer) = context(Capabilities::STREAM);
        let paused = ctx.paused.clone();

        let job = make_job("blip", 50, 10, 0).on_progress(move |p| {
            if p.sent == 20 {
                paused.pause();
                paused.resume();
            }
        });

        let outcome = send_file(job, &ctx).await;
        assert_eq!(outcome, TransferOutcome::Aborted { sent: 20, total: 50 });
        assert_eq!(peer.writes().len(), 2);
    }

    #[tokio::test]
    async fn test_pause_while_chunk_queued_aborts_at_once() {
        let (ctx, peer) = context(Capabilities::STREAM);
        peer.set_write_delay(Duration::from_millis(40));
        ctx.queue.enqueue(SendItem::new(Bytes::from_static(b"a"), "a", SendMode::Text));
        ctx.queue.enqueue(SendItem::new(Bytes::from_static(b"b"), "b", SendMode::Text));

        let paused = ctx.paused.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            paused.pause();
        });

        let job = make_job("q", 30, 10, 0);
        let outcome = tokio::time::timeout(Duration::from_secs(1), send_file(job, &ctx))
            .await
            .unwrap();
        assert_eq!(outcome, TransferOutcome::Aborted { sent: 0, total: 30 });
        assert_eq!(entries(&ctx, EntryKind::Error).len(), 1);

        peer.wait_for_writes(1).await;
        assert_eq!(peer.written_bytes(), b"a");
        assert_eq!(ctx.queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_only_between_chunks() {
        let (ctx, _peer) = context(Capabilities::STREAM);
        let job = make_job("paced", 30, 10, 100);

        let started = tokio::time::Instant::now();
        let outcome = send_file(job, &ctx).await;
        assert_eq!(outcome, TransferOutcome::Completed { total: 30, chunks: 3 });
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_cancel_stops_transfer() {
        let (ctx, peer) = context(Capabilities::STREAM);
        let cancel = ctx.cancel.clone();

        let job = make_job("c", 100, 10, 5).on_progress(move |p| {
            if p.sent == 40 {
                cancel.cancel();
            }
        });

        let outcome = send_file(job, &ctx).await;
        assert_eq!(outcome, TransferOutcome::Cancelled { sent: 40, total: 100 });
        assert_eq!(peer.writes().len(), 4);
    }

    #[tokio::test]
    async fn test_write_failure_fails_transfer() {
        let (ctx, peer) = context(Capabilities::STREAM);
        peer.fail_next_writes(1);

        let job = make_job("f", 30, 10, 0);
        let outcome = send_file(job, &ctx).await;

        assert!(matches!(outcome, TransferOutcome::Failed { sent: 0, total: 30, .. }));
        assert!(peer.writes().is_empty());
    }

    #[tokio::test]
    async fn test_empty_payload_completes() {
        let (ctx, peer) = context(Capabilities::STREAM);
        let last = Arc::new(Mutex::new(None));
        let seen = last.clone();
        let job = TransferJob::new("empty", Bytes::new(), TransferOptions::default())
            .unwrap()
            .on_progress(move |p| *seen.lock() = Some(p.percent));

        let outcome = send_file(job, &ctx).await;
        assert_eq!(outcome, TransferOutcome::Completed { total: 0, chunks: 0 });
        assert_eq!(*last.lock(), Some(100));
        assert!(peer.writes().is_empty());
    }

    #[test]
    fn test_zero_chunk_rejected() {
        let options = TransferOptions::new(0, Duration::ZERO);
        let result = TransferJob::new("z", Bytes::from_static(b"x"), options);
        assert!(matches!(result, Err(TransportError::Configuration(_))));
    }

    #[test]
    fn test_progress_rounding() {
        assert_eq!(TransferProgress::new(128, 10_000).percent, 1);
        assert_eq!(TransferProgress::new(9_984, 10_000).percent, 100);
        assert_eq!(TransferProgress::new(9_940, 10_000).percent, 99);
        assert_eq!(TransferProgress::new(10_000, 10_000).percent, 100);
    }
}
