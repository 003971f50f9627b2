//! Serialized outbound writes
//!
//! All writes to the active link go through one FIFO queue drained by at most
//! one task at a time. The queue state and the "drain running" flag live
//! behind the same lock, so an enqueue either lands before the running drain
//! checks for emptiness (and is picked up by it) or finds no drain running and
//! starts one.
//!
//! Nothing is written while the session is paused. A transfer chunk that is
//! still queued when a pause lands is pulled back out and reported to the
//! transfer as [`ChunkWrite::Withdrawn`].

use super::logger::LogBuffer;
use super::pause::PauseFlag;
use super::transport::{Link, SendMode, TransportError};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// One queued write
#[derive(Debug)]
pub struct SendItem {
    /// Payload bytes
    pub payload: Bytes,
    /// Display text
    pub text: String,
    /// Frame type for sockets
    pub mode: SendMode,
    ticket: Option<u64>,
    completion: Option<oneshot::Sender<Result<(), TransportError>>>,
}

impl SendItem {
    /// Create a fire-and-forget item
    pub fn new(payload: Bytes, text: impl Into<String>, mode: SendMode) -> Self {
        Self {
            payload,
            text: text.into(),
            mode,
            ticket: None,
            completion: None,
        }
    }

    fn complete(self, result: Result<(), TransportError>) {
        if let Some(tx) = self.completion {
            let _ = tx.send(result);
        }
    }
}

/// How a submitted transfer chunk left the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkWrite {
    /// The link accepted it
    Written,
    /// A pause landed first; the chunk was taken back unwritten
    Withdrawn,
}

/// Queue counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Drain loops started
    pub drains_started: u64,
    /// Items written successfully
    pub written: u64,
    /// Items whose write failed
    pub failed: u64,
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<SendItem>,
    draining: bool,
}

/// FIFO send queue with a single drain loop
pub struct SendQueue {
    state: Mutex<QueueState>,
    link: RwLock<Option<Arc<dyn Link>>>,
    paused: PauseFlag,
    log: Arc<LogBuffer>,
    next_ticket: AtomicU64,
    drains_started: AtomicU64,
    written: AtomicU64,
    failed: AtomicU64,
}

impl SendQueue {
    /// Create a queue that logs write failures into `log`
    pub fn new(log: Arc<LogBuffer>, paused: PauseFlag) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState::default()),
            link: RwLock::new(None),
            paused,
            log,
            next_ticket: AtomicU64::new(0),
            drains_started: AtomicU64::new(0),
            written: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        })
    }

    /// Route subsequent writes to `link`
    pub fn attach(&self, link: Arc<dyn Link>) {
        *self.link.write() = Some(link);
    }

    /// Forget the link and drop everything still queued
    pub fn detach(&self) {
        self.link.write().take();
        let dropped: Vec<SendItem> = self.state.lock().items.drain(..).collect();
        if !dropped.is_empty() {
            debug!("Dropped {} queued writes on detach", dropped.len());
        }
        for item in dropped {
            item.complete(Err(TransportError::NotConnected));
        }
    }

    /// Queue an item and make sure a drain loop will write it
    pub fn enqueue(self: &Arc<Self>, item: SendItem) {
        let start = {
            let mut state = self.state.lock();
            state.items.push_back(item);
            self.claim_drain(&mut state)
        };
        if start {
            self.spawn_drain();
        }
    }

    /// Queue one transfer chunk and wait for it to leave the queue
    ///
    /// If the session is paused before the drain picks the chunk up, it is
    /// removed again and `Withdrawn` is returned. A chunk the drain already
    /// handed to the link is waited for. Write errors are returned rather
    /// than logged; the caller reports them.
    pub async fn submit_chunk(
        self: &Arc<Self>,
        payload: Bytes,
    ) -> Result<ChunkWrite, TransportError> {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = oneshot::channel();
        let mut item = SendItem::new(payload, String::new(), SendMode::Binary);
        item.ticket = Some(ticket);
        item.completion = Some(tx);
        self.enqueue(item);

        tokio::select! {
            biased;
            result = &mut rx => {
                return result
                    .unwrap_or(Err(TransportError::NotConnected))
                    .map(|()| ChunkWrite::Written);
            }
            () = self.paused.paused() => {}
        }

        if self.withdraw(ticket) {
            debug!("Withdrew queued chunk {} on pause", ticket);
            return Ok(ChunkWrite::Withdrawn);
        }
        rx.await
            .unwrap_or(Err(TransportError::NotConnected))
            .map(|()| ChunkWrite::Written)
    }

    /// Remove a queued chunk the drain has not taken yet
    fn withdraw(&self, ticket: u64) -> bool {
        let mut state = self.state.lock();
        match state.items.iter().position(|item| item.ticket == Some(ticket)) {
            Some(index) => state.items.remove(index).is_some(),
            None => false,
        }
    }

    /// Restart draining after a resume
    pub fn kick(self: &Arc<Self>) {
        let start = {
            let mut state = self.state.lock();
            self.claim_drain(&mut state)
        };
        if start {
            self.spawn_drain();
        }
    }

    /// Items waiting to be written
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Whether nothing is waiting
    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// Whether a drain loop is running
    pub fn is_draining(&self) -> bool {
        self.state.lock().draining
    }

    /// Counters
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            drains_started: self.drains_started.load(Ordering::Relaxed),
            written: self.written.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    fn claim_drain(&self, state: &mut QueueState) -> bool {
        if state.draining || !self.writable_head(state) {
            return false;
        }
        state.draining = true;
        true
    }

    fn writable_head(&self, state: &QueueState) -> bool {
        !state.items.is_empty() && !self.paused.is_paused()
    }

    fn spawn_drain(self: &Arc<Self>) {
        self.drains_started.fetch_add(1, Ordering::Relaxed);
        let queue = self.clone();
        tokio::spawn(async move { queue.drain().await });
    }

    async fn drain(self: Arc<Self>) {
        loop {
            let item = {
                let mut state = self.state.lock();
                if !self.writable_head(&state) {
                    state.draining = false;
                    return;
                }
                match state.items.pop_front() {
                    Some(item) => item,
                    None => {
                        state.draining = false;
                        return;
                    }
                }
            };

            let result = self.write_item(&item).await;
            match &result {
                Ok(()) => {
                    self.written.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.failed.fetch_add(1, Ordering::Relaxed);
                    warn!("Queued write failed: {}", e);
                    // A waiting submitter logs its own failure.
                    if item.completion.is_none() {
                        self.log.error(e.to_string());
                    }
                }
            }
            item.complete(result);
        }
    }

    /// Write one item, split to the link's chunk limit
    async fn write_item(&self, item: &SendItem) -> Result<(), TransportError> {
        let link = self.link.read().clone().ok_or(TransportError::NotConnected)?;

        let Some(max) = link.capabilities().max_write_chunk else {
            return link.write(item.payload.clone(), item.mode).await;
        };
        let max = max.max(1);

        let mut offset = 0;
        while offset < item.payload.len() {
            let end = (offset + max).min(item.payload.len());
            link.write(item.payload.slice(offset..end), item.mode).await?;
            offset = end;
        }
        Ok(())
    }
}
