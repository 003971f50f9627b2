//! In-memory transport
//!
//! A [`MemoryPeer`] plays the remote device: it injects inbound data, ends or
//! breaks the stream, and records every write the session issues. The
//! [`MemoryConnector`] hands out scripted links and errors in order, which is
//! how the session state machine is exercised without hardware.

use super::{
    Capabilities, Connector, Link, LinkReader, OpenLink, ReadEvent, SendMode, SharedStats,
    TransportConfig, TransportError, TransportKind, TransportStats,
};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

#[derive(Default)]
struct PeerState {
    writes: Mutex<Vec<(Bytes, SendMode)>>,
    failing_writes: AtomicUsize,
    write_delay: Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    closes: AtomicUsize,
    written: Notify,
}

/// Remote end of an in-memory link
#[derive(Clone)]
pub struct MemoryPeer {
    inbound: mpsc::UnboundedSender<Result<ReadEvent, TransportError>>,
    state: Arc<PeerState>,
    link: Arc<MemoryLink>,
}

impl MemoryPeer {
    /// Deliver bytes to the session's reader
    pub fn inject(&self, data: &[u8]) {
        let _ = self
            .inbound
            .send(Ok(ReadEvent::Data(Bytes::copy_from_slice(data))));
    }

    /// Close the stream from the remote side
    pub fn end_stream(&self) {
        let _ = self.inbound.send(Ok(ReadEvent::EndOfStream));
    }

    /// Break the stream with a read error
    pub fn fail_read(&self, message: &str) {
        let _ = self
            .inbound
            .send(Err(TransportError::ReadFailure(message.to_string())));
    }

    /// Reject the next `count` writes
    pub fn fail_next_writes(&self, count: usize) {
        self.state.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Make every write take `delay`
    pub fn set_write_delay(&self, delay: Duration) {
        *self.state.write_delay.lock() = delay;
    }

    /// Successful writes, in order
    pub fn writes(&self) -> Vec<Bytes> {
        self.state.writes.lock().iter().map(|(b, _)| b.clone()).collect()
    }

    /// Send modes of successful writes, in order
    pub fn write_modes(&self) -> Vec<SendMode> {
        self.state.writes.lock().iter().map(|(_, m)| *m).collect()
    }

    /// All written bytes concatenated
    pub fn written_bytes(&self) -> Vec<u8> {
        self.state
            .writes
            .lock()
            .iter()
            .flat_map(|(b, _)| b.iter().copied())
            .collect()
    }

    /// Largest number of writes that were ever in progress at once
    pub fn max_concurrent_writes(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }

    /// How many times the link was closed by the session
    pub fn close_count(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }

    /// Whether the session still holds the link open
    pub fn is_open(&self) -> bool {
        self.link.is_open()
    }

    /// Wait until at least `count` writes have succeeded
    pub async fn wait_for_writes(&self, count: usize) {
        loop {
            let notified = self.state.written.notified();
            if self.state.writes.lock().len() >= count {
                return;
            }
            notified.await;
        }
    }
}

/// Create a connected link/peer pair
pub fn pair(kind: TransportKind, capabilities: Capabilities) -> (OpenLink, MemoryPeer) {
    let (tx, rx) = mpsc::unbounded_channel();
    let state = Arc::new(PeerState::default());
    let stats = SharedStats::new();

    let link = Arc::new(MemoryLink {
        name: format!("memory:{}", kind.to_string().to_lowercase()),
        kind,
        capabilities,
        open: AtomicBool::new(true),
        state: state.clone(),
        stats: stats.clone(),
    });
    let reader = MemoryReader { inbound: rx, stats };

    let peer = MemoryPeer {
        inbound: tx,
        state,
        link: link.clone(),
    };
    let open = OpenLink {
        link,
        reader: Box::new(reader),
    };
    (open, peer)
}

struct MemoryLink {
    name: String,
    kind: TransportKind,
    capabilities: Capabilities,
    open: AtomicBool,
    state: Arc<PeerState>,
    stats: SharedStats,
}

#[async_trait]
impl Link for MemoryLink {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn write(&self, data: Bytes, mode: SendMode) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotConnected);
        }
        if let Some(max) = self.capabilities.max_write_chunk {
            if data.len() > max {
                return Err(TransportError::WriteFailure(format!(
                    "{} bytes exceeds the {max}-byte limit",
                    data.len()
                )));
            }
        }

        let now = self.state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = *self.state.write_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let failing = self
            .state
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        self.state.in_flight.fetch_sub(1, Ordering::SeqCst);

        if failing {
            return Err(TransportError::WriteFailure("injected failure".into()));
        }

        self.stats.record_write(data.len());
        self.state.writes.lock().push((data, mode));
        self.state.written.notify_waiters();
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.open.swap(false, Ordering::AcqRel) {
            self.state.closes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn stats(&self) -> TransportStats {
        self.stats.snapshot()
    }
}

struct MemoryReader {
    inbound: mpsc::UnboundedReceiver<Result<ReadEvent, TransportError>>,
    stats: SharedStats,
}

#[async_trait]
impl LinkReader for MemoryReader {
    async fn read(&mut self) -> Result<ReadEvent, TransportError> {
        match self.inbound.recv().await {
            Some(Ok(ReadEvent::Data(data))) => {
                self.stats.record_read(data.len());
                Ok(ReadEvent::Data(data))
            }
            Some(other) => other,
            None => Ok(ReadEvent::EndOfStream),
        }
    }
}

enum Script {
    Link(OpenLink),
    Fail(TransportError),
}

/// Connector that replays scripted outcomes, one per `open` call
#[derive(Default)]
pub struct MemoryConnector {
    script: Mutex<VecDeque<Script>>,
    attempts: AtomicUsize,
    open_delay: Mutex<Duration>,
}

impl MemoryConnector {
    /// Create an empty connector; unscripted opens fail
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful open and return the remote peer for it
    pub fn push_link(&self, kind: TransportKind, capabilities: Capabilities) -> MemoryPeer {
        let (open, peer) = pair(kind, capabilities);
        self.script.lock().push_back(Script::Link(open));
        peer
    }

    /// Queue a failed open
    pub fn push_error(&self, error: TransportError) {
        self.script.lock().push_back(Script::Fail(error));
    }

    /// Make every open take `delay`
    pub fn set_open_delay(&self, delay: Duration) {
        *self.open_delay.lock() = delay;
    }

    /// Number of `open` calls so far
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn open(&self, config: &TransportConfig) -> Result<OpenLink, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        config.validate()?;

        let delay = *self.open_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match self.script.lock().pop_front() {
            Some(Script::Link(open)) => Ok(open),
            Some(Script::Fail(error)) => Err(error),
            None => Err(TransportError::ConnectFailure("no scripted link".into())),
        }
    }
}
