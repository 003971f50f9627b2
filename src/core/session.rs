//! Session controller
//!
//! A Session owns at most one live link and drives it through the
//! connection state machine:
//!
//! ```text
//! Disconnected -> Connecting -> Connected <-> Paused
//! Connected/Paused -> Reconnecting -> Connecting      (sockets only)
//! any -> Disconnected                                 (explicit disconnect)
//! ```
//!
//! Inbound data is read by one task per link and appended to the shared
//! [`LogBuffer`]; outbound data goes through the [`SendQueue`]. Every failure
//! surfaced here becomes an `Error` log entry and a returned [`SessionError`],
//! except a dismissed device picker.

use super::codec::{self, CodecError, DisplayMode};
use super::logger::{EntryKind, ExportArtifact, ExportFormat, LogBuffer};
use super::pause::PauseFlag;
use super::send_queue::{QueueStats, SendItem, SendQueue};
use super::transfer::{
    self, TransferContext, TransferJob, TransferOptions, TransferOutcome, TransferProgress,
};
use super::transport::{
    Capabilities, Connector, Link, LinkReader, OpenLink, ReadEvent, SendMode, TransportConfig,
    TransportError, TransportKind, TransportStats,
};
use crate::utils::autoconnect::{ReconnectSupervisor, RECONNECT_DELAY};
use crate::utils::clipboard::{copy_with_fallback, ClipboardBackend, ClipboardError};
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// No link
    Disconnected,
    /// Opening a link
    Connecting,
    /// Link open, data flowing
    Connected,
    /// Link open, inbound data dropped and sends rejected
    Paused,
    /// Waiting for the next automatic reconnect attempt
    Reconnecting,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Paused => "paused",
            Self::Reconnecting => "reconnecting",
        };
        f.write_str(s)
    }
}

/// Session errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Transport failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// User input could not be decoded
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Clipboard failure
    #[error(transparent)]
    Clipboard(#[from] ClipboardError),

    /// Sends and transfers are rejected while paused
    #[error("Session is paused")]
    Paused,

    /// No live link
    #[error("Not connected")]
    NotConnected,

    /// A second transfer was requested while one is running
    #[error("A file transfer is already in progress")]
    TransferInProgress,

    /// The running transfer was halted by a pause
    #[error("File transfer aborted after {sent} of {total} bytes")]
    TransferAborted {
        /// Bytes written before the pause
        sent: usize,
        /// Payload size
        total: usize,
    },

    /// The operation was cut short by a disconnect
    #[error("Cancelled by disconnect")]
    Cancelled,

    /// Another connection attempt is running
    #[error("A connection attempt is already in progress")]
    ConnectInProgress,

    /// The operation is not allowed in the current state
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        /// What was attempted
        operation: &'static str,
        /// State at the time
        state: SessionState,
    },
}

impl SessionError {
    /// Whether this is a dismissed device picker
    pub fn is_user_cancelled(&self) -> bool {
        matches!(self, Self::Transport(e) if e.is_user_cancelled())
    }
}

/// Session events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// State changed
    StateChanged(SessionState),
    /// A transfer chunk was written
    TransferProgress(TransferProgress),
}

/// Saved quick-send command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuickCommand {
    /// Button label
    pub label: String,
    /// Payload as typed
    pub content: String,
    /// How `content` is interpreted
    #[serde(default)]
    pub mode: DisplayMode,
}

impl QuickCommand {
    /// Create a quick command
    pub fn new(label: &str, content: &str, mode: DisplayMode) -> Self {
        Self {
            label: label.to_string(),
            content: content.to_string(),
            mode,
        }
    }
}

/// Session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Transport to open on connect
    pub transport: TransportConfig,
    /// Byte ceiling for the log buffer
    pub max_buffer_bytes: usize,
    /// File transfer chunking
    pub transfer: TransferOptions,
    /// Delay before each automatic reconnect
    pub reconnect_delay: Duration,
}

impl SessionConfig {
    /// Create a configuration with default limits
    pub fn new(transport: TransportConfig) -> Self {
        Self {
            transport,
            max_buffer_bytes: super::logger::DEFAULT_BYTE_CEILING,
            transfer: TransferOptions::default(),
            reconnect_delay: RECONNECT_DELAY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    User,
    Supervised,
}

enum LinkLoss {
    Closed,
    Failed(TransportError),
}

struct ActiveLink {
    id: u64,
    link: Arc<dyn Link>,
    reader: JoinHandle<()>,
}

struct RunningTransfer {
    id: u64,
    cancel: CancellationToken,
}

struct SessionInner {
    id: Uuid,
    connector: Arc<dyn Connector>,
    transport: RwLock<TransportConfig>,
    transfer_options: RwLock<TransferOptions>,
    state: RwLock<SessionState>,
    active: Mutex<Option<ActiveLink>>,
    transfer: Mutex<Option<RunningTransfer>>,
    connect_guard: tokio::sync::Mutex<()>,
    epoch: AtomicU64,
    next_id: AtomicU64,
    log: Arc<LogBuffer>,
    queue: Arc<SendQueue>,
    paused: PauseFlag,
    supervisor: Arc<ReconnectSupervisor>,
    event_tx: broadcast::Sender<SessionEvent>,
}

/// Cloneable handle to one session
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

impl Session {
    /// Create a disconnected session
    pub fn new(config: SessionConfig, connector: Arc<dyn Connector>) -> Self {
        let log = Arc::new(LogBuffer::new(config.max_buffer_bytes));
        let paused = PauseFlag::new();
        let queue = SendQueue::new(log.clone(), paused.clone());
        let (event_tx, _) = broadcast::channel(256);

        Self {
            inner: Arc::new(SessionInner {
                id: Uuid::new_v4(),
                connector,
                transport: RwLock::new(config.transport),
                transfer_options: RwLock::new(config.transfer),
                state: RwLock::new(SessionState::Disconnected),
                active: Mutex::new(None),
                transfer: Mutex::new(None),
                connect_guard: tokio::sync::Mutex::new(()),
                epoch: AtomicU64::new(0),
                next_id: AtomicU64::new(0),
                log,
                queue,
                paused,
                supervisor: ReconnectSupervisor::with_delay(config.reconnect_delay),
                event_tx,
            }),
        }
    }

    /// Session ID
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        *self.inner.state.read()
    }

    /// Check if a link is open (connected or paused)
    pub fn is_connected(&self) -> bool {
        matches!(self.state(), SessionState::Connected | SessionState::Paused)
    }

    /// Shared log buffer
    pub fn log(&self) -> Arc<LogBuffer> {
        self.inner.log.clone()
    }

    /// Subscribe to state and transfer events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Configured transport
    pub fn transport(&self) -> TransportConfig {
        self.inner.transport.read().clone()
    }

    /// Kind of the configured transport
    pub fn transport_kind(&self) -> TransportKind {
        self.inner.transport.read().kind()
    }

    /// Name of the open link
    pub fn link_name(&self) -> Option<String> {
        self.inner
            .active
            .lock()
            .as_ref()
            .map(|a| a.link.name().to_string())
    }

    /// Link statistics, if a link is open
    pub fn stats(&self) -> Option<TransportStats> {
        self.inner.active.lock().as_ref().map(|a| a.link.stats())
    }

    /// Send queue counters
    pub fn queue_stats(&self) -> QueueStats {
        self.inner.queue.stats()
    }

    /// Automatic reconnect attempts since the last successful connect
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.supervisor.attempts()
    }

    /// Whether an automatic reconnect is waiting on its timer
    pub fn reconnect_pending(&self) -> bool {
        self.inner.supervisor.is_pending()
    }

    /// Whether a file transfer is running
    pub fn is_transfer_running(&self) -> bool {
        self.inner.transfer.lock().is_some()
    }

    /// Open the configured transport
    ///
    /// Cancels a pending automatic reconnect and tries right away.
    pub async fn connect(&self) -> Result<(), SessionError> {
        self.inner.supervisor.cancel_pending();
        SessionInner::connect_inner(self.inner.clone(), Origin::User).await
    }

    /// Close the link and stop reconnecting
    ///
    /// Idempotent: only the call that actually closes a link logs it.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        inner.supervisor.disarm();
        inner.cancel_transfer();

        // Same lock as the epoch read in connect, so a connect that started
        // earlier can never overwrite this state afterwards.
        let active = {
            let mut active = inner.active.lock();
            inner.epoch.fetch_add(1, Ordering::AcqRel);
            inner.paused.resume();
            inner.set_state(SessionState::Disconnected);
            active.take()
        };

        if let Some(active) = active {
            active.reader.abort();
            inner.queue.detach();
            if let Err(e) = active.link.close().await {
                warn!("Error closing {}: {}", active.link.name(), e);
            }
            info!("Disconnected from {}", active.link.name());
            inner
                .log
                .info(format!("Disconnected from {}", active.link.name()));
        }
    }

    /// Stop accepting inbound data and outbound sends
    pub fn pause(&self) -> Result<(), SessionError> {
        match self.state() {
            SessionState::Paused => Ok(()),
            SessionState::Connected => {
                self.inner.paused.pause();
                self.inner.set_state(SessionState::Paused);
                debug!("Session paused");
                Ok(())
            }
            state => Err(self.inner.fail(SessionError::InvalidState {
                operation: "pause",
                state,
            })),
        }
    }

    /// Leave the paused state and flush anything queued
    pub fn resume(&self) -> Result<(), SessionError> {
        match self.state() {
            SessionState::Connected => Ok(()),
            SessionState::Paused => {
                self.inner.paused.resume();
                self.inner.set_state(SessionState::Connected);
                self.inner.queue.kick();
                debug!("Session resumed");
                Ok(())
            }
            state => Err(self.inner.fail(SessionError::InvalidState {
                operation: "resume",
                state,
            })),
        }
    }

    /// Pause when connected, resume when paused; returns the new state
    pub fn toggle_pause(&self) -> Result<SessionState, SessionError> {
        if self.state() == SessionState::Paused {
            self.resume()?;
        } else {
            self.pause()?;
        }
        Ok(self.state())
    }

    /// Queue a payload for sending
    ///
    /// The `Sent` entry is logged here, before the write happens.
    pub fn send(&self, payload: Bytes, text: &str, mode: SendMode) -> Result<(), SessionError> {
        self.inner.ensure_sendable()?;
        self.inner
            .log
            .append(EntryKind::Sent, payload.clone(), text.to_string());
        self.inner.queue.enqueue(SendItem::new(payload, text, mode));
        Ok(())
    }

    /// Decode user input and send it
    pub fn send_text(&self, input: &str, mode: DisplayMode) -> Result<(), SessionError> {
        let payload = codec::decode(input, mode).map_err(|e| self.inner.fail(e.into()))?;
        match mode {
            DisplayMode::Text => self.send(Bytes::from(payload), input, SendMode::Text),
            DisplayMode::Hex => {
                let text = codec::encode(&payload, DisplayMode::Hex);
                self.send(Bytes::from(payload), &text, SendMode::Binary)
            }
        }
    }

    /// Send a saved quick command
    pub fn send_quick(&self, command: &QuickCommand) -> Result<(), SessionError> {
        debug!("Quick send '{}'", command.label);
        self.send_text(&command.content, command.mode)
    }

    /// Stream a file payload in chunks
    ///
    /// Returns the number of bytes written. Only one transfer runs at a time.
    pub async fn send_file(&self, name: &str, data: Bytes) -> Result<usize, SessionError> {
        self.send_file_with_progress(name, data, |_| {}).await
    }

    /// Stream a file payload, reporting progress after every chunk
    pub async fn send_file_with_progress(
        &self,
        name: &str,
        data: Bytes,
        mut on_progress: impl FnMut(TransferProgress) + Send + 'static,
    ) -> Result<usize, SessionError> {
        let inner = &self.inner;
        inner.ensure_sendable()?;

        let capabilities = inner
            .active
            .lock()
            .as_ref()
            .map_or(Capabilities::STREAM, |a| a.link.capabilities());

        let options = *inner.transfer_options.read();
        let events = inner.event_tx.clone();
        let job = TransferJob::new(name, data, options)
            .map_err(|e| inner.fail(e.into()))?
            .on_progress(move |progress| {
                on_progress(progress);
                let _ = events.send(SessionEvent::TransferProgress(progress));
            });

        let (id, cancel) = {
            let mut slot = inner.transfer.lock();
            if slot.is_some() {
                return Err(inner.fail(SessionError::TransferInProgress));
            }
            let id = inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
            let cancel = CancellationToken::new();
            *slot = Some(RunningTransfer {
                id,
                cancel: cancel.clone(),
            });
            (id, cancel)
        };
        let _guard = TransferGuard {
            inner: inner.clone(),
            id,
        };

        info!("Starting transfer '{}' ({} bytes)", name, job.total());
        let ctx = TransferContext {
            queue: inner.queue.clone(),
            paused: inner.paused.clone(),
            log: inner.log.clone(),
            cancel,
            capabilities,
        };

        match transfer::send_file(job, &ctx).await {
            TransferOutcome::Completed { total, .. } => Ok(total),
            TransferOutcome::Aborted { sent, total } => {
                Err(SessionError::TransferAborted { sent, total })
            }
            TransferOutcome::Cancelled { .. } => Err(SessionError::Cancelled),
            TransferOutcome::Failed { error, .. } => Err(SessionError::Transport(error)),
        }
    }

    /// Use a different transport on the next connect
    pub fn set_transport(&self, config: TransportConfig) -> Result<(), SessionError> {
        let state = self.state();
        if state != SessionState::Disconnected {
            return Err(self.inner.fail(SessionError::InvalidState {
                operation: "switch transport",
                state,
            }));
        }
        debug!("Transport set to {}", config.kind());
        *self.inner.transport.write() = config;
        Ok(())
    }

    /// Change file transfer chunking
    pub fn set_transfer_options(&self, options: TransferOptions) {
        *self.inner.transfer_options.write() = options;
    }

    /// Change the log buffer byte ceiling
    pub fn set_max_buffer_bytes(&self, bytes: usize) {
        self.inner.log.set_ceiling(bytes);
    }

    /// Render the log for saving
    pub fn export(&self, format: ExportFormat) -> ExportArtifact {
        ExportArtifact::from_buffer(&self.inner.log, format)
    }

    /// Copy the data log to the clipboard
    pub fn copy_log(
        &self,
        primary: &dyn ClipboardBackend,
        fallback: &dyn ClipboardBackend,
    ) -> Result<(), SessionError> {
        let text = self.inner.log.copy_text();
        copy_with_fallback(&text, primary, fallback)
            .map(|backend| debug!("Copied {} bytes via {}", text.len(), backend))
            .map_err(|e| self.inner.fail(e.into()))
    }

    /// Remove every log entry
    pub fn clear_log(&self) {
        self.inner.log.clear();
    }
}

impl SessionInner {
    fn set_state(&self, state: SessionState) {
        let previous = std::mem::replace(&mut *self.state.write(), state);
        if previous != state {
            debug!("Session state {} -> {}", previous, state);
            let _ = self.event_tx.send(SessionEvent::StateChanged(state));
        }
    }

    /// Log an error entry and hand the error back
    fn fail(&self, error: SessionError) -> SessionError {
        if !error.is_user_cancelled() {
            warn!("{}", error);
            self.log.error(error.to_string());
        }
        error
    }

    fn ensure_sendable(&self) -> Result<(), SessionError> {
        match *self.state.read() {
            SessionState::Connected => Ok(()),
            SessionState::Paused => Err(SessionError::Paused),
            _ => Err(SessionError::NotConnected),
        }
        .map_err(|e| self.fail(e))
    }

    fn cancel_transfer(&self) {
        if let Some(running) = self.transfer.lock().as_ref() {
            running.cancel.cancel();
        }
    }

    fn connect_inner(
        self: Arc<Self>,
        origin: Origin,
    ) -> BoxFuture<'static, Result<(), SessionError>> {
        async move {
            let Ok(_guard) = self.connect_guard.try_lock() else {
                if origin == Origin::User {
                    return Err(self.fail(SessionError::ConnectInProgress));
                }
                return Ok(());
            };

            let state = *self.state.read();
            match (origin, state) {
                (_, SessionState::Connected | SessionState::Paused) => {
                    if origin == Origin::Supervised {
                        return Ok(());
                    }
                    return Err(self.fail(SessionError::InvalidState {
                        operation: "connect",
                        state,
                    }));
                }
                (Origin::Supervised, _) if !self.supervisor.should_reconnect() => return Ok(()),
                _ => {}
            }

            let epoch = {
                let _active = self.active.lock();
                self.set_state(SessionState::Connecting);
                self.epoch.load(Ordering::Acquire)
            };
            let config = self.transport.read().clone();
            info!("Connecting ({})", config.kind());

            let open = match self.connector.open(&config).await {
                Ok(open) => open,
                Err(e) => return Err(self.connect_failed(origin, epoch, e)),
            };

            self.install(open, epoch).await
        }
        .boxed()
    }

    async fn install(self: &Arc<Self>, open: OpenLink, epoch: u64) -> Result<(), SessionError> {
        let OpenLink { link, reader } = open;
        let installed = {
            let mut active = self.active.lock();
            if self.epoch.load(Ordering::Acquire) == epoch {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
                self.paused.resume();
                self.queue.attach(link.clone());
                self.log.info(format!("Connected to {}", link.name()));
                if link.kind().supports_reconnect() {
                    self.supervisor.arm();
                }
                self.supervisor.reset_attempts();
                self.set_state(SessionState::Connected);

                let handle = tokio::spawn(read_loop(
                    Arc::downgrade(self),
                    id,
                    reader,
                    self.paused.clone(),
                    self.log.clone(),
                ));
                *active = Some(ActiveLink {
                    id,
                    link: link.clone(),
                    reader: handle,
                });
                true
            } else {
                false
            }
        };

        if installed {
            info!("Connected to {}", link.name());
            return Ok(());
        }

        debug!("Disconnect during open; closing {}", link.name());
        let _ = link.close().await;
        Err(SessionError::Cancelled)
    }

    fn connect_failed(
        self: &Arc<Self>,
        origin: Origin,
        epoch: u64,
        error: TransportError,
    ) -> SessionError {
        let error = self.fail(error.into());
        if self.epoch.load(Ordering::Acquire) != epoch {
            return error;
        }

        if origin == Origin::Supervised && self.supervisor.should_reconnect() {
            self.set_state(SessionState::Reconnecting);
            if !self.schedule_reconnect() {
                self.set_state(SessionState::Disconnected);
            }
        } else {
            if origin == Origin::User {
                self.supervisor.disarm();
            }
            self.set_state(SessionState::Disconnected);
        }
        error
    }

    fn schedule_reconnect(self: &Arc<Self>) -> bool {
        let session = Arc::downgrade(self);
        self.supervisor.schedule(move || {
            async move {
                if let Some(inner) = session.upgrade() {
                    let _ = SessionInner::connect_inner(inner, Origin::Supervised).await;
                }
            }
            .boxed()
        })
    }

    async fn handle_link_lost(self: &Arc<Self>, id: u64, loss: LinkLoss) {
        let link = {
            let mut active = self.active.lock();
            if active.as_ref().is_some_and(|a| a.id == id) {
                active.take().map(|a| a.link)
            } else {
                None
            }
        };
        let Some(link) = link else {
            return;
        };

        self.queue.detach();
        let _ = link.close().await;

        if let LinkLoss::Failed(e) = &loss {
            warn!("{} failed: {}", link.name(), e);
            self.log.error(e.to_string());
        }
        info!("Connection to {} closed", link.name());
        self.log.info(format!("Connection closed: {}", link.name()));

        self.cancel_transfer();
        self.paused.resume();

        if link.kind().supports_reconnect() && self.supervisor.should_reconnect() {
            self.set_state(SessionState::Reconnecting);
            if !self.schedule_reconnect() {
                self.set_state(SessionState::Disconnected);
            }
        } else {
            self.set_state(SessionState::Disconnected);
        }
    }
}

/// Clears the transfer slot when the transfer future finishes or is dropped
struct TransferGuard {
    inner: Arc<SessionInner>,
    id: u64,
}

impl Drop for TransferGuard {
    fn drop(&mut self) {
        let mut slot = self.inner.transfer.lock();
        if slot.as_ref().is_some_and(|t| t.id == self.id) {
            slot.take();
        }
    }
}

async fn read_loop(
    session: Weak<SessionInner>,
    id: u64,
    mut reader: Box<dyn LinkReader>,
    paused: PauseFlag,
    log: Arc<LogBuffer>,
) {
    let loss = loop {
        match reader.read().await {
            Ok(ReadEvent::Data(data)) => {
                if paused.is_paused() {
                    continue;
                }
                let text = codec::encode(&data, DisplayMode::Text);
                log.append(EntryKind::Received, data, text);
            }
            Ok(ReadEvent::EndOfStream) => break LinkLoss::Closed,
            Err(e) => break LinkLoss::Failed(e),
        }
    };

    if let Some(inner) = session.upgrade() {
        inner.handle_link_lost(id, loss).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transport::{MemoryConnector, SerialConfig, SocketConfig};

    fn serial_session() -> (Session, Arc<MemoryConnector>) {
        let connector = Arc::new(MemoryConnector::new());
        let serial = SerialConfig::new("/dev/ttyUSB0", 115_200);
        let config = SessionConfig::new(TransportConfig::Serial(serial));
        (Session::new(config, connector.clone()), connector)
    }

    fn entries_of(session: &Session, kind: EntryKind) -> Vec<String> {
        session
            .log()
            .entries()
            .into_iter()
            .filter(|e| e.kind == kind)
            .map(|e| e.text)
            .collect()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_connect_receive_disconnect() {
        let (session, connector) = serial_session();
        let peer = connector.push_link(TransportKind::Serial, Capabilities::STREAM);

        session.connect().await.unwrap();
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(entries_of(&session, EntryKind::Info).len(), 1);

        peer.inject(b"hello\n");
        settle().await;
        assert_eq!(session.log().export_text(), "hello\n");

        session.disconnect().await;
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(peer.close_count(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let (session, connector) = serial_session();
        let _peer = connector.push_link(TransportKind::Serial, Capabilities::STREAM);
        session.connect().await.unwrap();

        session.disconnect().await;
        session.disconnect().await;

        let closed: Vec<_> = entries_of(&session, EntryKind::Info)
            .into_iter()
            .filter(|t| t.starts_with("Disconnected"))
            .collect();
        assert_eq!(closed.len(), 1);
    }

    #[tokio::test]
    async fn test_paused_drops_inbound_and_rejects_send() {
        let (session, connector) = serial_session();
        let peer = connector.push_link(TransportKind::Serial, Capabilities::STREAM);
        session.connect().await.unwrap();

        session.pause().unwrap();
        peer.inject(b"dropped");
        settle().await;
        assert_eq!(session.log().export_text(), "");

        let err = session.send_text("AT", DisplayMode::Text).unwrap_err();
        assert_eq!(err, SessionError::Paused);
        assert_eq!(entries_of(&session, EntryKind::Error).len(), 1);

        session.resume().unwrap();
        peer.inject(b"kept");
        settle().await;
        assert_eq!(session.log().export_text(), "kept");
    }

    #[tokio::test]
    async fn test_send_logs_at_enqueue_and_writes() {
        let (session, connector) = serial_session();
        let peer = connector.push_link(TransportKind::Serial, Capabilities::STREAM);
        session.connect().await.unwrap();

        session.send_text("48 49", DisplayMode::Hex).unwrap();
        assert_eq!(entries_of(&session, EntryKind::Sent), vec!["48 49 ".to_string()]);

        peer.wait_for_writes(1).await;
        assert_eq!(peer.written_bytes(), b"HI");
        assert_eq!(peer.write_modes(), vec![SendMode::Binary]);
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let (session, _connector) = serial_session();
        let err = session.send_text("x", DisplayMode::Text).unwrap_err();
        assert_eq!(err, SessionError::NotConnected);
    }

    #[tokio::test]
    async fn test_bad_hex_logged() {
        let (session, connector) = serial_session();
        let _peer = connector.push_link(TransportKind::Serial, Capabilities::STREAM);
        session.connect().await.unwrap();

        let err = session.send_text("ABC", DisplayMode::Hex).unwrap_err();
        assert!(matches!(err, SessionError::Codec(_)));
        assert_eq!(entries_of(&session, EntryKind::Error).len(), 1);
    }

    #[tokio::test]
    async fn test_user_cancel_not_logged() {
        let (session, connector) = serial_session();
        connector.push_error(TransportError::UserCancelled);

        let err = session.connect().await.unwrap_err();
        assert!(err.is_user_cancelled());
        assert!(session.log().is_empty());
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_failure_logged() {
        let (session, connector) = serial_session();
        connector.push_error(TransportError::ConnectFailure("busy".into()));

        assert!(session.connect().await.is_err());
        assert_eq!(entries_of(&session, EntryKind::Error).len(), 1);
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_switch_transport_only_when_disconnected() {
        let (session, connector) = serial_session();
        let _peer = connector.push_link(TransportKind::Serial, Capabilities::STREAM);
        session.connect().await.unwrap();

        let socket = TransportConfig::Socket(SocketConfig::new("ws://localhost:1234"));
        assert!(matches!(
            session.set_transport(socket.clone()),
            Err(SessionError::InvalidState { .. })
        ));

        session.disconnect().await;
        session.set_transport(socket).unwrap();
        assert_eq!(session.transport_kind(), TransportKind::Socket);
    }

    #[tokio::test]
    async fn test_serial_read_failure_disconnects_without_retry() {
        let (session, connector) = serial_session();
        let peer = connector.push_link(TransportKind::Serial, Capabilities::STREAM);
        session.connect().await.unwrap();

        peer.fail_read("device unplugged");
        settle().await;

        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(!session.reconnect_pending());
        assert_eq!(entries_of(&session, EntryKind::Error).len(), 1);
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test]
    async fn test_second_transfer_rejected() {
        let (session, connector) = serial_session();
        let peer = connector.push_link(TransportKind::Serial, Capabilities::STREAM);
        peer.set_write_delay(Duration::from_millis(5));
        session.connect().await.unwrap();

        let first = {
            let session = session.clone();
            tokio::spawn(async move { session.send_file("a", Bytes::from(vec![0u8; 2048])).await })
        };
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert!(session.is_transfer_running());

        let err = session.send_file("b", Bytes::from_static(b"x")).await.unwrap_err();
        assert_eq!(err, SessionError::TransferInProgress);

        assert_eq!(first.await.unwrap(), Ok(2048));
        assert!(!session.is_transfer_running());
    }

    #[tokio::test]
    async fn test_disconnect_cancels_transfer() {
        let (session, connector) = serial_session();
        let peer = connector.push_link(TransportKind::Serial, Capabilities::STREAM);
        peer.set_write_delay(Duration::from_millis(5));
        session.connect().await.unwrap();

        let running = {
            let session = session.clone();
            tokio::spawn(async move { session.send_file("a", Bytes::from(vec![0u8; 4096])).await })
        };
        tokio::time::sleep(Duration::from_millis(12)).await;
        session.disconnect().await;

        let result = running.await.unwrap();
        assert!(matches!(
            result,
            Err(SessionError::Cancelled
                | SessionError::Transport(TransportError::NotConnected))
        ));
        assert!(!session.is_transfer_running());
    }

    #[tokio::test]
    async fn test_disconnect_during_open_leaves_disconnected() {
        let (session, connector) = serial_session();
        let peer = connector.push_link(TransportKind::Serial, Capabilities::STREAM);
        connector.set_open_delay(Duration::from_millis(50));

        let connecting = {
            let session = session.clone();
            tokio::spawn(async move { session.connect().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(session.state(), SessionState::Connecting);

        session.disconnect().await;
        assert_eq!(session.state(), SessionState::Disconnected);

        assert_eq!(connecting.await.unwrap(), Err(SessionError::Cancelled));
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(peer.close_count(), 1);
        assert!(entries_of(&session, EntryKind::Error).is_empty());
        assert!(entries_of(&session, EntryKind::Info).is_empty());
    }

    #[tokio::test]
    async fn test_state_events_broadcast() {
        let (session, connector) = serial_session();
        let _peer = connector.push_link(TransportKind::Serial, Capabilities::STREAM);
        let mut events = session.subscribe();

        session.connect().await.unwrap();
        for expected in [SessionState::Connecting, SessionState::Connected] {
            assert_eq!(
                events.recv().await.unwrap(),
                SessionEvent::StateChanged(expected)
            );
        }
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SessionState::Reconnecting.to_string(), "reconnecting");
        let err = SessionError::InvalidState {
            operation: "pause",
            state: SessionState::Disconnected,
        };
        assert_eq!(err.to_string(), "Cannot pause while disconnected");
    }
}
