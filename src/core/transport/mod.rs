//! Transport layer for the three supported link types
//!
//! Supports:
//! - Serial ports (RS-232, USB-Serial) via `tokio-serial`
//! - WebSocket sockets (`ws://` / `wss://`) via `tokio-tungstenite`
//! - Bluetooth LE characteristics via `btleplug`
//!
//! Every transport is opened through a [`Connector`] and handed back as an
//! [`OpenLink`]: a shared [`Link`] handle for writing and closing, plus a
//! single [`LinkReader`] owned by the session's read task.

mod ble;
pub mod memory;
mod serial;
mod socket;

pub use ble::{BleCandidate, BleConfig, DeviceSelector, FirstCandidate, BLE_MAX_WRITE_CHUNK};
pub use memory::{MemoryConnector, MemoryPeer};
pub use serial::{list_ports, SerialConfig, SerialFlowControl, SerialParity, STANDARD_BAUD_RATES};
pub use socket::SocketConfig;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// Transport configuration, one variant per link type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TransportConfig {
    /// Serial port
    Serial(SerialConfig),
    /// WebSocket
    Socket(SocketConfig),
    /// Bluetooth LE characteristic
    Ble(BleConfig),
}

impl TransportConfig {
    /// Kind of transport this configuration opens
    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Serial(_) => TransportKind::Serial,
            Self::Socket(_) => TransportKind::Socket,
            Self::Ble(_) => TransportKind::Ble,
        }
    }

    /// Check parameters before any device is touched
    pub fn validate(&self) -> Result<(), TransportError> {
        match self {
            Self::Serial(cfg) => cfg.validate(),
            Self::Socket(cfg) => cfg.validate(),
            Self::Ble(cfg) => cfg.validate().map(|_| ()),
        }
    }
}

/// Transport type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    /// Serial port
    Serial,
    /// WebSocket
    Socket,
    /// Bluetooth LE
    Ble,
}

impl TransportKind {
    /// Whether an unexpected closure is followed by automatic reconnection
    pub fn supports_reconnect(self) -> bool {
        matches!(self, Self::Socket)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serial => write!(f, "Serial"),
            Self::Socket => write!(f, "WebSocket"),
            Self::Ble => write!(f, "BLE"),
        }
    }
}

/// Transport error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Bad parameters, detected before opening
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The host lacks the required capability (no adapter, no device)
    #[error("Capability unavailable: {0}")]
    CapabilityUnavailable(String),

    /// The user dismissed the device picker
    #[error("Cancelled by user")]
    UserCancelled,

    /// Open or handshake failed
    #[error("Connection failed: {0}")]
    ConnectFailure(String),

    /// A single write was rejected
    #[error("Write failed: {0}")]
    WriteFailure(String),

    /// The inbound stream failed
    #[error("Read failed: {0}")]
    ReadFailure(String),

    /// No live link
    #[error("Not connected")]
    NotConnected,
}

impl TransportError {
    /// A dismissed picker is not a failure and is never logged as one
    pub fn is_user_cancelled(&self) -> bool {
        matches!(self, Self::UserCancelled)
    }
}

/// What a link can do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Inbound data is pushed by notifications rather than pulled
    pub notify: bool,
    /// Largest chunk a single write may carry, `None` when unbounded
    pub max_write_chunk: Option<usize>,
}

impl Capabilities {
    /// Pull-read stream with no write limit
    pub const STREAM: Self = Self {
        notify: false,
        max_write_chunk: None,
    };

    /// Clamp a requested chunk size to what the link accepts
    pub fn clamp_chunk(&self, requested: usize) -> usize {
        match self.max_write_chunk {
            Some(max) => requested.min(max),
            None => requested,
        }
    }
}

/// How a queued payload goes out on the wire
///
/// Only sockets distinguish the two; every other link writes raw bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SendMode {
    /// Raw bytes / binary frame
    #[default]
    Binary,
    /// UTF-8 text frame
    Text,
}

/// Result of one pull from a link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadEvent {
    /// A chunk of inbound bytes
    Data(Bytes),
    /// The peer closed the stream
    EndOfStream,
}

/// Transport statistics
#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    /// Bytes sent
    pub bytes_sent: u64,
    /// Bytes received
    pub bytes_received: u64,
    /// Writes issued
    pub writes: u64,
    /// Reads delivered
    pub reads: u64,
    /// Connection uptime in seconds
    pub uptime_secs: u64,
}

/// Statistics shared between a link and its reader
#[derive(Debug, Clone)]
pub(crate) struct SharedStats {
    inner: Arc<RwLock<TransportStats>>,
    opened_at: Instant,
}

impl SharedStats {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(TransportStats::default())),
            opened_at: Instant::now(),
        }
    }

    pub(crate) fn record_write(&self, len: usize) {
        let mut stats = self.inner.write();
        stats.bytes_sent += len as u64;
        stats.writes += 1;
    }

    pub(crate) fn record_read(&self, len: usize) {
        let mut stats = self.inner.write();
        stats.bytes_received += len as u64;
        stats.reads += 1;
    }

    pub(crate) fn snapshot(&self) -> TransportStats {
        let mut stats = self.inner.read().clone();
        stats.uptime_secs = self.opened_at.elapsed().as_secs();
        stats
    }
}

/// Write/close side of an open transport
#[async_trait]
pub trait Link: Send + Sync {
    /// Transport kind
    fn kind(&self) -> TransportKind;

    /// Human readable identity (port name, URL, device name)
    fn name(&self) -> &str;

    /// Capability flags
    fn capabilities(&self) -> Capabilities;

    /// Whether the link is still open
    fn is_open(&self) -> bool;

    /// Write one contiguous chunk
    ///
    /// Callers split payloads larger than [`Capabilities::max_write_chunk`].
    async fn write(&self, data: Bytes, mode: SendMode) -> Result<(), TransportError>;

    /// Close the link; closing twice is harmless
    async fn close(&self) -> Result<(), TransportError>;

    /// Get statistics
    fn stats(&self) -> TransportStats;
}

/// Read side of an open transport, owned by exactly one task
#[async_trait]
pub trait LinkReader: Send {
    /// Wait for the next inbound chunk
    async fn read(&mut self) -> Result<ReadEvent, TransportError>;
}

/// A freshly opened transport
pub struct OpenLink {
    /// Shared write/close handle
    pub link: Arc<dyn Link>,
    /// Exclusive read handle
    pub reader: Box<dyn LinkReader>,
}

impl fmt::Debug for OpenLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenLink")
            .field("kind", &self.link.kind())
            .field("name", &self.link.name())
            .finish()
    }
}

/// Opens transports from configuration
#[async_trait]
pub trait Connector: Send + Sync {
    /// Request the device and open it
    async fn open(&self, config: &TransportConfig) -> Result<OpenLink, TransportError>;
}

/// Connector backed by the host's serial, WebSocket and Bluetooth stacks
pub struct SystemConnector {
    selector: Arc<dyn DeviceSelector>,
}

impl SystemConnector {
    /// Create a connector that picks the first matching BLE device
    pub fn new() -> Self {
        Self::with_selector(Arc::new(FirstCandidate))
    }

    /// Create a connector with a custom BLE device picker
    pub fn with_selector(selector: Arc<dyn DeviceSelector>) -> Self {
        Self { selector }
    }
}

impl Default for SystemConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for SystemConnector {
    async fn open(&self, config: &TransportConfig) -> Result<OpenLink, TransportError> {
        config.validate()?;
        match config {
            TransportConfig::Serial(cfg) => serial::open(cfg),
            TransportConfig::Socket(cfg) => socket::open(cfg).await,
            TransportConfig::Ble(cfg) => ble::open(cfg, self.selector.as_ref()).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_dispatch() {
        let serial = TransportConfig::Serial(SerialConfig::new("/dev/ttyUSB0", 115_200));
        let socket = TransportConfig::Socket(SocketConfig::new("ws://localhost:8080"));
        let ble = TransportConfig::Ble(BleConfig::default());

        assert_eq!(serial.kind(), TransportKind::Serial);
        assert_eq!(socket.kind(), TransportKind::Socket);
        assert_eq!(ble.kind(), TransportKind::Ble);
        assert!(socket.kind().supports_reconnect());
        assert!(!serial.kind().supports_reconnect());
        assert!(!ble.kind().supports_reconnect());
    }

    #[test]
    fn test_clamp_chunk() {
        let ble = Capabilities {
            notify: true,
            max_write_chunk: Some(20),
        };
        assert_eq!(ble.clamp_chunk(256), 20);
        assert_eq!(ble.clamp_chunk(8), 8);
        assert_eq!(Capabilities::STREAM.clamp_chunk(4096), 4096);
    }

    #[test]
    fn test_user_cancel_flag() {
        assert!(TransportError::UserCancelled.is_user_cancelled());
        assert!(!TransportError::NotConnected.is_user_cancelled());
    }
}
