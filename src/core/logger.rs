//! Bounded in-memory communication log
//!
//! Every received, sent, informational and error event becomes an immutable
//! [`LogEntry`] in a [`LogBuffer`]. The buffer enforces two ceilings after
//! each append, in this order:
//!
//! 1. entry count: above [`MAX_ENTRIES`] only the newest [`RETAIN_ON_OVERFLOW`]
//!    entries survive;
//! 2. byte footprint: the oldest entries are dropped one at a time until the
//!    received/sent byte total fits the ceiling or [`MIN_RETAINED`] entries remain.
//!
//! Both checks run under the same write lock as the append, so readers never
//! observe a buffer above either ceiling.

use bytes::Bytes;
use chrono::{DateTime, Local};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;

/// Hard entry-count ceiling
pub const MAX_ENTRIES: usize = 1000;
/// Entries kept when the count ceiling is exceeded
pub const RETAIN_ON_OVERFLOW: usize = 500;
/// Byte eviction never shrinks the buffer below this many entries
pub const MIN_RETAINED: usize = 10;
/// Default byte ceiling (1 MiB)
pub const DEFAULT_BYTE_CEILING: usize = 1024 * 1024;

/// Kind of log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    /// Bytes read from the link
    Received,
    /// Bytes queued for the link
    Sent,
    /// Informational message
    Info,
    /// Error message
    Error,
}

impl EntryKind {
    /// Data entries count toward the byte ceiling and appear in exports
    pub fn is_data(self) -> bool {
        matches!(self, Self::Received | Self::Sent)
    }

    /// Short direction tag
    pub fn tag(self) -> &'static str {
        match self {
            Self::Received => "RX",
            Self::Sent => "TX",
            Self::Info => "##",
            Self::Error => "!!",
        }
    }
}

/// A single log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Unique, increasing id
    pub id: u64,
    /// Creation time
    pub timestamp: DateTime<Local>,
    /// Entry kind
    pub kind: EntryKind,
    /// Raw payload
    pub data: Bytes,
    /// Decoded display text
    pub text: String,
}

impl LogEntry {
    /// Raw byte count
    pub fn byte_count(&self) -> usize {
        self.data.len()
    }

    /// Format as a display line
    pub fn to_line(&self, show_timestamp: bool) -> String {
        if show_timestamp {
            format!(
                "[{}] {} {}",
                self.timestamp.format("%H:%M:%S%.3f"),
                self.kind.tag(),
                self.text
            )
        } else {
            format!("{} {}", self.kind.tag(), self.text)
        }
    }
}

struct Entries {
    entries: VecDeque<LogEntry>,
    data_bytes: usize,
    ceiling: usize,
}

impl Entries {
    fn pop_oldest(&mut self) {
        if let Some(entry) = self.entries.pop_front() {
            if entry.kind.is_data() {
                self.data_bytes -= entry.byte_count();
            }
        }
    }

    fn enforce_limits(&mut self) {
        if self.entries.len() > MAX_ENTRIES {
            let excess = self.entries.len() - RETAIN_ON_OVERFLOW;
            for _ in 0..excess {
                self.pop_oldest();
            }
        }

        while self.data_bytes > self.ceiling && self.entries.len() > MIN_RETAINED {
            self.pop_oldest();
        }
    }
}

/// Bounded, ordered log of communication events
pub struct LogBuffer {
    inner: RwLock<Entries>,
    next_id: AtomicU64,
    pending_lines: Arc<AtomicU64>,
    events: broadcast::Sender<LogEntry>,
}

impl LogBuffer {
    /// Create a buffer with the given byte ceiling
    pub fn new(byte_ceiling: usize) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            inner: RwLock::new(Entries {
                entries: VecDeque::with_capacity(MAX_ENTRIES + 1),
                data_bytes: 0,
                ceiling: byte_ceiling,
            }),
            next_id: AtomicU64::new(1),
            pending_lines: Arc::new(AtomicU64::new(0)),
            events,
        }
    }

    /// Append an entry and evict as needed, atomically
    pub fn append(&self, kind: EntryKind, data: Bytes, text: impl Into<String>) -> LogEntry {
        let text = text.into();
        if kind == EntryKind::Received {
            let lines = text.bytes().filter(|&b| b == b'\n').count() as u64;
            if lines > 0 {
                self.pending_lines.fetch_add(lines, Ordering::Relaxed);
            }
        }

        let entry = {
            let mut inner = self.inner.write();
            // Ids are taken under the lock so they follow insertion order.
            let entry = LogEntry {
                id: self.next_id.fetch_add(1, Ordering::Relaxed),
                timestamp: Local::now(),
                kind,
                data,
                text,
            };
            if kind.is_data() {
                inner.data_bytes += entry.byte_count();
            }
            inner.entries.push_back(entry.clone());
            inner.enforce_limits();
            entry
        };

        // Nobody listening is fine.
        let _ = self.events.send(entry.clone());
        entry
    }

    /// Append an informational message
    pub fn info(&self, message: impl Into<String>) -> LogEntry {
        self.append(EntryKind::Info, Bytes::new(), message)
    }

    /// Append an error message
    pub fn error(&self, message: impl Into<String>) -> LogEntry {
        self.append(EntryKind::Error, Bytes::new(), message)
    }

    /// Sum of byte counts over received and sent entries
    pub fn total_bytes(&self) -> usize {
        self.inner.read().data_bytes
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    /// Whether the buffer is empty
    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }

    /// Current byte ceiling
    pub fn ceiling(&self) -> usize {
        self.inner.read().ceiling
    }

    /// Change the byte ceiling and evict down to it
    pub fn set_ceiling(&self, bytes: usize) {
        let mut inner = self.inner.write();
        inner.ceiling = bytes;
        inner.enforce_limits();
    }

    /// Snapshot of all entries, oldest first
    pub fn entries(&self) -> Vec<LogEntry> {
        self.inner.read().entries.iter().cloned().collect()
    }

    /// Remove every entry
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.entries.clear();
        inner.data_bytes = 0;
    }

    /// Text of received and sent entries, in order, without separators
    pub fn export_text(&self) -> String {
        let inner = self.inner.read();
        inner
            .entries
            .iter()
            .filter(|e| e.kind.is_data())
            .map(|e| e.text.as_str())
            .collect()
    }

    /// Clipboard payload; identical to [`LogBuffer::export_text`]
    pub fn copy_text(&self) -> String {
        self.export_text()
    }

    /// Subscribe to appended entries
    pub fn subscribe(&self) -> broadcast::Receiver<LogEntry> {
        self.events.subscribe()
    }

    /// Counter of newlines seen in received text since the last sample
    pub(crate) fn line_counter(&self) -> Arc<AtomicU64> {
        self.pending_lines.clone()
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_BYTE_CEILING)
    }
}

/// Export file flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ExportFormat {
    /// `.txt`
    #[default]
    Txt,
    /// `.bin`; currently the same text content as `.txt`
    Bin,
}

impl ExportFormat {
    /// Get file extension for format
    pub fn extension(self) -> &'static str {
        match self {
            Self::Txt => "txt",
            Self::Bin => "bin",
        }
    }
}

impl std::str::FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "txt" | "text" => Ok(Self::Txt),
            "bin" | "binary" | "hex" => Ok(Self::Bin),
            other => Err(format!("unknown export format '{other}'")),
        }
    }
}

/// A rendered export ready to be saved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportArtifact {
    /// Suggested file name
    pub file_name: String,
    /// File contents
    pub contents: String,
}

impl ExportArtifact {
    /// Render the buffer for export
    pub fn from_buffer(buffer: &LogBuffer, format: ExportFormat) -> Self {
        Self {
            file_name: export_file_name(format, unix_millis()),
            contents: buffer.export_text(),
        }
    }

    /// Write into `dir`, returning the full path
    pub fn write_to(&self, dir: &Path) -> std::io::Result<PathBuf> {
        let path = dir.join(&self.file_name);
        std::fs::write(&path, self.contents.as_bytes())?;
        Ok(path)
    }
}

/// `serial_log_<unix-ms>.<ext>`
pub fn export_file_name(format: ExportFormat, unix_ms: u128) -> String {
    format!("serial_log_{}.{}", unix_ms, format.extension())
}

fn unix_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}
