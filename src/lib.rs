//! # linkterm core library
//!
//! A terminal library for talking to devices over:
//! - Serial ports (RS-232, USB-Serial adapters)
//! - WebSockets (`ws://`, `wss://`)
//! - Bluetooth LE characteristics
//!
//! ## Features
//!
//! - Bounded receive/send log with text export
//! - Hex/Text input and display
//! - Serialized outbound writes
//! - Chunked raw file transfer
//! - Automatic reconnect for WebSockets
//!
//! ## Example
//!
//! ```rust,no_run
//! use linkterm_core::{Session, SessionConfig, SerialConfig, SystemConnector, TransportConfig};
//! use linkterm_core::core::codec::DisplayMode;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let transport = TransportConfig::Serial(SerialConfig::new("COM3", 115200));
//!     let session = Session::new(SessionConfig::new(transport), Arc::new(SystemConnector::new()));
//!     session.connect().await?;
//!
//!     session.send_text("AT\r\n", DisplayMode::Text)?;
//!
//!     let mut rx = session.log().subscribe();
//!     while let Ok(entry) = rx.recv().await {
//!         println!("{}", entry.to_line(true));
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod config;
pub mod core;
pub mod utils;

// Re-exports for convenience
pub use crate::config::{AppConfig, ConfigError};
pub use crate::core::codec::{CodecError, DisplayMode};
pub use crate::core::logger::{EntryKind, ExportArtifact, ExportFormat, LogBuffer, LogEntry};
pub use crate::core::session::{
    QuickCommand, Session, SessionConfig, SessionError, SessionEvent, SessionState,
};
pub use crate::core::transfer::{TransferOptions, TransferProgress};
pub use crate::core::transport::{
    BleConfig, Connector, SerialConfig, SerialFlowControl, SerialParity, SocketConfig,
    SystemConnector, TransportConfig, TransportError, TransportKind,
};
pub use crate::utils::autoconnect::ReconnectSupervisor;
pub use crate::utils::clipboard::{ClipboardBackend, NativeClipboard, SelectionClipboard};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
