//! Serial port transport implementation

use super::{
    Capabilities, Link, LinkReader, OpenLink, ReadEvent, SendMode, SharedStats, TransportError,
    TransportKind, TransportStats,
};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, SerialStream, StopBits};
use tracing::{debug, info};

/// Baud rates accepted by [`SerialConfig::validate`]
pub const STANDARD_BAUD_RATES: &[u32] = &[
    300, 1200, 2400, 4800, 9600, 19200, 38400, 57600, 115_200, 230_400, 460_800, 921_600,
];

const READ_BUFFER: usize = 4096;

/// Serial port flow control type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SerialFlowControl {
    /// No flow control
    #[default]
    None,
    /// Hardware flow control (RTS/CTS)
    Hardware,
}

impl std::str::FromStr for SerialFlowControl {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" | "n" => Ok(Self::None),
            "hardware" | "hw" | "rtscts" => Ok(Self::Hardware),
            other => Err(TransportError::Configuration(format!(
                "unsupported flow control '{other}'"
            ))),
        }
    }
}

/// Serial port parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SerialParity {
    /// No parity
    #[default]
    None,
    /// Odd parity
    Odd,
    /// Even parity
    Even,
}

impl std::str::FromStr for SerialParity {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" | "n" => Ok(Self::None),
            "odd" | "o" => Ok(Self::Odd),
            "even" | "e" => Ok(Self::Even),
            other => Err(TransportError::Configuration(format!(
                "unsupported parity '{other}'"
            ))),
        }
    }
}

/// Serial port configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Port name (e.g., COM3, /dev/ttyUSB0)
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Data bits (7, 8)
    pub data_bits: u8,
    /// Stop bits (1, 2)
    pub stop_bits: u8,
    /// Parity
    pub parity: SerialParity,
    /// Flow control
    pub flow_control: SerialFlowControl,
}

impl SerialConfig {
    /// Create a new serial configuration with 8N1 and no flow control
    pub fn new(port: &str, baud_rate: u32) -> Self {
        Self {
            port: port.to_string(),
            baud_rate,
            data_bits: 8,
            stop_bits: 1,
            parity: SerialParity::None,
            flow_control: SerialFlowControl::None,
        }
    }

    /// Set data bits
    #[must_use]
    pub fn data_bits(mut self, bits: u8) -> Self {
        self.data_bits = bits;
        self
    }

    /// Set stop bits
    #[must_use]
    pub fn stop_bits(mut self, bits: u8) -> Self {
        self.stop_bits = bits;
        self
    }

    /// Set parity
    #[must_use]
    pub fn parity(mut self, parity: SerialParity) -> Self {
        self.parity = parity;
        self
    }

    /// Set flow control
    #[must_use]
    pub fn flow_control(mut self, flow: SerialFlowControl) -> Self {
        self.flow_control = flow;
        self
    }

    /// Reject parameters the port would not accept
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.port.trim().is_empty() {
            return Err(TransportError::Configuration("no serial port selected".into()));
        }
        if !STANDARD_BAUD_RATES.contains(&self.baud_rate) {
            return Err(TransportError::Configuration(format!(
                "unsupported baud rate {}",
                self.baud_rate
            )));
        }
        if !matches!(self.data_bits, 7 | 8) {
            return Err(TransportError::Configuration(format!(
                "unsupported data bits {}",
                self.data_bits
            )));
        }
        if !matches!(self.stop_bits, 1 | 2) {
            return Err(TransportError::Configuration(format!(
                "unsupported stop bits {}",
                self.stop_bits
            )));
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!(
            "{} @ {} baud ({}{}{} {})",
            self.port,
            self.baud_rate,
            self.data_bits,
            match self.parity {
                SerialParity::None => "N",
                SerialParity::Odd => "O",
                SerialParity::Even => "E",
            },
            self.stop_bits,
            match self.flow_control {
                SerialFlowControl::None => "No FC",
                SerialFlowControl::Hardware => "HW FC",
            }
        )
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self::new("", 115_200)
    }
}

/// Open the configured port and split it into link and reader halves
pub(super) fn open(config: &SerialConfig) -> Result<OpenLink, TransportError> {
    let data_bits = match config.data_bits {
        7 => DataBits::Seven,
        _ => DataBits::Eight,
    };

    let stop_bits = match config.stop_bits {
        2 => StopBits::Two,
        _ => StopBits::One,
    };

    let parity = match config.parity {
        SerialParity::Odd => Parity::Odd,
        SerialParity::Even => Parity::Even,
        SerialParity::None => Parity::None,
    };

    let flow_control = match config.flow_control {
        SerialFlowControl::Hardware => FlowControl::Hardware,
        SerialFlowControl::None => FlowControl::None,
    };

    let stream = tokio_serial::new(&config.port, config.baud_rate)
        .data_bits(data_bits)
        .stop_bits(stop_bits)
        .parity(parity)
        .flow_control(flow_control)
        .open_native_async()
        .map_err(|e| map_open_error(&config.port, e))?;

    let name = config.describe();
    info!("Opened serial port {}", name);

    let (read_half, write_half) = tokio::io::split(stream);
    let stats = SharedStats::new();

    let link = SerialLink {
        name,
        writer: Mutex::new(Some(write_half)),
        open: AtomicBool::new(true),
        stats: stats.clone(),
    };
    let reader = SerialReader {
        port: read_half,
        stats,
        buffer: vec![0u8; READ_BUFFER],
    };

    Ok(OpenLink {
        link: Arc::new(link),
        reader: Box::new(reader),
    })
}

fn map_open_error(port: &str, e: tokio_serial::Error) -> TransportError {
    match e.kind() {
        tokio_serial::ErrorKind::NoDevice => {
            TransportError::CapabilityUnavailable(format!("serial port {port} not present"))
        }
        tokio_serial::ErrorKind::InvalidInput => TransportError::Configuration(e.to_string()),
        tokio_serial::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
            TransportError::ConnectFailure(format!("permission denied: {port}"))
        }
        _ => TransportError::ConnectFailure(e.to_string()),
    }
}

struct SerialLink {
    name: String,
    writer: Mutex<Option<WriteHalf<SerialStream>>>,
    open: AtomicBool,
    stats: SharedStats,
}

#[async_trait]
impl Link for SerialLink {
    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::STREAM
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn write(&self, data: Bytes, _mode: SendMode) -> Result<(), TransportError> {
        let mut guard = self.writer.lock().await;
        let port = guard.as_mut().ok_or(TransportError::NotConnected)?;

        port.write_all(&data)
            .await
            .map_err(|e| TransportError::WriteFailure(e.to_string()))?;
        port.flush()
            .await
            .map_err(|e| TransportError::WriteFailure(e.to_string()))?;

        self.stats.record_write(data.len());
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.open.swap(false, Ordering::AcqRel) {
            // The read half is released when the read task is aborted.
            self.writer.lock().await.take();
            debug!("Closed serial port {}", self.name);
        }
        Ok(())
    }

    fn stats(&self) -> TransportStats {
        self.stats.snapshot()
    }
}

struct SerialReader {
    port: ReadHalf<SerialStream>,
    stats: SharedStats,
    buffer: Vec<u8>,
}

#[async_trait]
impl LinkReader for SerialReader {
    async fn read(&mut self) -> Result<ReadEvent, TransportError> {
        match self.port.read(&mut self.buffer).await {
            Ok(0) => Ok(ReadEvent::EndOfStream),
            Ok(n) => {
                self.stats.record_read(n);
                Ok(ReadEvent::Data(Bytes::copy_from_slice(&self.buffer[..n])))
            }
            Err(e) => Err(TransportError::ReadFailure(e.to_string())),
        }
    }
}

/// List available serial ports
pub fn list_ports() -> Result<Vec<serialport::SerialPortInfo>, TransportError> {
    serialport::available_ports()
        .map_err(|e| TransportError::CapabilityUnavailable(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_accepts_standard_config() {
        let cfg = SerialConfig::new("/dev/ttyUSB0", 9600)
            .data_bits(7)
            .stop_bits(2)
            .parity(SerialParity::Even)
            .flow_control(SerialFlowControl::Hardware);
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.describe(), "/dev/ttyUSB0 @ 9600 baud (7E2 HW FC)");
    }

    #[test]
    fn test_validate_rejects_bad_parameters() {
        let base = SerialConfig::new("COM3", 115_200);

        let bad_baud = SerialConfig { baud_rate: 12345, ..base.clone() };
        assert!(matches!(bad_baud.validate(), Err(TransportError::Configuration(_))));

        let bad_bits = base.clone().data_bits(5);
        assert!(matches!(bad_bits.validate(), Err(TransportError::Configuration(_))));

        let bad_stop = base.clone().stop_bits(3);
        assert!(matches!(bad_stop.validate(), Err(TransportError::Configuration(_))));

        let no_port = SerialConfig::new("  ", 115_200);
        assert!(matches!(no_port.validate(), Err(TransportError::Configuration(_))));
    }

    #[test]
    fn test_parse_line_settings() {
        assert_eq!("E".parse::<SerialParity>().unwrap(), SerialParity::Even);
        assert_eq!("hw".parse::<SerialFlowControl>().unwrap(), SerialFlowControl::Hardware);
        assert!("mark".parse::<SerialParity>().is_err());
        assert!("xonxoff".parse::<SerialFlowControl>().is_err());
    }
}
