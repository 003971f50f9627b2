//! Application settings

use crate::core::codec::DisplayMode;
use crate::core::logger::DEFAULT_BYTE_CEILING;
use crate::core::session::{QuickCommand, SessionConfig};
use crate::core::transfer::TransferOptions;
use crate::core::transport::{
    BleConfig, SerialConfig, SerialFlowControl, SerialParity, TransportConfig,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// No home directory to put the config in
    #[error("Could not determine config directory")]
    NoConfigDir,

    /// Reading or writing the file failed
    #[error("Config I/O error on {path}: {source}")]
    Io {
        /// File involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML for [`AppConfig`]
    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized
    #[error("Could not serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Persisted user preferences
    pub preferences: Preferences,
    /// File transfer pacing
    pub transfer: TransferSettings,
    /// Serial defaults
    pub serial: SerialDefaults,
}

impl AppConfig {
    /// Load from the default location; a missing file yields defaults
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&super::config_file().ok_or(ConfigError::NoConfigDir)?)
    }

    /// Load from `path`; a missing file yields defaults
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&content)?)
    }

    /// Save to the default location
    pub fn save(&self) -> Result<PathBuf, ConfigError> {
        let path = super::config_file().ok_or(ConfigError::NoConfigDir)?;
        self.save_to(&path)?;
        Ok(path)
    }

    /// Save to `path`, creating parent directories
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(io_err)
    }

    /// Render as TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Controller settings for a session over `transport`
    pub fn session_config(&self, transport: TransportConfig) -> SessionConfig {
        let mut config = SessionConfig::new(transport);
        config.max_buffer_bytes = self.preferences.max_buffer_bytes;
        config.transfer = self.transfer.options();
        config
    }

    /// Serial configuration for `port` using the saved defaults
    pub fn serial_config(&self, port: &str) -> SerialConfig {
        SerialConfig::new(port, self.serial.baud_rate)
            .data_bits(self.serial.data_bits)
            .stop_bits(self.serial.stop_bits)
            .parity(self.serial.parity)
            .flow_control(self.serial.flow_control)
    }

    /// BLE configuration from the last used UUID pair
    pub fn ble_config(&self) -> BleConfig {
        match &self.preferences.last_ble {
            Some(last) => BleConfig::new(&last.service_uuid, &last.characteristic_uuid),
            None => BleConfig::default(),
        }
    }

    /// Remember a successfully used transport
    pub fn remember(&mut self, transport: &TransportConfig) {
        match transport {
            TransportConfig::Socket(cfg) => {
                self.preferences.last_socket_url = Some(cfg.url.clone());
            }
            TransportConfig::Ble(cfg) => {
                self.preferences.last_ble = Some(BleUuids {
                    service_uuid: cfg.service_uuid.clone(),
                    characteristic_uuid: cfg.characteristic_uuid.clone(),
                });
            }
            TransportConfig::Serial(_) => {}
        }
    }
}

/// Persisted user preferences
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Preferences {
    /// Log buffer byte ceiling
    pub max_buffer_bytes: usize,
    /// Last WebSocket URL
    pub last_socket_url: Option<String>,
    /// Line ending appended to interactive input
    pub line_ending: LineEnding,
    /// Last BLE service/characteristic pair
    pub last_ble: Option<BleUuids>,
    /// Quick-send buttons
    pub quick_send: Vec<QuickCommand>,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            max_buffer_bytes: DEFAULT_BYTE_CEILING,
            last_socket_url: None,
            line_ending: LineEnding::default(),
            last_ble: None,
            quick_send: default_quick_send(),
        }
    }
}

/// BLE UUID pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BleUuids {
    /// Service UUID
    pub service_uuid: String,
    /// Characteristic UUID
    pub characteristic_uuid: String,
}

/// File transfer pacing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSettings {
    /// Bytes per chunk
    pub chunk_size: usize,
    /// Delay between chunks in milliseconds
    pub delay_ms: u64,
}

impl TransferSettings {
    /// As engine options
    pub fn options(&self) -> TransferOptions {
        TransferOptions::new(self.chunk_size, Duration::from_millis(self.delay_ms))
    }
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            chunk_size: 256,
            delay_ms: 10,
        }
    }
}

/// Serial port defaults
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialDefaults {
    /// Baud rate
    pub baud_rate: u32,
    /// Data bits
    pub data_bits: u8,
    /// Stop bits
    pub stop_bits: u8,
    /// Parity
    pub parity: SerialParity,
    /// Flow control
    pub flow_control: SerialFlowControl,
}

impl Default for SerialDefaults {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            data_bits: 8,
            stop_bits: 1,
            parity: SerialParity::None,
            flow_control: SerialFlowControl::None,
        }
    }
}

/// Line ending type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LineEnding {
    /// Nothing appended
    None,
    /// Carriage Return only
    Cr,
    /// Line Feed only
    #[default]
    Lf,
    /// Both CR and LF
    CrLf,
}

impl LineEnding {
    /// Get the text for this line ending
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "",
            Self::Cr => "\r",
            Self::Lf => "\n",
            Self::CrLf => "\r\n",
        }
    }
}

impl std::str::FromStr for LineEnding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(Self::None),
            "cr" => Ok(Self::Cr),
            "lf" => Ok(Self::Lf),
            "crlf" => Ok(Self::CrLf),
            other => Err(format!("unknown line ending '{other}'")),
        }
    }
}

fn default_quick_send() -> Vec<QuickCommand> {
    vec![
        QuickCommand::new("AT", "AT\r\n", DisplayMode::Text),
        QuickCommand::new("Ping", "ping\n", DisplayMode::Text),
        QuickCommand::new("Ctrl-C", "03", DisplayMode::Hex),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transport::SocketConfig;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load_from(&dir.path().join("config.toml")).unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.preferences.max_buffer_bytes, 1024 * 1024);
        assert_eq!(config.transfer.chunk_size, 256);
        assert_eq!(config.transfer.delay_ms, 10);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = AppConfig::default();
        config.preferences.max_buffer_bytes = 4096;
        config.remember(&TransportConfig::Socket(SocketConfig::new("ws://host:81")));
        config.remember(&TransportConfig::Ble(BleConfig::default()));
        config.save_to(&path).unwrap();

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.preferences.last_socket_url.as_deref(), Some("ws://host:81"));
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[transfer]\nchunk_size = 64\n").unwrap();

        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.transfer.chunk_size, 64);
        assert_eq!(config.transfer.delay_ms, 10);
        assert_eq!(config.serial.baud_rate, 115_200);
    }

    #[test]
    fn test_invalid_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "preferences = 3").unwrap();
        assert!(matches!(AppConfig::load_from(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_session_config_derived() {
        let mut config = AppConfig::default();
        config.preferences.max_buffer_bytes = 2048;
        config.transfer.delay_ms = 0;

        let session = config.session_config(TransportConfig::Serial(config.serial_config("COM3")));
        assert_eq!(session.max_buffer_bytes, 2048);
        assert_eq!(session.transfer.inter_chunk_delay, Duration::ZERO);
    }

    #[test]
    fn test_line_ending_parse() {
        assert_eq!("CRLF".parse::<LineEnding>().unwrap().as_str(), "\r\n");
        assert!("x".parse::<LineEnding>().is_err());
    }
}
