//! Bluetooth LE characteristic transport
//!
//! One characteristic carries both directions: writes go to it, inbound data
//! arrives as notifications (or, when the characteristic cannot notify, by
//! polling reads).

use super::{
    Capabilities, Link, LinkReader, OpenLink, ReadEvent, SendMode, SharedStats, TransportError,
    TransportKind, TransportStats,
};
use async_trait::async_trait;
use btleplug::api::{
    Central, CharPropFlags, Characteristic, Manager as _, Peripheral as _, ScanFilter,
    ValueNotification, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Largest payload a single characteristic write may carry
pub const BLE_MAX_WRITE_CHUNK: usize = 20;

const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// BLE connection configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BleConfig {
    /// Service UUID the device must advertise
    pub service_uuid: String,
    /// Characteristic UUID used for both directions
    pub characteristic_uuid: String,
    /// Optional device name or address to pick without asking
    pub device: Option<String>,
    /// Scan duration in seconds
    pub scan_secs: u64,
    /// Connection timeout in seconds
    pub timeout_secs: u64,
}

impl BleConfig {
    /// Create a configuration for a service/characteristic pair
    pub fn new(service_uuid: &str, characteristic_uuid: &str) -> Self {
        Self {
            service_uuid: service_uuid.trim().to_string(),
            characteristic_uuid: characteristic_uuid.trim().to_string(),
            ..Self::default()
        }
    }

    /// Restrict the scan to one device name or address
    #[must_use]
    pub fn device(mut self, device: &str) -> Self {
        self.device = Some(device.to_string());
        self
    }

    /// Parse both UUIDs
    pub fn validate(&self) -> Result<(Uuid, Uuid), TransportError> {
        let service = Uuid::parse_str(&self.service_uuid).map_err(|e| {
            TransportError::Configuration(format!(
                "invalid service UUID '{}': {e}",
                self.service_uuid
            ))
        })?;
        let characteristic = Uuid::parse_str(&self.characteristic_uuid).map_err(|e| {
            TransportError::Configuration(format!(
                "invalid characteristic UUID '{}': {e}",
                self.characteristic_uuid
            ))
        })?;
        Ok((service, characteristic))
    }
}

impl Default for BleConfig {
    fn default() -> Self {
        // Nordic UART Service, RX characteristic
        Self {
            service_uuid: "6e400001-b5a3-f393-e0a9-e50e24dcca9e".to_string(),
            characteristic_uuid: "6e400003-b5a3-f393-e0a9-e50e24dcca9e".to_string(),
            device: None,
            scan_secs: 3,
            timeout_secs: 10,
        }
    }
}

/// A device found during the scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BleCandidate {
    /// Advertised name
    pub name: String,
    /// Platform address / identifier
    pub address: String,
    /// Signal strength
    pub rssi: Option<i16>,
}

/// Device picker consulted when a scan finds candidates
pub trait DeviceSelector: Send + Sync {
    /// Pick one candidate by index; `None` means the user dismissed the picker
    fn select(&self, candidates: &[BleCandidate]) -> Option<usize>;
}

/// Picks the first candidate
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstCandidate;

impl DeviceSelector for FirstCandidate {
    fn select(&self, candidates: &[BleCandidate]) -> Option<usize> {
        if candidates.is_empty() {
            None
        } else {
            Some(0)
        }
    }
}

pub(super) async fn open(
    config: &BleConfig,
    selector: &dyn DeviceSelector,
) -> Result<OpenLink, TransportError> {
    let (service_uuid, char_uuid) = config.validate()?;

    let manager = Manager::new()
        .await
        .map_err(|e| TransportError::CapabilityUnavailable(format!("Bluetooth unavailable: {e}")))?;
    let adapter = manager
        .adapters()
        .await
        .map_err(|e| TransportError::CapabilityUnavailable(format!("Bluetooth unavailable: {e}")))?
        .into_iter()
        .next()
        .ok_or_else(|| TransportError::CapabilityUnavailable("no Bluetooth adapter found".into()))?;

    let (peripheral, name) = pick_peripheral(&adapter, config, service_uuid, selector).await?;

    tokio::time::timeout(Duration::from_secs(config.timeout_secs), peripheral.connect())
        .await
        .map_err(|_| TransportError::ConnectFailure("connection timeout".into()))?
        .map_err(|e| TransportError::ConnectFailure(format!("failed to connect: {e}")))?;

    let characteristic = match find_characteristic(&peripheral, service_uuid, char_uuid).await {
        Ok(c) => c,
        Err(e) => {
            peripheral.disconnect().await.ok();
            return Err(e);
        }
    };

    let notify = characteristic
        .properties
        .intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE);
    let stats = SharedStats::new();

    let reader: Box<dyn LinkReader> = if notify {
        peripheral
            .subscribe(&characteristic)
            .await
            .map_err(|e| TransportError::ConnectFailure(format!("failed to subscribe: {e}")))?;
        let notifications = peripheral
            .notifications()
            .await
            .map_err(|e| TransportError::ConnectFailure(format!("no notification stream: {e}")))?;
        Box::new(NotifyReader {
            notifications,
            characteristic: char_uuid,
            stats: stats.clone(),
        })
    } else if characteristic.properties.contains(CharPropFlags::READ) {
        Box::new(PollReader {
            peripheral: peripheral.clone(),
            characteristic: characteristic.clone(),
            last: None,
            stats: stats.clone(),
        })
    } else {
        peripheral.disconnect().await.ok();
        return Err(TransportError::ConnectFailure(
            "characteristic supports neither notify nor read".into(),
        ));
    };

    let write_type = if characteristic
        .properties
        .contains(CharPropFlags::WRITE_WITHOUT_RESPONSE)
    {
        WriteType::WithoutResponse
    } else {
        WriteType::WithResponse
    };

    info!("Opened BLE characteristic {} on {}", char_uuid, name);

    let link = BleLink {
        name,
        peripheral,
        characteristic,
        write_type,
        notify,
        open: AtomicBool::new(true),
        stats,
    };

    Ok(OpenLink {
        link: Arc::new(link),
        reader,
    })
}

async fn pick_peripheral(
    adapter: &Adapter,
    config: &BleConfig,
    service_uuid: Uuid,
    selector: &dyn DeviceSelector,
) -> Result<(Peripheral, String), TransportError> {
    adapter
        .start_scan(ScanFilter {
            services: vec![service_uuid],
        })
        .await
        .map_err(|e| TransportError::CapabilityUnavailable(format!("failed to start scan: {e}")))?;

    tokio::time::sleep(Duration::from_secs(config.scan_secs)).await;

    let peripherals = adapter
        .peripherals()
        .await
        .map_err(|e| TransportError::ConnectFailure(format!("failed to list devices: {e}")));

    if let Err(e) = adapter.stop_scan().await {
        warn!("Failed to stop BLE scan: {}", e);
    }

    let mut found = Vec::new();
    for peripheral in peripherals? {
        let Ok(Some(props)) = peripheral.properties().await else {
            continue;
        };
        let name = props.local_name.unwrap_or_else(|| "Unknown".to_string());
        let address = peripheral.id().to_string();

        let advertises = props.services.contains(&service_uuid);
        if is_candidate(config.device.as_deref(), &name, &address, advertises) {
            found.push((
                peripheral,
                BleCandidate {
                    name,
                    address,
                    rssi: props.rssi,
                },
            ));
        }
    }

    if found.is_empty() {
        return Err(TransportError::ConnectFailure(format!(
            "no device advertising service {service_uuid}"
        )));
    }

    let candidates: Vec<BleCandidate> = found.iter().map(|(_, c)| c.clone()).collect();
    let index = match (&config.device, found.len()) {
        (Some(_), _) | (None, 1) => 0,
        _ => selector.select(&candidates).ok_or(TransportError::UserCancelled)?,
    };

    if index >= found.len() {
        return Err(TransportError::UserCancelled);
    }
    let (peripheral, candidate) = found.swap_remove(index);
    debug!("Selected BLE device {} ({})", candidate.name, candidate.address);
    Ok((peripheral, candidate.name))
}

async fn find_characteristic(
    peripheral: &Peripheral,
    service_uuid: Uuid,
    char_uuid: Uuid,
) -> Result<Characteristic, TransportError> {
    peripheral
        .discover_services()
        .await
        .map_err(|e| TransportError::ConnectFailure(format!("failed to discover services: {e}")))?;

    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == char_uuid && c.service_uuid == service_uuid)
        .ok_or_else(|| {
            TransportError::ConnectFailure(format!(
                "characteristic {char_uuid} not found in service {service_uuid}"
            ))
        })
}

struct BleLink {
    name: String,
    peripheral: Peripheral,
    characteristic: Characteristic,
    write_type: WriteType,
    notify: bool,
    open: AtomicBool,
    stats: SharedStats,
}

#[async_trait]
impl Link for BleLink {
    fn kind(&self) -> TransportKind {
        TransportKind::Ble
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            notify: self.notify,
            max_write_chunk: Some(BLE_MAX_WRITE_CHUNK),
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn write(&self, data: Bytes, _mode: SendMode) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotConnected);
        }
        if data.len() > BLE_MAX_WRITE_CHUNK {
            return Err(TransportError::WriteFailure(format!(
                "{} bytes exceeds the {BLE_MAX_WRITE_CHUNK}-byte characteristic limit",
                data.len()
            )));
        }

        self.peripheral
            .write(&self.characteristic, &data, self.write_type)
            .await
            .map_err(|e| TransportError::WriteFailure(e.to_string()))?;

        self.stats.record_write(data.len());
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.open.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        if self.notify {
            self.peripheral.unsubscribe(&self.characteristic).await.ok();
        }
        self.peripheral
            .disconnect()
            .await
            .map_err(|e| TransportError::ConnectFailure(format!("failed to disconnect: {e}")))?;
        debug!("Closed BLE link to {}", self.name);
        Ok(())
    }

    fn stats(&self) -> TransportStats {
        self.stats.snapshot()
    }
}

struct NotifyReader {
    notifications: Pin<Box<dyn Stream<Item = ValueNotification> + Send>>,
    characteristic: Uuid,
    stats: SharedStats,
}

#[async_trait]
impl LinkReader for NotifyReader {
    async fn read(&mut self) -> Result<ReadEvent, TransportError> {
        while let Some(notification) = self.notifications.next().await {
            if notification.uuid != self.characteristic || notification.value.is_empty() {
                continue;
            }
            self.stats.record_read(notification.value.len());
            return Ok(ReadEvent::Data(Bytes::from(notification.value)));
        }
        Ok(ReadEvent::EndOfStream)
    }
}

/// Reads the characteristic on a fixed interval and reports value changes
struct PollReader {
    peripheral: Peripheral,
    characteristic: Characteristic,
    last: Option<Vec<u8>>,
    stats: SharedStats,
}

#[async_trait]
impl LinkReader for PollReader {
    async fn read(&mut self) -> Result<ReadEvent, TransportError> {
        loop {
            tokio::time::sleep(POLL_INTERVAL).await;

            if !self
                .peripheral
                .is_connected()
                .await
                .map_err(|e| TransportError::ReadFailure(e.to_string()))?
            {
                return Ok(ReadEvent::EndOfStream);
            }

            let value = self
                .peripheral
                .read(&self.characteristic)
                .await
                .map_err(|e| TransportError::ReadFailure(e.to_string()))?;

            if value.is_empty() || self.last.as_ref() == Some(&value) {
                continue;
            }
            self.last = Some(value.clone());
            self.stats.record_read(value.len());
            return Ok(ReadEvent::Data(Bytes::from(value)));
        }
    }
}

/// A named device must match exactly by name or address; otherwise the
/// peripheral has to advertise the service
fn is_candidate(wanted: Option<&str>, name: &str, address: &str, advertises: bool) -> bool {
    match wanted {
        Some(wanted) => wanted == name || wanted == address,
        None => advertises,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ble_config_default() {
        let config = BleConfig::default();
        // Nordic UART Service
        assert!(config.service_uuid.contains("6e400001"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_device_filter_is_exact() {
        assert!(is_candidate(Some("Sensor"), "Sensor", "AA:BB", false));
        assert!(is_candidate(Some("AA:BB"), "Sensor", "AA:BB", false));
        assert!(!is_candidate(Some("Sens"), "Sensor", "AA:BB", true));
        assert!(is_candidate(None, "Sensor", "AA:BB", true));
        assert!(!is_candidate(None, "Sensor", "AA:BB", false));
    }

    #[test]
    fn test_ble_config_rejects_bad_uuid() {
        let config = BleConfig::new("not-a-uuid", "6e400003-b5a3-f393-e0a9-e50e24dcca9e");
        assert!(matches!(config.validate(), Err(TransportError::Configuration(_))));

        let config = BleConfig::new("6e400001-b5a3-f393-e0a9-e50e24dcca9e", "");
        assert!(matches!(config.validate(), Err(TransportError::Configuration(_))));
    }

    #[test]
    fn test_first_candidate_selector() {
        let candidates = vec![BleCandidate {
            name: "UART".into(),
            address: "AA:BB".into(),
            rssi: Some(-40),
        }];
        assert_eq!(FirstCandidate.select(&candidates), Some(0));
        assert_eq!(FirstCandidate.select(&[]), None);
    }
}
