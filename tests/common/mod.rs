//! Shared fixtures for integration tests

#![allow(dead_code)]

use linkterm_core::core::logger::EntryKind;
use linkterm_core::core::session::{Session, SessionConfig};
use linkterm_core::core::transfer::TransferOptions;
use linkterm_core::core::transport::{
    BleConfig, MemoryConnector, SerialConfig, SocketConfig, TransportConfig,
};
use std::sync::Arc;
use std::time::Duration;

pub fn serial() -> TransportConfig {
    TransportConfig::Serial(SerialConfig::new("/dev/ttyACM0", 115_200))
}

pub fn socket() -> TransportConfig {
    TransportConfig::Socket(SocketConfig::new("ws://device.local:81/"))
}

pub fn ble() -> TransportConfig {
    TransportConfig::Ble(BleConfig::default())
}

/// Session over a scripted connector
pub fn session(transport: TransportConfig) -> (Session, Arc<MemoryConnector>) {
    session_with(SessionConfig::new(transport))
}

pub fn session_with(config: SessionConfig) -> (Session, Arc<MemoryConnector>) {
    let connector = Arc::new(MemoryConnector::new());
    (Session::new(config, connector.clone()), connector)
}

/// Session whose transfers use `chunk_size` and `delay`
pub fn transfer_session(
    transport: TransportConfig,
    chunk_size: usize,
    delay: Duration,
) -> (Session, Arc<MemoryConnector>) {
    let mut config = SessionConfig::new(transport);
    config.transfer = TransferOptions::new(chunk_size, delay);
    session_with(config)
}

pub fn texts(session: &Session, kind: EntryKind) -> Vec<String> {
    session
        .log()
        .entries()
        .into_iter()
        .filter(|e| e.kind == kind)
        .map(|e| e.text)
        .collect()
}

/// Give spawned tasks a chance to run
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}
