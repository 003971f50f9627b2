//! Core module containing the main functionality of linkterm
//!
//! This module provides:
//! - Transport layer for the supported link types (Serial, WebSocket, BLE)
//! - Session controller with its connection state machine
//! - Codec for data encoding/decoding
//! - Bounded log buffer with export
//! - Serialized send queue and chunked file transfer

pub mod codec;
pub mod logger;
pub mod pause;
pub mod rate;
pub mod send_queue;
pub mod session;
pub mod transfer;
pub mod transport;
