//! Supporting services for the session: reconnect supervision and clipboard

pub mod autoconnect;
pub mod clipboard;
