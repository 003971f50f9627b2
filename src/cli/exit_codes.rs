//! CLI Exit Codes
//!
//! Standard exit codes for CLI operations and automation.

use crate::core::session::SessionError;
use crate::core::transport::TransportError;
use std::process::ExitCode;

/// Exit code constants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCodes;

impl ExitCodes {
    /// Success
    pub const SUCCESS: u8 = 0;

    /// General error
    pub const ERROR: u8 = 1;

    /// Invalid arguments or input
    pub const INVALID_ARGS: u8 = 2;

    /// Connection failed
    pub const CONNECTION_FAILED: u8 = 3;

    /// Configuration error
    pub const CONFIG_ERROR: u8 = 8;

    /// Transfer failed or aborted
    pub const TRANSFER_FAILED: u8 = 10;

    /// User cancelled
    pub const CANCELLED: u8 = 11;

    /// Device or adapter not found
    pub const DEVICE_NOT_FOUND: u8 = 12;

    /// Link lost while running
    pub const LINK_LOST: u8 = 13;
}

/// Exit code for a session error
pub fn exit_code_for(err: &SessionError) -> u8 {
    match err {
        SessionError::Transport(e) => match e {
            TransportError::Configuration(_) => ExitCodes::CONFIG_ERROR,
            TransportError::CapabilityUnavailable(_) => ExitCodes::DEVICE_NOT_FOUND,
            TransportError::UserCancelled => ExitCodes::CANCELLED,
            TransportError::ConnectFailure(_) => ExitCodes::CONNECTION_FAILED,
            TransportError::ReadFailure(_) | TransportError::NotConnected => ExitCodes::LINK_LOST,
            TransportError::WriteFailure(_) => ExitCodes::ERROR,
        },
        SessionError::Codec(_) => ExitCodes::INVALID_ARGS,
        SessionError::TransferAborted { .. } | SessionError::TransferInProgress => {
            ExitCodes::TRANSFER_FAILED
        }
        SessionError::Cancelled => ExitCodes::CANCELLED,
        SessionError::NotConnected => ExitCodes::LINK_LOST,
        SessionError::Clipboard(_)
        | SessionError::Paused
        | SessionError::ConnectInProgress
        | SessionError::InvalidState { .. } => ExitCodes::ERROR,
    }
}

/// Exit code description
pub fn exit_code_description(code: u8) -> &'static str {
    match code {
        0 => "Success",
        1 => "General error",
        2 => "Invalid arguments",
        3 => "Connection failed",
        8 => "Configuration error",
        10 => "Transfer failed",
        11 => "Operation cancelled",
        12 => "Device not found",
        13 => "Link lost",
        _ => "Unknown error",
    }
}

/// Convert to a process exit code
pub fn to_exit_code(err: &SessionError) -> ExitCode {
    ExitCode::from(exit_code_for(err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_errors_mapped() {
        let err = SessionError::Transport(TransportError::Configuration("baud".into()));
        assert_eq!(exit_code_for(&err), ExitCodes::CONFIG_ERROR);

        let err = SessionError::Transport(TransportError::UserCancelled);
        assert_eq!(exit_code_for(&err), ExitCodes::CANCELLED);
        assert_eq!(exit_code_description(exit_code_for(&err)), "Operation cancelled");
    }

    #[test]
    fn test_transfer_errors_mapped() {
        let err = SessionError::TransferAborted { sent: 1, total: 2 };
        assert_eq!(exit_code_for(&err), ExitCodes::TRANSFER_FAILED);
    }
}
