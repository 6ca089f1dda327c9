//! Protocol errors

use thiserror::Error;

use super::frame::CommStatus;

/// Errors that can occur while talking to a PLR device
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Header selects the reserved checksum mode
    #[error("Unsupported checksum mode bits in header byte {0:#04x}")]
    UnsupportedMode(u8),

    /// Frame structure does not hold together
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// Payload shorter than its record layout
    #[error("Truncated payload: expected {expected} bytes, got {actual}")]
    TruncatedPayload {
        /// Bytes the record needs
        expected: usize,
        /// Bytes present
        actual: usize,
    },

    /// Push frame with a command code nobody handles
    #[error("Unknown command {0:#04x}")]
    UnknownCommand(u8),

    /// Device answered with a non-success status
    #[error("Device reported failure: {0:?}")]
    DeviceReportedFailure(CommStatus),

    /// Frame checksum does not match its bytes
    #[error("Checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Checksum computed over the frame
        expected: u32,
        /// Checksum carried by the frame
        actual: u32,
    },

    /// No reply before the deadline
    #[error("Reply timeout")]
    Timeout,

    /// The link went away while the request was outstanding
    #[error("Device disconnected")]
    Disconnected,

    /// Session closed
    #[error("Not connected to device")]
    NotConnected,

    /// Opening or configuring the port failed
    #[error("Serial port error: {0}")]
    SerialError(String),

    /// Reply payload does not fit the command
    #[error("Invalid response from device")]
    InvalidResponse,

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(String),

    /// Transport read or write failed
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
