//! Error types for the gopher library.

use thiserror::Error;

use crate::types::DeliveryOutcome;

/// The main error type for gopher operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The radio link could not be opened.
    #[error("failed to open radio link on {port}: {cause}")]
    TransportOpen {
        port: String,
        #[source]
        cause: Box<Error>,
    },

    /// An operation needed an open link.
    #[error("radio link is not open")]
    TransportNotOpen,

    /// Malformed 64-bit or 16-bit address string.
    #[error("invalid address {address:?}: {reason}")]
    InvalidAddress { address: String, reason: String },

    /// Payload is not valid UTF-8 text.
    #[error("payload is not valid UTF-8: {0}")]
    PayloadEncoding(#[from] std::str::Utf8Error),

    /// No transmit status arrived for an acknowledged send.
    #[error("no delivery status for frame {frame_id} after {timeout_ms}ms")]
    AckTimeout { frame_id: u8, timeout_ms: u64 },

    /// The radio reported a failed delivery.
    #[error("delivery of frame {} failed: {}", .0.frame_id, .0.status)]
    AckFailed(DeliveryOutcome),

    /// The transmission log cannot be reached.
    #[error("transmission log unavailable: {reason}")]
    StoreUnavailable { reason: String },

    /// A log insert failed and was rolled back.
    #[error("transmission log write failed: {0}")]
    StoreWriteFailed(#[source] rusqlite::Error),

    /// Database error outside of an insert.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Log table name is not a plain identifier.
    #[error("invalid table name: {0:?}")]
    InvalidTableName(String),

    /// Serial port error.
    #[error("serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame encoding/decoding error.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// The module rejected a local AT command.
    #[error("AT command {command} failed with status {status:#04x}")]
    AtCommand { command: String, status: u8 },

    /// A local AT command got no response in time.
    #[error("AT command {command} timed out after {timeout_ms}ms")]
    AtTimeout { command: String, timeout_ms: u64 },

    /// All 255 frame ids are waiting for a response.
    #[error("no free frame id: too many requests awaiting a response")]
    FrameIdsExhausted,

    /// A sensor payload value is missing or not a number.
    #[error("malformed payload value for {key:?}: {value:?}")]
    MalformedPayload { key: String, value: Option<String> },

    /// Internal channel closed, usually because the link went down.
    #[error("channel closed")]
    ChannelClosed,
}

/// Frame-specific errors.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Frame data too short for its frame type.
    #[error("frame too short: need at least {need} bytes, got {got}")]
    TooShort { need: usize, got: usize },

    /// Frame data exceeds maximum size.
    #[error("frame too large: {size} bytes exceeds maximum {max}")]
    TooLarge { size: usize, max: usize },

    /// Length field of zero or beyond the maximum.
    #[error("invalid frame length {0}")]
    InvalidLength(usize),

    /// Checksum byte does not match the frame data.
    #[error("checksum mismatch: expected {expected:#04x}, got {got:#04x}")]
    Checksum { expected: u8, got: u8 },
}

/// Result type alias for gopher operations.
pub type Result<T> = std::result::Result<T, Error>;
