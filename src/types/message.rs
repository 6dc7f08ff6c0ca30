//! Message types for received and sent frames.

use bytes::Bytes;

use crate::error::Result;
use crate::protocol::DeliveryStatus;
use crate::types::{Address16, RemoteEndpoint};

/// Gets the current Unix time in seconds with sub-second precision.
#[must_use]
pub fn current_timestamp() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// A data frame from (or replayed as if from) a remote node.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteMessage {
    /// Sender identity at receipt time.
    pub sender: RemoteEndpoint,
    /// Raw RF payload.
    pub payload: Bytes,
    /// True if the frame was sent to the broadcast address.
    pub is_broadcast: bool,
    /// Receipt time (Unix seconds).
    pub timestamp: f64,
    /// Received signal strength in dBm, if the module reported it.
    ///
    /// Always `None` for replayed messages.
    pub rssi: Option<i32>,
}

impl RemoteMessage {
    /// Returns the payload as UTF-8 text.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::PayloadEncoding`] if the payload is not UTF-8.
    pub fn text(&self) -> Result<&str> {
        Ok(std::str::from_utf8(&self.payload)?)
    }
}

/// Result of an acknowledged unicast send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryOutcome {
    /// Frame id correlating the request with its status frame.
    pub frame_id: u8,
    /// Delivery status.
    pub status: DeliveryStatus,
    /// Network address the module delivered to.
    pub destination16: Address16,
    /// Number of application retransmissions.
    pub retry_count: u8,
    /// Route/address discovery overhead code.
    pub discovery_status: u8,
}

impl DeliveryOutcome {
    /// Returns true if the frame was delivered.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Addresses of the locally attached module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalDevice {
    /// Own addresses, read with `SH`/`SL`/`MY` when the link opens.
    pub endpoint: RemoteEndpoint,
}
