//! Transmission log records.

use bytes::Bytes;

use crate::types::{RemoteEndpoint, RemoteMessage};

/// One row of the transmission log.
#[derive(Debug, Clone, PartialEq)]
pub struct TransmissionRecord {
    /// Store-assigned id, increasing with insertion order.
    pub id: u64,
    /// Sender identity at receipt (or send) time.
    pub sender: RemoteEndpoint,
    /// Signal strength in dBm; `None` when not reported.
    pub rssi: Option<i32>,
    /// True if the frame was a broadcast.
    pub is_broadcast: bool,
    /// Payload text.
    pub payload: String,
    /// Observation time (Unix seconds).
    pub timestamp: f64,
}

impl TransmissionRecord {
    /// Rebuilds the live message shape for replay.
    ///
    /// Signal strength belonged to the original reception and is reported
    /// as absent, never as a default value.
    #[must_use]
    pub fn to_remote_message(&self) -> RemoteMessage {
        RemoteMessage {
            sender: self.sender,
            payload: Bytes::from(self.payload.clone().into_bytes()),
            is_broadcast: self.is_broadcast,
            timestamp: self.timestamp,
            rssi: None,
        }
    }
}

impl std::fmt::Display for TransmissionRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "#{} from {} rssi={} broadcast={} at {:.3}: {}",
            self.id,
            self.sender,
            self.rssi.map_or_else(|| "-".to_owned(), |r| r.to_string()),
            self.is_broadcast,
            self.timestamp,
            self.payload
        )
    }
}
