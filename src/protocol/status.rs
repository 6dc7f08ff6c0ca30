//! Option bit sets and status codes carried inside API frames.

use std::fmt;

/// Transmit options byte of a transmit request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransmitOptions(u8);

impl TransmitOptions {
    /// No options set.
    pub const NONE: Self = Self(0);

    /// Disable retries and acknowledgement; no status is awaited.
    pub const DISABLE_ACK: Self = Self(0x01);

    /// Enable APS-layer encryption (requires `EE` on the module).
    pub const APS_ENCRYPTION: Self = Self(0x20);

    /// Use the extended transmission timeout for sleepy end devices.
    pub const EXTENDED_TIMEOUT: Self = Self(0x40);

    /// Creates options from a raw byte.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Self {
        Self(byte)
    }

    /// Returns the raw byte value.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self.0
    }

    /// Check if an option is set.
    #[must_use]
    pub const fn contains(self, flag: Self) -> bool {
        (self.0 & flag.0) == flag.0
    }

    /// Returns these options with `flag` added.
    #[must_use]
    pub const fn with(self, flag: Self) -> Self {
        Self(self.0 | flag.0)
    }

    /// Returns these options with `flag` removed.
    #[must_use]
    pub const fn without(self, flag: Self) -> Self {
        Self(self.0 & !flag.0)
    }
}

/// Receive options byte of a receive packet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceiveOptions(u8);

impl ReceiveOptions {
    /// Packet was acknowledged.
    pub const ACKNOWLEDGED: Self = Self(0x01);

    /// Packet was a broadcast.
    pub const BROADCAST: Self = Self(0x02);

    /// Creates options from a raw byte.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Self {
        Self(byte)
    }

    /// Returns the raw byte value.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self.0
    }

    /// Check if an option is set.
    #[must_use]
    pub const fn contains(self, flag: Self) -> bool {
        (self.0 & flag.0) == flag.0
    }
}

/// Delivery status reported by a transmit status frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// Delivered and acknowledged.
    Success,
    /// MAC acknowledgement failure.
    MacAckFailure,
    /// Clear channel assessment failure.
    CcaFailure,
    /// Invalid destination endpoint.
    InvalidDestinationEndpoint,
    /// Network acknowledgement failure.
    NetworkAckFailure,
    /// Module is not joined to a network.
    NotJoined,
    /// Sent to its own address.
    SelfAddressed,
    /// Destination address not found.
    AddressNotFound,
    /// No route to the destination.
    RouteNotFound,
    /// Neighbour failed to relay the broadcast.
    BroadcastSourceFailed,
    /// Out of internal resources.
    ResourceError,
    /// Payload exceeds the maximum for the current options.
    PayloadTooLarge,
    /// Any code not listed above.
    Other(u8),
}

impl DeliveryStatus {
    /// Parses a status from its code byte.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Self {
        match byte {
            0x00 => Self::Success,
            0x01 => Self::MacAckFailure,
            0x02 => Self::CcaFailure,
            0x15 => Self::InvalidDestinationEndpoint,
            0x21 => Self::NetworkAckFailure,
            0x22 => Self::NotJoined,
            0x23 => Self::SelfAddressed,
            0x24 => Self::AddressNotFound,
            0x25 => Self::RouteNotFound,
            0x26 => Self::BroadcastSourceFailed,
            0x2C | 0x32 => Self::ResourceError,
            0x74 => Self::PayloadTooLarge,
            other => Self::Other(other),
        }
    }

    /// Returns the code byte.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Success => 0x00,
            Self::MacAckFailure => 0x01,
            Self::CcaFailure => 0x02,
            Self::InvalidDestinationEndpoint => 0x15,
            Self::NetworkAckFailure => 0x21,
            Self::NotJoined => 0x22,
            Self::SelfAddressed => 0x23,
            Self::AddressNotFound => 0x24,
            Self::RouteNotFound => 0x25,
            Self::BroadcastSourceFailed => 0x26,
            Self::ResourceError => 0x2C,
            Self::PayloadTooLarge => 0x74,
            Self::Other(code) => code,
        }
    }

    /// Returns true if the frame was delivered.
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Other(code) => write!(f, "status {code:#04x}"),
            other => write!(f, "{other:?} ({:#04x})", other.code()),
        }
    }
}

/// Status byte of an AT command response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AtStatus {
    /// Command accepted.
    Ok = 0,
    /// Command failed.
    Error = 1,
    /// Unknown command.
    InvalidCommand = 2,
    /// Parameter out of range.
    InvalidParameter = 3,
}

impl AtStatus {
    /// Parses a status byte; unknown values map to `Error`.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Self {
        match byte {
            0 => Self::Ok,
            2 => Self::InvalidCommand,
            3 => Self::InvalidParameter,
            _ => Self::Error,
        }
    }
}
