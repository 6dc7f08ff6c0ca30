//! Radio addresses and endpoint identity.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// A permanent 64-bit hardware address (the module's serial number).
///
/// Canonical text form is 16 uppercase hex digits without separators.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address64(u64);

impl Address64 {
    /// Coordinator address.
    pub const COORDINATOR: Self = Self(0);

    /// Broadcast address reaching every node in the network.
    pub const BROADCAST: Self = Self(0xFFFF);

    /// Address reported when the sender's 64-bit address is unknown.
    pub const UNKNOWN: Self = Self(0xFFFF_FFFF_FFFF_FFFF);

    /// Creates an address from its numeric value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the numeric value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Returns the big-endian byte form used on the wire.
    #[must_use]
    pub const fn to_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    /// Creates an address from its big-endian wire form.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_be_bytes(bytes))
    }

    /// Parses an address from exactly 16 hex digits (either case).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] for any other input.
    pub fn from_hex(s: &str) -> Result<Self> {
        let mut bytes = [0u8; 8];
        decode_hex(s, &mut bytes)?;
        Ok(Self::from_bytes(bytes))
    }

    /// Returns the canonical uppercase hex form.
    #[must_use]
    pub fn to_hex(self) -> String {
        hex::encode_upper(self.to_bytes())
    }

    /// Returns true for the broadcast address.
    #[must_use]
    pub const fn is_broadcast(self) -> bool {
        self.0 == Self::BROADCAST.0
    }
}

/// A 16-bit network address assigned by the mesh on association.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address16(u16);

impl Address16 {
    /// Placeholder used when the destination's network address is unknown.
    pub const UNKNOWN: Self = Self(0xFFFE);

    /// Creates an address from its numeric value.
    #[must_use]
    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    /// Returns the numeric value.
    #[must_use]
    pub const fn value(self) -> u16 {
        self.0
    }

    /// Returns the big-endian byte form used on the wire.
    #[must_use]
    pub const fn to_bytes(self) -> [u8; 2] {
        self.0.to_be_bytes()
    }

    /// Creates an address from its big-endian wire form.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 2]) -> Self {
        Self(u16::from_be_bytes(bytes))
    }

    /// Parses an address from exactly 4 hex digits (either case).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] for any other input.
    pub fn from_hex(s: &str) -> Result<Self> {
        let mut bytes = [0u8; 2];
        decode_hex(s, &mut bytes)?;
        Ok(Self::from_bytes(bytes))
    }

    /// Returns the canonical uppercase hex form.
    #[must_use]
    pub fn to_hex(self) -> String {
        hex::encode_upper(self.to_bytes())
    }
}

impl Default for Address16 {
    fn default() -> Self {
        Self::UNKNOWN
    }
}

fn decode_hex(s: &str, out: &mut [u8]) -> Result<()> {
    let expected = out.len() * 2;
    if s.len() != expected {
        return Err(Error::InvalidAddress {
            address: s.to_owned(),
            reason: format!("expected {expected} hex digits, got {}", s.len()),
        });
    }
    hex::decode_to_slice(s, out).map_err(|e| Error::InvalidAddress {
        address: s.to_owned(),
        reason: e.to_string(),
    })
}

impl fmt::Display for Address64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016X}", self.0)
    }
}

impl fmt::Debug for Address64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address64({self})")
    }
}

impl fmt::Display for Address16 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}", self.0)
    }
}

impl fmt::Debug for Address16 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address16({self})")
    }
}

impl FromStr for Address64 {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl FromStr for Address16 {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

/// Addressing identity of a mesh peer.
///
/// The 16-bit address is a snapshot: the mesh may hand the same hardware a
/// different network address after it re-associates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RemoteEndpoint {
    /// Permanent hardware address.
    pub address64: Address64,
    /// Mesh-assigned network address.
    pub address16: Address16,
}

impl RemoteEndpoint {
    /// Creates an endpoint from both addresses.
    #[must_use]
    pub const fn new(address64: Address64, address16: Address16) -> Self {
        Self {
            address64,
            address16,
        }
    }
}

impl fmt::Display for RemoteEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address64, self.address16)
    }
}
