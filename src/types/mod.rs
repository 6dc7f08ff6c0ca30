//! Data types for gateway entities.
//!
//! This module contains the core data structures used throughout the library:
//! - Radio addresses and endpoints
//! - Live messages and delivery outcomes
//! - Transmission log records
//! - Sensor readings decoded from payloads

pub mod address;
pub mod message;
pub mod readings;
pub mod record;

pub use crate::protocol::{DeliveryStatus, TransmitOptions};
pub use address::{Address16, Address64, RemoteEndpoint};
pub use message::{DeliveryOutcome, LocalDevice, RemoteMessage, current_timestamp};
pub use readings::{Environment, Orientation, Readings};
pub use record::TransmissionRecord;
