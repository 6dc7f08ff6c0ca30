//! Protocol definitions for XBee API-mode communication.
//!
//! This module contains the low-level protocol types including:
//! - Frame envelope encoding/decoding
//! - Typed API frames
//! - Transmit/receive option bits and status codes

pub mod api;
pub mod frame;
pub mod status;

pub use api::{ApiFrame, FrameType, NO_RESPONSE_FRAME_ID};
pub use frame::{FrameDecoder, MAX_FRAME_SIZE, START_DELIMITER, encode as encode_frame};
pub use status::{AtStatus, DeliveryStatus, ReceiveOptions, TransmitOptions};
