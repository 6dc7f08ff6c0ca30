//! Typed API frames.
//!
//! The first byte of frame data is the frame type and decides the layout of
//! everything after it.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::FrameError;
use crate::protocol::status::{DeliveryStatus, ReceiveOptions, TransmitOptions};
use crate::types::{Address16, Address64};

/// Frame id meaning "do not send a response frame".
pub const NO_RESPONSE_FRAME_ID: u8 = 0;

/// API frame types used by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Local AT command request.
    AtCommand = 0x08,
    /// Transmit request to a 64-bit address.
    TransmitRequest = 0x10,
    /// Local AT command response.
    AtCommandResponse = 0x88,
    /// Modem status notification.
    ModemStatus = 0x8A,
    /// Transmit status for a transmit request.
    TransmitStatus = 0x8B,
    /// Received RF packet.
    ReceivePacket = 0x90,
}

impl FrameType {
    /// Attempts to parse a frame type from a byte.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x08 => Some(Self::AtCommand),
            0x10 => Some(Self::TransmitRequest),
            0x88 => Some(Self::AtCommandResponse),
            0x8A => Some(Self::ModemStatus),
            0x8B => Some(Self::TransmitStatus),
            0x90 => Some(Self::ReceivePacket),
            _ => None,
        }
    }

    /// Returns true for frames produced by the module.
    #[must_use]
    pub const fn is_inbound(&self) -> bool {
        (*self as u8) >= 0x80
    }
}

impl From<FrameType> for u8 {
    fn from(frame_type: FrameType) -> Self {
        frame_type as Self
    }
}

/// A decoded API frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiFrame {
    /// Query or set a local parameter.
    AtCommand {
        frame_id: u8,
        command: [u8; 2],
        parameter: Bytes,
    },
    /// Send RF data.
    TransmitRequest {
        frame_id: u8,
        destination64: Address64,
        destination16: Address16,
        broadcast_radius: u8,
        options: TransmitOptions,
        data: Bytes,
    },
    /// Reply to an AT command.
    AtCommandResponse {
        frame_id: u8,
        command: [u8; 2],
        status: u8,
        data: Bytes,
    },
    /// Module state change (joined, reset, ...).
    ModemStatus { status: u8 },
    /// Outcome of a transmit request.
    TransmitStatus {
        frame_id: u8,
        destination16: Address16,
        retry_count: u8,
        delivery_status: DeliveryStatus,
        discovery_status: u8,
    },
    /// RF data from a remote node.
    ReceivePacket {
        source64: Address64,
        source16: Address16,
        options: ReceiveOptions,
        data: Bytes,
    },
    /// A frame type the gateway does not handle.
    Unknown { frame_type: u8, data: Bytes },
}

fn ensure_len(data: &[u8], need: usize) -> Result<(), FrameError> {
    if data.len() < need {
        return Err(FrameError::TooShort {
            need,
            got: data.len(),
        });
    }
    Ok(())
}

impl ApiFrame {
    /// Parses frame data (without envelope).
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::TooShort`] if the data ends before the fixed
    /// fields of its frame type.
    pub fn parse(data: &[u8]) -> Result<Self, FrameError> {
        ensure_len(data, 1)?;
        let mut cursor = std::io::Cursor::new(data);
        let frame_type = cursor.get_u8();

        let frame = match FrameType::from_byte(frame_type) {
            Some(FrameType::AtCommand) => {
                ensure_len(data, 4)?;
                let frame_id = cursor.get_u8();
                let command = [cursor.get_u8(), cursor.get_u8()];
                Self::AtCommand {
                    frame_id,
                    command,
                    parameter: Bytes::copy_from_slice(cursor.chunk()),
                }
            }
            Some(FrameType::TransmitRequest) => {
                ensure_len(data, 14)?;
                let frame_id = cursor.get_u8();
                let destination64 = Address64::new(cursor.get_u64());
                let destination16 = Address16::new(cursor.get_u16());
                let broadcast_radius = cursor.get_u8();
                let options = TransmitOptions::from_byte(cursor.get_u8());
                Self::TransmitRequest {
                    frame_id,
                    destination64,
                    destination16,
                    broadcast_radius,
                    options,
                    data: Bytes::copy_from_slice(cursor.chunk()),
                }
            }
            Some(FrameType::AtCommandResponse) => {
                ensure_len(data, 5)?;
                let frame_id = cursor.get_u8();
                let command = [cursor.get_u8(), cursor.get_u8()];
                let status = cursor.get_u8();
                Self::AtCommandResponse {
                    frame_id,
                    command,
                    status,
                    data: Bytes::copy_from_slice(cursor.chunk()),
                }
            }
            Some(FrameType::ModemStatus) => {
                ensure_len(data, 2)?;
                Self::ModemStatus {
                    status: cursor.get_u8(),
                }
            }
            Some(FrameType::TransmitStatus) => {
                ensure_len(data, 7)?;
                Self::TransmitStatus {
                    frame_id: cursor.get_u8(),
                    destination16: Address16::new(cursor.get_u16()),
                    retry_count: cursor.get_u8(),
                    delivery_status: DeliveryStatus::from_byte(cursor.get_u8()),
                    discovery_status: cursor.get_u8(),
                }
            }
            Some(FrameType::ReceivePacket) => {
                ensure_len(data, 12)?;
                let source64 = Address64::new(cursor.get_u64());
                let source16 = Address16::new(cursor.get_u16());
                let options = ReceiveOptions::from_byte(cursor.get_u8());
                Self::ReceivePacket {
                    source64,
                    source16,
                    options,
                    data: Bytes::copy_from_slice(cursor.chunk()),
                }
            }
            None => Self::Unknown {
                frame_type,
                data: Bytes::copy_from_slice(cursor.chunk()),
            },
        };

        Ok(frame)
    }

    /// Encodes the frame data (without envelope).
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Self::AtCommand {
                frame_id,
                command,
                parameter,
            } => {
                buf.put_u8(FrameType::AtCommand.into());
                buf.put_u8(*frame_id);
                buf.put_slice(command);
                buf.put_slice(parameter);
            }
            Self::TransmitRequest {
                frame_id,
                destination64,
                destination16,
                broadcast_radius,
                options,
                data,
            } => {
                buf.put_u8(FrameType::TransmitRequest.into());
                buf.put_u8(*frame_id);
                buf.put_slice(&destination64.to_bytes());
                buf.put_slice(&destination16.to_bytes());
                buf.put_u8(*broadcast_radius);
                buf.put_u8(options.as_byte());
                buf.put_slice(data);
            }
            Self::AtCommandResponse {
                frame_id,
                command,
                status,
                data,
            } => {
                buf.put_u8(FrameType::AtCommandResponse.into());
                buf.put_u8(*frame_id);
                buf.put_slice(command);
                buf.put_u8(*status);
                buf.put_slice(data);
            }
            Self::ModemStatus { status } => {
                buf.put_u8(FrameType::ModemStatus.into());
                buf.put_u8(*status);
            }
            Self::TransmitStatus {
                frame_id,
                destination16,
                retry_count,
                delivery_status,
                discovery_status,
            } => {
                buf.put_u8(FrameType::TransmitStatus.into());
                buf.put_u8(*frame_id);
                buf.put_slice(&destination16.to_bytes());
                buf.put_u8(*retry_count);
                buf.put_u8(delivery_status.code());
                buf.put_u8(*discovery_status);
            }
            Self::ReceivePacket {
                source64,
                source16,
                options,
                data,
            } => {
                buf.put_u8(FrameType::ReceivePacket.into());
                buf.put_slice(&source64.to_bytes());
                buf.put_slice(&source16.to_bytes());
                buf.put_u8(options.as_byte());
                buf.put_slice(data);
            }
            Self::Unknown { frame_type, data } => {
                buf.put_u8(*frame_type);
                buf.put_slice(data);
            }
        }
        buf.freeze()
    }

    /// Returns the frame id for frames that carry one.
    #[must_use]
    pub const fn frame_id(&self) -> Option<u8> {
        match self {
            Self::AtCommand { frame_id, .. }
            | Self::TransmitRequest { frame_id, .. }
            | Self::AtCommandResponse { frame_id, .. }
            | Self::TransmitStatus { frame_id, .. } => Some(*frame_id),
            Self::ModemStatus { .. } | Self::ReceivePacket { .. } | Self::Unknown { .. } => None,
        }
    }
}
