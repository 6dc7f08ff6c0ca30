//! API frame envelope encoding and decoding.
//!
//! The module runs in API mode 1 (no byte escaping):
//! ```text
//! ┌──────────┬──────────────┬─────────────────┬──────────┐
//! │  0x7E    │  length (BE) │   frame data    │ checksum │
//! │  1 byte  │   2 bytes    │  length bytes   │  1 byte  │
//! └──────────┴──────────────┴─────────────────┴──────────┘
//! ```
//! The checksum is `0xFF` minus the low byte of the sum of the frame data.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::FrameError;

/// Start delimiter byte.
pub const START_DELIMITER: u8 = 0x7E;

/// Maximum frame data length accepted in either direction.
pub const MAX_FRAME_SIZE: usize = 512;

/// Delimiter plus the 2-byte length.
const HEADER_SIZE: usize = 3;

/// Computes the checksum over frame data.
#[must_use]
pub fn checksum(data: &[u8]) -> u8 {
    let sum = data.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    0xFF - sum
}

/// Wraps frame data in the API envelope.
///
/// # Errors
///
/// Returns [`FrameError::TooLarge`] if the data exceeds [`MAX_FRAME_SIZE`].
pub fn encode(data: &[u8]) -> Result<Bytes, FrameError> {
    if data.len() > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge {
            size: data.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    let mut buf = BytesMut::with_capacity(HEADER_SIZE + data.len() + 1);
    buf.put_u8(START_DELIMITER);
    buf.put_u16(data.len() as u16);
    buf.put_slice(data);
    buf.put_u8(checksum(data));
    Ok(buf.freeze())
}

/// Frame decoder that handles partial data and line noise.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    /// Creates a new frame decoder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
        }
    }

    /// Feeds data into the decoder.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to decode the next complete frame.
    ///
    /// Returns `Ok(Some(frame_data))` when a frame is complete and its
    /// checksum verifies, `Ok(None)` if more data is needed. Bytes before a
    /// start delimiter are discarded. On a bad length or checksum the
    /// delimiter is dropped so the next call resynchronises on the
    /// following one.
    ///
    /// # Errors
    ///
    /// Returns a `FrameError` for an invalid length or checksum.
    pub fn decode(&mut self) -> Result<Option<Bytes>, FrameError> {
        match self.buffer.iter().position(|&b| b == START_DELIMITER) {
            Some(0) => {}
            Some(skip) => {
                tracing::trace!("discarding {} bytes before start delimiter", skip);
                self.buffer.advance(skip);
            }
            None => {
                self.buffer.clear();
                return Ok(None);
            }
        }

        if self.buffer.len() < HEADER_SIZE {
            return Ok(None);
        }

        let length = u16::from_be_bytes([self.buffer[1], self.buffer[2]]) as usize;
        if length == 0 || length > MAX_FRAME_SIZE {
            self.buffer.advance(1);
            return Err(FrameError::InvalidLength(length));
        }

        let total = HEADER_SIZE + length + 1;
        if self.buffer.len() < total {
            return Ok(None);
        }

        let data = &self.buffer[HEADER_SIZE..HEADER_SIZE + length];
        let expected = checksum(data);
        let got = self.buffer[total - 1];
        if expected != got {
            self.buffer.advance(1);
            return Err(FrameError::Checksum { expected, got });
        }

        self.buffer.advance(HEADER_SIZE);
        let frame = self.buffer.split_to(length).freeze();
        self.buffer.advance(1);
        Ok(Some(frame))
    }

    /// Returns the number of bytes currently buffered.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}
