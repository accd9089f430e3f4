//! Length-prefixed framing for the reliable stream and datagrams.
//!
//! Wire format: `[u16 length (little-endian)][payload]`

use thiserror::Error;

/// Bytes taken by the length prefix.
pub const FRAME_HEADER_LEN: usize = 2;

/// Largest payload a frame can carry.
pub const MAX_FRAME_PAYLOAD: usize = u16::MAX as usize;

/// Framing failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Payload does not fit the length prefix.
    #[error("payload of {0} bytes exceeds the frame limit")]
    TooLarge(usize),
    /// Datagram length prefix disagrees with the datagram size.
    #[error("datagram declares {declared} payload bytes but carries {actual}")]
    LengthMismatch {
        /// Length from the prefix.
        declared: usize,
        /// Bytes actually present.
        actual: usize,
    },
}

/// Prefix `payload` with its length.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    if payload.len() > MAX_FRAME_PAYLOAD {
        return Err(FrameError::TooLarge(payload.len()));
    }
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Unwrap a datagram, which must hold exactly one frame.
pub fn decode_datagram(datagram: &[u8]) -> Result<&[u8], FrameError> {
    if datagram.len() < FRAME_HEADER_LEN {
        return Err(FrameError::LengthMismatch {
            declared: 0,
            actual: datagram.len(),
        });
    }
    let declared = u16::from_le_bytes([datagram[0], datagram[1]]) as usize;
    let payload = &datagram[FRAME_HEADER_LEN..];
    if declared != payload.len() {
        return Err(FrameError::LengthMismatch {
            declared,
            actual: payload.len(),
        });
    }
    Ok(payload)
}

/// Reassembles frames from a byte stream that may split or merge them.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    pending: Vec<u8>,
}

impl FrameDecoder {
    /// Empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the stream.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    /// Next complete frame payload, in stream order.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        if self.pending.len() < FRAME_HEADER_LEN {
            return None;
        }
        let len = u16::from_le_bytes([self.pending[0], self.pending[1]]) as usize;
        if self.pending.len() < FRAME_HEADER_LEN + len {
            return None;
        }
        let payload = self.pending[FRAME_HEADER_LEN..FRAME_HEADER_LEN + len].to_vec();
        self.pending.drain(..FRAME_HEADER_LEN + len);
        Some(payload)
    }

    /// Bytes of an incomplete frame still buffered.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }
}
