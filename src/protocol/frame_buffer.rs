//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management.
//! Implements a state machine for handling fragmented frames:
//! - `WaitingForHeader`: Need at least 10 bytes
//! - `WaitingForPayload`: Length known, need the rest of the frame
//!
//! The buffer only delimits frames by their length prefix; it hands out each
//! whole frame (header included) as raw bytes and leaves command validation
//! to [`decode`](super::decode). A frame with an unknown command is therefore
//! still skipped cleanly, while an oversized length prefix is unrecoverable
//! because the stream can no longer be resynchronised.
//!
//! # Example
//!
//! ```
//! use blockquery_client::protocol::{encode, Command, CorrelationId, FrameBuffer};
//!
//! let mut buffer = FrameBuffer::new();
//! let wire = encode(Command::LastHeight, CorrelationId(1), b"").unwrap();
//!
//! assert!(buffer.push(&wire[..4]).unwrap().is_empty());
//! let frames = buffer.push(&wire[4..]).unwrap();
//! assert_eq!(frames.len(), 1);
//! ```

use bytes::{Bytes, BytesMut};

use super::wire_format::{DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE, LENGTH_OFFSET};
use crate::error::{QueryError, Result};

/// State machine for frame parsing.
#[derive(Debug, Clone, Copy)]
enum State {
    /// Waiting for complete header (need 10 bytes).
    WaitingForHeader,
    /// Header seen, waiting for the frame to complete.
    WaitingForPayload { frame_len: usize },
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
pub struct FrameBuffer {
    /// Accumulated bytes from socket reads.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
    /// Maximum allowed payload size.
    max_payload_size: u32,
}

impl FrameBuffer {
    /// Create a new frame buffer with default settings.
    ///
    /// Default capacity: 64KB, max payload: 32MB.
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD_SIZE)
    }

    /// Create a new frame buffer with custom max payload size.
    pub fn with_max_payload(max_payload_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: State::WaitingForHeader,
            max_payload_size,
        }
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// Returns the raw bytes of each complete frame. Partial data is
    /// buffered internally for the next push.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::Protocol`] if a length prefix exceeds
    /// `max_payload_size`.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Bytes>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract_one()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    fn try_extract_one(&mut self) -> Result<Option<Bytes>> {
        loop {
            match self.state {
                State::WaitingForHeader => {
                    if self.buffer.len() < HEADER_SIZE {
                        return Ok(None);
                    }

                    let mut len = [0u8; 4];
                    len.copy_from_slice(&self.buffer[LENGTH_OFFSET..LENGTH_OFFSET + 4]);
                    let payload_length = u32::from_be_bytes(len);

                    if payload_length > self.max_payload_size {
                        return Err(QueryError::Protocol(format!(
                            "Payload size {} exceeds maximum {}",
                            payload_length, self.max_payload_size
                        )));
                    }

                    self.state = State::WaitingForPayload {
                        frame_len: HEADER_SIZE + payload_length as usize,
                    };
                }

                State::WaitingForPayload { frame_len } => {
                    if self.buffer.len() < frame_len {
                        return Ok(None);
                    }

                    self.state = State::WaitingForHeader;
                    return Ok(Some(self.buffer.split_to(frame_len).freeze()));
                }
            }
        }
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Clear the buffer and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::WaitingForHeader;
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match &self.state {
            State::WaitingForHeader => "WaitingForHeader",
            State::WaitingForPayload { .. } => "WaitingForPayload",
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
