//! Frame struct and the frame codec.
//!
//! A frame is one complete message: command, correlation id and payload.
//! Uses `bytes::Bytes` for zero-copy payload sharing.
//!
//! # Example
//!
//! ```
//! use blockquery_client::protocol::{decode, encode, Command, CorrelationId};
//!
//! let wire = encode(Command::LastHeight, CorrelationId(7), b"").unwrap();
//! let frame = decode(&wire).unwrap();
//!
//! assert_eq!(frame.command, Command::LastHeight);
//! assert_eq!(frame.correlation_id, CorrelationId(7));
//! assert!(frame.payload.is_empty());
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use super::wire_format::{Command, CorrelationId, Header, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE};
use crate::error::{DecodeError, QueryError};

/// A complete protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub correlation_id: CorrelationId,
    /// Payload bytes (zero-copy via `bytes::Bytes`).
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame.
    pub fn new(command: Command, correlation_id: CorrelationId, payload: Bytes) -> Self {
        Self {
            command,
            correlation_id,
            payload,
        }
    }

    /// Header describing this frame.
    #[inline]
    pub fn header(&self) -> Result<Header, QueryError> {
        Header::for_payload(self.command, self.correlation_id, self.payload.len())
    }

    /// Encode into a contiguous wire buffer.
    pub fn encode(&self) -> Result<Bytes, QueryError> {
        encode(self.command, self.correlation_id, &self.payload)
    }
}

/// Encode a frame into a single contiguous buffer.
///
/// Fails with [`QueryError::PayloadTooLarge`] if the payload does not fit the
/// `u32` length field.
pub fn encode(
    command: Command,
    correlation_id: CorrelationId,
    payload: &[u8],
) -> Result<Bytes, QueryError> {
    let header = Header::for_payload(command, correlation_id, payload.len())?;
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    buf.put_slice(&header.encode());
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Decode exactly one frame from `buf`.
///
/// `buf` must hold one whole frame and nothing else. Uses the default
/// maximum payload size.
pub fn decode(buf: &Bytes) -> Result<Frame, DecodeError> {
    decode_with_max(buf, DEFAULT_MAX_PAYLOAD_SIZE)
}

/// Decode exactly one frame, rejecting payloads above `max_payload_size`.
pub fn decode_with_max(buf: &Bytes, max_payload_size: u32) -> Result<Frame, DecodeError> {
    let header = Header::decode(buf).ok_or(DecodeError::Truncated {
        needed: HEADER_SIZE,
        available: buf.len(),
    })?;
    let command = header.validate(max_payload_size)?;

    let declared = header.payload_length;
    let needed = HEADER_SIZE + declared as usize;
    if buf.len() < needed {
        return Err(DecodeError::Truncated {
            needed,
            available: buf.len(),
        });
    }
    if buf.len() > needed {
        return Err(DecodeError::LengthMismatch {
            declared,
            actual: buf.len() - HEADER_SIZE,
        });
    }

    Ok(Frame {
        command,
        correlation_id: header.correlation_id(),
        payload: buf.slice(HEADER_SIZE..),
    })
}
