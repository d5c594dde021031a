//! Wire format encoding and decoding.
//!
//! Implements the 10-byte header format:
//! ```text
//! ┌──────────┬────────────┬──────────┐
//! │ Command  │ Correl. ID │ Length   │
//! │ 2 bytes  │ 4 bytes    │ 4 bytes  │
//! │ uint16 BE│ uint32 BE  │ uint32 BE│
//! └──────────┴────────────┴──────────┘
//! ```
//!
//! All multi-byte integers are Big Endian. The header is followed by exactly
//! `length` payload bytes, with no padding.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{DecodeError, QueryError};

/// Header size in bytes (fixed, exactly 10).
pub const HEADER_SIZE: usize = 10;

/// Default maximum payload size (32 MB, enough for any block).
pub const DEFAULT_MAX_PAYLOAD_SIZE: u32 = 32 * 1024 * 1024;

/// Reserved command tag (never sent).
pub const RESERVED_COMMAND_TAG: u16 = 0;

/// Offset of the payload length field inside the header.
pub(crate) const LENGTH_OFFSET: usize = 6;

/// Query commands understood by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum Command {
    LastHeight = 1,
    TotalConnections = 2,
    BlockHeader = 3,
    BlockHeight = 4,
    Transaction = 5,
}

impl Command {
    /// All known commands, in tag order.
    pub const ALL: [Command; 5] = [
        Command::LastHeight,
        Command::TotalConnections,
        Command::BlockHeader,
        Command::BlockHeight,
        Command::Transaction,
    ];

    /// Fixed-width wire tag.
    #[inline]
    pub fn tag(self) -> u16 {
        self as u16
    }

    /// Look up a command by its wire tag.
    pub fn from_tag(tag: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.tag() == tag)
    }

    /// Canonical command name.
    pub fn name(self) -> &'static str {
        match self {
            Command::LastHeight => "blockchain.fetch_last_height",
            Command::TotalConnections => "protocol.total_connections",
            Command::BlockHeader => "blockchain.fetch_block_header",
            Command::BlockHeight => "blockchain.fetch_block_height",
            Command::Transaction => "blockchain.fetch_transaction",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<u16> for Command {
    type Error = DecodeError;

    fn try_from(tag: u16) -> Result<Self, Self::Error> {
        Self::from_tag(tag).ok_or(DecodeError::UnknownCommand(tag))
    }
}

impl FromStr for Command {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.name() == s)
            .ok_or_else(|| format!("unknown command name: {s}"))
    }
}

/// Identifier matching a reply to the request that caused it.
///
/// Unique among the requests in flight on one client. `0` is never allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(pub u32);

impl CorrelationId {
    /// Raw wire value.
    #[inline]
    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for CorrelationId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

/// Decoded header from wire format.
///
/// The command is kept as the raw tag so that frames with unknown commands
/// can still be delimited and skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Command tag.
    pub command_tag: u16,
    /// Correlation identifier.
    pub correlation_id: u32,
    /// Payload length in bytes.
    pub payload_length: u32,
}

impl Header {
    /// Create a new header.
    pub fn new(command: Command, correlation_id: CorrelationId, payload_length: u32) -> Self {
        Self {
            command_tag: command.tag(),
            correlation_id: correlation_id.get(),
            payload_length,
        }
    }

    /// Header for a payload of `payload_len` bytes.
    ///
    /// Fails if the length does not fit the `u32` length field.
    pub fn for_payload(
        command: Command,
        correlation_id: CorrelationId,
        payload_len: usize,
    ) -> Result<Self, QueryError> {
        let payload_length =
            u32::try_from(payload_len).map_err(|_| QueryError::PayloadTooLarge {
                length: payload_len,
                max: u32::MAX,
            })?;
        Ok(Self::new(command, correlation_id, payload_length))
    }

    /// Encode header to bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use blockquery_client::protocol::{Command, CorrelationId, Header};
    ///
    /// let header = Header::new(Command::LastHeight, CorrelationId(42), 4);
    /// let bytes = header.encode();
    /// assert_eq!(bytes.len(), 10);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode header into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than `HEADER_SIZE` (10 bytes).
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        buf[0..2].copy_from_slice(&self.command_tag.to_be_bytes());
        buf[2..6].copy_from_slice(&self.correlation_id.to_be_bytes());
        buf[6..10].copy_from_slice(&self.payload_length.to_be_bytes());
    }

    /// Decode header from bytes (Big Endian).
    ///
    /// Returns `None` if buffer is too short.
    ///
    /// # Example
    ///
    /// ```
    /// use blockquery_client::protocol::Header;
    ///
    /// let bytes = [0, 1, 0, 0, 0, 42, 0, 0, 0, 4];
    /// let header = Header::decode(&bytes).unwrap();
    /// assert_eq!(header.command_tag, 1);
    /// assert_eq!(header.correlation_id, 42);
    /// assert_eq!(header.payload_length, 4);
    /// ```
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            command_tag: u16::from_be_bytes([buf[0], buf[1]]),
            correlation_id: u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]),
            payload_length: u32::from_be_bytes([buf[6], buf[7], buf[8], buf[9]]),
        })
    }

    /// Resolve the command tag.
    pub fn command(&self) -> Result<Command, DecodeError> {
        Command::try_from(self.command_tag)
    }

    /// Correlation id as a typed value.
    #[inline]
    pub fn correlation_id(&self) -> CorrelationId {
        CorrelationId(self.correlation_id)
    }

    /// Validate the header for protocol compliance.
    ///
    /// Checks:
    /// - Command tag is known
    /// - Payload length doesn't exceed max
    pub fn validate(&self, max_payload_size: u32) -> Result<Command, DecodeError> {
        let command = self.command()?;
        if self.payload_length > max_payload_size {
            return Err(DecodeError::PayloadTooLarge {
                length: self.payload_length,
                max: max_payload_size,
            });
        }
        Ok(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encode_decode_roundtrip() {
        let original = Header::new(Command::BlockHeader, CorrelationId(42), 100);
        let encoded = original.encode();
        let decoded = Header::decode(&encoded).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_header_big_endian_byte_order() {
        let header = Header {
            command_tag: 0x0102,
            correlation_id: 0x03040506,
            payload_length: 0x0708090A,
        };
        let bytes = header.encode();

        assert_eq!(
            bytes,
            [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A]
        );
    }

    #[test]
    fn test_header_size_is_exactly_10() {
        assert_eq!(HEADER_SIZE, 10);
        let header = Header::new(Command::LastHeight, CorrelationId(1), 0);
        assert_eq!(header.encode().len(), 10);
    }

    #[test]
    fn test_decode_too_short_buffer() {
        let buf = [0u8; 9];
        assert!(Header::decode(&buf).is_none());
    }

    #[test]
    fn test_validate_unknown_command_rejected() {
        let header = Header {
            command_tag: 0x7777,
            correlation_id: 1,
            payload_length: 0,
        };
        assert_eq!(
            header.validate(DEFAULT_MAX_PAYLOAD_SIZE),
            Err(DecodeError::UnknownCommand(0x7777))
        );
    }

    #[test]
    fn test_validate_reserved_tag_rejected() {
        let header = Header {
            command_tag: RESERVED_COMMAND_TAG,
            correlation_id: 1,
            payload_length: 0,
        };
        assert!(header.validate(DEFAULT_MAX_PAYLOAD_SIZE).is_err());
    }

    #[test]
    fn test_validate_payload_too_large() {
        let header = Header::new(Command::Transaction, CorrelationId(1), 1_000);
        assert_eq!(
            header.validate(100),
            Err(DecodeError::PayloadTooLarge {
                length: 1_000,
                max: 100
            })
        );
    }

    #[test]
    fn test_for_payload_checks_length_field() {
        let header = Header::for_payload(Command::Transaction, CorrelationId(1), 4).unwrap();
        assert_eq!(header.payload_length, 4);

        let max = Header::for_payload(Command::Transaction, CorrelationId(1), u32::MAX as usize);
        assert_eq!(max.unwrap().payload_length, u32::MAX);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_for_payload_rejects_length_over_u32() {
        let length = u32::MAX as usize + 1;
        let result = Header::for_payload(Command::Transaction, CorrelationId(1), length);
        assert!(matches!(
            result,
            Err(QueryError::PayloadTooLarge { length: l, max: u32::MAX }) if l == length
        ));
    }

    #[test]
    fn test_command_tags_and_names_are_unique() {
        for (i, a) in Command::ALL.iter().enumerate() {
            assert_eq!(Command::from_tag(a.tag()), Some(*a));
            assert_eq!(a.name().parse::<Command>(), Ok(*a));
            for b in &Command::ALL[i + 1..] {
                assert_ne!(a.tag(), b.tag());
                assert_ne!(a.name(), b.name());
            }
        }
        assert_eq!(Command::from_tag(RESERVED_COMMAND_TAG), None);
    }

    #[test]
    fn test_command_display_uses_name() {
        assert_eq!(
            Command::LastHeight.to_string(),
            "blockchain.fetch_last_height"
        );
        assert_eq!(
            Command::TotalConnections.to_string(),
            "protocol.total_connections"
        );
    }
}
