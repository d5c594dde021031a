//! Bitcoin consensus encoding for query payloads.
//!
//! # Example
//!
//! ```
//! use blockquery_client::codec::ConsensusCodec;
//! use blockquery_client::protocol::Command;
//!
//! let payload = ConsensusCodec::encode(&700_000u32);
//! assert_eq!(&payload[..], &[0x60, 0xae, 0x0a, 0x00]);
//!
//! let height: u32 = ConsensusCodec::decode_reply(Command::LastHeight, &payload).unwrap();
//! assert_eq!(height, 700_000);
//! ```

use bitcoin::consensus::encode::{deserialize, serialize};
use bitcoin::consensus::{Decodable, Encodable};
use bytes::Bytes;

use crate::error::{QueryError, Result};
use crate::protocol::Command;

/// Consensus codec for request and reply payloads.
pub struct ConsensusCodec;

impl ConsensusCodec {
    /// Encode a request payload.
    #[inline]
    pub fn encode<T: Encodable + ?Sized>(value: &T) -> Bytes {
        Bytes::from(serialize(value))
    }

    /// Decode a reply payload for `command`.
    ///
    /// The payload must be consumed exactly; short or trailing bytes are a
    /// [`QueryError::MalformedResponse`].
    pub fn decode_reply<T: Decodable>(command: Command, payload: &[u8]) -> Result<T> {
        deserialize(payload).map_err(|e| QueryError::MalformedResponse {
            command,
            reason: format!("{e} ({} bytes)", payload.len()),
        })
    }
}
