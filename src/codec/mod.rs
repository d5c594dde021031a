//! Codec module - payload encoding for the typed queries.
//!
//! Frame payloads are opaque to the transport and the client core. The
//! typed queries in [`crate::Client`] fill and read them with Bitcoin
//! consensus encoding (little-endian integers, raw 32-byte hashes, 80-byte
//! headers) via [`ConsensusCodec`].

mod consensus;

pub use consensus::ConsensusCodec;
