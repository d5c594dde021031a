//! Protocol module - wire format, framing, and frame types.
//!
//! This module implements the binary frame protocol:
//! - 10-byte header encoding/decoding
//! - Frame codec (`encode`/`decode`)
//! - Frame buffer for accumulating partial reads

mod frame;
mod frame_buffer;
mod wire_format;

pub use frame::{decode, decode_with_max, encode, Frame};
pub use frame_buffer::FrameBuffer;
pub use wire_format::{
    Command, CorrelationId, Header, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE, RESERVED_COMMAND_TAG,
};
