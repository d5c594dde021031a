//! Transport: one persistent TCP stream, optionally through a SOCKS5 proxy.
//!
//! The transport only moves frames. It never interprets payloads and never
//! reconnects on its own.

mod connection;
mod socks;

pub use connection::{Connection, ConnectionHandle, ConnectionState, TransportEvent};
pub use crate::writer::OutboundFrame;
