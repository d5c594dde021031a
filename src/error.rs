//! Error types for blockquery-client.

use thiserror::Error;

use crate::protocol::{Command, CorrelationId};

/// Main error type for all client operations.
#[derive(Debug, Error)]
pub enum QueryError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error while loading settings.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The endpoint URI could not be parsed.
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Dialing the server failed.
    #[error("Failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    /// SOCKS5 negotiation failed.
    #[error("Proxy error: {0}")]
    Proxy(String),

    /// The transport's writer is gone.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Backpressure timeout - write queue full.
    #[error("Backpressure timeout")]
    BackpressureTimeout,

    /// Stream-level protocol violation (e.g. oversized frame).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A single frame could not be decoded.
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// An outbound payload is larger than the frame may carry.
    #[error("Payload of {length} bytes exceeds maximum {max}")]
    PayloadTooLarge { length: usize, max: u32 },

    /// A reply arrived for a correlation id that is not pending.
    #[error("No pending request for correlation id {0}")]
    NotFound(CorrelationId),

    /// A correlation id was registered twice.
    #[error("Correlation id {0} is already pending")]
    DuplicateId(CorrelationId),

    /// Submit was attempted without a live connection.
    #[error("Not connected")]
    NotConnected,

    /// The client has been stopped.
    #[error("Client has been stopped")]
    Shutdown,

    /// The request was resolved without a reply.
    #[error("Request failed: {0}")]
    Request(#[from] ErrorKind),

    /// The reply payload did not decode to the expected type.
    #[error("Malformed {command} response: {reason}")]
    MalformedResponse { command: Command, reason: String },
}

/// Why a pending request resolved without a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ErrorKind {
    /// The deadline passed before a reply arrived.
    #[error("timed out")]
    Timeout,
    /// The transport dropped while the request was pending.
    #[error("connection lost")]
    ConnectionLost,
    /// The caller withdrew interest, or the client shut down.
    #[error("cancelled")]
    Cancelled,
}

/// Failure to decode one wire frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("truncated frame: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("unknown command tag {0:#06x}")]
    UnknownCommand(u16),

    #[error("payload length {length} exceeds maximum {max}")]
    PayloadTooLarge { length: u32, max: u32 },

    #[error("length prefix says {declared} payload bytes, frame carries {actual}")]
    LengthMismatch { declared: u32, actual: usize },
}

/// Result type alias using QueryError.
pub type Result<T> = std::result::Result<T, QueryError>;
