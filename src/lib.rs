//! # blockquery-client
//!
//! Async client for remote Bitcoin full-node query servers.
//!
//! Many requests share one persistent TCP connection (optionally through a
//! SOCKS5 proxy). Each request carries a correlation id; replies are matched
//! back to their caller in whatever order the server sends them.
//!
//! ## Architecture
//!
//! - **Transport**: one stream, a reader task that cuts frames, a writer
//!   task with bounded backpressure
//! - **Client core**: pending-request table, timeout sweep, disconnect
//!   handling
//! - **Queries**: typed wrappers that encode arguments and decode replies
//!   with Bitcoin consensus encoding
//!
//! ## Example
//!
//! ```no_run
//! use blockquery_client::{Client, ClientSettings};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), blockquery_client::QueryError> {
//!     let settings = ClientSettings::new("tcp://127.0.0.1:9091".parse()?);
//!     let client = Client::connect(settings).await?;
//!
//!     println!("height {}", client.last_height().await?);
//!     println!("peers {}", client.total_connections().await?);
//!
//!     client.stop();
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod pending;
pub mod protocol;
pub mod transport;

mod api;
mod backpressure;
mod client;
mod writer;

pub use client::{Client, ClientBuilder, PendingResponse};
pub use config::{ClientSettings, Endpoint, Socks5Config, TransportConfig};
pub use error::{DecodeError, ErrorKind, QueryError, Result};
pub use pending::Completion;
pub use transport::ConnectionState;
