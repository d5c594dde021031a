//! Fetch Last Height - one-shot query against a live server.
//!
//! This example demonstrates:
//! - Connecting with the builder pattern
//! - Running two typed queries over one connection
//! - Stopping the client cleanly
//!
//! # Running
//!
//! ```text
//! RUST_LOG=debug cargo run --example fetch_last_height -- tcp://127.0.0.1:9091
//! ```
//!
//! The endpoint may also come from `BLOCKQUERY_ENDPOINT`.

use std::time::Duration;

use blockquery_client::{Client, Endpoint};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let endpoint: Endpoint = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("BLOCKQUERY_ENDPOINT").ok())
        .ok_or("usage: fetch_last_height <tcp://host:port>")?
        .parse()?;

    let client = Client::builder(endpoint)
        .connect_timeout(Duration::from_secs(10))
        .query_expire_time(Some(Duration::from_secs(30)))
        .connect()
        .await?;

    let height = client.last_height().await?;
    tracing::info!("Last height: {}", height);

    let peers = client.total_connections().await?;
    tracing::info!("Total connections: {}", peers);

    client.stop();
    Ok(())
}
