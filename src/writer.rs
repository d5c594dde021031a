//! Dedicated writer task for outbound frames.
//!
//! Every sender hands frames to one writer task over an mpsc channel, so at
//! most one write is ever in flight on the socket and concurrent submits
//! never interleave bytes. The task batches whatever is queued into a single
//! vectored write.
//!
//! ```text
//! submit 1 ─┐
//! submit 2 ─┼─► mpsc::Sender<OutboundFrame> ─► Writer Task ─► socket
//! submit N ─┘
//! ```
//!
//! Queue depth is bounded by a [`BackpressureController`]: a sender that
//! finds the queue full is suspended until the writer drains a batch, and
//! fails with `BackpressureTimeout` if that takes too long. Frames are never
//! dropped silently.

use std::io::IoSlice;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::backpressure::BackpressureController;
use crate::config::TransportConfig;
use crate::error::{QueryError, Result};
use crate::protocol::{Command, CorrelationId, Header, HEADER_SIZE};

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// A frame ready to be written to the socket.
#[derive(Debug)]
pub struct OutboundFrame {
    /// Pre-encoded header.
    pub header: [u8; HEADER_SIZE],
    /// Payload bytes (may be empty).
    pub payload: Bytes,
}

impl OutboundFrame {
    /// Create a new outbound frame.
    ///
    /// Fails if the payload does not fit the header's length field.
    #[inline]
    pub fn new(command: Command, correlation_id: CorrelationId, payload: Bytes) -> Result<Self> {
        let header = Header::for_payload(command, correlation_id, payload.len())?;
        Ok(Self {
            header: header.encode(),
            payload,
        })
    }

    /// Total size of this frame (header + payload).
    #[inline]
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// Handle for sending frames to the writer task.
///
/// This is cheaply cloneable and can be shared across tasks.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundFrame>,
    backpressure: BackpressureController,
}

impl WriterHandle {
    /// Send a frame to the writer task.
    ///
    /// Waits while backpressure is active, timing out after the configured
    /// duration. Dropping the future before it completes queues nothing and
    /// holds no slot.
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        let permit = self
            .tx
            .reserve()
            .await
            .map_err(|_| QueryError::ConnectionClosed)?;
        self.backpressure.reserve().await?;
        // No await between claiming the slot and handing the frame over.
        permit.send(frame);
        Ok(())
    }

    /// Check if backpressure is currently active.
    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.backpressure.is_active()
    }

    /// Get current queued frame count.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.backpressure.pending_count()
    }
}

/// Spawn the writer task and return a handle for sending frames.
///
/// The task ends with `Ok(())` once every handle is dropped, after shutting
/// down the write half, or with the first I/O error.
pub fn spawn_writer_task<W>(
    writer: W,
    config: &TransportConfig,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let backpressure =
        BackpressureController::with_timeout(config.max_pending_frames, config.backpressure_timeout);

    let handle = WriterHandle {
        tx,
        backpressure: backpressure.clone(),
    };
    let task = tokio::spawn(writer_loop(rx, writer, backpressure));

    (handle, task)
}

async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundFrame>,
    mut writer: W,
    backpressure: BackpressureController,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);

    while let Some(first) = rx.recv().await {
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        let result = write_batch(&mut writer, &batch).await;
        backpressure.release_many(batch.len());
        batch.clear();
        result?;
    }

    tracing::debug!("Writer channel closed, shutting down write half");
    writer.shutdown().await?;
    Ok(())
}

/// Write a batch of frames using scatter/gather I/O (write_vectored).
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total_size: usize = batch.iter().map(OutboundFrame::size).sum();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = remaining_slices(batch, total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(QueryError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build the IoSlice list for whatever is left after `skip_bytes`.
fn remaining_slices(batch: &[OutboundFrame], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len() * 2);
    let mut offset = 0;

    for frame in batch {
        for part in [&frame.header[..], &frame.payload[..]] {
            let end = offset + part.len();
            if !part.is_empty() && skip_bytes < end {
                let start = skip_bytes.saturating_sub(offset);
                slices.push(IoSlice::new(&part[start..]));
            }
            offset = end;
        }
    }

    slices
}
