//! One persistent stream to a query server.
//!
//! A [`Connection`] splits its stream into two tasks:
//! - the writer task (see [`crate::writer`]) serializes outbound frames
//! - the reader task cuts inbound bytes into frames and pushes them as
//!   [`TransportEvent::Frame`] onto a bounded channel
//!
//! Whichever side notices the stream is gone first moves the state to
//! `Disconnected` and emits a single [`TransportEvent::Disconnected`]. A
//! connection never redials; reconnecting means building a new one.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};

use super::socks;
use crate::config::{ClientSettings, TransportConfig};
use crate::error::{QueryError, Result};
use crate::protocol::FrameBuffer;
use crate::writer::{spawn_writer_task, OutboundFrame, WriterHandle};

/// Lifecycle of a transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Closing = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Closing,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// Notification pushed from the transport to its consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Raw bytes of one whole inbound frame, header included.
    Frame(Bytes),
    /// The stream is gone. Sent at most once per connection.
    Disconnected(String),
}

#[derive(Debug)]
struct StateCell(AtomicU8);

impl StateCell {
    fn new(state: ConnectionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, state: ConnectionState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Returns true only for the caller that performed the transition.
    fn mark_disconnected(&self) -> bool {
        self.0.swap(ConnectionState::Disconnected as u8, Ordering::AcqRel)
            != ConnectionState::Disconnected as u8
    }
}

/// Cloneable send side of a [`Connection`].
#[derive(Clone)]
pub struct ConnectionHandle {
    writer: WriterHandle,
    state: Arc<StateCell>,
}

impl ConnectionHandle {
    /// Queue a frame for writing.
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        if self.state.get() != ConnectionState::Connected {
            return Err(QueryError::ConnectionClosed);
        }
        self.writer.send(frame).await
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// True while senders are being held back by a full write queue.
    pub fn is_backpressure_active(&self) -> bool {
        self.writer.is_backpressure_active()
    }

    /// Frames queued but not yet written.
    pub fn queued_frames(&self) -> usize {
        self.writer.pending_count()
    }
}

/// A live transport connection.
pub struct Connection {
    handle: ConnectionHandle,
    peer: String,
    reader_task: JoinHandle<()>,
    writer_task: AbortHandle,
    monitor_task: JoinHandle<()>,
}

impl Connection {
    /// Dial the configured endpoint, through the SOCKS5 proxy if one is set.
    pub async fn connect(
        settings: &ClientSettings,
    ) -> Result<(Self, mpsc::Receiver<TransportEvent>)> {
        let endpoint = settings.endpoint();

        let dial = async {
            match settings.socks5() {
                Some(proxy) => socks::connect(proxy, endpoint).await,
                None => TcpStream::connect(endpoint.authority())
                    .await
                    .map_err(|source| QueryError::Connect {
                        endpoint: endpoint.to_string(),
                        source,
                    }),
            }
        };

        let stream = match settings.connect_timeout() {
            Some(limit) => tokio::time::timeout(limit, dial).await.map_err(|_| {
                QueryError::Connect {
                    endpoint: endpoint.to_string(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "connect timed out",
                    ),
                }
            })??,
            None => dial.await?,
        };

        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Failed to set TCP_NODELAY on {}: {}", endpoint, e);
        }

        tracing::debug!("Connected to {}", endpoint);
        Ok(Self::start(stream, settings.transport(), endpoint.to_string()))
    }

    /// Wrap an already-established stream.
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_stream<S>(
        stream: S,
        config: &TransportConfig,
    ) -> (Self, mpsc::Receiver<TransportEvent>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::start(stream, config, "in-memory stream".to_string())
    }

    fn start<S>(
        stream: S,
        config: &TransportConfig,
        peer: String,
    ) -> (Self, mpsc::Receiver<TransportEvent>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (events_tx, events_rx) = mpsc::channel(config.event_capacity);
        let state = Arc::new(StateCell::new(ConnectionState::Connected));

        let (writer, writer_task) = spawn_writer_task(write_half, config);
        let writer_abort = writer_task.abort_handle();

        let reader_task = tokio::spawn(read_loop(
            read_half,
            events_tx.clone(),
            state.clone(),
            config.max_payload_size,
            config.read_buffer_size,
        ));

        let monitor_state = state.clone();
        let monitor_task = tokio::spawn(async move {
            let reason = match writer_task.await {
                Ok(Ok(())) => return,
                Ok(Err(e)) => format!("write failed: {e}"),
                Err(e) if e.is_cancelled() => return,
                Err(e) => format!("writer task failed: {e}"),
            };
            notify_disconnect(&monitor_state, &events_tx, reason).await;
        });

        let connection = Self {
            handle: ConnectionHandle { writer, state },
            peer,
            reader_task,
            writer_task: writer_abort,
            monitor_task,
        };
        (connection, events_rx)
    }

    /// Cloneable send side.
    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.handle.state()
    }

    /// Queue a frame for writing.
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        self.handle.send(frame).await
    }

    /// Tear the connection down without emitting a disconnect event.
    ///
    /// Frames still queued for writing are discarded. Idempotent.
    pub fn close(&self) {
        if self.state() == ConnectionState::Disconnected && self.reader_task.is_finished() {
            return;
        }
        self.handle.state.set(ConnectionState::Closing);
        self.reader_task.abort();
        self.writer_task.abort();
        self.monitor_task.abort();
        self.handle.state.set(ConnectionState::Disconnected);
        tracing::debug!("Closed connection to {}", self.peer);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

async fn notify_disconnect(
    state: &StateCell,
    events: &mpsc::Sender<TransportEvent>,
    reason: String,
) {
    if state.mark_disconnected() {
        tracing::debug!("Transport disconnected: {}", reason);
        let _ = events.send(TransportEvent::Disconnected(reason)).await;
    }
}

async fn read_loop<R>(
    mut reader: R,
    events: mpsc::Sender<TransportEvent>,
    state: Arc<StateCell>,
    max_payload_size: u32,
    read_buffer_size: usize,
) where
    R: AsyncRead + Unpin,
{
    let mut frame_buffer = FrameBuffer::with_max_payload(max_payload_size);
    let mut buf = vec![0u8; read_buffer_size];

    let reason = loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break "connection closed by peer".to_string(),
            Ok(n) => n,
            Err(e) => break format!("read failed: {e}"),
        };

        let frames = match frame_buffer.push(&buf[..n]) {
            Ok(frames) => frames,
            Err(e) => break e.to_string(),
        };

        for frame in frames {
            if events.send(TransportEvent::Frame(frame)).await.is_err() {
                // Nobody is listening any more.
                state.mark_disconnected();
                return;
            }
        }
    };

    notify_disconnect(&state, &events, reason).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{decode, encode, Command, CorrelationId, HEADER_SIZE};
    use tokio::io::{duplex, AsyncWriteExt};

    #[tokio::test]
    async fn test_inbound_frames_become_events() {
        let (client, mut server) = duplex(4096);
        let (conn, mut events) = Connection::from_stream(client, &TransportConfig::default());
        assert_eq!(conn.state(), ConnectionState::Connected);

        let mut wire = encode(Command::LastHeight, CorrelationId(1), b"abcd")
            .unwrap()
            .to_vec();
        wire.extend_from_slice(&encode(Command::LastHeight, CorrelationId(2), b"").unwrap());
        server.write_all(&wire).await.unwrap();

        for expected in [1, 2] {
            match events.recv().await.unwrap() {
                TransportEvent::Frame(bytes) => {
                    assert_eq!(decode(&bytes).unwrap().correlation_id, CorrelationId(expected))
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_send_reaches_peer() {
        let (client, mut server) = duplex(4096);
        let (conn, _events) = Connection::from_stream(client, &TransportConfig::default());

        conn.send(
            OutboundFrame::new(Command::TotalConnections, CorrelationId(5), Bytes::new()).unwrap(),
        )
        .await
        .unwrap();

        let mut buf = [0u8; HEADER_SIZE];
        server.read_exact(&mut buf).await.unwrap();
        let frame = decode(&Bytes::copy_from_slice(&buf)).unwrap();
        assert_eq!(frame.command, Command::TotalConnections);
    }

    #[tokio::test]
    async fn test_peer_close_emits_single_disconnect() {
        let (client, server) = duplex(4096);
        let (conn, mut events) = Connection::from_stream(client, &TransportConfig::default());

        drop(server);

        assert!(matches!(
            events.recv().await,
            Some(TransportEvent::Disconnected(_))
        ));
        assert_eq!(conn.state(), ConnectionState::Disconnected);

        // A failing send must not produce a second notification.
        let result = conn
            .send(OutboundFrame::new(Command::LastHeight, CorrelationId(1), Bytes::new()).unwrap())
            .await;
        assert!(matches!(result, Err(QueryError::ConnectionClosed)));

        let second =
            tokio::time::timeout(std::time::Duration::from_millis(50), events.recv()).await;
        assert!(!matches!(second, Ok(Some(TransportEvent::Disconnected(_)))));
    }

    #[tokio::test]
    async fn test_oversized_frame_disconnects() {
        let (client, mut server) = duplex(4096);
        let config = TransportConfig {
            max_payload_size: 8,
            ..TransportConfig::default()
        };
        let (_conn, mut events) = Connection::from_stream(client, &config);

        server
            .write_all(&encode(Command::Transaction, CorrelationId(1), &[0u8; 64]).unwrap())
            .await
            .unwrap();

        match events.recv().await.unwrap() {
            TransportEvent::Disconnected(reason) => assert!(reason.contains("exceeds maximum")),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_silent() {
        let (client, _server) = duplex(4096);
        let (conn, mut events) = Connection::from_stream(client, &TransportConfig::default());

        conn.close();
        conn.close();

        assert_eq!(conn.state(), ConnectionState::Disconnected);
        let result = conn
            .send(OutboundFrame::new(Command::LastHeight, CorrelationId(1), Bytes::new()).unwrap())
            .await;
        assert!(matches!(result, Err(QueryError::ConnectionClosed)));
        assert!(!matches!(
            events.try_recv(),
            Ok(TransportEvent::Disconnected(_))
        ));
    }
}
