//! Client core: request submission and reply dispatch.
//!
//! The [`Client`] owns one transport connection, the pending-request table,
//! and a dispatch task per connection. A request goes through:
//! 1. Allocate a correlation id and register it in the table
//! 2. Hand the encoded frame to the connection's writer task
//! 3. Wait on the returned [`PendingResponse`]
//!
//! The dispatch task routes inbound frames to the matching entry, sweeps
//! expired entries on a fixed interval, and fails everything outstanding
//! when the connection drops.
//!
//! # Example
//!
//! ```no_run
//! use blockquery_client::{Client, Endpoint};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::builder(Endpoint::new("127.0.0.1", 9091))
//!         .query_expire_time(Some(Duration::from_secs(10)))
//!         .connect()
//!         .await?;
//!
//!     let height = client.last_height().await?;
//!     println!("tip is at {height}");
//!
//!     client.stop();
//!     Ok(())
//! }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{ready, Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::{ClientSettings, Endpoint, Socks5Config};
use crate::error::{ErrorKind, QueryError, Result};
use crate::pending::{Completer, Completion, IdAllocator, PendingTable};
use crate::protocol::{self, Command, CorrelationId};
use crate::transport::{Connection, ConnectionState, TransportEvent};
use crate::writer::OutboundFrame;

/// Builder for configuring and connecting a [`Client`].
pub struct ClientBuilder {
    settings: ClientSettings,
}

impl ClientBuilder {
    /// Start from default settings for `endpoint`.
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            settings: ClientSettings::new(endpoint),
        }
    }

    /// Start from existing settings.
    pub fn from_settings(settings: ClientSettings) -> Self {
        Self { settings }
    }

    /// Deadline applied by the typed queries and [`Client::call`].
    ///
    /// `None` waits forever.
    /// Default: 30 seconds
    pub fn query_expire_time(mut self, expire: Option<Duration>) -> Self {
        self.settings.set_query_expire_time(expire);
        self
    }

    /// Route the connection through a SOCKS5 proxy.
    pub fn socks5(mut self, proxy: Socks5Config) -> Self {
        self.settings.set_socks5(Some(proxy));
        self
    }

    /// Give up dialing after `timeout`.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.settings.set_connect_timeout(Some(timeout));
        self
    }

    /// How often expired requests are swept.
    ///
    /// Default: 250 milliseconds
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.settings.set_sweep_interval(interval);
        self
    }

    /// Set the maximum pending frames for backpressure.
    ///
    /// Default: 1024
    pub fn max_pending_frames(mut self, limit: usize) -> Self {
        self.settings.transport_mut().max_pending_frames = limit;
        self
    }

    /// Set the writer channel capacity.
    ///
    /// Default: 1024
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.settings.transport_mut().channel_capacity = capacity;
        self
    }

    /// Set the backpressure timeout.
    ///
    /// Default: 5 seconds
    pub fn backpressure_timeout(mut self, timeout: Duration) -> Self {
        self.settings.transport_mut().backpressure_timeout = timeout;
        self
    }

    /// Largest payload sent or accepted. A larger reply drops the connection;
    /// a larger request is refused by `submit`.
    pub fn max_payload_size(mut self, max: u32) -> Self {
        self.settings.transport_mut().max_payload_size = max;
        self
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    /// Dial the endpoint and start dispatching.
    pub async fn connect(self) -> Result<Client> {
        Client::connect(self.settings).await
    }

    /// Run over an already-established stream.
    pub fn from_stream<S>(self, stream: S) -> Result<Client>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Client::from_stream(stream, self.settings)
    }
}

struct Link {
    generation: u64,
    connection: Connection,
    dispatch_task: JoinHandle<()>,
}

impl Link {
    fn close(self) {
        self.connection.close();
        self.dispatch_task.abort();
    }
}

/// A connection taken out of the client along with every request that was
/// waiting on it.
struct Detached {
    link: Option<Link>,
    drained: Vec<Completer>,
}

impl Detached {
    fn take(state: &mut DispatchState) -> Self {
        Self {
            link: state.link.take(),
            drained: state.table.drain_all(),
        }
    }

    /// Close the link and resolve the drained requests. Call without the
    /// state lock held.
    fn finish(self, kind: ErrorKind) {
        if let Some(link) = self.link {
            link.close();
        }
        complete_all(self.drained, kind);
    }
}

struct DispatchState {
    table: PendingTable,
    ids: IdAllocator,
    link: Option<Link>,
    /// Reconnects currently dialing.
    connecting: usize,
    stopped: bool,
    next_generation: u64,
}

struct Shared {
    settings: ClientSettings,
    state: Mutex<DispatchState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, DispatchState> {
        // Nothing in the critical sections can leave the table half-updated.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle_frame(&self, raw: Bytes) {
        let frame =
            match protocol::decode_with_max(&raw, self.settings.transport().max_payload_size) {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::warn!("Dropping undecodable frame ({} bytes): {}", raw.len(), e);
                    return;
                }
            };

        let result = self
            .lock()
            .table
            .resolve(frame.correlation_id, Ok(frame.payload));
        if let Err(e) = result {
            tracing::debug!("Dropping {} reply: {}", frame.command, e);
        }
    }

    fn sweep_expired(&self) {
        let expired = self.lock().table.sweep_expired(Instant::now());
        for completer in expired {
            tracing::debug!(
                "Request {} ({}) timed out after {:?}",
                completer.id(),
                completer.command(),
                completer.issued_at().elapsed()
            );
            completer.complete(Err(ErrorKind::Timeout));
        }
    }

    fn handle_disconnect(&self, generation: u64, reason: &str) {
        let (link, drained) = {
            let mut state = self.lock();
            match &state.link {
                Some(link) if link.generation == generation => {}
                // Stale event from a connection already replaced or stopped.
                _ => return,
            }
            (state.link.take(), state.table.drain_all())
        };

        tracing::warn!(
            "Connection lost ({}), failing {} pending requests",
            reason,
            drained.len()
        );
        // Dropping the link tears the transport down; the dispatch task is
        // the caller and exits on its own.
        drop(link);
        complete_all(drained, ErrorKind::ConnectionLost);
    }
}

/// Counts one in-progress dial for as long as it lives.
struct Dialing<'a> {
    shared: &'a Shared,
}

impl<'a> Dialing<'a> {
    fn begin(shared: &'a Shared, state: &mut DispatchState) -> Self {
        state.connecting += 1;
        Self { shared }
    }
}

impl Drop for Dialing<'_> {
    fn drop(&mut self) {
        self.shared.lock().connecting -= 1;
    }
}

fn complete_all(completers: Vec<Completer>, kind: ErrorKind) {
    for completer in completers {
        completer.complete(Err(kind));
    }
}

/// A connected query client.
///
/// Cheap to clone; every clone drives the same connection and table.
#[derive(Clone)]
pub struct Client {
    shared: Arc<Shared>,
}

impl Client {
    /// Create a new client builder.
    pub fn builder(endpoint: Endpoint) -> ClientBuilder {
        ClientBuilder::new(endpoint)
    }

    /// Dial the configured endpoint and start dispatching.
    pub async fn connect(settings: ClientSettings) -> Result<Self> {
        settings.validate()?;
        let (connection, events) = Connection::connect(&settings).await?;
        Ok(Self::start(settings, connection, events))
    }

    /// Run over an already-established stream.
    ///
    /// Must be called from within a tokio runtime. [`Client::reconnect`]
    /// still dials the configured endpoint.
    pub fn from_stream<S>(stream: S, settings: ClientSettings) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        settings.validate()?;
        let (connection, events) = Connection::from_stream(stream, settings.transport());
        Ok(Self::start(settings, connection, events))
    }

    fn start(
        settings: ClientSettings,
        connection: Connection,
        events: mpsc::Receiver<TransportEvent>,
    ) -> Self {
        if settings.query_expire_time().is_none() {
            tracing::warn!("No query expire time set; unanswered requests will wait forever");
        }

        let shared = Arc::new(Shared {
            settings,
            state: Mutex::new(DispatchState {
                table: PendingTable::new(),
                ids: IdAllocator::new(),
                link: None,
                connecting: 0,
                stopped: false,
                next_generation: 0,
            }),
        });

        let client = Self { shared };
        let mut state = client.shared.lock();
        let replaced = client.attach(&mut state, connection, events);
        drop(state);
        if let Some(replaced) = replaced {
            replaced.finish(ErrorKind::ConnectionLost);
        }
        client
    }

    /// Install `connection` as the live link.
    ///
    /// A link already in place is detached together with the table; the
    /// caller must finish it once the lock is released.
    #[must_use]
    fn attach(
        &self,
        state: &mut DispatchState,
        connection: Connection,
        events: mpsc::Receiver<TransportEvent>,
    ) -> Option<Detached> {
        let replaced = state.link.is_some().then(|| Detached::take(state));

        let generation = state.next_generation;
        state.next_generation += 1;

        let dispatch_task = tokio::spawn(dispatch_loop(
            Arc::downgrade(&self.shared),
            generation,
            events,
            self.shared.settings.sweep_interval(),
        ));

        state.link = Some(Link {
            generation,
            connection,
            dispatch_task,
        });
        replaced
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.shared.settings
    }

    /// Send a request and return a handle that resolves with its reply.
    ///
    /// `timeout` of `None` waits forever. Fails with
    /// [`QueryError::NotConnected`] unless the connection is up, and with
    /// [`QueryError::PayloadTooLarge`] if the payload exceeds the configured
    /// maximum.
    pub async fn submit(
        &self,
        command: Command,
        payload: Bytes,
        timeout: Option<Duration>,
    ) -> Result<PendingResponse> {
        let max = self.shared.settings.transport().max_payload_size;
        if payload.len() > max as usize {
            return Err(QueryError::PayloadTooLarge {
                length: payload.len(),
                max,
            });
        }

        let (mut response, connection) = {
            let mut guard = self.shared.lock();
            let state = &mut *guard;

            let connection = match &state.link {
                Some(link) if link.connection.state() == ConnectionState::Connected => {
                    link.connection.handle()
                }
                _ => return Err(QueryError::NotConnected),
            };

            let issued_at = Instant::now();
            let deadline = timeout.and_then(|t| issued_at.checked_add(t));
            let id = state.ids.next(&state.table);
            let (serial, receiver) = state.table.register(id, command, issued_at, deadline)?;

            let response = PendingResponse {
                id,
                serial,
                command,
                receiver,
                shared: Arc::downgrade(&self.shared),
                finished: false,
            };
            (response, connection)
        };

        let sent = match OutboundFrame::new(command, response.id, payload) {
            Ok(frame) => connection.send(frame).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            self.shared.lock().table.cancel(response.id, response.serial);
            response.finished = true;
            return Err(e);
        }

        tracing::trace!("Sent {} as request {}", command, response.id);
        Ok(response)
    }

    /// Send a request with the configured expire time and wait for the reply.
    pub async fn call(&self, command: Command, payload: Bytes) -> Result<Bytes> {
        let response = self
            .submit(command, payload, self.shared.settings.query_expire_time())
            .await?;
        Ok(response.await?)
    }

    /// Replace the connection with a freshly dialed one.
    ///
    /// Requests outstanding on the old connection fail with
    /// [`ErrorKind::ConnectionLost`]. Concurrent calls each dial; the last
    /// to finish wins and fails whatever was sent on the earlier one.
    pub async fn reconnect(&self) -> Result<()> {
        let (old, dialing) = {
            let mut state = self.shared.lock();
            if state.stopped {
                return Err(QueryError::Shutdown);
            }
            let dialing = Dialing::begin(&self.shared, &mut state);
            (Detached::take(&mut state), dialing)
        };
        old.finish(ErrorKind::ConnectionLost);

        tracing::debug!("Reconnecting to {}", self.shared.settings.endpoint());
        let dialed = Connection::connect(&self.shared.settings).await;
        drop(dialing);
        let (connection, events) = dialed?;

        let replaced = {
            let mut state = self.shared.lock();
            if state.stopped {
                drop(state);
                connection.close();
                return Err(QueryError::Shutdown);
            }
            self.attach(&mut state, connection, events)
        };
        if let Some(replaced) = replaced {
            tracing::debug!(
                "Replaced a concurrently attached connection, failing {} pending requests",
                replaced.drained.len()
            );
            replaced.finish(ErrorKind::ConnectionLost);
        }
        Ok(())
    }

    /// Close the connection and cancel every outstanding request.
    ///
    /// Idempotent. Afterwards `submit` fails with `NotConnected` and
    /// `reconnect` with `Shutdown`.
    pub fn stop(&self) {
        let detached = {
            let mut state = self.shared.lock();
            if state.stopped {
                return;
            }
            state.stopped = true;
            Detached::take(&mut state)
        };

        tracing::debug!(
            "Client stopped, cancelling {} pending requests",
            detached.drained.len()
        );
        detached.finish(ErrorKind::Cancelled);
    }

    pub fn connection_state(&self) -> ConnectionState {
        let state = self.shared.lock();
        match &state.link {
            Some(link) => link.connection.state(),
            None if state.connecting > 0 => ConnectionState::Connecting,
            None => ConnectionState::Disconnected,
        }
    }

    /// Number of requests still waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.shared.lock().table.len()
    }
}

/// Handle to one in-flight request.
///
/// Resolves exactly once with the reply payload or the reason there is
/// none. Dropping it before it resolves cancels the request.
#[must_use = "dropping a PendingResponse cancels the request"]
pub struct PendingResponse {
    id: CorrelationId,
    serial: u64,
    command: Command,
    receiver: oneshot::Receiver<Completion>,
    shared: Weak<Shared>,
    finished: bool,
}

impl PendingResponse {
    pub fn id(&self) -> CorrelationId {
        self.id
    }

    pub fn command(&self) -> Command {
        self.command
    }

    /// Withdraw the request; awaiting it afterwards yields
    /// [`ErrorKind::Cancelled`].
    ///
    /// Returns false if it had already been resolved.
    pub fn cancel(&mut self) -> bool {
        if self.finished {
            return false;
        }
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        let completer = shared.lock().table.cancel(self.id, self.serial);
        match completer {
            Some(completer) => {
                completer.complete(Err(ErrorKind::Cancelled));
                true
            }
            None => false,
        }
    }
}

impl Future for PendingResponse {
    type Output = Completion;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(Err(ErrorKind::Cancelled));
        }
        let result = ready!(Pin::new(&mut this.receiver).poll(cx));
        this.finished = true;
        // A dropped sender means the client itself went away.
        Poll::Ready(result.unwrap_or(Err(ErrorKind::Cancelled)))
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        if !self.finished {
            self.cancel();
        }
    }
}

impl std::fmt::Debug for PendingResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingResponse")
            .field("id", &self.id)
            .field("command", &self.command)
            .field("finished", &self.finished)
            .finish()
    }
}

async fn dispatch_loop(
    shared: Weak<Shared>,
    generation: u64,
    mut events: mpsc::Receiver<TransportEvent>,
    sweep_interval: Duration,
) {
    let mut sweep = tokio::time::interval(sweep_interval);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(shared) = shared.upgrade() else { return };
                match event {
                    Some(TransportEvent::Frame(raw)) => shared.handle_frame(raw),
                    Some(TransportEvent::Disconnected(reason)) => {
                        shared.handle_disconnect(generation, &reason);
                        return;
                    }
                    None => {
                        shared.handle_disconnect(generation, "transport event channel closed");
                        return;
                    }
                }
            }
            _ = sweep.tick() => {
                let Some(shared) = shared.upgrade() else { return };
                shared.sweep_expired();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_QUERY_EXPIRE_TIME;
    use crate::protocol::HEADER_SIZE;
    use tokio::io::{duplex, AsyncReadExt};

    fn endpoint() -> Endpoint {
        Endpoint::new("127.0.0.1", 9091)
    }

    #[test]
    fn test_builder_defaults() {
        let builder = Client::builder(endpoint());
        assert_eq!(
            builder.settings().query_expire_time(),
            Some(DEFAULT_QUERY_EXPIRE_TIME)
        );
        assert!(builder.settings().socks5().is_none());
    }

    #[test]
    fn test_builder_configuration() {
        let builder = Client::builder(endpoint())
            .query_expire_time(None)
            .socks5(Socks5Config::new("127.0.0.1:9050"))
            .connect_timeout(Duration::from_secs(3))
            .sweep_interval(Duration::from_millis(100))
            .max_pending_frames(2048)
            .channel_capacity(512)
            .backpressure_timeout(Duration::from_secs(10))
            .max_payload_size(1024);

        let settings = builder.settings();
        assert_eq!(settings.query_expire_time(), None);
        assert_eq!(settings.socks5().unwrap().addr, "127.0.0.1:9050");
        assert_eq!(settings.connect_timeout(), Some(Duration::from_secs(3)));
        assert_eq!(settings.sweep_interval(), Duration::from_millis(100));
        assert_eq!(settings.transport().max_pending_frames, 2048);
        assert_eq!(settings.transport().channel_capacity, 512);
        assert_eq!(
            settings.transport().backpressure_timeout,
            Duration::from_secs(10)
        );
        assert_eq!(settings.transport().max_payload_size, 1024);
    }

    #[tokio::test]
    async fn test_from_stream_rejects_invalid_settings() {
        let (client_io, _server_io) = duplex(1024);
        let result = Client::builder(endpoint())
            .sweep_interval(Duration::ZERO)
            .from_stream(client_io);
        assert!(matches!(result, Err(QueryError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_fresh_client_is_connected() {
        let (client_io, _server_io) = duplex(1024);
        let client = Client::builder(endpoint()).from_stream(client_io).unwrap();

        assert_eq!(client.connection_state(), ConnectionState::Connected);
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_removes_entry() {
        let (client_io, _server_io) = duplex(1024);
        let client = Client::builder(endpoint()).from_stream(client_io).unwrap();

        let mut response = client
            .submit(Command::LastHeight, Bytes::new(), None)
            .await
            .unwrap();
        assert_eq!(client.pending_count(), 1);

        assert!(response.cancel());
        assert!(!response.cancel());
        assert_eq!(client.pending_count(), 0);
        assert_eq!(response.await, Err(ErrorKind::Cancelled));
    }

    #[tokio::test]
    async fn test_drop_cancels_request() {
        let (client_io, _server_io) = duplex(1024);
        let client = Client::builder(endpoint()).from_stream(client_io).unwrap();

        let response = client
            .submit(Command::TotalConnections, Bytes::new(), None)
            .await
            .unwrap();
        assert_eq!(client.pending_count(), 1);

        drop(response);
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_submit_rejects_oversized_payload() {
        let (client_io, mut server_io) = duplex(1024);
        let client = Client::builder(endpoint())
            .max_payload_size(8)
            .from_stream(client_io)
            .unwrap();

        let result = client
            .submit(Command::Transaction, Bytes::from_static(&[0u8; 9]), None)
            .await;
        assert!(matches!(
            result,
            Err(QueryError::PayloadTooLarge { length: 9, max: 8 })
        ));
        assert_eq!(client.pending_count(), 0);

        let _response = client
            .submit(Command::Transaction, Bytes::from_static(&[0u8; 8]), None)
            .await
            .unwrap();
        let mut wire = [0u8; HEADER_SIZE + 8];
        server_io.read_exact(&mut wire).await.unwrap();
        assert_eq!(&wire[6..10], &8u32.to_be_bytes());
        assert_eq!(client.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_attach_fails_requests_on_replaced_link() {
        let (client_io, _server_io) = duplex(1024);
        let client = Client::builder(endpoint()).from_stream(client_io).unwrap();
        let response = client
            .submit(Command::LastHeight, Bytes::new(), None)
            .await
            .unwrap();

        let (next_io, _next_server_io) = duplex(1024);
        let (connection, events) =
            Connection::from_stream(next_io, client.settings().transport());
        let replaced = {
            let mut state = client.shared.lock();
            client.attach(&mut state, connection, events)
        };
        replaced
            .expect("the original link should be replaced")
            .finish(ErrorKind::ConnectionLost);

        assert_eq!(response.await, Err(ErrorKind::ConnectionLost));
        assert_eq!(client.pending_count(), 0);
        assert_eq!(client.connection_state(), ConnectionState::Connected);

        // The new link carries requests.
        let _next = client
            .submit(Command::LastHeight, Bytes::new(), None)
            .await
            .unwrap();
        assert_eq!(client.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_reconnect_after_stop_fails() {
        let (client_io, _server_io) = duplex(1024);
        let client = Client::builder(endpoint()).from_stream(client_io).unwrap();

        client.stop();
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
        assert!(matches!(
            client.reconnect().await,
            Err(QueryError::Shutdown)
        ));
    }
}
