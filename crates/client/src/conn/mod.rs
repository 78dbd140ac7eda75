//! Connections and the tasks that own them.
//!
//! Every connection is driven by exactly one task, its actor. Callers never
//! touch the socket: they register a [`ResponseHandle`] in the connection's
//! [`HandleRegistry`] and send [`Command`]s over an unbounded channel, which
//! the actor executes in order. Inbound bytes are decoded by the actor and
//! dispatched to the registered handles by the protocol adapters in [`h1`]
//! and [`h2`].

mod h1;
mod h2;
mod registry;

pub(crate) use registry::HandleRegistry;

use crate::config::Http2Options;
use crate::connect::Connected;
use crate::handle::ResponseHandle;
use crate::{ClientConfig, ClientError, Destination};
use bytes::Bytes;
use http::HeaderMap;
use micro_client_proto::codec::h2::ErrorCode;
use micro_client_proto::protocol::{PayloadSize, RequestHead};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use tokio::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// The protocol negotiated when the connection was created. It never changes afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Http1,
    Http2,
}

/// The part of the client configuration a connection actor needs.
#[derive(Debug, Clone)]
pub(crate) struct ConnectionSettings {
    pub(crate) high_watermark: usize,
    pub(crate) max_content_length: Option<u64>,
    pub(crate) http2: Http2Options,
}

impl ConnectionSettings {
    pub(crate) fn from_config(config: &ClientConfig) -> Self {
        Self {
            high_watermark: config.write_buffer_high_watermark,
            max_content_length: config.max_content_length,
            http2: config.http2.clone(),
        }
    }
}

/// State shared between a connection's actor and the pool handing it out.
pub(crate) struct ConnectionState {
    id: u64,
    protocol: Protocol,
    secure: bool,
    destination: Destination,
    registry: HandleRegistry<ResponseHandle>,
    active: AtomicBool,
    reusable: AtomicBool,
    pending_bytes: AtomicUsize,
    high_watermark: usize,
    max_concurrent: AtomicU32,
    in_flight: AtomicU32,
    last_used: Mutex<Instant>,
    max_content_length: Option<u64>,
}

impl ConnectionState {
    pub(crate) fn new(
        protocol: Protocol,
        secure: bool,
        destination: Destination,
        registry: HandleRegistry<ResponseHandle>,
        settings: &ConnectionSettings,
    ) -> Self {
        let max_concurrent = match protocol {
            Protocol::Http1 => 1,
            Protocol::Http2 => settings.http2.max_concurrent_streams.max(1),
        };
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            protocol,
            secure,
            destination,
            registry,
            active: AtomicBool::new(true),
            reusable: AtomicBool::new(true),
            pending_bytes: AtomicUsize::new(0),
            high_watermark: settings.high_watermark,
            max_concurrent: AtomicU32::new(max_concurrent),
            in_flight: AtomicU32::new(0),
            last_used: Mutex::new(Instant::now()),
            max_content_length: settings.max_content_length,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn registry(&self) -> &HandleRegistry<ResponseHandle> {
        &self.registry
    }

    pub(crate) fn max_content_length(&self) -> Option<u64> {
        self.max_content_length
    }

    pub(crate) fn set_inactive(&self) {
        self.active.store(false, Ordering::Release);
    }

    pub(crate) fn is_reusable(&self) -> bool {
        self.reusable.load(Ordering::Acquire)
    }

    pub(crate) fn set_unreusable(&self) {
        self.reusable.store(false, Ordering::Release);
    }

    pub(crate) fn set_max_concurrent(&self, max: u32) {
        self.max_concurrent.store(max.max(1), Ordering::Release);
    }

    /// Fail every handle still registered, used when the connection goes away.
    pub(crate) fn fail_all(&self, error: &ClientError) {
        self.registry.drain(|_, handle| handle.on_error(error.clone()));
    }
}

impl fmt::Debug for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionState")
            .field("id", &self.id)
            .field("protocol", &self.protocol)
            .field("destination", &self.destination)
            .field("active", &self.active.load(Ordering::Relaxed))
            .field("in_flight", &self.in_flight.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// One piece of outbound request data, in protocol neutral form.
pub(crate) enum Outbound {
    /// The request head. `end_stream` means no body follows.
    Head { head: RequestHead, size: PayloadSize, end_stream: bool },
    Data { data: Bytes, end_stream: bool },
    /// Copy `len` bytes of `file` straight into a plaintext HTTP/1 socket.
    File { file: tokio::fs::File, len: u64, end_stream: bool },
    /// Trailers, which end the body.
    Trailers(HeaderMap),
    /// End the body without more data.
    End,
    /// Abandon the request body.
    Reset(ErrorCode),
}

impl Outbound {
    fn buffered_len(&self) -> usize {
        match self {
            Self::Data { data, .. } => data.len(),
            Self::Head { .. } | Self::File { .. } | Self::Trailers(_) | Self::End | Self::Reset(_) => 0,
        }
    }
}

impl fmt::Debug for Outbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Head { head, size, end_stream } => {
                write!(f, "Head({} {}, {size:?}, end_stream: {end_stream})", head.method(), head.uri())
            }
            Self::Data { data, end_stream } => write!(f, "Data({} bytes, end_stream: {end_stream})", data.len()),
            Self::File { len, end_stream, .. } => write!(f, "File({len} bytes, end_stream: {end_stream})"),
            Self::Trailers(trailers) => write!(f, "Trailers({})", trailers.len()),
            Self::End => f.write_str("End"),
            Self::Reset(code) => write!(f, "Reset({code})"),
        }
    }
}

pub(crate) type WriteResult = Result<(), ClientError>;

/// Completion of one write command.
///
/// Dropping an ack without completing it tells the writer the connection went
/// away. Either way the bytes it accounts for leave the pending write budget.
pub(crate) struct WriteAck {
    size: usize,
    state: Arc<ConnectionState>,
    tx: Option<oneshot::Sender<WriteResult>>,
}

impl WriteAck {
    pub(crate) fn complete(mut self, result: WriteResult) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(result);
        }
    }
}

impl Drop for WriteAck {
    fn drop(&mut self) {
        self.state.pending_bytes.fetch_sub(self.size, Ordering::AcqRel);
    }
}

pub(crate) enum Command {
    /// The first write of a request: registers `id` as awaiting a response.
    Start { id: u32, head_request: bool, outbound: Vec<Outbound>, ack: WriteAck },
    Write { id: u32, outbound: Vec<Outbound>, ack: WriteAck },
    Close,
}

/// Await a write acknowledgement; a dropped ack means the connection closed.
pub(crate) async fn acked(receiver: oneshot::Receiver<WriteResult>) -> WriteResult {
    receiver.await.unwrap_or(Err(ClientError::ClosedConnection))
}

/// A cheap handle on a live connection, handed out by the pool.
#[derive(Clone)]
pub(crate) struct PooledConnection {
    state: Arc<ConnectionState>,
    commands: mpsc::UnboundedSender<Command>,
}

impl PooledConnection {
    pub(crate) fn id(&self) -> u64 {
        self.state.id
    }

    pub(crate) fn protocol(&self) -> Protocol {
        self.state.protocol
    }

    pub(crate) fn is_secure(&self) -> bool {
        self.state.secure
    }

    pub(crate) fn destination(&self) -> &Destination {
        &self.state.destination
    }

    pub(crate) fn is_active(&self) -> bool {
        self.state.active.load(Ordering::Acquire) && !self.commands.is_closed()
    }

    pub(crate) fn is_reusable(&self) -> bool {
        self.state.is_reusable()
    }

    /// Whether the outbound buffer is below its high watermark.
    pub(crate) fn is_writable(&self) -> bool {
        self.state.pending_bytes.load(Ordering::Acquire) < self.state.high_watermark
    }

    /// The connection finishes its current response and is then closed.
    pub(crate) fn mark_unreusable(&self) {
        self.state.set_unreusable();
    }

    pub(crate) fn in_flight(&self) -> u32 {
        self.state.in_flight.load(Ordering::Acquire)
    }

    pub(crate) fn max_concurrent(&self) -> u32 {
        self.state.max_concurrent.load(Ordering::Acquire)
    }

    /// Claim one request slot.
    pub(crate) fn try_reserve(&self) -> bool {
        let max = self.max_concurrent();
        let reserved = self
            .state
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .is_ok();
        if reserved {
            *self.state.last_used.lock() = Instant::now();
        }
        reserved
    }

    pub(crate) fn release_slot(&self) {
        let _ = self.state.in_flight.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        *self.state.last_used.lock() = Instant::now();
    }

    /// When the connection became idle, `None` while requests are in flight.
    pub(crate) fn idle_since(&self) -> Option<Instant> {
        (self.in_flight() == 0).then(|| *self.state.last_used.lock())
    }

    pub(crate) fn registry(&self) -> &HandleRegistry<ResponseHandle> {
        &self.state.registry
    }

    /// Register `handle` and hand its first writes to the actor.
    ///
    /// The id is allocated and the command queued under the registry lock, so
    /// HTTP/2 stream ids reach the actor in increasing order.
    pub(crate) fn begin(
        &self,
        handle: &ResponseHandle,
        head_request: bool,
        outbound: Vec<Outbound>,
    ) -> Result<oneshot::Receiver<WriteResult>, ClientError> {
        let (tx, rx) = oneshot::channel();
        let ack = self.ack(&outbound, tx);
        self.state.registry.put_with(handle.clone(), ClientError::protocol("stream ids exhausted"), |id| {
            handle.set_id(id);
            self.commands
                .send(Command::Start { id, head_request, outbound, ack })
                .map_err(|_e| ClientError::ConnectionInactive)
        })?;
        Ok(rx)
    }

    pub(crate) fn write(&self, id: u32, outbound: Vec<Outbound>) -> oneshot::Receiver<WriteResult> {
        let (tx, rx) = oneshot::channel();
        self.send(id, outbound, tx);
        rx
    }

    /// Queue a write whose completion is reported on `tx`.
    pub(crate) fn send(&self, id: u32, outbound: Vec<Outbound>, tx: oneshot::Sender<WriteResult>) {
        let ack = self.ack(&outbound, tx);
        if let Err(mpsc::error::SendError(Command::Write { ack, .. })) = self.commands.send(Command::Write { id, outbound, ack }) {
            ack.complete(Err(ClientError::ClosedConnection));
        }
    }

    pub(crate) fn close(&self) {
        debug!(connection = self.state.id, destination = %self.state.destination, "closing connection");
        self.state.set_inactive();
        let _ = self.commands.send(Command::Close);
    }

    fn ack(&self, outbound: &[Outbound], tx: oneshot::Sender<WriteResult>) -> WriteAck {
        let size = outbound.iter().map(Outbound::buffered_len).sum();
        self.state.pending_bytes.fetch_add(size, Ordering::AcqRel);
        WriteAck { size, state: Arc::clone(&self.state), tx: Some(tx) }
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> &Arc<ConnectionState> {
        &self.state
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.state.fmt(f)
    }
}

/// Start the actor for a freshly connected transport.
pub(crate) fn spawn(connected: Connected, destination: Destination, settings: &ConnectionSettings) -> PooledConnection {
    let registry = match connected.protocol {
        Protocol::Http1 => HandleRegistry::reusing(),
        // stream 1 carried the upgrade request
        Protocol::Http2 if connected.upgraded => HandleRegistry::streams(3),
        Protocol::Http2 => HandleRegistry::streams(1),
    };
    let state = Arc::new(ConnectionState::new(connected.protocol, connected.secure, destination, registry, settings));
    let (commands, receiver) = mpsc::unbounded_channel();

    debug!(connection = state.id, protocol = ?state.protocol, destination = %state.destination, "connection established");
    match connected.protocol {
        Protocol::Http1 => {
            tokio::spawn(h1::run(connected.io, connected.leftover, Arc::clone(&state), receiver));
        }
        Protocol::Http2 => {
            tokio::spawn(h2::run(connected.io, connected.leftover, Arc::clone(&state), settings.http2.clone(), receiver));
        }
    }
    PooledConnection { state, commands }
}

/// Drain commands that raced with the actor's shutdown, failing their handles.
fn reject_pending(state: &ConnectionState, receiver: &mut mpsc::UnboundedReceiver<Command>) {
    receiver.close();
    while let Ok(command) = receiver.try_recv() {
        match command {
            Command::Start { id, ack, .. } => {
                if let Some(handle) = state.registry.remove(id) {
                    handle.on_error(ClientError::ClosedConnection);
                }
                ack.complete(Err(ClientError::ClosedConnection));
            }
            Command::Write { ack, .. } => ack.complete(Err(ClientError::ClosedConnection)),
            Command::Close => {}
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::Resources;
    use crate::context::RequestContext;
    use crate::handle::ResponseResult;
    use crate::listener::NoopListener;
    use http::uri::Scheme;

    pub(crate) fn settings() -> ConnectionSettings {
        ConnectionSettings::from_config(&ClientConfig::default())
    }

    pub(crate) fn destination() -> Destination {
        Destination::new(Scheme::HTTP, "example.com", 80)
    }

    pub(crate) fn new_handle() -> (ResponseHandle, oneshot::Receiver<ResponseResult>) {
        let resources = Resources::new();
        ResponseHandle::new(Arc::new(RequestContext::new()), Arc::new(NoopListener), resources.callback_handle().as_ref())
    }

    /// A connection over an in-memory duplex pipe, and the server end of the pipe.
    pub(crate) fn duplex_connection(protocol: Protocol) -> (PooledConnection, tokio::io::DuplexStream) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let connected = Connected::new(Box::new(client), protocol, false);
        (spawn(connected, destination(), &settings()), server)
    }

    #[tokio::test]
    async fn slots_are_bounded_by_max_concurrent() {
        let (connection, _server) = duplex_connection(Protocol::Http1);
        assert!(connection.try_reserve());
        assert!(!connection.try_reserve());
        assert!(connection.idle_since().is_none());

        connection.release_slot();
        assert!(connection.idle_since().is_some());
        assert!(connection.try_reserve());
    }

    #[tokio::test]
    async fn closed_connection_rejects_new_requests() {
        let (connection, _server) = duplex_connection(Protocol::Http1);
        connection.close();
        assert!(!connection.is_active());

        tokio::task::yield_now().await;
        let (handle, receiver) = new_handle();
        let head = RequestHead::new(http::Method::GET, http::Uri::from_static("http://example.com/"));
        let outbound = vec![Outbound::Head { head, size: PayloadSize::Empty, end_stream: true }];
        if let Ok(ack) = connection.begin(&handle, false, outbound) {
            assert!(acked(ack).await.is_err());
        } else {
            handle.on_error(ClientError::ConnectionInactive);
        }
        assert!(receiver.await.unwrap().is_err());
        assert!(connection.registry().is_empty());
    }

    #[tokio::test]
    async fn pending_bytes_follow_acks() {
        let (connection, _server) = duplex_connection(Protocol::Http1);
        let (tx, _rx) = oneshot::channel();
        let ack = connection.ack(&[Outbound::Data { data: Bytes::from_static(b"12345"), end_stream: false }], tx);
        assert_eq!(connection.state.pending_bytes.load(Ordering::Acquire), 5);
        drop(ack);
        assert_eq!(connection.state.pending_bytes.load(Ordering::Acquire), 0);
        assert!(connection.is_writable());
    }
}
