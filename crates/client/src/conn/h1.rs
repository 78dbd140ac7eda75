//! The HTTP/1 connection actor and its response adapter.
//!
//! HTTP/1 answers requests strictly in order, so the adapter keeps a FIFO of
//! the ids written on this connection and routes every decoded response event
//! to the id at its front.

use super::{Command, ConnectionState, Outbound, reject_pending};
use crate::ClientError;
use crate::connect::BoxIo;
use crate::handle::ResponseHandle;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use http::{StatusCode, Version, header};
use micro_client_proto::codec::{RequestEncoder, ResponseDecoder};
use micro_client_proto::protocol::{Message, ParseError, PayloadItem, PayloadSize, RequestHead, ResponseHead};
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, trace, warn};

type RequestMessage = Message<(RequestHead, PayloadSize), Bytes>;

/// What the actor should do after an inbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Flow {
    Continue,
    Close,
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    id: u32,
    head_request: bool,
}

/// The response currently being decoded.
struct Current {
    handle: Option<ResponseHandle>,
    received: u64,
    keep_alive: bool,
}

impl Current {
    /// Fail the response and retire the connection before the handle releases it.
    fn abort(&mut self, state: &ConnectionState, error: ClientError) -> Flow {
        state.set_unreusable();
        if let Some(handle) = self.handle.take() {
            handle.on_error(error);
        }
        Flow::Close
    }
}

pub(super) struct Http1Adapter {
    state: Arc<ConnectionState>,
    in_flight: VecDeque<Pending>,
    current: Option<Current>,
}

impl Http1Adapter {
    pub(super) fn new(state: Arc<ConnectionState>) -> Self {
        Self { state, in_flight: VecDeque::with_capacity(1), current: None }
    }

    /// A request was written for `id`; its response is expected after the earlier ones.
    pub(super) fn push(&mut self, id: u32, head_request: bool) {
        self.in_flight.push_back(Pending { id, head_request });
    }

    /// Whether the next response head to decode answers a `HEAD` request.
    pub(super) fn next_is_head(&self) -> bool {
        let index = usize::from(self.current.is_some());
        self.in_flight.get(index).is_some_and(|pending| pending.head_request)
    }

    pub(super) fn on_message(&mut self, message: Message<(ResponseHead, PayloadSize)>) -> Flow {
        match message {
            Message::Header((head, size)) => self.on_head(head, size),
            Message::Payload(item) => self.on_payload(item),
        }
    }

    fn on_head(&mut self, head: ResponseHead, size: PayloadSize) -> Flow {
        let Some(pending) = self.in_flight.front().copied() else {
            warn!(connection = self.state.id(), status = %head.status(), "response without a request, closing");
            return Flow::Close;
        };
        let handle = self.state.registry().get(pending.id);

        if head.status().is_informational() {
            if head.status() == StatusCode::CONTINUE {
                if let Some(handle) = &handle {
                    handle.on_continue();
                }
            } else {
                trace!(id = pending.id, status = %head.status(), "interim response ignored");
            }
            return Flow::Continue;
        }

        let mut current = Current { handle, received: 0, keep_alive: keep_alive(&head, size) };
        let flow = match (self.state.max_content_length(), size.length()) {
            (Some(limit), Some(length)) if length > limit => {
                debug!(id = pending.id, limit, length, "declared content length exceeds the limit");
                current.abort(&self.state, ClientError::ContentTooLarge { limit, actual: length })
            }
            _ => {
                if let Some(handle) = &current.handle {
                    handle.on_message(head);
                }
                Flow::Continue
            }
        };
        self.current = Some(current);
        flow
    }

    fn on_payload(&mut self, item: PayloadItem) -> Flow {
        let Some(current) = &mut self.current else {
            warn!(connection = self.state.id(), "payload without a response head, closing");
            return Flow::Close;
        };

        match item {
            PayloadItem::Chunk(data) => {
                current.received += data.len() as u64;
                match self.state.max_content_length() {
                    Some(limit) if current.received > limit => {
                        let actual = current.received;
                        debug!(connection = self.state.id(), limit, actual, "response content exceeds the limit");
                        current.abort(&self.state, ClientError::ContentTooLarge { limit, actual })
                    }
                    _ => {
                        if let Some(handle) = &current.handle {
                            handle.on_data(data);
                        }
                        Flow::Continue
                    }
                }
            }
            PayloadItem::Trailers(trailers) => {
                if let Some(handle) = &current.handle {
                    handle.on_trailers(trailers);
                }
                Flow::Continue
            }
            PayloadItem::Eof => {
                let keep_alive = current.keep_alive;
                let handle = current.handle.take();
                self.current = None;
                let pending = self.in_flight.pop_front();

                // decided before the handle ends, so the pool sees it on release
                if !keep_alive {
                    self.state.set_unreusable();
                }
                if let Some(handle) = handle {
                    if let Some(pending) = pending {
                        self.state.registry().remove_if(pending.id, |registered| registered.same(&handle));
                    }
                    handle.on_end();
                }

                if keep_alive && (self.state.is_reusable() || !self.in_flight.is_empty()) { Flow::Continue } else { Flow::Close }
            }
        }
    }

    /// The response stream can't be decoded any more; the connection must close.
    pub(super) fn on_decode_error(&mut self, error: ParseError) {
        warn!(connection = self.state.id(), cause = %error, "can't decode response");
        let error = ClientError::protocol(error);
        if let Some(current) = &mut self.current {
            current.abort(&self.state, error);
        } else if let Some(handle) = self.in_flight.front().and_then(|pending| self.state.registry().get(pending.id)) {
            handle.on_error(error);
        }
    }
}

/// Whether the connection survives this response.
fn keep_alive(head: &ResponseHead, size: PayloadSize) -> bool {
    if size.is_until_close() {
        return false;
    }
    let connection = head.headers().get(header::CONNECTION).and_then(|value| value.to_str().ok()).unwrap_or("");
    let has = |token: &str| connection.split(',').any(|value| value.trim().eq_ignore_ascii_case(token));
    match head.version() {
        Version::HTTP_10 => has("keep-alive"),
        _ => !has("close"),
    }
}

pub(super) async fn run(io: BoxIo, leftover: Bytes, state: Arc<ConnectionState>, mut commands: mpsc::UnboundedReceiver<Command>) {
    let (reader, writer) = tokio::io::split(io);
    let mut framed_read = FramedRead::with_capacity(reader, ResponseDecoder::new(), 8 * 1024);
    framed_read.read_buffer_mut().extend_from_slice(&leftover);
    let mut framed_write = FramedWrite::new(writer, RequestEncoder::new());
    let mut adapter = Http1Adapter::new(Arc::clone(&state));

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Start { id, head_request, outbound, ack }) => {
                    adapter.push(id, head_request);
                    framed_read.decoder_mut().set_head_request(adapter.next_is_head());
                    let result = write(&mut framed_write, outbound, &state).await;
                    if let Err(e) = result {
                        // the writer reports this failure on the handle itself
                        state.registry().remove(id);
                        debug!(connection = state.id(), id, cause = %e, "request head write failed");
                        ack.complete(Err(e));
                        break;
                    }
                    ack.complete(Ok(()));
                }
                Some(Command::Write { id, outbound, ack }) => {
                    let result = write(&mut framed_write, outbound, &state).await;
                    let failed = result.is_err();
                    ack.complete(result);
                    if failed {
                        debug!(connection = state.id(), id, "request body write failed");
                        break;
                    }
                }
                Some(Command::Close) | None => break,
            },

            message = framed_read.next() => match message {
                Some(Ok(message)) => {
                    if adapter.on_message(message) == Flow::Close {
                        break;
                    }
                    framed_read.decoder_mut().set_head_request(adapter.next_is_head());
                }
                Some(Err(e)) => {
                    adapter.on_decode_error(e);
                    break;
                }
                None => {
                    debug!(connection = state.id(), "connection closed by peer");
                    break;
                }
            },
        }
    }

    state.set_inactive();
    reject_pending(&state, &mut commands);
    state.fail_all(&ClientError::ClosedConnection);
    if let Err(e) = framed_write.get_mut().shutdown().await {
        trace!(connection = state.id(), cause = %e, "shutdown failed");
    }
}

async fn write<W: AsyncWrite + Unpin>(
    framed: &mut FramedWrite<W, RequestEncoder>,
    outbound: Vec<Outbound>,
    state: &ConnectionState,
) -> Result<(), ClientError> {
    for item in outbound {
        match item {
            Outbound::Head { head, size, end_stream } => {
                framed.feed(RequestMessage::Header((head, size))).await?;
                if end_stream {
                    framed.feed(RequestMessage::Payload(PayloadItem::Eof)).await?;
                }
            }
            Outbound::Data { data, end_stream } => {
                framed.feed(RequestMessage::Payload(PayloadItem::Chunk(data))).await?;
                if end_stream {
                    framed.feed(RequestMessage::Payload(PayloadItem::Eof)).await?;
                }
            }
            Outbound::File { file, len, end_stream } => {
                SinkExt::<RequestMessage>::flush(framed).await?;
                let mut reader = file.take(len);
                let copied = tokio::io::copy(&mut reader, framed.get_mut()).await.map_err(ClientError::io)?;
                framed.encoder_mut().advance_body(copied)?;
                if copied < len {
                    let e = io::Error::new(io::ErrorKind::UnexpectedEof, format!("file ended after {copied} of {len} bytes"));
                    return Err(ClientError::io(e));
                }
                if end_stream {
                    framed.feed(RequestMessage::Payload(PayloadItem::Eof)).await?;
                }
            }
            Outbound::Trailers(trailers) => {
                framed.feed(RequestMessage::Payload(PayloadItem::Trailers(trailers))).await?;
                framed.feed(RequestMessage::Payload(PayloadItem::Eof)).await?;
            }
            Outbound::End => framed.feed(RequestMessage::Payload(PayloadItem::Eof)).await?,
            Outbound::Reset(code) => {
                // HTTP/1 can't abandon a body that was announced, the connection goes after the response
                debug!(connection = state.id(), %code, "request body abandoned");
                state.set_unreusable();
            }
        }
    }
    SinkExt::<RequestMessage>::flush(framed).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::tests::{destination, duplex_connection, new_handle, settings};
    use crate::conn::{HandleRegistry, Protocol, acked};
    use crate::context::RequestContext;
    use crate::listener::NoopListener;
    use bytes::BytesMut;
    use http::{Method, Uri};
    use indoc::indoc;
    use std::io::Write as _;
    use tokio::io::AsyncWriteExt as _;
    use tokio::sync::oneshot;
    use tokio_util::codec::Decoder;

    fn adapter_with_limit(limit: Option<u64>) -> Http1Adapter {
        let mut settings = settings();
        settings.max_content_length = limit;
        let state = ConnectionState::new(Protocol::Http1, false, destination(), HandleRegistry::reusing(), &settings);
        Http1Adapter::new(Arc::new(state))
    }

    fn feed(adapter: &mut Http1Adapter, raw: &str) -> Vec<Flow> {
        let mut decoder = ResponseDecoder::new();
        let mut buf = BytesMut::from(raw);
        let mut flows = Vec::new();
        while let Some(message) = decoder.decode(&mut buf).unwrap() {
            let flow = adapter.on_message(message);
            flows.push(flow);
            if flow == Flow::Close {
                break;
            }
        }
        flows
    }

    async fn read_head(server: &mut tokio::io::DuplexStream) -> String {
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        while !buf.ends_with(b"\r\n\r\n") {
            server.read_exact(&mut byte).await.unwrap();
            buf.push(byte[0]);
        }
        String::from_utf8(buf).unwrap()
    }

    #[tokio::test]
    async fn declared_oversize_fails_without_data() {
        let mut adapter = adapter_with_limit(Some(4));
        let data_seen = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let context = RequestContext::new();
        let seen = Arc::clone(&data_seen);
        context.set_callbacks(crate::ResponseCallbacks::new().on_data(move |_| seen.store(true, std::sync::atomic::Ordering::SeqCst)));
        let (handle, receiver) = ResponseHandle::new(Arc::new(context), Arc::new(NoopListener), None);
        let id = adapter.state.registry().put(handle).unwrap();
        adapter.push(id, false);

        let flows = feed(&mut adapter, "HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n0123456789");
        assert_eq!(flows, vec![Flow::Close]);
        assert!(!adapter.state.is_reusable());
        assert!(matches!(receiver.await.unwrap(), Err(ClientError::ContentTooLarge { limit: 4, actual: 10 })));
        assert!(!data_seen.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn chunked_oversize_is_tracked_cumulatively() {
        let mut adapter = adapter_with_limit(Some(4));
        let (handle, receiver) = new_handle();
        let id = adapter.state.registry().put(handle).unwrap();
        adapter.push(id, false);

        let flows = feed(&mut adapter, "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n3\r\ndef\r\n0\r\n\r\n");
        assert_eq!(flows.last(), Some(&Flow::Close));
        assert!(!adapter.state.is_reusable());
        assert!(matches!(receiver.await.unwrap(), Err(ClientError::ContentTooLarge { limit: 4, actual: 6 })));
    }

    #[tokio::test]
    async fn decode_error_retires_the_connection() {
        let mut adapter = adapter_with_limit(None);
        let (handle, receiver) = new_handle();
        let id = adapter.state.registry().put(handle).unwrap();
        adapter.push(id, false);

        let flows = feed(&mut adapter, "HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nab");
        assert_eq!(flows, vec![Flow::Continue, Flow::Continue]);
        adapter.on_decode_error(ParseError::invalid_body("bad framing"));

        assert!(!adapter.state.is_reusable());
        assert!(matches!(receiver.await.unwrap(), Err(ClientError::Protocol(_))));
    }

    #[tokio::test]
    async fn interim_continue_fires_the_deferred_body() {
        let mut adapter = adapter_with_limit(None);
        let (handle, receiver) = new_handle();
        let (tx, mut continue_rx) = oneshot::channel();
        handle.context().set_continue(tx);
        let id = adapter.state.registry().put(handle).unwrap();
        adapter.push(id, false);

        feed(&mut adapter, "HTTP/1.1 100 Continue\r\n\r\n");
        assert!(continue_rx.try_recv().is_ok());

        feed(&mut adapter, "HTTP/1.1 201 Created\r\nContent-Length: 2\r\n\r\nok");
        let response = receiver.await.unwrap().unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.body().as_ref(), b"ok");
    }

    #[tokio::test]
    async fn connection_close_response_ends_the_connection() {
        let mut adapter = adapter_with_limit(None);
        let (handle, receiver) = new_handle();
        let id = adapter.state.registry().put(handle).unwrap();
        adapter.push(id, false);

        let flows = feed(&mut adapter, "HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: 0\r\n\r\n");
        assert_eq!(flows.last(), Some(&Flow::Close));
        assert!(!adapter.state.is_reusable());
        assert!(receiver.await.unwrap().is_ok());
    }

    #[test]
    fn keep_alive_by_version() {
        let mut head = ResponseHead::new(());
        assert!(keep_alive(&head, PayloadSize::Empty));
        assert!(!keep_alive(&head, PayloadSize::UntilClose));

        *head.version_mut() = Version::HTTP_10;
        assert!(!keep_alive(&head, PayloadSize::Empty));
        head.headers_mut().insert(header::CONNECTION, "Keep-Alive".parse().unwrap());
        assert!(keep_alive(&head, PayloadSize::Empty));
    }

    #[tokio::test]
    async fn request_and_response_over_a_socket() {
        let (connection, mut server) = duplex_connection(Protocol::Http1);
        let (handle, receiver) = new_handle();

        let mut head = RequestHead::new(Method::POST, Uri::from_static("http://example.com/echo"));
        head.headers_mut().insert(header::HOST, "example.com".parse().unwrap());
        let outbound = vec![
            Outbound::Head { head, size: PayloadSize::Length(5), end_stream: false },
            Outbound::Data { data: Bytes::from_static(b"hello"), end_stream: true },
        ];
        let ack = connection.begin(&handle, false, outbound).unwrap();
        assert!(acked(ack).await.is_ok());

        let request = read_head(&mut server).await;
        assert!(request.starts_with("POST /echo HTTP/1.1\r\n"));
        let mut body = [0u8; 5];
        server.read_exact(&mut body).await.unwrap();
        assert_eq!(&body, b"hello");

        let response = indoc! {"
            HTTP/1.1 200 OK\r
            Transfer-Encoding: chunked\r
            \r
            5\r
            world\r
            0\r
            x-checksum: 42\r
            \r
        "};
        server.write_all(response.as_bytes()).await.unwrap();

        let response = receiver.await.unwrap().unwrap();
        assert_eq!(response.body().as_ref(), b"world");
        assert_eq!(response.trailers().unwrap().get("x-checksum").unwrap(), "42");
        assert!(connection.is_active());
    }

    #[tokio::test]
    async fn peer_close_fails_pending_response() {
        let (connection, mut server) = duplex_connection(Protocol::Http1);
        let (handle, receiver) = new_handle();

        let head = RequestHead::new(Method::GET, Uri::from_static("http://example.com/"));
        let ack = connection.begin(&handle, false, vec![Outbound::Head { head, size: PayloadSize::Empty, end_stream: true }]).unwrap();
        acked(ack).await.unwrap();
        read_head(&mut server).await;

        drop(server);

        assert!(matches!(receiver.await.unwrap(), Err(ClientError::ClosedConnection)));
        tokio::task::yield_now().await;
        assert!(!connection.is_active());
    }

    #[tokio::test]
    async fn plaintext_file_is_copied_into_the_socket() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"file body").unwrap();
        let (connection, mut server) = duplex_connection(Protocol::Http1);
        let (handle, _receiver) = new_handle();

        let head = RequestHead::new(Method::PUT, Uri::from_static("http://example.com/upload"));
        let file = tokio::fs::File::open(file.path()).await.unwrap();
        let outbound = vec![
            Outbound::Head { head, size: PayloadSize::Length(9), end_stream: false },
            Outbound::File { file, len: 9, end_stream: true },
        ];
        acked(connection.begin(&handle, false, outbound).unwrap()).await.unwrap();

        let request = read_head(&mut server).await;
        assert!(request.contains("content-length: 9\r\n"));
        let mut body = [0u8; 9];
        server.read_exact(&mut body).await.unwrap();
        assert_eq!(&body, b"file body");
    }
}
