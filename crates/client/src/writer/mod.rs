//! Request writers: one per payload shape, all sharing the same head template.
//!
//! A writer normalizes the request head for the connection's protocol, starts
//! the request on the connection and then sends the body. With
//! `Expect: 100-continue` the body is held back until the connection sees the
//! interim response, the read timeout passes, or a final response makes the
//! body unnecessary.

mod segment;

pub use segment::SegmentChannel;

use crate::conn::{Outbound, PooledConnection, Protocol, acked};
use crate::handle::ResponseHandle;
use crate::listener::EventListener;
use crate::multipart::{EncodedForm, FormSegment};
use crate::request::Payload;
use crate::{ClientError, Destination};
use bytes::{Bytes, BytesMut};
use http::{HeaderName, HeaderValue, Method, header};
use micro_client_proto::codec::h2::ErrorCode;
use micro_client_proto::protocol::{PayloadSize, RequestHead};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::oneshot;
use tracing::{debug, trace};

const FILE_CHUNK_SIZE: usize = 64 * 1024;

/// The body of one request attempt, resolved from its [`Payload`].
#[derive(Debug)]
pub(crate) enum RequestWriter {
    Plain(Bytes),
    File { path: PathBuf, len: u64 },
    Multipart(EncodedForm),
    Segment(SegmentChannel),
}

/// Everything a writer needs from the transceiver.
pub(crate) struct WriteContext<'a> {
    pub(crate) connection: &'a PooledConnection,
    pub(crate) handle: &'a ResponseHandle,
    pub(crate) head: RequestHead,
    pub(crate) keep_alive: bool,
    pub(crate) listener: &'a dyn EventListener,
}

/// Where a write failed; decides whether the failure is safe to retry.
#[derive(Debug)]
pub(crate) enum WriteFailure {
    /// The head never made it out, the peer saw nothing of this request.
    Header(ClientError),
    /// The head went out, part of the body may have too.
    Body(ClientError),
}

impl WriteFailure {
    pub(crate) fn into_error(self) -> ClientError {
        match self {
            Self::Header(e) => e.into_connect_class(),
            Self::Body(e) => e,
        }
    }
}

impl RequestWriter {
    pub(crate) async fn for_payload(payload: &Payload) -> Result<Self, ClientError> {
        Ok(match payload {
            Payload::Empty => Self::Plain(Bytes::new()),
            Payload::Buffer(data) => Self::Plain(data.clone()),
            Payload::File(path) => {
                let len = tokio::fs::metadata(path).await.map_err(ClientError::io)?.len();
                Self::File { path: path.clone(), len }
            }
            Payload::Form(form) => Self::Multipart(form.encode().await?),
            Payload::Segment(channel) => Self::Segment(channel.clone()),
        })
    }

    pub(crate) fn payload_size(&self) -> PayloadSize {
        let length = match self {
            Self::Plain(data) => data.len() as u64,
            Self::File { len, .. } => *len,
            Self::Multipart(form) => form.length,
            Self::Segment(channel) => return channel.payload_size(),
        };
        if length == 0 { PayloadSize::Empty } else { PayloadSize::Length(length) }
    }

    /// Write the request and its body on `cx.connection`.
    ///
    /// On success the request is registered and its head and body, where the
    /// writer owns it, are on the wire. A streamed body is only bound to the
    /// connection; the caller's writes complete it.
    pub(crate) async fn write(self, cx: WriteContext<'_>) -> Result<(), WriteFailure> {
        let connection = cx.connection;
        let size = self.payload_size();
        let mut head = cx.head;
        prepare_head(&mut head, connection.destination(), connection.protocol(), cx.keep_alive, size)
            .map_err(WriteFailure::Header)?;

        let end_stream = size.is_empty();
        let expect = !end_stream && expects_continue(&head);
        let head_request = head.method() == Method::HEAD;
        cx.listener.on_write_attempt(&head);
        let written = head.clone();

        let continue_rx = expect.then(|| {
            let (tx, rx) = oneshot::channel();
            cx.handle.context().set_continue(tx);
            rx
        });

        let mut first = vec![Outbound::Head { head, size, end_stream }];
        let deferred = match self {
            _ if end_stream => None,
            Self::Plain(data) if !expect => {
                first.push(Outbound::Data { data, end_stream: true });
                None
            }
            writer => Some(writer),
        };

        let started = connection.begin(cx.handle, head_request, first).map_err(WriteFailure::Header)?;
        acked(started).await.map_err(WriteFailure::Header)?;
        let id = cx.handle.id();
        trace!(connection = connection.id(), id, ?size, expect, "request head written");

        if let Some(writer) = deferred {
            if let Some(rx) = continue_rx
                && !await_continue(rx, cx.handle.context().read_timeout()).await
            {
                debug!(connection = connection.id(), id, "final response arrived before 100-continue, body dropped");
                // the announced body will never follow; a stream that already ended refuses the reset
                let _ = acked(connection.write(id, vec![Outbound::Reset(ErrorCode::CANCEL)])).await;
                if let Self::Segment(channel) = writer {
                    channel.close();
                }
                return Ok(());
            }
            writer.write_body(connection, id).await.map_err(WriteFailure::Body)?;
        }

        cx.listener.on_write_done(&written);
        Ok(())
    }

    async fn write_body(self, connection: &PooledConnection, id: u32) -> Result<(), ClientError> {
        match self {
            Self::Plain(data) => acked(connection.write(id, vec![Outbound::Data { data, end_stream: true }])).await,
            Self::File { path, len } => send_file(connection, id, &path, len, true).await,
            Self::Multipart(form) => {
                let last = form.segments.len().saturating_sub(1);
                if form.segments.is_empty() {
                    return acked(connection.write(id, vec![Outbound::End])).await;
                }
                for (index, segment) in form.segments.into_iter().enumerate() {
                    let end_stream = index == last;
                    match segment {
                        FormSegment::Bytes(data) => {
                            acked(connection.write(id, vec![Outbound::Data { data, end_stream }])).await?;
                        }
                        FormSegment::File { path, len } => send_file(connection, id, &path, len, end_stream).await?,
                    }
                }
                Ok(())
            }
            Self::Segment(channel) => channel.bind(connection, id),
        }
    }
}

/// Wait for the interim response. `false` means the body is not wanted.
async fn await_continue(rx: oneshot::Receiver<()>, read_timeout: Option<Duration>) -> bool {
    match read_timeout {
        Some(timeout) => match tokio::time::timeout(timeout, rx).await {
            Ok(result) => result.is_ok(),
            Err(_elapsed) => {
                trace!(?timeout, "no 100-continue within the read timeout, sending the body");
                true
            }
        },
        None => rx.await.is_ok(),
    }
}

pub(crate) fn expects_continue(head: &RequestHead) -> bool {
    head.headers()
        .get(header::EXPECT)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.trim().eq_ignore_ascii_case("100-continue"))
}

/// The template every writer applies to the head before it goes out.
fn prepare_head(
    head: &mut RequestHead,
    destination: &Destination,
    protocol: Protocol,
    keep_alive: bool,
    size: PayloadSize,
) -> Result<(), ClientError> {
    if !head.headers().contains_key(header::HOST) {
        let host = destination.host_header()?;
        head.headers_mut().insert(header::HOST, host);
    }
    match protocol {
        // the HTTP/1 encoder frames the body from `size`
        Protocol::Http1 => {
            if !keep_alive && !head.headers().contains_key(header::CONNECTION) {
                head.headers_mut().insert(header::CONNECTION, HeaderValue::from_static("close"));
            }
        }
        Protocol::Http2 => {
            let expects_body = head.expects_body();
            let headers = head.headers_mut();
            for name in [header::CONNECTION, header::TRANSFER_ENCODING, header::UPGRADE] {
                headers.remove(name);
            }
            headers.remove(HeaderName::from_static("proxy-connection"));
            headers.remove(HeaderName::from_static("keep-alive"));
            match size {
                PayloadSize::Length(n) => {
                    headers.insert(header::CONTENT_LENGTH, n.into());
                }
                PayloadSize::Empty if expects_body => {
                    headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("0"));
                }
                _ => {}
            }
        }
    }
    Ok(())
}

/// Stream `len` bytes of the file at `path`.
///
/// A plaintext HTTP/1 socket takes the file directly; otherwise the file is
/// read in chunks, each waiting for the previous one to be written.
async fn send_file(connection: &PooledConnection, id: u32, path: &Path, len: u64, end_stream: bool) -> Result<(), ClientError> {
    let file = tokio::fs::File::open(path).await.map_err(ClientError::io)?;
    if connection.protocol() == Protocol::Http1 && !connection.is_secure() {
        return acked(connection.write(id, vec![Outbound::File { file, len, end_stream }])).await;
    }

    if len == 0 {
        return if end_stream { acked(connection.write(id, vec![Outbound::End])).await } else { Ok(()) };
    }
    let mut reader = file.take(len);
    let mut remaining = len;
    while remaining > 0 {
        let capacity = usize::try_from(remaining).map_or(FILE_CHUNK_SIZE, |remaining| remaining.min(FILE_CHUNK_SIZE));
        let mut buf = BytesMut::with_capacity(capacity);
        let n = reader.read_buf(&mut buf).await.map_err(ClientError::io)?;
        if n == 0 {
            let e = io::Error::new(io::ErrorKind::UnexpectedEof, format!("{} ended {remaining} bytes early", path.display()));
            return Err(ClientError::io(e));
        }
        remaining -= n as u64;
        let data = Outbound::Data { data: buf.freeze(), end_stream: end_stream && remaining == 0 };
        acked(connection.write(id, vec![data])).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::tests::{duplex_connection, new_handle};
    use crate::listener::NoopListener;
    use crate::multipart::Form;
    use http::Uri;
    use indoc::indoc;
    use std::io::Write as _;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn head(method: Method, expect: bool) -> RequestHead {
        let mut head = RequestHead::new(method, Uri::from_static("http://example.com:8080/upload"));
        if expect {
            head.headers_mut().insert(header::EXPECT, HeaderValue::from_static("100-continue"));
        }
        head
    }

    async fn read_until(server: &mut tokio::io::DuplexStream, needle: &str) -> String {
        let mut received = String::new();
        let mut buf = [0u8; 1024];
        while !received.contains(needle) {
            let n = server.read(&mut buf).await.unwrap();
            assert!(n > 0, "connection closed before {needle:?}, got {received:?}");
            received.push_str(std::str::from_utf8(&buf[..n]).unwrap());
        }
        received
    }

    #[test]
    fn template_adds_host_and_close() {
        let destination = Destination::new(http::uri::Scheme::HTTP, "example.com", 8080);
        let mut h1 = head(Method::GET, false);
        prepare_head(&mut h1, &destination, Protocol::Http1, false, PayloadSize::Empty).unwrap();
        assert_eq!(h1.headers()[header::HOST], "example.com:8080");
        assert_eq!(h1.headers()[header::CONNECTION], "close");

        let mut h2 = head(Method::POST, false);
        h2.headers_mut().insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        prepare_head(&mut h2, &destination, Protocol::Http2, true, PayloadSize::Length(3)).unwrap();
        assert!(!h2.headers().contains_key(header::CONNECTION));
        assert_eq!(h2.headers()[header::CONTENT_LENGTH], "3");
    }

    #[test]
    fn http2_drops_every_connection_specific_header() {
        let destination = Destination::new(http::uri::Scheme::HTTPS, "example.com", 443);
        let mut h2 = head(Method::POST, false);
        for (name, value) in [("proxy-connection", "keep-alive"), ("keep-alive", "timeout=5"), ("upgrade", "h2c")] {
            h2.headers_mut().insert(HeaderName::from_static(name), HeaderValue::from_static(value));
        }
        prepare_head(&mut h2, &destination, Protocol::Http2, true, PayloadSize::Empty).unwrap();

        for name in ["proxy-connection", "keep-alive", "upgrade", "transfer-encoding"] {
            assert!(!h2.headers().contains_key(name), "{name} survived");
        }
        assert_eq!(h2.headers()[header::CONTENT_LENGTH], "0");
    }

    #[test]
    fn header_failures_are_connect_class() {
        let broken = || ClientError::io(io::Error::from(io::ErrorKind::BrokenPipe));
        assert!(WriteFailure::Header(broken()).into_error().is_connect_class());
        assert!(!WriteFailure::Body(broken()).into_error().is_connect_class());
    }

    #[tokio::test]
    async fn plain_body_follows_the_head() {
        let (connection, mut server) = duplex_connection(Protocol::Http1);
        let (handle, _response) = new_handle();
        let cx = WriteContext { connection: &connection, handle: &handle, head: head(Method::POST, false), keep_alive: true, listener: &NoopListener };

        RequestWriter::Plain(Bytes::from_static(b"hello")).write(cx).await.unwrap();
        let received = read_until(&mut server, "hello").await;
        assert!(received.starts_with("POST /upload HTTP/1.1\r\n"));
        assert!(received.contains("content-length: 5\r\n"));
        assert!(received.contains("host: example.com\r\n"));
    }

    #[tokio::test]
    async fn expect_continue_holds_the_body() {
        let (connection, mut server) = duplex_connection(Protocol::Http1);
        let (handle, response) = new_handle();

        let write = {
            let connection = connection.clone();
            let handle = handle.clone();
            tokio::spawn(async move {
                let cx = WriteContext { connection: &connection, handle: &handle, head: head(Method::PUT, true), keep_alive: true, listener: &NoopListener };
                RequestWriter::Plain(Bytes::from_static(b"payload")).write(cx).await
            })
        };

        let received = read_until(&mut server, "\r\n\r\n").await;
        assert!(received.ends_with("\r\n\r\n"), "body sent before 100-continue: {received:?}");
        assert!(!write.is_finished());

        server.write_all(b"HTTP/1.1 100 Continue\r\n\r\n").await.unwrap();
        read_until(&mut server, "payload").await;
        write.await.unwrap().unwrap();

        server.write_all(b"HTTP/1.1 204 No Content\r\n\r\n").await.unwrap();
        let response = response.await.unwrap().unwrap();
        assert_eq!(response.status(), http::StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn final_response_cancels_the_deferred_body() {
        let (connection, mut server) = duplex_connection(Protocol::Http1);
        let (handle, response) = new_handle();

        let write = {
            let connection = connection.clone();
            let handle = handle.clone();
            tokio::spawn(async move {
                let cx = WriteContext { connection: &connection, handle: &handle, head: head(Method::PUT, true), keep_alive: true, listener: &NoopListener };
                RequestWriter::Plain(Bytes::from_static(b"payload")).write(cx).await
            })
        };
        read_until(&mut server, "\r\n\r\n").await;

        let refusal = indoc! {"
            HTTP/1.1 417 Expectation Failed\r
            content-length: 0\r
            \r
        "};
        server.write_all(refusal.as_bytes()).await.unwrap();
        write.await.unwrap().unwrap();
        assert_eq!(response.await.unwrap().unwrap().status(), http::StatusCode::EXPECTATION_FAILED);
        assert!(!connection.is_reusable());
    }

    #[tokio::test]
    async fn file_length_comes_from_metadata() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&vec![b'x'; FILE_CHUNK_SIZE + 10]).unwrap();
        let writer = RequestWriter::for_payload(&Payload::File(file.path().to_owned())).await.unwrap();
        assert_eq!(writer.payload_size(), PayloadSize::Length(FILE_CHUNK_SIZE as u64 + 10));
    }

    #[tokio::test]
    async fn multipart_segments_are_streamed_in_order() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"file-content").unwrap();
        let form = Form::new().text("name", "value").file("upload", file.path());
        let writer = RequestWriter::for_payload(&Payload::Form(form)).await.unwrap();
        let PayloadSize::Length(length) = writer.payload_size() else { panic!("form length is known") };

        let (connection, mut server) = duplex_connection(Protocol::Http1);
        let (handle, _response) = new_handle();
        let cx = WriteContext { connection: &connection, handle: &handle, head: head(Method::POST, false), keep_alive: true, listener: &NoopListener };
        writer.write(cx).await.unwrap();

        let received = read_until(&mut server, "--\r\n").await;
        let (head, body) = received.split_once("\r\n\r\n").unwrap();
        assert!(head.contains(&format!("content-length: {length}")));
        assert_eq!(body.len() as u64, length);
        assert!(body.find("value").unwrap() < body.find("file-content").unwrap());
    }

    #[tokio::test]
    async fn empty_body_ends_with_the_head() {
        let (connection, mut server) = duplex_connection(Protocol::Http1);
        let (handle, _response) = new_handle();
        let cx = WriteContext { connection: &connection, handle: &handle, head: head(Method::GET, true), keep_alive: true, listener: &NoopListener };

        RequestWriter::Plain(Bytes::new()).write(cx).await.unwrap();
        let received = read_until(&mut server, "\r\n\r\n").await;
        assert!(received.starts_with("GET /upload HTTP/1.1\r\n"));
        assert!(!handle.context().fire_continue());
    }
}
