//! The HTTP/2 connection actor and its frame adapter.
//!
//! [`Http2Connection`] is sans-IO: it turns commands into frames in a write
//! buffer and inbound frames into handle events. The actor in [`run`] moves
//! bytes between it and the socket.
//!
//! Received DATA is credited back right away, so the receive windows never
//! close. The send side honours the peer's connection and stream windows and
//! queues DATA until a WINDOW_UPDATE makes room.

use super::{Command, ConnectionState, Outbound, WriteAck, reject_pending};
use crate::ClientError;
use crate::config::Http2Options;
use crate::connect::BoxIo;
use crate::handle::ResponseHandle;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use http::{HeaderMap, StatusCode, Version, header};
use micro_client_proto::codec::h2::{
    DEFAULT_WINDOW_SIZE, ErrorCode, Frame, FrameCodec, HeaderBlock, HpackDecoder, HpackEncoder, MAX_WINDOW_SIZE, PREFACE,
    Settings,
};
use micro_client_proto::protocol::{H2Error, ResponseHead};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::codec::{Encoder, FramedRead};
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Flow {
    Continue,
    Close,
}

enum Chunk {
    Data { data: Bytes, end_stream: bool },
    Trailers(HeaderMap),
}

struct PendingChunk {
    chunk: Chunk,
    ack: Option<WriteAck>,
}

struct Stream {
    send_window: i64,
    pending: VecDeque<PendingChunk>,
    head_received: bool,
    received: u64,
    local_closed: bool,
    remote_closed: bool,
}

impl Stream {
    fn new(send_window: i64) -> Self {
        Self {
            send_window,
            pending: VecDeque::new(),
            head_received: false,
            received: 0,
            local_closed: false,
            remote_closed: false,
        }
    }
}

pub(super) struct Http2Connection {
    state: Arc<ConnectionState>,
    codec: FrameCodec,
    write_buf: BytesMut,
    encoder: HpackEncoder,
    decoder: HpackDecoder,
    scheme: &'static str,
    local: Settings,
    connection_window: u32,
    send_window: i64,
    peer_initial_window: i64,
    streams: HashMap<u32, Stream>,
    completed: Vec<WriteAck>,
    going_away: bool,
}

impl Http2Connection {
    pub(super) fn new(state: Arc<ConnectionState>, options: &Http2Options) -> Self {
        let scheme = if state.secure { "https" } else { "http" };
        let local = Settings {
            enable_push: Some(options.enable_push),
            initial_window_size: Some(options.initial_stream_window_size.min(MAX_WINDOW_SIZE)),
            max_frame_size: Some(options.max_frame_size),
            ..Settings::default()
        };
        Self {
            state,
            codec: FrameCodec::new(),
            write_buf: BytesMut::with_capacity(16 * 1024),
            encoder: HpackEncoder::new(),
            decoder: HpackDecoder::new(),
            scheme,
            local,
            connection_window: options.initial_connection_window_size.min(MAX_WINDOW_SIZE),
            send_window: i64::from(DEFAULT_WINDOW_SIZE),
            peer_initial_window: i64::from(DEFAULT_WINDOW_SIZE),
            streams: HashMap::new(),
            completed: Vec::new(),
            going_away: false,
        }
    }

    /// The client connection preface: magic, SETTINGS and the connection window.
    pub(super) fn preface(&mut self) -> Result<(), H2Error> {
        self.write_buf.extend_from_slice(PREFACE);
        let settings = self.local.to_frame();
        self.encode(settings)?;
        if self.connection_window > DEFAULT_WINDOW_SIZE {
            let increment = self.connection_window - DEFAULT_WINDOW_SIZE;
            self.encode(Frame::WindowUpdate { stream_id: 0, increment })?;
        }
        Ok(())
    }

    /// Open stream `id` and write its first outbound items.
    pub(super) fn start(&mut self, id: u32, outbound: Vec<Outbound>, ack: WriteAck) -> Result<(), H2Error> {
        if self.going_away {
            if let Some(handle) = self.state.registry().remove(id) {
                handle.on_error(ClientError::ClosedConnection);
            }
            ack.complete(Err(ClientError::ClosedConnection));
            return Ok(());
        }
        self.streams.insert(id, Stream::new(self.peer_initial_window));
        self.write(id, outbound, ack)
    }

    pub(super) fn write(&mut self, id: u32, outbound: Vec<Outbound>, ack: WriteAck) -> Result<(), H2Error> {
        if !self.streams.contains_key(&id) {
            ack.complete(Err(ClientError::ClosedStream { stream_id: id, code: ErrorCode::STREAM_CLOSED }));
            return Ok(());
        }

        let mut queued = false;
        for item in outbound {
            match item {
                Outbound::Head { head, end_stream, .. } => {
                    let block = self.encoder.encode_request(&head, self.scheme);
                    self.encode(Frame::Headers { stream_id: id, block, end_stream })?;
                    if end_stream {
                        self.close_local(id);
                    }
                }
                Outbound::Data { data, end_stream } => queued |= self.queue(id, Chunk::Data { data, end_stream }),
                Outbound::End => queued |= self.queue(id, Chunk::Data { data: Bytes::new(), end_stream: true }),
                Outbound::Trailers(trailers) => queued |= self.queue(id, Chunk::Trailers(trailers)),
                Outbound::File { .. } => {
                    ack.complete(Err(ClientError::invalid_request("file transfer over HTTP/2 must be sent as data")));
                    return Ok(());
                }
                Outbound::Reset(code) => {
                    self.reset(id, code)?;
                    ack.complete(Ok(()));
                    return Ok(());
                }
            }
        }

        match self.streams.get_mut(&id).and_then(|stream| stream.pending.back_mut()) {
            Some(last) if queued => last.ack = Some(ack),
            _ => self.completed.push(ack),
        }
        self.flush_pending()
    }

    fn queue(&mut self, id: u32, chunk: Chunk) -> bool {
        match self.streams.get_mut(&id) {
            Some(stream) => {
                stream.pending.push_back(PendingChunk { chunk, ack: None });
                true
            }
            None => false,
        }
    }

    /// Send as much queued data as the flow-control windows allow.
    fn flush_pending(&mut self) -> Result<(), H2Error> {
        for (&id, stream) in &mut self.streams {
            while let Some(front) = stream.pending.front_mut() {
                let finished = match &mut front.chunk {
                    Chunk::Data { data, end_stream } if data.is_empty() => {
                        self.codec.encode(Frame::Data { stream_id: id, data: Bytes::new(), end_stream: *end_stream }, &mut self.write_buf)?;
                        *end_stream
                    }
                    Chunk::Data { data, end_stream } => {
                        let window = self.send_window.min(stream.send_window);
                        if window <= 0 {
                            trace!(stream_id = id, "send window exhausted");
                            break;
                        }
                        let n = usize::try_from(window).unwrap_or(usize::MAX).min(data.len());
                        let part = data.split_to(n);
                        let end = data.is_empty() && *end_stream;
                        self.codec.encode(Frame::Data { stream_id: id, data: part, end_stream: end }, &mut self.write_buf)?;
                        self.send_window -= n as i64;
                        stream.send_window -= n as i64;
                        if !data.is_empty() {
                            continue;
                        }
                        end
                    }
                    Chunk::Trailers(trailers) => {
                        let block = self.encoder.encode_trailers(trailers);
                        self.codec.encode(Frame::Headers { stream_id: id, block, end_stream: true }, &mut self.write_buf)?;
                        true
                    }
                };

                if let Some(done) = stream.pending.pop_front()
                    && let Some(ack) = done.ack
                {
                    self.completed.push(ack);
                }
                if finished {
                    stream.local_closed = true;
                }
            }
        }
        self.streams.retain(|_, stream| !(stream.local_closed && stream.remote_closed));
        Ok(())
    }

    pub(super) fn on_frame(&mut self, frame: Frame) -> Result<Flow, H2Error> {
        match frame {
            Frame::Headers { stream_id, block, end_stream } => {
                let block = self.decoder.decode(&block)?;
                self.on_headers(stream_id, block, end_stream)?;
            }
            Frame::Data { stream_id, data, end_stream } => self.on_data(stream_id, data, end_stream)?,
            Frame::RstStream { stream_id, error_code } => {
                debug!(connection = self.state.id(), stream_id, code = %error_code, "stream reset by peer");
                self.streams.remove(&stream_id);
                if let Some(handle) = self.state.registry().remove(stream_id) {
                    handle.on_error(ClientError::ClosedStream { stream_id, code: error_code });
                }
            }
            Frame::Settings { ack: false, settings } => {
                let settings = Settings::from_pairs(&settings)?;
                self.apply_settings(&settings)?;
                self.encode(Frame::settings_ack())?;
                self.flush_pending()?;
            }
            Frame::Settings { ack: true, .. } => trace!(connection = self.state.id(), "settings acknowledged"),
            Frame::Ping { ack: false, payload } => self.encode(Frame::Ping { ack: true, payload })?,
            Frame::Ping { ack: true, .. } => {}
            Frame::GoAway { last_stream_id, error_code, debug_data } => {
                debug!(
                    connection = self.state.id(),
                    last_stream_id,
                    code = %error_code,
                    debug_data = %String::from_utf8_lossy(&debug_data),
                    "received GOAWAY"
                );
                self.going_away = true;
                self.state.set_inactive();
                for (_, handle) in self.state.registry().remove_where(|id| id > last_stream_id) {
                    handle.on_error(ClientError::ClosedConnection);
                }
                self.streams.retain(|&id, _| id <= last_stream_id);
                if self.streams.is_empty() {
                    return Ok(Flow::Close);
                }
            }
            Frame::WindowUpdate { stream_id: 0, increment } => {
                self.send_window += i64::from(increment);
                if self.send_window > i64::from(MAX_WINDOW_SIZE) {
                    return Err(H2Error::with_code(ErrorCode::FLOW_CONTROL_ERROR, "connection window overflow"));
                }
                self.flush_pending()?;
            }
            Frame::WindowUpdate { stream_id, increment } => {
                let overflow = match self.streams.get_mut(&stream_id) {
                    Some(stream) => {
                        stream.send_window += i64::from(increment);
                        stream.send_window > i64::from(MAX_WINDOW_SIZE)
                    }
                    None => false,
                };
                if overflow {
                    self.abort(stream_id, ErrorCode::FLOW_CONTROL_ERROR, ClientError::protocol("stream window overflow"))?;
                }
                self.flush_pending()?;
            }
            Frame::PushPromise { stream_id, promised_id, block } => {
                // decoded anyway, the header table is shared by the connection;
                // request pseudo-headers in the block are not an error here
                if let Err(e @ H2Error::Hpack { .. }) = self.decoder.decode(&block) {
                    return Err(e);
                }
                if self.streams.contains_key(&promised_id) || self.state.registry().contains(promised_id) {
                    return Err(H2Error::protocol(format!("push promise on stream {stream_id} targets active stream {promised_id}")));
                }
                trace!(stream_id, promised_id, "refusing pushed stream");
                self.encode(Frame::RstStream { stream_id: promised_id, error_code: ErrorCode::CANCEL })?;
            }
            Frame::Priority { .. } | Frame::Unknown { .. } => {}
        }
        Ok(Flow::Continue)
    }

    fn on_headers(&mut self, stream_id: u32, block: HeaderBlock, end_stream: bool) -> Result<(), H2Error> {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            trace!(stream_id, "headers for an unknown stream ignored");
            return Ok(());
        };
        let handle = self.state.registry().get(stream_id);

        if stream.head_received {
            if !end_stream {
                return self.abort(stream_id, ErrorCode::PROTOCOL_ERROR, ClientError::protocol("trailers without END_STREAM"));
            }
            stream.remote_closed = true;
            if let Some(handle) = handle {
                handle.on_trailers(block.fields);
                self.end(stream_id, &handle);
            }
            return self.flush_pending();
        }

        let Some(status) = block.status else {
            return self.abort(stream_id, ErrorCode::PROTOCOL_ERROR, ClientError::protocol("response without :status"));
        };
        if status.is_informational() {
            if status == StatusCode::CONTINUE
                && let Some(handle) = &handle
            {
                handle.on_continue();
            }
            return Ok(());
        }

        stream.head_received = true;
        let declared = block.fields.get(header::CONTENT_LENGTH).and_then(|value| value.to_str().ok()?.parse::<u64>().ok());
        if let (Some(limit), Some(length)) = (self.state.max_content_length(), declared)
            && length > limit
        {
            return self.abort(stream_id, ErrorCode::CANCEL, ClientError::ContentTooLarge { limit, actual: length });
        }

        let mut head = ResponseHead::new(());
        *head.status_mut() = status;
        *head.version_mut() = Version::HTTP_2;
        *head.headers_mut() = block.fields;
        if end_stream {
            stream.remote_closed = true;
        }
        if let Some(handle) = handle {
            handle.on_message(head);
            if end_stream {
                self.end(stream_id, &handle);
            }
        }
        self.flush_pending()
    }

    fn on_data(&mut self, stream_id: u32, data: Bytes, end_stream: bool) -> Result<(), H2Error> {
        let len = u32::try_from(data.len()).unwrap_or(u32::MAX);
        if len > 0 {
            self.encode(Frame::WindowUpdate { stream_id: 0, increment: len })?;
        }
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            trace!(stream_id, "data for an unknown stream ignored");
            return Ok(());
        };
        if !stream.head_received {
            return self.abort(stream_id, ErrorCode::PROTOCOL_ERROR, ClientError::protocol("DATA before response headers"));
        }

        stream.received += u64::from(len);
        if let Some(limit) = self.state.max_content_length()
            && stream.received > limit
        {
            let actual = stream.received;
            return self.abort(stream_id, ErrorCode::CANCEL, ClientError::ContentTooLarge { limit, actual });
        }
        if end_stream {
            stream.remote_closed = true;
        } else if len > 0 {
            self.encode(Frame::WindowUpdate { stream_id, increment: len })?;
        }

        if let Some(handle) = self.state.registry().get(stream_id) {
            handle.on_data(data);
            if end_stream {
                self.end(stream_id, &handle);
            }
        }
        if end_stream {
            self.flush_pending()?;
        }
        Ok(())
    }

    /// The response is complete. A request body still being sent is cancelled.
    fn end(&mut self, stream_id: u32, handle: &ResponseHandle) {
        self.state.registry().remove_if(stream_id, |registered| registered.same(handle));
        handle.on_end();
        if let Some(stream) = self.streams.get_mut(&stream_id)
            && !stream.local_closed
        {
            stream.pending.clear();
            stream.local_closed = true;
            let _ = self.codec.encode(Frame::RstStream { stream_id, error_code: ErrorCode::NO_ERROR }, &mut self.write_buf);
        }
    }

    /// Fail one stream and reset it, leaving the connection usable.
    fn abort(&mut self, stream_id: u32, code: ErrorCode, error: ClientError) -> Result<(), H2Error> {
        if let Some(handle) = self.state.registry().remove(stream_id) {
            handle.on_error(error);
        }
        self.reset(stream_id, code)
    }

    fn reset(&mut self, stream_id: u32, code: ErrorCode) -> Result<(), H2Error> {
        self.streams.remove(&stream_id);
        self.encode(Frame::RstStream { stream_id, error_code: code })
    }

    fn close_local(&mut self, id: u32) {
        if let Some(stream) = self.streams.get_mut(&id) {
            stream.local_closed = true;
        }
    }

    fn apply_settings(&mut self, settings: &Settings) -> Result<(), H2Error> {
        if let Some(max) = settings.max_concurrent_streams {
            self.state.set_max_concurrent(max);
        }
        if let Some(size) = settings.max_frame_size {
            self.codec.set_max_send_frame_size(size);
        }
        if let Some(window) = settings.initial_window_size {
            let delta = i64::from(window) - self.peer_initial_window;
            self.peer_initial_window = i64::from(window);
            for stream in self.streams.values_mut() {
                stream.send_window += delta;
                if stream.send_window > i64::from(MAX_WINDOW_SIZE) {
                    return Err(H2Error::with_code(ErrorCode::FLOW_CONTROL_ERROR, "stream window overflow"));
                }
            }
        }
        Ok(())
    }

    pub(super) fn go_away(&mut self, code: ErrorCode) {
        // no pushed streams are ever accepted, so the last processed id is 0
        let frame = Frame::GoAway { last_stream_id: 0, error_code: code, debug_data: Bytes::new() };
        if let Err(e) = self.encode(frame) {
            warn!(connection = self.state.id(), cause = %e, "can't encode GOAWAY");
        }
    }

    fn encode(&mut self, frame: Frame) -> Result<(), H2Error> {
        self.codec.encode(frame, &mut self.write_buf)
    }

    /// Write out buffered frames, then complete the acks they carried.
    pub(super) async fn flush_to<W: AsyncWrite + Unpin>(&mut self, writer: &mut W) -> io::Result<()> {
        if !self.write_buf.is_empty() {
            let result = async {
                writer.write_all(&self.write_buf).await?;
                writer.flush().await
            }
            .await;
            self.write_buf.clear();
            if let Err(e) = result {
                let error = ClientError::io(io::Error::new(e.kind(), e.to_string()));
                for ack in self.completed.drain(..) {
                    ack.complete(Err(error.clone()));
                }
                return Err(e);
            }
        }
        for ack in self.completed.drain(..) {
            ack.complete(Ok(()));
        }
        Ok(())
    }

    #[cfg(test)]
    fn take_written(&mut self) -> BytesMut {
        self.write_buf.split()
    }
}

pub(super) async fn run(
    io: BoxIo,
    leftover: Bytes,
    state: Arc<ConnectionState>,
    options: Http2Options,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let (reader, mut writer) = tokio::io::split(io);
    let mut recv_codec = FrameCodec::new();
    recv_codec.set_max_recv_frame_size(options.max_frame_size);
    let mut framed_read = FramedRead::new(reader, recv_codec);
    framed_read.read_buffer_mut().extend_from_slice(&leftover);

    let mut connection = Http2Connection::new(Arc::clone(&state), &options);
    let mut failure = connection.preface().err().map(ClientError::from);

    while failure.is_none() {
        if let Err(e) = connection.flush_to(&mut writer).await {
            failure = Some(ClientError::io(e));
            break;
        }

        let result = tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Start { id, outbound, ack, .. }) => connection.start(id, outbound, ack).map(|()| Flow::Continue),
                Some(Command::Write { id, outbound, ack }) => connection.write(id, outbound, ack).map(|()| Flow::Continue),
                Some(Command::Close) | None => {
                    connection.go_away(ErrorCode::NO_ERROR);
                    Ok(Flow::Close)
                }
            },
            frame = framed_read.next() => match frame {
                Some(Ok(frame)) => connection.on_frame(frame),
                Some(Err(e)) => Err(e),
                None => {
                    debug!(connection = state.id(), "connection closed by peer");
                    break;
                }
            },
        };

        match result {
            Ok(Flow::Continue) => {}
            Ok(Flow::Close) => {
                let _ = connection.flush_to(&mut writer).await;
                break;
            }
            Err(e) => {
                warn!(connection = state.id(), cause = %e, "connection error");
                connection.go_away(e.code());
                let _ = connection.flush_to(&mut writer).await;
                failure = Some(e.into());
            }
        }
    }

    state.set_inactive();
    reject_pending(&state, &mut commands);
    state.fail_all(&failure.unwrap_or(ClientError::ClosedConnection));
    if let Err(e) = writer.shutdown().await {
        trace!(connection = state.id(), cause = %e, "shutdown failed");
    }
}
