//! Streaming HTTP/2 frame codec.
//!
//! [`FrameCodec`] implements both halves of the `tokio_util` codec traits so
//! the connection actor can drive it from a `FramedRead`/`FramedWrite` pair or
//! feed it raw buffers directly.
//!
//! On decode it enforces the receive frame size, strips padding and priority
//! fields and merges `CONTINUATION` frames into the preceding `HEADERS` or
//! `PUSH_PROMISE`. On encode it splits header blocks and `DATA` payloads so no
//! frame exceeds the peer's `SETTINGS_MAX_FRAME_SIZE`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use super::frame::{DEFAULT_MAX_FRAME_SIZE, ErrorCode, FRAME_HEADER_LEN, Frame, MAX_MAX_FRAME_SIZE, flags, kind};
use crate::ensure;
use crate::protocol::H2Error;

const STREAM_ID_MASK: u32 = 0x7fff_ffff;

#[derive(Debug)]
pub struct FrameCodec {
    max_recv_frame_size: u32,
    max_send_frame_size: u32,
    partial: Option<PartialBlock>,
}

/// A header block waiting for its `CONTINUATION` frames.
#[derive(Debug)]
struct PartialBlock {
    stream_id: u32,
    kind: PartialKind,
    block: BytesMut,
}

#[derive(Debug, Clone, Copy)]
enum PartialKind {
    Headers { end_stream: bool },
    PushPromise { promised_id: u32 },
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self { max_recv_frame_size: DEFAULT_MAX_FRAME_SIZE, max_send_frame_size: DEFAULT_MAX_FRAME_SIZE, partial: None }
    }

    /// Largest frame payload accepted from the peer; must match what we advertised.
    pub fn set_max_recv_frame_size(&mut self, size: u32) {
        self.max_recv_frame_size = size.clamp(DEFAULT_MAX_FRAME_SIZE, MAX_MAX_FRAME_SIZE);
    }

    /// Largest frame payload we emit, taken from the peer's SETTINGS.
    pub fn set_max_send_frame_size(&mut self, size: u32) {
        self.max_send_frame_size = size.clamp(DEFAULT_MAX_FRAME_SIZE, MAX_MAX_FRAME_SIZE);
    }

    pub fn max_send_frame_size(&self) -> u32 {
        self.max_send_frame_size
    }

    fn decode_frame(&mut self, kind: u8, flags: u8, stream_id: u32, payload: Bytes) -> Result<Option<Frame>, H2Error> {
        if let Some(partial) = self.partial.as_mut() {
            ensure!(
                kind == kind::CONTINUATION && stream_id == partial.stream_id,
                H2Error::protocol("header block interrupted by another frame")
            );
            partial.block.extend_from_slice(&payload);
            if flags & flags::END_HEADERS == 0 {
                return Ok(None);
            }
            let Some(partial) = self.partial.take() else {
                return Ok(None);
            };
            let block = partial.block.freeze();
            let frame = match partial.kind {
                PartialKind::Headers { end_stream } => Frame::Headers { stream_id, block, end_stream },
                PartialKind::PushPromise { promised_id } => Frame::PushPromise { stream_id, promised_id, block },
            };
            return Ok(Some(frame));
        }

        let frame = match kind {
            kind::DATA => {
                ensure!(stream_id != 0, H2Error::protocol("DATA frame on stream 0"));
                let data = strip_padding(flags, payload)?;
                Frame::Data { stream_id, data, end_stream: flags & flags::END_STREAM != 0 }
            }
            kind::HEADERS => {
                ensure!(stream_id != 0, H2Error::protocol("HEADERS frame on stream 0"));
                let mut block = strip_padding(flags, payload)?;
                if flags & flags::PRIORITY != 0 {
                    ensure!(block.len() >= 5, H2Error::with_code(ErrorCode::FRAME_SIZE_ERROR, "short HEADERS priority"));
                    block.advance(5);
                }
                let end_stream = flags & flags::END_STREAM != 0;
                if flags & flags::END_HEADERS == 0 {
                    self.partial = Some(PartialBlock {
                        stream_id,
                        kind: PartialKind::Headers { end_stream },
                        block: BytesMut::from(&block[..]),
                    });
                    return Ok(None);
                }
                Frame::Headers { stream_id, block, end_stream }
            }
            kind::PRIORITY => {
                ensure!(payload.len() == 5, H2Error::with_code(ErrorCode::FRAME_SIZE_ERROR, "PRIORITY must be 5 bytes"));
                Frame::Priority { stream_id }
            }
            kind::RST_STREAM => {
                ensure!(stream_id != 0, H2Error::protocol("RST_STREAM on stream 0"));
                ensure!(payload.len() == 4, H2Error::with_code(ErrorCode::FRAME_SIZE_ERROR, "RST_STREAM must be 4 bytes"));
                let mut payload = payload;
                Frame::RstStream { stream_id, error_code: ErrorCode(payload.get_u32()) }
            }
            kind::SETTINGS => {
                ensure!(stream_id == 0, H2Error::protocol("SETTINGS on a stream"));
                let ack = flags & flags::ACK != 0;
                ensure!(
                    payload.len() % 6 == 0 && !(ack && !payload.is_empty()),
                    H2Error::with_code(ErrorCode::FRAME_SIZE_ERROR, "malformed SETTINGS payload")
                );
                let mut payload = payload;
                let mut settings = Vec::with_capacity(payload.len() / 6);
                while payload.has_remaining() {
                    settings.push((payload.get_u16(), payload.get_u32()));
                }
                Frame::Settings { ack, settings }
            }
            kind::PUSH_PROMISE => {
                ensure!(stream_id != 0, H2Error::protocol("PUSH_PROMISE on stream 0"));
                let mut block = strip_padding(flags, payload)?;
                ensure!(block.len() >= 4, H2Error::with_code(ErrorCode::FRAME_SIZE_ERROR, "short PUSH_PROMISE"));
                let promised_id = block.get_u32() & STREAM_ID_MASK;
                if flags & flags::END_HEADERS == 0 {
                    self.partial = Some(PartialBlock {
                        stream_id,
                        kind: PartialKind::PushPromise { promised_id },
                        block: BytesMut::from(&block[..]),
                    });
                    return Ok(None);
                }
                Frame::PushPromise { stream_id, promised_id, block }
            }
            kind::PING => {
                ensure!(stream_id == 0, H2Error::protocol("PING on a stream"));
                ensure!(payload.len() == 8, H2Error::with_code(ErrorCode::FRAME_SIZE_ERROR, "PING must be 8 bytes"));
                let mut data = [0u8; 8];
                data.copy_from_slice(&payload);
                Frame::Ping { ack: flags & flags::ACK != 0, payload: data }
            }
            kind::GOAWAY => {
                ensure!(stream_id == 0, H2Error::protocol("GOAWAY on a stream"));
                ensure!(payload.len() >= 8, H2Error::with_code(ErrorCode::FRAME_SIZE_ERROR, "short GOAWAY"));
                let mut payload = payload;
                let last_stream_id = payload.get_u32() & STREAM_ID_MASK;
                let error_code = ErrorCode(payload.get_u32());
                Frame::GoAway { last_stream_id, error_code, debug_data: payload }
            }
            kind::WINDOW_UPDATE => {
                ensure!(payload.len() == 4, H2Error::with_code(ErrorCode::FRAME_SIZE_ERROR, "WINDOW_UPDATE must be 4 bytes"));
                let mut payload = payload;
                Frame::WindowUpdate { stream_id, increment: payload.get_u32() & STREAM_ID_MASK }
            }
            kind::CONTINUATION => return Err(H2Error::protocol("CONTINUATION without a header block")),
            other => Frame::Unknown { kind: other, stream_id },
        };
        Ok(Some(frame))
    }

    fn encode_header_block(&self, kind: u8, flags: u8, stream_id: u32, prefix: &[u8], block: &[u8], dst: &mut BytesMut) {
        let max = self.max_send_frame_size as usize;
        let first_len = block.len().min(max.saturating_sub(prefix.len()));
        let (first, mut rest) = block.split_at(first_len);

        let end_headers = if rest.is_empty() { flags::END_HEADERS } else { 0 };
        write_head(dst, prefix.len() + first.len(), kind, flags | end_headers, stream_id);
        dst.put_slice(prefix);
        dst.put_slice(first);

        while !rest.is_empty() {
            let len = rest.len().min(max);
            let (fragment, remaining) = rest.split_at(len);
            let end_headers = if remaining.is_empty() { flags::END_HEADERS } else { 0 };
            write_head(dst, fragment.len(), kind::CONTINUATION, end_headers, stream_id);
            dst.put_slice(fragment);
            rest = remaining;
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = H2Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if src.len() < FRAME_HEADER_LEN {
                return Ok(None);
            }

            let len = (usize::from(src[0]) << 16) | (usize::from(src[1]) << 8) | usize::from(src[2]);
            ensure!(
                len <= self.max_recv_frame_size as usize,
                H2Error::FrameSize { size: len, max_size: self.max_recv_frame_size as usize }
            );
            if src.len() < FRAME_HEADER_LEN + len {
                src.reserve(FRAME_HEADER_LEN + len - src.len());
                return Ok(None);
            }

            let kind = src[3];
            let flags = src[4];
            let stream_id = u32::from_be_bytes([src[5], src[6], src[7], src[8]]) & STREAM_ID_MASK;
            src.advance(FRAME_HEADER_LEN);
            let payload = src.split_to(len).freeze();
            trace!(kind, flags, stream_id, len, "decoded frame header");

            if let Some(frame) = self.decode_frame(kind, flags, stream_id, payload)? {
                return Ok(Some(frame));
            }
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = H2Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match frame {
            Frame::Data { stream_id, data, end_stream } => {
                let max = self.max_send_frame_size as usize;
                let mut data = data;
                loop {
                    let len = data.len().min(max);
                    let chunk = data.split_to(len);
                    let last = data.is_empty();
                    let flags = if last && end_stream { flags::END_STREAM } else { 0 };
                    write_head(dst, chunk.len(), kind::DATA, flags, stream_id);
                    dst.put_slice(&chunk);
                    if last {
                        break;
                    }
                }
            }
            Frame::Headers { stream_id, block, end_stream } => {
                let flags = if end_stream { flags::END_STREAM } else { 0 };
                self.encode_header_block(kind::HEADERS, flags, stream_id, &[], &block, dst);
            }
            Frame::PushPromise { stream_id, promised_id, block } => {
                let prefix = (promised_id & STREAM_ID_MASK).to_be_bytes();
                self.encode_header_block(kind::PUSH_PROMISE, 0, stream_id, &prefix, &block, dst);
            }
            Frame::Priority { stream_id } => {
                write_head(dst, 5, kind::PRIORITY, 0, stream_id);
                dst.put_u32(0);
                dst.put_u8(15);
            }
            Frame::RstStream { stream_id, error_code } => {
                write_head(dst, 4, kind::RST_STREAM, 0, stream_id);
                dst.put_u32(error_code.0);
            }
            Frame::Settings { ack, settings } => {
                let flags = if ack { flags::ACK } else { 0 };
                write_head(dst, settings.len() * 6, kind::SETTINGS, flags, 0);
                for (id, value) in settings {
                    dst.put_u16(id);
                    dst.put_u32(value);
                }
            }
            Frame::Ping { ack, payload } => {
                let flags = if ack { flags::ACK } else { 0 };
                write_head(dst, 8, kind::PING, flags, 0);
                dst.put_slice(&payload);
            }
            Frame::GoAway { last_stream_id, error_code, debug_data } => {
                write_head(dst, 8 + debug_data.len(), kind::GOAWAY, 0, 0);
                dst.put_u32(last_stream_id & STREAM_ID_MASK);
                dst.put_u32(error_code.0);
                dst.put_slice(&debug_data);
            }
            Frame::WindowUpdate { stream_id, increment } => {
                write_head(dst, 4, kind::WINDOW_UPDATE, 0, stream_id);
                dst.put_u32(increment & STREAM_ID_MASK);
            }
            Frame::Unknown { kind, .. } => {
                return Err(H2Error::protocol(format!("can't encode unknown frame type {kind:#x}")));
            }
        }
        Ok(())
    }
}

fn write_head(dst: &mut BytesMut, len: usize, kind: u8, flags: u8, stream_id: u32) {
    dst.reserve(FRAME_HEADER_LEN + len);
    let len = len as u32;
    dst.put_slice(&len.to_be_bytes()[1..]);
    dst.put_u8(kind);
    dst.put_u8(flags);
    dst.put_u32(stream_id & STREAM_ID_MASK);
}

fn strip_padding(flags: u8, mut payload: Bytes) -> Result<Bytes, H2Error> {
    if flags & flags::PADDED == 0 {
        return Ok(payload);
    }
    ensure!(!payload.is_empty(), H2Error::protocol("padded frame without pad length"));
    let pad_len = usize::from(payload.get_u8());
    ensure!(pad_len <= payload.len(), H2Error::protocol("padding exceeds frame payload"));
    payload.truncate(payload.len() - pad_len);
    Ok(payload)
}
