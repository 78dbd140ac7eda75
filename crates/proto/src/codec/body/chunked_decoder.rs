//! Decoder for the `chunked` transfer coding ([RFC 9112 Section 7.1](https://www.rfc-editor.org/rfc/rfc9112#section-7.1)).
//!
//! The decoder works line by line: a size line, then that many data bytes and
//! a CRLF, repeated until a zero size. The trailer section after the last
//! chunk is surfaced as [`PayloadItem::Trailers`] when it is not empty.

use crate::codec::header::{MAX_HEADER_BYTES, MAX_HEADER_NUM};
use crate::ensure;
use crate::protocol::{ParseError, PayloadItem};
use bytes::{Buf, BytesMut};
use http::{HeaderMap, HeaderName, HeaderValue};
use tokio_util::codec::Decoder;
use tracing::trace;

/// Longest size line accepted, extensions included.
const MAX_SIZE_LINE: usize = 4096;

/// Hex digits that still fit a `u64`.
const MAX_SIZE_DIGITS: usize = 16;

/// Incremental decoder for a chunked message body.
///
/// Chunk data is yielded as soon as it arrives, so a large chunk may come out
/// as several [`PayloadItem::Chunk`]s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkedDecoder {
    state: State,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Size,
    Data { remaining: u64 },
    DataCrlf,
    Trailers,
    Done,
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self { state: State::Size }
    }
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for ChunkedDecoder {
    type Item = PayloadItem;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state {
                State::Size => {
                    let Some(size) = read_size_line(src)? else {
                        return Ok(None);
                    };
                    self.state = if size == 0 { State::Trailers } else { State::Data { remaining: size } };
                }

                State::Data { remaining } => {
                    if src.is_empty() {
                        return Ok(None);
                    }
                    let take = usize::try_from(remaining).unwrap_or(usize::MAX).min(src.len());
                    let left = remaining - take as u64;
                    self.state = if left == 0 { State::DataCrlf } else { State::Data { remaining: left } };
                    trace!(len = take, left, "read chunk data");
                    return Ok(Some(PayloadItem::Chunk(src.split_to(take).freeze())));
                }

                State::DataCrlf => {
                    let expected: &[u8] = b"\r\n";
                    let available = src.len().min(2);
                    ensure!(
                        src[..available] == expected[..available],
                        ParseError::invalid_body("chunk data is not followed by CRLF")
                    );
                    if available < 2 {
                        return Ok(None);
                    }
                    src.advance(2);
                    self.state = State::Size;
                }

                State::Trailers => {
                    if src.starts_with(b"\r\n") {
                        src.advance(2);
                        self.state = State::Done;
                        continue;
                    }
                    if src.is_empty() || src[..] == b"\r"[..] {
                        return Ok(None);
                    }

                    let Some(end) = src.windows(4).position(|window| window == b"\r\n\r\n") else {
                        ensure!(src.len() <= MAX_HEADER_BYTES, ParseError::too_large_header(src.len(), MAX_HEADER_BYTES));
                        return Ok(None);
                    };
                    let section = src.split_to(end + 4);
                    let trailers = parse_trailers(&section)?;
                    trace!(count = trailers.len(), "read chunked trailers");
                    self.state = State::Done;
                    return Ok(Some(PayloadItem::Trailers(trailers)));
                }

                State::Done => {
                    trace!("finished reading chunked data");
                    return Ok(Some(PayloadItem::Eof));
                }
            }
        }
    }
}

/// Consumes one `size[;ext]CRLF` line, returning the chunk size.
fn read_size_line(src: &mut BytesMut) -> Result<Option<u64>, ParseError> {
    let Some(lf) = src.iter().position(|&b| b == b'\n') else {
        ensure!(src.len() <= MAX_SIZE_LINE, ParseError::invalid_body("chunk size line too long"));
        return Ok(None);
    };
    ensure!(lf > 0 && src[lf - 1] == b'\r', ParseError::invalid_body("chunk size line must end with CRLF"));
    ensure!(lf <= MAX_SIZE_LINE, ParseError::invalid_body("chunk size line too long"));

    let line = src.split_to(lf + 1);
    let line = &line[..lf - 1];
    let digits = match line.iter().position(|&b| b == b';') {
        Some(semi) => &line[..semi],
        None => line,
    };
    let digits = digits.trim_ascii();

    ensure!(
        !digits.is_empty() && digits.len() <= MAX_SIZE_DIGITS && digits.iter().all(u8::is_ascii_hexdigit),
        ParseError::invalid_body(format!("invalid chunk size: {:?}", String::from_utf8_lossy(digits)))
    );
    // all ascii hex, so both conversions hold
    let digits = std::str::from_utf8(digits).map_err(ParseError::invalid_body)?;
    let size = u64::from_str_radix(digits, 16).map_err(ParseError::invalid_body)?;
    trace!(size, "read chunk size");
    Ok(Some(size))
}

/// Parses a complete trailer section, terminating blank line included.
fn parse_trailers(section: &[u8]) -> Result<HeaderMap, ParseError> {
    let mut fields = [httparse::EMPTY_HEADER; MAX_HEADER_NUM];
    let fields = match httparse::parse_headers(section, &mut fields) {
        Ok(httparse::Status::Complete((_, fields))) => fields,
        Ok(httparse::Status::Partial) => return Err(ParseError::invalid_header("incomplete trailer section")),
        Err(httparse::Error::TooManyHeaders) => return Err(ParseError::too_many_headers(MAX_HEADER_NUM)),
        Err(e) => return Err(ParseError::invalid_header(e)),
    };

    let mut trailers = HeaderMap::with_capacity(fields.len());
    for field in fields.iter() {
        let name = HeaderName::from_bytes(field.name.as_bytes()).map_err(ParseError::invalid_header)?;
        let value = HeaderValue::from_bytes(field.value).map_err(ParseError::invalid_header)?;
        trailers.append(name, value);
    }
    Ok(trailers)
}
