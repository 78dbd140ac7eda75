//! HTTP header decoder implementation for parsing HTTP response heads
//!
//! This module decodes a status line and header fields from raw bytes into a
//! [`ResponseHead`], and decides how the following body is framed.
//!
//! # Limits
//!
//! - Maximum number of headers: 64
//! - Maximum header size: 8KB
//! - Only HTTP/1.0 and HTTP/1.1 responses; HTTP/2 is framed by [`crate::codec::h2`]
//!
//! # Implementation Details
//!
//! The decoder works in multiple stages:
//!
//! 1. Parse raw bytes using `httparse`
//! 2. Record header name/value byte ranges
//! 3. Convert to typed `http::Response` structure
//! 4. Determine the payload framing from the request method, status and headers
//!
//! Header values are sliced out of the frozen head bytes rather than copied.

use bytes::BytesMut;
use http::{HeaderName, HeaderValue, Response, StatusCode};
use httparse::{Error, Status};
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::ensure;

use crate::protocol::{ParseError, PayloadSize, ResponseHead};

/// Maximum number of headers allowed in a response
pub(crate) const MAX_HEADER_NUM: usize = 64;

/// Maximum size in bytes allowed for the entire header section
pub(crate) const MAX_HEADER_BYTES: usize = 8 * 1024;

/// Decoder for HTTP response heads implementing the [`Decoder`] trait.
///
/// The body framing of a response depends on the request that triggered it, so
/// the decoder has to be told when the pending request was a `HEAD`.
#[derive(Debug, Default)]
pub struct HeaderDecoder {
    head_request: bool,
}

impl HeaderDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark whether the response being decoded answers a `HEAD` request.
    pub fn set_head_request(&mut self, head_request: bool) {
        self.head_request = head_request;
    }
}

impl Decoder for HeaderDecoder {
    type Item = (ResponseHead, PayloadSize);
    type Error = ParseError;

    /// Attempts to decode a response head from the provided bytes buffer.
    ///
    /// # Returns
    ///
    /// - `Ok(Some((head, payload_size)))` if a complete head was successfully parsed
    /// - `Ok(None)` if more data is needed
    /// - `Err(ParseError)` if parsing failed
    ///
    /// # Errors
    ///
    /// Returns `ParseError` if:
    /// - The number of headers exceeds `MAX_HEADER_NUM`
    /// - The total header size exceeds `MAX_HEADER_BYTES`
    /// - The HTTP version or status code is not supported
    /// - Headers contain invalid characters
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // "HTTP/1.1 200 \r\n\r\n" is the shortest complete head
        if src.len() < 16 {
            return Ok(None);
        }

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADER_NUM];
        let mut res = httparse::Response::new(&mut headers);

        let parsed_result = res.parse(src).map_err(|e| match e {
            Error::TooManyHeaders => ParseError::too_many_headers(MAX_HEADER_NUM),
            e => ParseError::invalid_header(e.to_string()),
        });

        let body_offset = match parsed_result? {
            Status::Complete(body_offset) => body_offset,
            Status::Partial => {
                ensure!(src.len() <= MAX_HEADER_BYTES, ParseError::too_large_header(src.len(), MAX_HEADER_BYTES));
                return Ok(None);
            }
        };

        trace!(head_size = body_offset, "parsed response head");
        ensure!(body_offset <= MAX_HEADER_BYTES, ParseError::too_large_header(body_offset, MAX_HEADER_BYTES));

        let header_count = res.headers.len();
        let mut header_index: [HeaderIndex; MAX_HEADER_NUM] = EMPTY_HEADER_INDEX_ARRAY;
        HeaderIndex::record(src, res.headers, &mut header_index);

        let version = match res.version {
            Some(0) => http::Version::HTTP_10,
            Some(1) => http::Version::HTTP_11,
            v => return Err(ParseError::InvalidVersion(v)),
        };

        let code = res.code.unwrap_or_default();
        let status = StatusCode::from_u16(code).map_err(|_| ParseError::InvalidStatus(code))?;

        let mut head = Response::new(());
        *head.status_mut() = status;
        *head.version_mut() = version;

        let headers = head.headers_mut();
        headers.reserve(header_count);

        // Split head portion from source buffer
        let header_bytes = src.split_to(body_offset).freeze();
        for index in &header_index[..header_count] {
            let name = HeaderName::from_bytes(&header_bytes[index.name.0..index.name.1]).map_err(ParseError::invalid_header)?;
            let value = HeaderValue::from_maybe_shared(header_bytes.slice(index.value.0..index.value.1))
                .map_err(ParseError::invalid_header)?;
            headers.append(name, value);
        }

        let payload_size = parse_payload(&head, self.head_request)?;
        Ok(Some((head, payload_size)))
    }
}

/// Stores the byte range positions of a header's name and value within the original buffer.
#[derive(Clone, Copy)]
struct HeaderIndex {
    /// Start and end byte positions of the header name
    name: (usize, usize),
    /// Start and end byte positions of the header value
    value: (usize, usize),
}

const EMPTY_HEADER_INDEX: HeaderIndex = HeaderIndex { name: (0, 0), value: (0, 0) };

const EMPTY_HEADER_INDEX_ARRAY: [HeaderIndex; MAX_HEADER_NUM] = [EMPTY_HEADER_INDEX; MAX_HEADER_NUM];

impl HeaderIndex {
    /// Records the byte positions of header names and values from the parsed headers.
    fn record(bytes: &[u8], headers: &[httparse::Header<'_>], indices: &mut [HeaderIndex]) {
        let bytes_ptr = bytes.as_ptr() as usize;
        for (header, indices) in headers.iter().zip(indices.iter_mut()) {
            let name_start = header.name.as_ptr() as usize - bytes_ptr;
            let name_end = name_start + header.name.len();
            indices.name = (name_start, name_end);
            let value_start = header.value.as_ptr() as usize - bytes_ptr;
            let value_end = value_start + header.value.len();
            indices.value = (value_start, value_end);
        }
    }
}

/// Determines the body framing of a response.
///
/// Follows RFC 9112 section 6.3:
/// - responses to `HEAD`, and `1xx`, `204` and `304` responses never carry a body
/// - a `Transfer-Encoding` ending in `chunked` wins over `Content-Length`
/// - any other `Transfer-Encoding` is read until the connection closes
/// - otherwise `Content-Length` decides, and without it the body runs until close
///
/// # Errors
///
/// Returns `ParseError` if the Content-Length value is invalid
pub(crate) fn parse_payload(head: &ResponseHead, head_request: bool) -> Result<PayloadSize, ParseError> {
    let status = head.status();
    if head_request
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        return Ok(PayloadSize::new_empty());
    }

    // refer: https://www.rfc-editor.org/rfc/rfc9112.html#name-message-body-length
    let te_header = head.headers().get(http::header::TRANSFER_ENCODING);
    let cl_header = head.headers().get(http::header::CONTENT_LENGTH);

    match (te_header, cl_header) {
        (Some(te_value), _) => {
            if is_chunked(Some(te_value)) {
                Ok(PayloadSize::new_chunked())
            } else {
                Ok(PayloadSize::UntilClose)
            }
        }

        (None, Some(cl_value)) => {
            let cl_str = cl_value.to_str().map_err(|_| ParseError::invalid_content_length("value can't to_str"))?;

            let length =
                cl_str.trim().parse::<u64>().map_err(|_| ParseError::invalid_content_length(format!("value {cl_str} is not u64")))?;

            Ok(PayloadSize::new_length(length))
        }

        (None, None) => Ok(PayloadSize::UntilClose),
    }
}

/// Checks if the Transfer-Encoding header indicates chunked encoding.
///
/// According to RFC 9112, chunked must be the last encoding if present.
pub(crate) fn is_chunked(header_value: Option<&HeaderValue>) -> bool {
    const CHUNKED: &[u8] = b"chunked";
    if let Some(value) = header_value {
        if let Some(bytes) = value.as_bytes().rsplit(|b| *b == b',').next() {
            return bytes.trim_ascii().eq_ignore_ascii_case(CHUNKED);
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderMap, Version};
    use indoc::indoc;

    #[test]
    fn check_is_chunked() {
        {
            let headers = HeaderMap::new();
            assert!(!is_chunked(headers.get(http::header::TRANSFER_ENCODING)))
        }

        {
            let mut headers = HeaderMap::new();
            headers.insert("Transfer-Encoding", "gzip, chunked".parse().unwrap());
            assert!(is_chunked(headers.get(http::header::TRANSFER_ENCODING)));
        }

        {
            let mut headers = HeaderMap::new();
            headers.insert("Transfer-Encoding", "chunked, gzip".parse().unwrap());
            assert!(!is_chunked(headers.get(http::header::TRANSFER_ENCODING)));
        }

        {
            let mut headers = HeaderMap::new();
            headers.insert("Transfer-Encoding", "gzip".parse().unwrap());
            assert!(!is_chunked(headers.get(http::header::TRANSFER_ENCODING)));
        }
    }

    #[test]
    fn leaves_body_in_buffer() {
        let str = indoc! {r##"
        HTTP/1.1 200 OK
        Content-Length: 3
        Server: nginx

        123"##};

        let mut bytes = BytesMut::from(str);
        let (head, payload_size) = HeaderDecoder::new().decode(&mut bytes).unwrap().unwrap();

        assert_eq!(head.status(), StatusCode::OK);
        assert_eq!(payload_size, PayloadSize::Length(3));
        assert_eq!(&bytes[..], &b"123"[..]);
    }

    #[test]
    fn from_nginx() {
        let str = indoc! {r##"
        HTTP/1.1 404 Not Found
        Server: nginx/1.25.3
        Date: Sat, 17 Oct 2026 08:00:00 GMT
        Content-Type: text/html
        Transfer-Encoding: chunked
        Connection: keep-alive

        "##};

        let mut buf = BytesMut::from(str);
        let (head, payload_size) = HeaderDecoder::new().decode(&mut buf).unwrap().unwrap();

        assert!(payload_size.is_chunked());
        assert_eq!(head.status(), StatusCode::NOT_FOUND);
        assert_eq!(head.version(), Version::HTTP_11);
        assert_eq!(head.headers().len(), 5);
        assert_eq!(head.headers().get(http::header::CONTENT_TYPE), Some(&HeaderValue::from_static("text/html")));
        assert_eq!(head.headers().get(http::header::CONNECTION), Some(&HeaderValue::from_static("keep-alive")));
    }

    #[test]
    fn partial_head_needs_more() {
        let mut buf = BytesMut::from("HTTP/1.1 200 OK\r\nContent-Len");
        assert!(HeaderDecoder::new().decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 28);
    }

    #[test]
    fn bodiless_responses() {
        let mut decoder = HeaderDecoder::new();

        let mut buf = BytesMut::from("HTTP/1.1 100 Continue\r\n\r\n");
        let (head, payload_size) = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(head.status(), StatusCode::CONTINUE);
        assert!(payload_size.is_empty());

        let mut buf = BytesMut::from("HTTP/1.1 204 No Content\r\nContent-Length: 10\r\n\r\n");
        let (_, payload_size) = decoder.decode(&mut buf).unwrap().unwrap();
        assert!(payload_size.is_empty());

        decoder.set_head_request(true);
        let mut buf = BytesMut::from("HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n");
        let (_, payload_size) = decoder.decode(&mut buf).unwrap().unwrap();
        assert!(payload_size.is_empty());
    }

    #[test]
    fn http10_without_length_reads_until_close() {
        let mut buf = BytesMut::from("HTTP/1.0 200 OK\r\nServer: old\r\n\r\n");
        let (head, payload_size) = HeaderDecoder::new().decode(&mut buf).unwrap().unwrap();
        assert_eq!(head.version(), Version::HTTP_10);
        assert!(payload_size.is_until_close());
    }

    #[test]
    fn invalid_content_length() {
        let mut buf = BytesMut::from("HTTP/1.1 200 OK\r\nContent-Length: ten\r\n\r\n");
        let result = HeaderDecoder::new().decode(&mut buf);
        assert!(matches!(result, Err(ParseError::InvalidContentLength { .. })));
    }

    #[test]
    fn too_large_head() {
        let mut raw = String::from("HTTP/1.1 200 OK\r\n");
        while raw.len() <= MAX_HEADER_BYTES {
            raw.push_str("X-Padding: aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa\r\n");
        }
        let mut buf = BytesMut::from(raw.as_str());
        let result = HeaderDecoder::new().decode(&mut buf);
        assert!(matches!(result, Err(ParseError::TooLargeHeader { .. } | ParseError::TooManyHeaders { .. })));
    }
}
