//! HPACK header block encoding and decoding on top of `fluke-hpack`.
//!
//! Both directions are stateful: one encoder and one decoder live for the
//! whole connection, and header blocks must pass through them in the order
//! they are sent or received.

use bytes::Bytes;
use http::header::{self, HeaderName};
use http::{HeaderMap, HeaderValue, StatusCode};

use crate::protocol::{H2Error, RequestHead};

/// Connection-specific fields that must not appear in an HTTP/2 message.
const CONNECTION_HEADERS: [HeaderName; 5] = [
    header::CONNECTION,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::HOST,
    HeaderName::from_static("keep-alive"),
];

pub struct HpackEncoder {
    inner: fluke_hpack::Encoder<'static>,
}

impl std::fmt::Debug for HpackEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HpackEncoder").finish_non_exhaustive()
    }
}

impl Default for HpackEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl HpackEncoder {
    pub fn new() -> Self {
        Self { inner: fluke_hpack::Encoder::new() }
    }

    /// Encode a request head, pseudo-header fields first.
    ///
    /// `:authority` comes from the uri, falling back to the `Host` header.
    pub fn encode_request(&mut self, head: &RequestHead, scheme: &str) -> Bytes {
        let authority = head
            .uri()
            .authority()
            .map(|authority| authority.as_str().as_bytes())
            .or_else(|| head.headers().get(header::HOST).map(HeaderValue::as_bytes))
            .unwrap_or_default();

        let mut fields: Vec<(&[u8], &[u8])> = Vec::with_capacity(head.headers().len() + 4);
        fields.push((b":method", head.method().as_str().as_bytes()));
        fields.push((b":scheme", scheme.as_bytes()));
        fields.push((b":authority", authority));
        fields.push((b":path", head.request_target().as_bytes()));
        push_regular_fields(head.headers(), &mut fields);

        Bytes::from(self.inner.encode(fields))
    }

    pub fn encode_trailers(&mut self, trailers: &HeaderMap) -> Bytes {
        let mut fields: Vec<(&[u8], &[u8])> = Vec::with_capacity(trailers.len());
        push_regular_fields(trailers, &mut fields);
        Bytes::from(self.inner.encode(fields))
    }
}

fn push_regular_fields<'a>(headers: &'a HeaderMap, fields: &mut Vec<(&'a [u8], &'a [u8])>) {
    for (name, value) in headers {
        if CONNECTION_HEADERS.contains(name) {
            continue;
        }
        if *name == header::TE && value.as_bytes() != b"trailers" {
            continue;
        }
        fields.push((name.as_str().as_bytes(), value.as_bytes()));
    }
}

/// A decoded header block: the `:status` pseudo-header, if any, and the regular fields.
#[derive(Debug, Default)]
pub struct HeaderBlock {
    pub status: Option<StatusCode>,
    pub fields: HeaderMap,
}

pub struct HpackDecoder {
    inner: fluke_hpack::Decoder<'static>,
}

impl std::fmt::Debug for HpackDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HpackDecoder").finish_non_exhaustive()
    }
}

impl Default for HpackDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl HpackDecoder {
    pub fn new() -> Self {
        Self { inner: fluke_hpack::Decoder::new() }
    }

    /// Decode a complete header block.
    ///
    /// A malformed block corrupts the shared table, so every error here is a
    /// connection error (`COMPRESSION_ERROR`) except for malformed fields,
    /// which are reported as `PROTOCOL_ERROR`.
    pub fn decode(&mut self, block: &[u8]) -> Result<HeaderBlock, H2Error> {
        let decoded = self.inner.decode(block).map_err(|e| H2Error::hpack(format!("{e:?}")))?;

        let mut result = HeaderBlock { status: None, fields: HeaderMap::with_capacity(decoded.len()) };
        let mut regular_seen = false;
        for (name, value) in decoded {
            if let Some(pseudo) = name.strip_prefix(b":") {
                if regular_seen {
                    return Err(H2Error::protocol("pseudo-header after regular header"));
                }
                if pseudo != b"status" {
                    return Err(H2Error::protocol(format!("unexpected pseudo-header {}", String::from_utf8_lossy(&name))));
                }
                let status = StatusCode::from_bytes(&value)
                    .map_err(|e| H2Error::protocol(format!("invalid :status {}: {e}", String::from_utf8_lossy(&value))))?;
                result.status = Some(status);
                continue;
            }

            regular_seen = true;
            let name = HeaderName::from_bytes(&name).map_err(|e| H2Error::protocol(format!("invalid header name: {e}")))?;
            let value = HeaderValue::from_bytes(&value).map_err(|e| H2Error::protocol(format!("invalid header value: {e}")))?;
            result.fields.append(name, value);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{Method, Uri};

    #[test]
    fn request_round_trip_strips_connection_headers() {
        let mut head = RequestHead::new(Method::POST, Uri::from_static("https://example.com:8443/upload?x=1"));
        head.headers_mut().insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        head.headers_mut().insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        head.headers_mut().insert(header::TE, HeaderValue::from_static("gzip"));

        let block = HpackEncoder::new().encode_request(&head, "https");
        let decoded = fluke_hpack::Decoder::new().decode(&block).unwrap();
        let fields: Vec<(String, String)> = decoded
            .into_iter()
            .map(|(n, v)| (String::from_utf8(n).unwrap(), String::from_utf8(v).unwrap()))
            .collect();

        assert_eq!(
            fields,
            vec![
                (":method".into(), "POST".into()),
                (":scheme".into(), "https".into()),
                (":authority".into(), "example.com:8443".into()),
                (":path".into(), "/upload?x=1".into()),
                ("content-type".into(), "text/plain".into()),
            ]
        );
    }

    #[test]
    fn decode_response_block() {
        let mut encoder = fluke_hpack::Encoder::new();
        let block = encoder.encode(vec![(&b":status"[..], &b"404"[..]), (&b"content-length"[..], &b"0"[..])]);

        let decoded = HpackDecoder::new().decode(&block).unwrap();
        assert_eq!(decoded.status, Some(StatusCode::NOT_FOUND));
        assert_eq!(decoded.fields.get(header::CONTENT_LENGTH).unwrap(), "0");
    }

    #[test]
    fn trailers_have_no_status() {
        let mut trailers = HeaderMap::new();
        trailers.insert("grpc-status", HeaderValue::from_static("0"));
        let block = HpackEncoder::new().encode_trailers(&trailers);

        let decoded = HpackDecoder::new().decode(&block).unwrap();
        assert!(decoded.status.is_none());
        assert_eq!(decoded.fields.get("grpc-status").unwrap(), "0");
    }

    #[test]
    fn pseudo_after_regular_is_rejected() {
        let mut encoder = fluke_hpack::Encoder::new();
        let block = encoder.encode(vec![(&b"server"[..], &b"x"[..]), (&b":status"[..], &b"200"[..])]);
        assert!(HpackDecoder::new().decode(&block).is_err());
    }
}
