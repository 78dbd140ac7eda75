//! Decoder implementation for HTTP response payloads.
//!
//! This module provides a unified decoder for handling different types of HTTP message bodies:
//! - Content-Length based payloads
//! - Chunked transfer encoding
//! - Payloads delimited by connection close
//! - Messages with no body

use crate::codec::body::chunked_decoder::ChunkedDecoder;
use crate::codec::body::length_decoder::LengthDecoder;
use crate::protocol::{ParseError, PayloadItem, PayloadSize};
use bytes::BytesMut;
use tokio_util::codec::Decoder;

/// A unified decoder for handling HTTP message payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadDecoder {
    /// The specific decoding strategy to use
    kind: Kind,
}

/// Enum representing different payload decoding strategies.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Kind {
    /// Decode payload with a fixed content length
    Length(LengthDecoder),

    /// Decode payload using chunked transfer encoding
    Chunked(ChunkedDecoder),

    /// Everything until the peer closes the connection
    UntilClose { finished: bool },

    /// Handle messages with no body
    NoBody,
}

impl PayloadDecoder {
    /// Creates a PayloadDecoder for messages with no body.
    pub fn empty() -> Self {
        Self { kind: Kind::NoBody }
    }

    /// Creates a PayloadDecoder for chunked transfer encoding.
    pub fn chunked() -> Self {
        Self { kind: Kind::Chunked(ChunkedDecoder::new()) }
    }

    /// Creates a PayloadDecoder for a fixed-length payload.
    pub fn fix_length(size: u64) -> Self {
        Self { kind: Kind::Length(LengthDecoder::new(size)) }
    }

    /// Creates a PayloadDecoder reading until the connection closes.
    pub fn until_close() -> Self {
        Self { kind: Kind::UntilClose { finished: false } }
    }
}

impl From<PayloadSize> for PayloadDecoder {
    fn from(payload_size: PayloadSize) -> Self {
        match payload_size {
            PayloadSize::Length(size) => PayloadDecoder::fix_length(size),
            PayloadSize::Chunked => PayloadDecoder::chunked(),
            PayloadSize::Empty => PayloadDecoder::empty(),
            PayloadSize::UntilClose => PayloadDecoder::until_close(),
        }
    }
}

impl Decoder for PayloadDecoder {
    type Item = PayloadItem;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match &mut self.kind {
            Kind::Length(length_decoder) => length_decoder.decode(src),
            Kind::Chunked(chunked_decoder) => chunked_decoder.decode(src),
            Kind::UntilClose { .. } if src.is_empty() => Ok(None),
            Kind::UntilClose { .. } => Ok(Some(PayloadItem::Chunk(src.split().freeze()))),
            Kind::NoBody => Ok(Some(PayloadItem::Eof)),
        }
    }

    /// Called once the peer closed the connection.
    ///
    /// Only an until-close body may legitimately end here; any other framing
    /// still expecting bytes is reported as a truncated body.
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match &mut self.kind {
            Kind::UntilClose { finished } => {
                if !src.is_empty() {
                    return Ok(Some(PayloadItem::Chunk(src.split().freeze())));
                }
                if *finished {
                    return Ok(None);
                }
                *finished = true;
                Ok(Some(PayloadItem::Eof))
            }
            _ => match self.decode(src)? {
                Some(item) => Ok(Some(item)),
                None => Err(ParseError::invalid_body("connection closed before the body was complete")),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn until_close_ends_on_eof() {
        let mut decoder = PayloadDecoder::from(PayloadSize::UntilClose);
        let mut buf = BytesMut::from(&b"partial"[..]);

        let item = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(item.as_bytes().unwrap(), &Bytes::from_static(b"partial"));
        assert!(decoder.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b" tail");
        let item = decoder.decode_eof(&mut buf).unwrap().unwrap();
        assert_eq!(item.as_bytes().unwrap(), &Bytes::from_static(b" tail"));
        assert!(decoder.decode_eof(&mut buf).unwrap().unwrap().is_eof());
    }

    #[test]
    fn truncated_length_body_fails_on_eof() {
        let mut decoder = PayloadDecoder::fix_length(10);
        let mut buf = BytesMut::from(&b"12345"[..]);

        assert!(decoder.decode(&mut buf).unwrap().unwrap().is_chunk());
        let result = decoder.decode_eof(&mut buf);
        assert!(matches!(result, Err(ParseError::InvalidBody { .. })));
    }
}
