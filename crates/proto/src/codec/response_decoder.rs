//! HTTP/1 response decoder module
//!
//! Decodes a stream of responses from a connection. Each response is a head
//! followed by payload items; interim `1xx` heads are yielded on their own and
//! leave the decoder waiting for the final head.
//!
//! # Example
//!
//! ```
//! use micro_client_proto::codec::ResponseDecoder;
//! use micro_client_proto::protocol::Message;
//! use tokio_util::codec::Decoder;
//! use bytes::BytesMut;
//!
//! let mut decoder = ResponseDecoder::new();
//! let mut buffer = BytesMut::from("HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi");
//! let head = decoder.decode(&mut buffer).unwrap().unwrap();
//! assert!(head.is_header());
//! ```

use crate::codec::body::PayloadDecoder;
use crate::codec::header::HeaderDecoder;
use crate::protocol::{Message, ParseError, PayloadItem, PayloadSize, ResponseHead};
use bytes::BytesMut;
use tokio_util::codec::Decoder;

/// A decoder for HTTP responses that handles both heads and payload
///
/// The decoder maintains its state through the `payload_decoder` field:
/// - `None`: Currently parsing a head
/// - `Some(PayloadDecoder)`: Currently parsing payload
#[derive(Debug, Default)]
pub struct ResponseDecoder {
    header_decoder: HeaderDecoder,
    payload_decoder: Option<PayloadDecoder>,
}

impl ResponseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the next head answers a `HEAD` request, which never has a body.
    pub fn set_head_request(&mut self, head_request: bool) {
        self.header_decoder.set_head_request(head_request);
    }

    /// Whether a head has been read and its body is still being decoded.
    pub fn in_payload(&self) -> bool {
        self.payload_decoder.is_some()
    }

    fn decode_payload(&mut self, item: Option<PayloadItem>) -> Option<Message<(ResponseHead, PayloadSize)>> {
        match item {
            Some(item @ PayloadItem::Eof) => {
                self.payload_decoder.take();
                Some(Message::Payload(item))
            }
            Some(item) => Some(Message::Payload(item)),
            None => None,
        }
    }
}

impl Decoder for ResponseDecoder {
    type Item = Message<(ResponseHead, PayloadSize)>;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // parse payload if have payload_decoder
        if let Some(payload_decoder) = &mut self.payload_decoder {
            let item = payload_decoder.decode(src)?;
            return Ok(self.decode_payload(item));
        }

        let message = match self.header_decoder.decode(src)? {
            Some((head, payload_size)) => {
                // interim responses are followed by another head, not a body
                if !head.status().is_informational() {
                    self.payload_decoder = Some(payload_size.into());
                }
                Some(Message::Header((head, payload_size)))
            }
            None => None,
        };

        Ok(message)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(payload_decoder) = &mut self.payload_decoder {
            let item = payload_decoder.decode_eof(src)?;
            return Ok(self.decode_payload(item));
        }

        match self.decode(src)? {
            Some(message) => Ok(Some(message)),
            None if src.is_empty() => Ok(None),
            None => Err(ParseError::invalid_header("connection closed in the middle of a response head")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;
    use indoc::indoc;

    fn collect(decoder: &mut ResponseDecoder, buf: &mut BytesMut) -> Vec<Message<(ResponseHead, PayloadSize)>> {
        let mut messages = vec![];
        while let Some(message) = decoder.decode(buf).unwrap() {
            messages.push(message);
        }
        messages
    }

    #[test]
    fn interim_then_final_response() {
        let str = indoc! {"
        HTTP/1.1 100 Continue

        HTTP/1.1 201 Created
        Content-Length: 5

        hello"};

        let mut decoder = ResponseDecoder::new();
        let mut buf = BytesMut::from(str);
        let mut messages = collect(&mut decoder, &mut buf).into_iter();

        match messages.next() {
            Some(Message::Header((head, _))) => assert_eq!(head.status(), StatusCode::CONTINUE),
            other => panic!("unexpected message {other:?}"),
        }
        match messages.next() {
            Some(Message::Header((head, size))) => {
                assert_eq!(head.status(), StatusCode::CREATED);
                assert_eq!(size, PayloadSize::Length(5));
            }
            other => panic!("unexpected message {other:?}"),
        }
        assert_eq!(messages.next().unwrap().into_payload_item().unwrap().into_bytes().unwrap().as_ref(), b"hello");
        assert!(messages.next().unwrap().into_payload_item().unwrap().is_eof());
        assert!(messages.next().is_none());
        assert!(!decoder.in_payload());
    }

    #[test]
    fn pipelined_responses_share_the_buffer() {
        let raw = "HTTP/1.1 200 OK\r\nContent-Length: 1\r\n\r\naHTTP/1.1 204 No Content\r\n\r\n";
        let mut decoder = ResponseDecoder::new();
        let mut buf = BytesMut::from(raw);

        let messages = collect(&mut decoder, &mut buf);
        assert_eq!(messages.len(), 5);
        assert!(buf.is_empty());
    }

    #[test]
    fn closed_mid_head_is_an_error() {
        let mut decoder = ResponseDecoder::new();
        let mut buf = BytesMut::from("HTTP/1.1 200 OK\r\nServ");
        assert!(decoder.decode(&mut buf).unwrap().is_none());
        assert!(decoder.decode_eof(&mut buf).is_err());
    }
}
