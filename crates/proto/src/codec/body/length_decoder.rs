//! Body decoding for responses framed by `Content-Length`
//! ([RFC 9112 Section 6.2](https://www.rfc-editor.org/rfc/rfc9112#section-6.2)).

use crate::protocol::{ParseError, PayloadItem};
use bytes::BytesMut;
use tokio_util::codec::Decoder;

/// Yields at most `remaining` bytes, then [`PayloadItem::Eof`].
///
/// Anything past the announced length stays in the buffer for the next
/// response on the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LengthDecoder {
    remaining: u64,
}

impl LengthDecoder {
    pub fn new(length: u64) -> Self {
        Self { remaining: length }
    }
}

impl Decoder for LengthDecoder {
    type Item = PayloadItem;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match (self.remaining, src.is_empty()) {
            (0, _) => Ok(Some(PayloadItem::Eof)),
            (_, true) => Ok(None),
            (remaining, false) => {
                let take = usize::try_from(remaining).map_or(src.len(), |remaining| remaining.min(src.len()));
                self.remaining -= take as u64;
                Ok(Some(PayloadItem::Chunk(src.split_to(take).freeze())))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stops_at_the_announced_length() {
        let mut buffer = BytesMut::from(&b"0123456789HTTP/1.1 200 OK\r\n"[..]);
        let mut decoder = LengthDecoder::new(10);

        let item = decoder.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(item.as_bytes().unwrap().as_ref(), b"0123456789");
        assert!(decoder.decode(&mut buffer).unwrap().unwrap().is_eof());
        assert_eq!(&buffer[..], b"HTTP/1.1 200 OK\r\n");
    }

    #[test]
    fn waits_for_the_rest() {
        let mut buffer = BytesMut::new();
        let mut decoder = LengthDecoder::new(4);
        assert!(decoder.decode(&mut buffer).unwrap().is_none());

        buffer.extend_from_slice(b"ab");
        assert_eq!(decoder.decode(&mut buffer).unwrap().unwrap().as_bytes().unwrap().as_ref(), b"ab");
        assert!(decoder.decode(&mut buffer).unwrap().is_none());

        buffer.extend_from_slice(b"cd");
        assert_eq!(decoder.decode(&mut buffer).unwrap().unwrap().as_bytes().unwrap().as_ref(), b"cd");
        assert!(decoder.decode(&mut buffer).unwrap().unwrap().is_eof());
    }

    #[test]
    fn zero_length_is_immediately_done() {
        let mut buffer = BytesMut::from(&b"next"[..]);
        assert!(LengthDecoder::new(0).decode(&mut buffer).unwrap().unwrap().is_eof());
        assert_eq!(buffer.len(), 4);
    }
}
