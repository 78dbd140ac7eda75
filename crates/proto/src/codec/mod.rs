//! Client side HTTP codecs.
//!
//! The HTTP/1 half is a pair of streaming state machines:
//!
//! - [`RequestEncoder`]: serializes a request head followed by its payload items,
//!   using `Content-Length` or chunked framing as chosen by the writer
//! - [`ResponseDecoder`]: parses response heads and yields body chunks, trailers
//!   and the end-of-body marker; interim (1xx) responses are surfaced as heads
//!   without a payload
//!
//! The [`h2`] module holds the HTTP/2 frame codec and HPACK support.
//!
//! # Example
//!
//! ```
//! use bytes::BytesMut;
//! use micro_client_proto::codec::ResponseDecoder;
//! use micro_client_proto::protocol::{Message, PayloadItem};
//! use tokio_util::codec::Decoder;
//!
//! let mut decoder = ResponseDecoder::default();
//! let mut buf = BytesMut::from(&b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nhi"[..]);
//!
//! let Some(Message::Header((head, _size))) = decoder.decode(&mut buf).unwrap() else { panic!() };
//! assert_eq!(head.status(), 200);
//!
//! let Some(Message::Payload(PayloadItem::Chunk(chunk))) = decoder.decode(&mut buf).unwrap() else { panic!() };
//! assert_eq!(&chunk[..], b"hi");
//! ```

mod body;
pub mod h2;
mod header;
mod request_encoder;
mod response_decoder;

pub use request_encoder::RequestEncoder;
pub use response_decoder::ResponseDecoder;
