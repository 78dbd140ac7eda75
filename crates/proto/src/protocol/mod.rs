//! Core HTTP protocol abstractions shared by the codecs.
//!
//! - **Message Handling** ([`Message`], [`PayloadItem`], [`PayloadSize`]): a message is
//!   either a head or a payload item, and a payload item is a chunk, a trailer section
//!   or the end of the body.
//! - **Request Head** ([`RequestHead`]): the cloneable head of an outgoing request.
//! - **Response Head** ([`ResponseHead`]): a decoded response head without its body.
//! - **Error Handling** ([`ParseError`], [`SendError`], [`H2Error`]): decode, encode and
//!   HTTP/2 frame level failures.

mod message;
pub use message::Message;
pub use message::PayloadItem;
pub use message::PayloadSize;

mod request;
pub use request::RequestHead;

mod response;
pub use response::ResponseHead;

mod error;
pub use error::H2Error;
pub use error::HttpError;
pub use error::ParseError;
pub use error::SendError;
