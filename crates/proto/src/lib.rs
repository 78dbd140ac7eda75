//! Wire protocol layer of the micro HTTP client.
//!
//! This crate contains no I/O: it turns request heads and payload items into
//! bytes and bytes back into response heads and payload items, for HTTP/1.1
//! and HTTP/2. Connection management, pooling and request execution live in
//! the `micro-client` crate.
//!
//! # Modules
//!
//! - [`protocol`]: message model and error types shared by both protocols
//! - [`codec`]: the HTTP/1 request encoder and response decoder, and the
//!   HTTP/2 frame codec under [`codec::h2`]

pub mod codec;
pub mod protocol;

mod utils;
pub(crate) use utils::ensure;
