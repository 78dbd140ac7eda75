//! HTTP/1 head processing module
//!
//! # Components
//!
//! - [`HeaderDecoder`]: Decodes HTTP response heads from raw bytes
//!   - Supports HTTP/1.0 and HTTP/1.1 status lines
//!   - Manages header size limits
//!   - Selects the body framing of the response
//!
//! - [`HeaderEncoder`]: Encodes HTTP request heads to bytes
//!   - Writes the origin-form request line
//!   - Manages content-length and transfer-encoding headers

mod header_decoder;
mod header_encoder;

pub use header_decoder::HeaderDecoder;
pub(crate) use header_decoder::{MAX_HEADER_BYTES, MAX_HEADER_NUM};
pub use header_encoder::HeaderEncoder;
