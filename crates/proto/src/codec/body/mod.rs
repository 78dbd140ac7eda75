//! HTTP body handling module for response and request payloads
//!
//! # Components
//!
//! ## Decoders
//! - `ChunkedDecoder`: Handles chunked transfer encoded payloads, trailers included
//! - `LengthDecoder`: Processes fixed-length payloads
//! - [`PayloadDecoder`]: Main decoder that coordinates different decoding strategies,
//!   including bodies delimited by connection close
//!
//! ## Encoders
//! - `ChunkedEncoder`: Implements chunked transfer encoding with optional trailers
//! - `LengthEncoder`: Handles fixed-length payload encoding
//! - [`PayloadEncoder`]: Main encoder that manages different encoding strategies

mod chunked_decoder;
mod chunked_encoder;
mod length_decoder;
mod length_encoder;
mod payload_decoder;
mod payload_encoder;

pub use payload_decoder::PayloadDecoder;
pub use payload_encoder::PayloadEncoder;
