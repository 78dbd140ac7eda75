//! HTTP/2 framing layer used by the client's multiplexed connections.
//!
//! - [`FrameCodec`]: frame level encoder/decoder, including `CONTINUATION` handling
//! - [`HpackEncoder`] / [`HpackDecoder`]: header block compression
//! - [`Settings`]: SETTINGS parameters and their validation
//!
//! Stream state, flow control and request multiplexing live in the client crate.

mod frame;
mod frame_codec;
mod hpack;
pub mod settings;

pub use frame::{DEFAULT_MAX_FRAME_SIZE, DEFAULT_WINDOW_SIZE, ErrorCode, Frame, MAX_WINDOW_SIZE, PREFACE};
pub use frame_codec::FrameCodec;
pub use hpack::{HeaderBlock, HpackDecoder, HpackEncoder};
pub use settings::Settings;
