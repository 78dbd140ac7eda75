use std::io;
use thiserror::Error;

use crate::codec::h2::ErrorCode;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("response error: {source}")]
    ResponseError {
        #[from]
        source: ParseError,
    },

    #[error("request error: {source}")]
    RequestError {
        #[from]
        source: SendError,
    },

    #[error("h2 error: {source}")]
    H2Error {
        #[from]
        source: H2Error,
    },
}

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("header size too large, current: {current_size} exceed the limit {max_size}")]
    TooLargeHeader { current_size: usize, max_size: usize },

    #[error("header number exceed the limit {max_num}")]
    TooManyHeaders { max_num: usize },

    #[error("invalid header: {reason}")]
    InvalidHeader { reason: String },

    #[error("invalid http version: {0:?}")]
    InvalidVersion(Option<u8>),

    #[error("invalid http status code: {0}")]
    InvalidStatus(u16),

    #[error("invalid content-length header: {reason}")]
    InvalidContentLength { reason: String },

    #[error("invalid body: {reason}")]
    InvalidBody { reason: String },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl ParseError {
    pub fn too_large_header(current_size: usize, max_size: usize) -> Self {
        Self::TooLargeHeader { current_size, max_size }
    }

    pub fn too_many_headers(max_num: usize) -> Self {
        Self::TooManyHeaders { max_num }
    }

    pub fn invalid_header<S: ToString>(str: S) -> Self {
        Self::InvalidHeader { reason: str.to_string() }
    }

    pub fn invalid_body<S: ToString>(str: S) -> Self {
        Self::InvalidBody { reason: str.to_string() }
    }

    pub fn invalid_content_length<S: ToString>(str: S) -> Self {
        Self::InvalidContentLength { reason: str.to_string() }
    }

    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: e.into() }
    }
}

#[derive(Error, Debug)]
pub enum SendError {
    #[error("invalid body: {reason}")]
    InvalidBody { reason: String },

    #[error("invalid head: {reason}")]
    InvalidHead { reason: String },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl SendError {
    pub fn invalid_body<S: ToString>(str: S) -> Self {
        Self::InvalidBody { reason: str.to_string() }
    }

    pub fn invalid_head<S: ToString>(str: S) -> Self {
        Self::InvalidHead { reason: str.to_string() }
    }

    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: e.into() }
    }
}

/// Failures raised by the HTTP/2 frame and header codecs.
///
/// Every variant maps onto the [`ErrorCode`] that should be carried by the
/// `GOAWAY` or `RST_STREAM` frame sent in response.
#[derive(Error, Debug)]
pub enum H2Error {
    #[error("protocol error: {reason}")]
    Protocol { code: ErrorCode, reason: String },

    #[error("frame of {size} bytes exceeds the limit {max_size}")]
    FrameSize { size: usize, max_size: usize },

    #[error("hpack error: {reason}")]
    Hpack { reason: String },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl H2Error {
    pub fn protocol<S: ToString>(str: S) -> Self {
        Self::Protocol { code: ErrorCode::PROTOCOL_ERROR, reason: str.to_string() }
    }

    pub fn with_code<S: ToString>(code: ErrorCode, str: S) -> Self {
        Self::Protocol { code, reason: str.to_string() }
    }

    pub fn hpack<S: ToString>(str: S) -> Self {
        Self::Hpack { reason: str.to_string() }
    }

    /// The error code to put on the wire for this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Protocol { code, .. } => *code,
            Self::FrameSize { .. } => ErrorCode::FRAME_SIZE_ERROR,
            Self::Hpack { .. } => ErrorCode::COMPRESSION_ERROR,
            Self::Io { .. } => ErrorCode::INTERNAL_ERROR,
        }
    }
}
