//! The normalized error type surfaced by every client operation.
//!
//! Internal failures from the codecs, the connection actors, the pool and the
//! interceptors are all converted to one [`ClientError`] before they reach a
//! caller. The error is cheap to clone so it can be delivered both to a
//! streaming writer's pending write and to the response future.

use micro_client_proto::codec::h2::ErrorCode;
use micro_client_proto::protocol::{H2Error, ParseError, SendError};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Failures that happen before a connection is handed out; always safe to retry.
#[derive(Debug, Clone, Error)]
pub enum AcquireError {
    #[error("connection pool exhausted, {max_pending} acquires already waiting")]
    PoolExhausted { max_pending: usize },

    #[error("no connection available after {0:?}")]
    Timeout(Duration),

    #[error("connection pool closed")]
    PoolClosed,
}

#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("acquire connection failed: {0}")]
    Acquire(#[from] AcquireError),

    #[error("connection inactive")]
    ConnectionInactive,

    #[error("connection write buffer is full")]
    WriteBufferFull,

    #[error("connect failed: {0}")]
    Connect(Arc<io::Error>),

    #[error("io error: {0}")]
    Io(Arc<io::Error>),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("response content of {actual} bytes exceeds the limit {limit}")]
    ContentTooLarge { limit: u64, actual: u64 },

    #[error("connection closed")]
    ClosedConnection,

    #[error("stream {stream_id} closed by peer with {code}")]
    ClosedStream { stream_id: u32, code: ErrorCode },

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("max retries {max_retries} exceeded, last error: {source}")]
    RetryExhausted { max_retries: u32, source: Box<ClientError> },

    #[error("retry interrupted while waiting for backoff")]
    RetryInterrupted,

    #[error("request has ended")]
    RequestEnded,

    #[error("connection is null")]
    ConnectionNull,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("response callback failed: {0}")]
    Callback(String),

    #[error("filter failed: {0}")]
    Filter(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ClientError {
    pub fn connect(e: io::Error) -> Self {
        Self::Connect(Arc::new(e))
    }

    pub fn io(e: io::Error) -> Self {
        Self::Io(Arc::new(e))
    }

    pub fn protocol<S: ToString>(reason: S) -> Self {
        Self::Protocol(reason.to_string())
    }

    pub fn config<S: ToString>(reason: S) -> Self {
        Self::Config(reason.to_string())
    }

    pub fn invalid_request<S: ToString>(reason: S) -> Self {
        Self::InvalidRequest(reason.to_string())
    }

    /// Failures where the request never reached the peer, retried by the default predicate.
    pub fn is_connect_class(&self) -> bool {
        matches!(self, Self::ConnectionInactive | Self::WriteBufferFull | Self::Connect(_))
    }

    pub fn is_acquire(&self) -> bool {
        matches!(self, Self::Acquire(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Acquire(AcquireError::Timeout(_)))
    }

    /// Re-classify an io failure that happened while the request head was written.
    pub(crate) fn into_connect_class(self) -> Self {
        match self {
            Self::Io(e) => Self::Connect(e),
            other => other,
        }
    }
}

impl From<ParseError> for ClientError {
    fn from(e: ParseError) -> Self {
        match e {
            ParseError::Io { source } => Self::io(source),
            other => Self::protocol(other),
        }
    }
}

impl From<SendError> for ClientError {
    fn from(e: SendError) -> Self {
        match e {
            SendError::Io { source } => Self::io(source),
            other => Self::invalid_request(other),
        }
    }
}

impl From<H2Error> for ClientError {
    fn from(e: H2Error) -> Self {
        match e {
            H2Error::Io { source } => Self::io(source),
            other => Self::protocol(other),
        }
    }
}
