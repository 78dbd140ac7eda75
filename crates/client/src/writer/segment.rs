//! The body channel of a client-streamed request.
//!
//! Callers may write from any task. Every write goes through one lock and is
//! handed to the connection's command channel while the lock is held, so the
//! connection sees the writes in submission order. Writes issued before the
//! connection is known are queued and flushed, in order, when the request's
//! head has been started.

use crate::ClientError;
use crate::conn::{Outbound, PooledConnection, WriteResult, acked};
use bytes::Bytes;
use http::HeaderMap;
use micro_client_proto::protocol::PayloadSize;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Notify, oneshot};
use tracing::trace;

/// Write side of a streamed request body.
///
/// Cheap to clone; all clones feed the same body.
#[derive(Clone)]
pub struct SegmentChannel {
    inner: Arc<Inner>,
}

struct Inner {
    length: Option<u64>,
    state: Mutex<State>,
    ready: Notify,
}

#[derive(Default)]
struct State {
    binding: Option<(PooledConnection, u32)>,
    queued: VecDeque<(Outbound, oneshot::Sender<WriteResult>)>,
    ended: bool,
    failed: Option<ClientError>,
}

impl SegmentChannel {
    /// A body of exactly `length` bytes, sent with `Content-Length`.
    pub fn with_length(length: u64) -> Self {
        Self::new(Some(length))
    }

    /// A body of unknown length, sent chunked on HTTP/1.1.
    pub fn chunked() -> Self {
        Self::new(None)
    }

    fn new(length: Option<u64>) -> Self {
        Self { inner: Arc::new(Inner { length, state: Mutex::new(State::default()), ready: Notify::new() }) }
    }

    pub fn length(&self) -> Option<u64> {
        self.inner.length
    }

    pub(crate) fn payload_size(&self) -> PayloadSize {
        // never `Empty`: the caller still ends the body explicitly
        self.inner.length.map_or(PayloadSize::Chunked, PayloadSize::Length)
    }

    /// Send `data` and wait until the connection has written it.
    pub async fn write(&self, data: impl Into<Bytes>) -> Result<(), ClientError> {
        let data = data.into();
        let receiver = {
            let mut state = self.inner.state.lock();
            if state.ended {
                return Err(ClientError::RequestEnded);
            }
            if let Some(e) = &state.failed {
                return Err(e.clone());
            }
            Self::submit(&mut state, Outbound::Data { data, end_stream: false })
        };
        acked(receiver).await
    }

    /// Finish the body, optionally with trailers, and wait until it is written.
    ///
    /// Ending a body whose connection isn't known yet fails with
    /// [`ClientError::ConnectionNull`], which also becomes the response's result.
    pub async fn end(&self, trailers: Option<HeaderMap>) -> Result<(), ClientError> {
        let receiver = {
            let mut state = self.inner.state.lock();
            if state.ended {
                return Err(ClientError::RequestEnded);
            }
            state.ended = true;
            if let Some(e) = &state.failed {
                return Err(e.clone());
            }
            if state.binding.is_none() {
                Self::fail_locked(&mut state, &ClientError::ConnectionNull);
                drop(state);
                self.inner.ready.notify_waiters();
                return Err(ClientError::ConnectionNull);
            }
            let outbound = match trailers {
                Some(trailers) if !trailers.is_empty() => Outbound::Trailers(trailers),
                _ => Outbound::End,
            };
            Self::submit(&mut state, outbound)
        };
        acked(receiver).await
    }

    fn submit(state: &mut State, outbound: Outbound) -> oneshot::Receiver<WriteResult> {
        let (tx, rx) = oneshot::channel();
        match &state.binding {
            Some((connection, id)) => connection.send(*id, vec![outbound], tx),
            None => state.queued.push_back((outbound, tx)),
        }
        rx
    }

    /// Wait until the request has a connection, or has failed before getting one.
    pub async fn ready(&self) -> Result<(), ClientError> {
        loop {
            let notified = self.inner.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.inner.state.lock();
                if let Some(e) = &state.failed {
                    return Err(e.clone());
                }
                if state.binding.is_some() {
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    /// Attach the connection carrying stream `id` and flush queued writes to it.
    pub(crate) fn bind(&self, connection: &PooledConnection, id: u32) -> Result<(), ClientError> {
        {
            let mut state = self.inner.state.lock();
            if let Some(e) = &state.failed {
                return Err(e.clone());
            }
            trace!(connection = connection.id(), id, queued = state.queued.len(), "segment channel bound");
            for (outbound, tx) in state.queued.drain(..) {
                connection.send(id, vec![outbound], tx);
            }
            state.binding = Some((connection.clone(), id));
        }
        self.inner.ready.notify_waiters();
        Ok(())
    }

    /// Fail pending and future writes with `error`. The first failure sticks.
    pub(crate) fn fail(&self, error: &ClientError) {
        Self::fail_locked(&mut self.inner.state.lock(), error);
        self.inner.ready.notify_waiters();
    }

    fn fail_locked(state: &mut State, error: &ClientError) {
        if state.failed.is_none() {
            state.failed = Some(error.clone());
        }
        state.binding = None;
        for (_, tx) in state.queued.drain(..) {
            let _ = tx.send(Err(error.clone()));
        }
    }

    /// The response is over; further writes are refused.
    pub(crate) fn close(&self) {
        self.fail(&ClientError::RequestEnded);
    }
}

impl fmt::Debug for SegmentChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("SegmentChannel")
            .field("length", &self.inner.length)
            .field("bound", &state.binding.is_some())
            .field("queued", &state.queued.len())
            .field("ended", &state.ended)
            .finish_non_exhaustive()
    }
}
