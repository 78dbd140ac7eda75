//! Per-operation state shared by every attempt of one logical request.
//!
//! A [`RequestContext`] is created with the request and lives until the
//! terminal result is delivered. Retries and redirects reuse it, so counters
//! keep growing across attempts instead of being reset.

use crate::handle::{ResponseCallbacks, ResponseEvents, ResponseHandler, panic_message};
use crate::{ClientConfig, ClientError, ClientResponse};
use http::Extensions;
use parking_lot::Mutex;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Default)]
pub struct RequestContext {
    attributes: Mutex<Extensions>,
    settings: Mutex<Settings>,
    retry_count: AtomicU32,
    redirect_count: AtomicU32,
    callbacks: Mutex<Option<ResponseCallbacks>>,
    handler: Mutex<Option<Arc<dyn ResponseHandler>>>,
    terminal_notified: AtomicBool,
    continue_slot: Mutex<Option<oneshot::Sender<()>>>,
    cancellation: CancellationToken,
}

/// Values left unset fall back to the client configuration.
#[derive(Debug, Default, Clone, Copy)]
struct Settings {
    max_retries: Option<u32>,
    max_redirects: Option<u32>,
    expect_continue: Option<bool>,
    read_timeout: Option<Option<Duration>>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T: Clone + Send + Sync + 'static>(&self, value: T) -> Option<T> {
        self.attributes.lock().insert(value)
    }

    pub fn get<T: Clone + Send + Sync + 'static>(&self) -> Option<T> {
        self.attributes.lock().get::<T>().cloned()
    }

    pub fn remove<T: Clone + Send + Sync + 'static>(&self) -> Option<T> {
        self.attributes.lock().remove::<T>()
    }

    pub fn max_retries(&self) -> u32 {
        self.settings.lock().max_retries.unwrap_or(0)
    }

    pub fn set_max_retries(&self, max_retries: u32) {
        self.settings.lock().max_retries = Some(max_retries);
    }

    pub fn max_redirects(&self) -> u32 {
        self.settings.lock().max_redirects.unwrap_or(0)
    }

    pub fn set_max_redirects(&self, max_redirects: u32) {
        self.settings.lock().max_redirects = Some(max_redirects);
    }

    pub fn expect_continue(&self) -> bool {
        self.settings.lock().expect_continue.unwrap_or(false)
    }

    pub fn set_expect_continue(&self, expect_continue: bool) {
        self.settings.lock().expect_continue = Some(expect_continue);
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.settings.lock().read_timeout.flatten()
    }

    /// `None` disables the read timeout for this request.
    pub fn set_read_timeout(&self, read_timeout: Option<Duration>) {
        self.settings.lock().read_timeout = Some(read_timeout);
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::Acquire)
    }

    /// Bump the retry counter, returning the new value.
    pub(crate) fn increment_retry(&self) -> u32 {
        self.retry_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn redirect_count(&self) -> u32 {
        self.redirect_count.load(Ordering::Acquire)
    }

    pub(crate) fn increment_redirect(&self) -> u32 {
        self.redirect_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn set_callbacks(&self, callbacks: ResponseCallbacks) {
        *self.callbacks.lock() = Some(callbacks);
    }

    pub fn set_handler(&self, handler: impl ResponseHandler + 'static) {
        *self.handler.lock() = Some(Arc::new(handler));
    }

    /// The user's response listener. Structured callbacks win over a combined handler.
    pub(crate) fn events(&self) -> Option<ResponseEvents> {
        let callbacks = self.callbacks.lock().clone();
        let handler = self.handler.lock().clone();
        match (callbacks, handler) {
            (Some(callbacks), Some(_)) => {
                warn!("both response callbacks and a response handler are set, the handler is ignored");
                Some(ResponseEvents::Callbacks(callbacks))
            }
            (Some(callbacks), None) => Some(ResponseEvents::Callbacks(callbacks)),
            (None, Some(handler)) => Some(ResponseEvents::Handler(handler)),
            (None, None) => None,
        }
    }

    /// Cancels pending retry backoff for this operation.
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub(crate) fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub(crate) fn set_continue(&self, sender: oneshot::Sender<()>) {
        *self.continue_slot.lock() = Some(sender);
    }

    /// Resume a body deferred behind `Expect: 100-continue`. Returns whether a writer was waiting.
    pub(crate) fn fire_continue(&self) -> bool {
        match self.continue_slot.lock().take() {
            Some(sender) => sender.send(()).is_ok(),
            None => false,
        }
    }

    /// Drop a pending continue callback, telling the writer the body won't be requested.
    pub(crate) fn cancel_continue(&self) {
        self.continue_slot.lock().take();
    }

    pub(crate) fn apply_defaults(&self, config: &ClientConfig) {
        let mut settings = self.settings.lock();
        settings.max_retries = settings.max_retries.or(Some(config.max_retries));
        settings.max_redirects = settings.max_redirects.or(Some(config.max_redirects));
        settings.expect_continue = settings.expect_continue.or(Some(config.expect_continue));
        settings.read_timeout = settings.read_timeout.or(Some(config.read_timeout));
    }

    /// Deliver the terminal result to the user's `on_end`/`on_error` exactly once.
    ///
    /// A panic in `on_end` turns the result into a [`ClientError::Callback`]
    /// which is then reported through `on_error`.
    pub(crate) fn complete(&self, result: Result<ClientResponse, ClientError>) -> Result<ClientResponse, ClientError> {
        if self.terminal_notified.swap(true, Ordering::AcqRel) {
            return result;
        }
        let Some(events) = self.events() else {
            return result;
        };

        match result {
            Ok(response) => match catch_unwind(AssertUnwindSafe(|| events.on_end(&response))) {
                Ok(()) => Ok(response),
                Err(panic) => {
                    let e = ClientError::Callback(panic_message(panic.as_ref()));
                    let _ = catch_unwind(AssertUnwindSafe(|| events.on_error(&e)));
                    Err(e)
                }
            },
            Err(e) => {
                let _ = catch_unwind(AssertUnwindSafe(|| events.on_error(&e)));
                Err(e)
            }
        }
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("settings", &*self.settings.lock())
            .field("retry_count", &self.retry_count())
            .field("redirect_count", &self.redirect_count())
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::Response;
    use std::sync::atomic::AtomicUsize;

    fn ok_response() -> ClientResponse {
        ClientResponse::new(Response::new(()), Bytes::new(), None)
    }

    #[test]
    fn explicit_values_survive_defaults() {
        let context = RequestContext::new();
        context.set_max_retries(3);
        context.set_read_timeout(None);

        let config = ClientConfig { max_retries: 1, max_redirects: 5, ..Default::default() };
        context.apply_defaults(&config);
        assert_eq!(context.max_retries(), 3);
        assert_eq!(context.max_redirects(), 5);
        assert_eq!(context.read_timeout(), None);
    }

    #[test]
    fn attributes() {
        let context = RequestContext::new();
        context.insert(7u8);
        assert_eq!(context.get::<u8>(), Some(7));
        assert_eq!(context.remove::<u8>(), Some(7));
        assert_eq!(context.get::<u8>(), None);
    }

    #[test]
    fn terminal_callbacks_fire_once() {
        let ends = Arc::new(AtomicUsize::new(0));
        let context = RequestContext::new();
        let counter = Arc::clone(&ends);
        context.set_callbacks(ResponseCallbacks::new().on_end(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(context.complete(Ok(ok_response())).is_ok());
        assert!(context.complete(Ok(ok_response())).is_ok());
        assert_eq!(ends.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_on_end_is_redirected_to_on_error() {
        let errors = Arc::new(AtomicUsize::new(0));
        let context = RequestContext::new();
        let counter = Arc::clone(&errors);
        context.set_callbacks(
            ResponseCallbacks::new().on_end(|_| panic!("boom")).on_error(move |e| {
                assert!(matches!(e, ClientError::Callback(message) if message.contains("boom")));
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let result = context.complete(Ok(ok_response()));
        assert!(matches!(result, Err(ClientError::Callback(_))));
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn continue_slot() {
        let context = RequestContext::new();
        assert!(!context.fire_continue());

        let (tx, mut rx) = oneshot::channel();
        context.set_continue(tx);
        assert!(context.fire_continue());
        assert!(rx.try_recv().is_ok());

        let (tx, mut rx) = oneshot::channel();
        context.set_continue(tx);
        context.cancel_continue();
        assert!(rx.try_recv().is_err());
    }
}
