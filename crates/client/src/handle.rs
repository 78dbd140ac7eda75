//! The per-request response state machine.
//!
//! Connection tasks feed protocol events into a [`ResponseHandle`]: a head,
//! body chunks, trailers, then either the end of the response or an error.
//! A single `ended` flag guards the terminal transition, so the first of
//! `on_end`/`on_error` wins and every later event is dropped.
//!
//! Non-terminal events are forwarded to the user's callbacks, either inline
//! or through an ordered queue drained on the dedicated callback runtime.
//! Terminal callbacks are fired once by the executor, after the interceptor
//! chain has produced its final result.

use crate::context::RequestContext;
use crate::listener::EventListener;
use crate::response::TimeToFirstByte;
use crate::{ClientError, ClientResponse};
use bytes::{Bytes, BytesMut};
use http::HeaderMap;
use micro_client_proto::protocol::ResponseHead;
use parking_lot::{Mutex, ReentrantMutex};
use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

type StartFn = Arc<dyn Fn(&ResponseHead) + Send + Sync>;
type DataFn = Arc<dyn Fn(&Bytes) + Send + Sync>;
type TrailersFn = Arc<dyn Fn(&HeaderMap) + Send + Sync>;
type EndFn = Arc<dyn Fn(&ClientResponse) + Send + Sync>;
type ErrorFn = Arc<dyn Fn(&ClientError) + Send + Sync>;

/// Five independently settable response hooks.
#[derive(Clone, Default)]
pub struct ResponseCallbacks {
    on_start: Option<StartFn>,
    on_data: Option<DataFn>,
    on_trailers: Option<TrailersFn>,
    on_end: Option<EndFn>,
    on_error: Option<ErrorFn>,
}

impl ResponseCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_start(mut self, f: impl Fn(&ResponseHead) + Send + Sync + 'static) -> Self {
        self.on_start = Some(Arc::new(f));
        self
    }

    pub fn on_data(mut self, f: impl Fn(&Bytes) + Send + Sync + 'static) -> Self {
        self.on_data = Some(Arc::new(f));
        self
    }

    pub fn on_trailers(mut self, f: impl Fn(&HeaderMap) + Send + Sync + 'static) -> Self {
        self.on_trailers = Some(Arc::new(f));
        self
    }

    pub fn on_end(mut self, f: impl Fn(&ClientResponse) + Send + Sync + 'static) -> Self {
        self.on_end = Some(Arc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&ClientError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for ResponseCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseCallbacks")
            .field("on_start", &self.on_start.is_some())
            .field("on_data", &self.on_data.is_some())
            .field("on_trailers", &self.on_trailers.is_some())
            .field("on_end", &self.on_end.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// A combined response handler; every method defaults to doing nothing.
#[allow(unused_variables, reason = "the default methods ignore every event")]
pub trait ResponseHandler: Send + Sync {
    fn on_start(&self, head: &ResponseHead) {}

    fn on_data(&self, data: &Bytes) {}

    fn on_trailers(&self, trailers: &HeaderMap) {}

    fn on_end(&self, response: &ClientResponse) {}

    fn on_error(&self, error: &ClientError) {}
}

/// Whichever of the two listener forms a request carries.
#[derive(Clone)]
pub(crate) enum ResponseEvents {
    Callbacks(ResponseCallbacks),
    Handler(Arc<dyn ResponseHandler>),
}

impl ResponseEvents {
    pub(crate) fn on_start(&self, head: &ResponseHead) {
        match self {
            Self::Callbacks(callbacks) => {
                if let Some(f) = &callbacks.on_start {
                    f(head);
                }
            }
            Self::Handler(handler) => handler.on_start(head),
        }
    }

    pub(crate) fn on_data(&self, data: &Bytes) {
        match self {
            Self::Callbacks(callbacks) => {
                if let Some(f) = &callbacks.on_data {
                    f(data);
                }
            }
            Self::Handler(handler) => handler.on_data(data),
        }
    }

    pub(crate) fn on_trailers(&self, trailers: &HeaderMap) {
        match self {
            Self::Callbacks(callbacks) => {
                if let Some(f) = &callbacks.on_trailers {
                    f(trailers);
                }
            }
            Self::Handler(handler) => handler.on_trailers(trailers),
        }
    }

    pub(crate) fn on_end(&self, response: &ClientResponse) {
        match self {
            Self::Callbacks(callbacks) => {
                if let Some(f) = &callbacks.on_end {
                    f(response);
                }
            }
            Self::Handler(handler) => handler.on_end(response),
        }
    }

    pub(crate) fn on_error(&self, error: &ClientError) {
        match self {
            Self::Callbacks(callbacks) => {
                if let Some(f) = &callbacks.on_error {
                    f(error);
                }
            }
            Self::Handler(handler) => handler.on_error(error),
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "callback panicked".to_owned()
    }
}

pub(crate) type ResponseResult = Result<ClientResponse, ClientError>;
type TerminalHook = Box<dyn FnOnce() + Send>;

#[derive(Clone)]
pub(crate) struct ResponseHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    /// Held across event dispatch and the terminal transition, so no event
    /// is delivered once the handle has ended. Reentrant because a panicking
    /// inline callback fails the handle from inside its own dispatch.
    gate: ReentrantMutex<()>,
    ended: AtomicBool,
    id: AtomicU32,
    started: Instant,
    context: Arc<RequestContext>,
    listener: Arc<dyn EventListener>,
    state: Mutex<HandleState>,
}

struct HandleState {
    head: Option<ResponseHead>,
    body: BytesMut,
    trailers: Option<HeaderMap>,
    promise: Option<oneshot::Sender<ResponseResult>>,
    hooks: Vec<TerminalHook>,
    dispatch: Dispatch,
}

enum Dispatch {
    Silent,
    Inline(ResponseEvents),
    Offload(mpsc::UnboundedSender<Event>),
}

enum Event {
    Start(ResponseHead),
    Data(Bytes),
    Trailers(HeaderMap),
    Finish(ResponseResult, oneshot::Sender<ResponseResult>),
}

impl ResponseHandle {
    /// A fresh handle and the receiver of its terminal result.
    ///
    /// With a `callback_runtime`, user callbacks run there in event order and the
    /// result is only delivered after every queued callback has returned.
    pub(crate) fn new(
        context: Arc<RequestContext>,
        listener: Arc<dyn EventListener>,
        callback_runtime: Option<&Handle>,
    ) -> (Self, oneshot::Receiver<ResponseResult>) {
        let (promise, receiver) = oneshot::channel();
        let events = context.events();
        let inner = Arc::new_cyclic(|weak: &Weak<HandleInner>| {
            let dispatch = match (events, callback_runtime) {
                (None, _) => Dispatch::Silent,
                (Some(events), None) => Dispatch::Inline(events),
                (Some(events), Some(runtime)) => {
                    let (sender, queue) = mpsc::unbounded_channel();
                    runtime.spawn(run_callbacks(events, queue, Weak::clone(weak)));
                    Dispatch::Offload(sender)
                }
            };
            HandleInner {
                gate: ReentrantMutex::new(()),
                ended: AtomicBool::new(false),
                id: AtomicU32::new(0),
                started: Instant::now(),
                context,
                listener,
                state: Mutex::new(HandleState {
                    head: None,
                    body: BytesMut::new(),
                    trailers: None,
                    promise: Some(promise),
                    hooks: Vec::new(),
                    dispatch,
                }),
            }
        });
        (Self { inner }, receiver)
    }

    pub(crate) fn id(&self) -> u32 {
        self.inner.id.load(Ordering::Acquire)
    }

    pub(crate) fn set_id(&self, id: u32) {
        self.inner.id.store(id, Ordering::Release);
    }

    pub(crate) fn is_ended(&self) -> bool {
        self.inner.ended.load(Ordering::Acquire)
    }

    pub(crate) fn same(&self, other: &ResponseHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn context(&self) -> &Arc<RequestContext> {
        &self.inner.context
    }

    /// Run `hook` once the handle ends, or right away if it already has.
    pub(crate) fn on_terminal(&self, hook: impl FnOnce() + Send + 'static) {
        let mut state = self.inner.state.lock();
        if !self.is_ended() {
            state.hooks.push(Box::new(hook));
            return;
        }
        drop(state);
        hook();
    }

    /// An interim `100 Continue` arrived: resume the deferred body.
    pub(crate) fn on_continue(&self) {
        if self.is_ended() {
            return;
        }
        if !self.inner.context.fire_continue() {
            trace!(id = self.id(), "100 continue without a waiting body");
        }
    }

    pub(crate) fn on_message(&self, mut head: ResponseHead) {
        let _gate = self.inner.gate.lock();
        if self.is_ended() {
            return;
        }
        head.extensions_mut().insert(TimeToFirstByte(self.inner.started.elapsed()));
        self.inner.listener.on_message_received(&head);
        // a final head without a preceding 100 means the deferred body is not wanted
        self.inner.context.cancel_continue();

        let inline = {
            let mut state = self.inner.state.lock();
            let inline = match &state.dispatch {
                Dispatch::Silent => None,
                Dispatch::Inline(events) => Some((events.clone(), clone_head(&head))),
                Dispatch::Offload(sender) => {
                    let _ = sender.send(Event::Start(clone_head(&head)));
                    None
                }
            };
            state.head = Some(head);
            inline
        };
        if let Some((events, head)) = inline {
            self.guard(|| events.on_start(&head));
        }
    }

    pub(crate) fn on_data(&self, data: Bytes) {
        let _gate = self.inner.gate.lock();
        if self.is_ended() || data.is_empty() {
            return;
        }
        let inline = {
            let mut state = self.inner.state.lock();
            state.body.extend_from_slice(&data);
            match &state.dispatch {
                Dispatch::Silent => None,
                Dispatch::Inline(events) => Some(events.clone()),
                Dispatch::Offload(sender) => {
                    let _ = sender.send(Event::Data(data.clone()));
                    None
                }
            }
        };
        if let Some(events) = inline {
            self.guard(|| events.on_data(&data));
        }
    }

    pub(crate) fn on_trailers(&self, trailers: HeaderMap) {
        let _gate = self.inner.gate.lock();
        if self.is_ended() {
            return;
        }
        let inline = {
            let mut state = self.inner.state.lock();
            let inline = match &state.dispatch {
                Dispatch::Silent => None,
                Dispatch::Inline(events) => Some(events.clone()),
                Dispatch::Offload(sender) => {
                    let _ = sender.send(Event::Trailers(trailers.clone()));
                    None
                }
            };
            state.trailers = Some(trailers.clone());
            inline
        };
        if let Some(events) = inline {
            self.guard(|| events.on_trailers(&trailers));
        }
    }

    /// The response is complete. Dropped if the handle already ended.
    pub(crate) fn on_end(&self) {
        let _gate = self.inner.gate.lock();
        if self.inner.ended.swap(true, Ordering::AcqRel) {
            return;
        }
        let result = {
            let mut state = self.inner.state.lock();
            match state.head.take() {
                Some(head) => {
                    let body = std::mem::take(&mut state.body).freeze();
                    Ok(ClientResponse::new(head, body, state.trailers.take()))
                }
                None => Err(ClientError::protocol("response ended before its head")),
            }
        };
        self.finish(result);
    }

    /// The single terminal failure path. Dropped if the handle already ended.
    pub(crate) fn on_error(&self, error: ClientError) {
        let _gate = self.inner.gate.lock();
        if self.inner.ended.swap(true, Ordering::AcqRel) {
            trace!(id = self.id(), cause = %error, "error after the response ended, dropped");
            return;
        }
        debug!(id = self.id(), cause = %error, "response failed");
        self.finish(Err(error));
    }

    fn finish(&self, result: ResponseResult) {
        self.inner.context.cancel_continue();
        match &result {
            Ok(response) => self.inner.listener.on_completed(response),
            Err(e) => self.inner.listener.on_error(e),
        }

        let (hooks, promise, dispatch) = {
            let mut state = self.inner.state.lock();
            let dispatch = std::mem::replace(&mut state.dispatch, Dispatch::Silent);
            (std::mem::take(&mut state.hooks), state.promise.take(), dispatch)
        };

        for hook in hooks {
            hook();
        }

        let Some(promise) = promise else {
            return;
        };
        match dispatch {
            // the callback task resolves the promise after the queued callbacks ran
            Dispatch::Offload(sender) => {
                if let Err(mpsc::error::SendError(Event::Finish(result, promise))) = sender.send(Event::Finish(result, promise)) {
                    let _ = promise.send(result);
                }
            }
            Dispatch::Silent | Dispatch::Inline(_) => {
                let _ = promise.send(result);
            }
        }
    }

    /// Run a non-terminal user callback, turning a panic into a terminal error.
    fn guard(&self, f: impl FnOnce()) {
        if let Err(panic) = catch_unwind(AssertUnwindSafe(f)) {
            self.on_error(ClientError::Callback(panic_message(panic.as_ref())));
        }
    }
}

impl fmt::Debug for ResponseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseHandle").field("id", &self.id()).field("ended", &self.is_ended()).finish_non_exhaustive()
    }
}

fn clone_head(head: &ResponseHead) -> ResponseHead {
    let mut clone = ResponseHead::new(());
    *clone.status_mut() = head.status();
    *clone.version_mut() = head.version();
    *clone.headers_mut() = head.headers().clone();
    if let Some(ttfb) = head.extensions().get::<TimeToFirstByte>() {
        clone.extensions_mut().insert(*ttfb);
    }
    clone
}

async fn run_callbacks(events: ResponseEvents, mut queue: mpsc::UnboundedReceiver<Event>, handle: Weak<HandleInner>) {
    while let Some(event) = queue.recv().await {
        let outcome = match event {
            Event::Start(head) => catch_unwind(AssertUnwindSafe(|| events.on_start(&head))),
            Event::Data(data) => catch_unwind(AssertUnwindSafe(|| events.on_data(&data))),
            Event::Trailers(trailers) => catch_unwind(AssertUnwindSafe(|| events.on_trailers(&trailers))),
            Event::Finish(result, promise) => {
                let _ = promise.send(result);
                return;
            }
        };
        if let Err(panic) = outcome
            && let Some(inner) = handle.upgrade()
        {
            ResponseHandle { inner }.on_error(ClientError::Callback(panic_message(panic.as_ref())));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Resources;
    use crate::listener::NoopListener;
    use http::StatusCode;
    use std::sync::atomic::AtomicUsize;

    fn new_handle(context: RequestContext) -> (ResponseHandle, oneshot::Receiver<ResponseResult>) {
        ResponseHandle::new(Arc::new(context), Arc::new(NoopListener), None)
    }

    fn head(status: StatusCode) -> ResponseHead {
        let mut head = ResponseHead::new(());
        *head.status_mut() = status;
        head
    }

    #[tokio::test]
    async fn end_then_error_keeps_success() {
        let (handle, receiver) = new_handle(RequestContext::new());
        handle.on_message(head(StatusCode::OK));
        handle.on_data(Bytes::from_static(b"hello"));
        handle.on_end();
        handle.on_error(ClientError::ClosedConnection);

        let response = receiver.await.unwrap().unwrap();
        assert_eq!(response.body().as_ref(), b"hello");
        assert!(response.time_to_first_byte().is_some());
    }

    #[tokio::test]
    async fn error_then_end_keeps_error() {
        let (handle, receiver) = new_handle(RequestContext::new());
        handle.on_message(head(StatusCode::OK));
        handle.on_error(ClientError::ClosedConnection);
        handle.on_data(Bytes::from_static(b"late"));
        handle.on_end();

        assert!(matches!(receiver.await.unwrap(), Err(ClientError::ClosedConnection)));
    }

    #[test]
    fn error_waits_for_the_data_callback_in_flight() {
        let context = RequestContext::new();
        let slot: Arc<Mutex<Option<ResponseHandle>>> = Arc::new(Mutex::new(None));
        let observed = Arc::new(Mutex::new(Vec::new()));
        let (handle_slot, log) = (Arc::clone(&slot), Arc::clone(&observed));
        context.set_callbacks(ResponseCallbacks::new().on_data(move |_| {
            let Some(handle) = handle_slot.lock().clone() else { return };
            let failed = Arc::new(AtomicBool::new(false));
            let flag = Arc::clone(&failed);
            std::thread::spawn(move || {
                handle.on_error(ClientError::ClosedConnection);
                flag.store(true, Ordering::SeqCst);
            });
            std::thread::sleep(std::time::Duration::from_millis(50));
            log.lock().push(failed.load(Ordering::SeqCst));
        }));

        let (handle, receiver) = new_handle(context);
        *slot.lock() = Some(handle.clone());
        handle.on_message(head(StatusCode::OK));
        handle.on_data(Bytes::from_static(b"x"));

        assert!(matches!(receiver.blocking_recv(), Ok(Err(ClientError::ClosedConnection))));
        handle.on_data(Bytes::from_static(b"late"));
        assert_eq!(*observed.lock(), vec![false]);
    }

    #[tokio::test]
    async fn end_without_head_is_a_protocol_error() {
        let (handle, receiver) = new_handle(RequestContext::new());
        handle.on_end();
        assert!(matches!(receiver.await.unwrap(), Err(ClientError::Protocol(_))));
    }

    #[test]
    fn hooks_run_once_even_when_added_late() {
        let runs = Arc::new(AtomicUsize::new(0));
        let (handle, _receiver) = new_handle(RequestContext::new());

        let counter = Arc::clone(&runs);
        handle.on_terminal(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        handle.on_error(ClientError::ClosedConnection);
        handle.on_end();
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        let counter = Arc::clone(&runs);
        handle.on_terminal(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn panicking_data_callback_fails_the_response() {
        let context = RequestContext::new();
        context.set_callbacks(ResponseCallbacks::new().on_data(|_| panic!("bad chunk")));
        let (handle, receiver) = new_handle(context);

        handle.on_message(head(StatusCode::OK));
        handle.on_data(Bytes::from_static(b"x"));
        handle.on_end();

        match receiver.await.unwrap() {
            Err(ClientError::Callback(message)) => assert_eq!(message, "bad chunk"),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[tokio::test]
    async fn callback_form_wins_over_handler() {
        struct Counting(Arc<AtomicUsize>);
        impl ResponseHandler for Counting {
            fn on_data(&self, _: &Bytes) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let handler_calls = Arc::new(AtomicUsize::new(0));
        let callback_calls = Arc::new(AtomicUsize::new(0));
        let context = RequestContext::new();
        context.set_handler(Counting(Arc::clone(&handler_calls)));
        let counter = Arc::clone(&callback_calls);
        context.set_callbacks(ResponseCallbacks::new().on_data(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let (handle, receiver) = new_handle(context);
        handle.on_message(head(StatusCode::OK));
        handle.on_data(Bytes::from_static(b"x"));
        handle.on_end();
        receiver.await.unwrap().unwrap();

        assert_eq!(callback_calls.load(Ordering::SeqCst), 1);
        assert_eq!(handler_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn offloaded_callbacks_run_before_the_result() {
        let resources = Resources::with_callback_threads(1).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let context = RequestContext::new();
        let chunks = Arc::clone(&seen);
        context.set_callbacks(ResponseCallbacks::new().on_data(move |data| {
            let name = std::thread::current().name().map(str::to_owned);
            chunks.lock().push((data.clone(), name));
        }));

        let callback_runtime = resources.callback_handle().unwrap();
        let (handle, receiver) = ResponseHandle::new(Arc::new(context), Arc::new(NoopListener), Some(&callback_runtime));
        handle.on_message(head(StatusCode::OK));
        handle.on_data(Bytes::from_static(b"a"));
        handle.on_data(Bytes::from_static(b"b"));
        handle.on_end();

        let response = receiver.blocking_recv().unwrap().unwrap();
        assert_eq!(response.body().as_ref(), b"ab");

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0.as_ref(), b"a");
        assert_eq!(seen[1].1.as_deref(), Some("micro-client-callback"));
    }
}
