//! The interceptor chain wrapped around the transceiver.
//!
//! Interceptors run in ascending [`priority`](Interceptor::priority) order,
//! lowest first and outermost. Each one gets the request and a [`Next`]
//! continuation; calling [`Next::run`] hands the request to the rest of the
//! chain and finally to the transceiver. `Next` is `Copy`, so an interceptor
//! may run the rest of the chain more than once.

mod decompress;
mod expect_continue;
mod filter;
mod redirect;
mod retry;

pub use decompress::DecompressInterceptor;
pub use expect_continue::ExpectContinueInterceptor;
pub use filter::{FilterInterceptor, RequestFilter, ResponseFilter, fn_request_filter, fn_response_filter};
pub use redirect::RedirectInterceptor;
pub use retry::{Backoff, ConnectFailures, ExponentialBackoff, NoBackoff, RetryInterceptor, RetryPredicate};

use crate::transceiver::Transceive;
use crate::{ClientError, ClientRequest, ClientResponse};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

pub const EXPECT_CONTINUE_PRIORITY: i32 = 10;
pub const REDIRECT_PRIORITY: i32 = 20;
pub const RETRY_PRIORITY: i32 = 30;
pub const DECOMPRESS_PRIORITY: i32 = 40;
pub const FILTER_PRIORITY: i32 = 50;

#[async_trait]
pub trait Interceptor: Send + Sync {
    /// Lower values run first, further from the network.
    fn priority(&self) -> i32 {
        0
    }

    async fn proceed(&self, request: ClientRequest, next: Next<'_>) -> Result<ClientResponse, ClientError>;
}

/// The rest of the chain after the running interceptor.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    rest: &'a [Arc<dyn Interceptor>],
    transceiver: &'a dyn Transceive,
}

impl Next<'_> {
    pub async fn run(self, request: ClientRequest) -> Result<ClientResponse, ClientError> {
        match self.rest.split_first() {
            Some((interceptor, rest)) => interceptor.proceed(request, Next { rest, transceiver: self.transceiver }).await,
            None => self.transceiver.transceive(request).await,
        }
    }
}

impl fmt::Debug for Next<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next").field("remaining", &self.rest.len()).finish_non_exhaustive()
    }
}

/// Interceptors sorted by priority; equal priorities keep their insertion order.
#[derive(Clone, Default)]
pub(crate) struct InterceptorChain {
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl InterceptorChain {
    pub(crate) fn new(mut interceptors: Vec<Arc<dyn Interceptor>>) -> Self {
        interceptors.sort_by_key(|interceptor| interceptor.priority());
        Self { interceptors }
    }

    pub(crate) async fn execute(&self, request: ClientRequest, transceiver: &dyn Transceive) -> Result<ClientResponse, ClientError> {
        Next { rest: &self.interceptors, transceiver }.run(request).await
    }

    pub(crate) fn len(&self) -> usize {
        self.interceptors.len()
    }
}

impl fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let priorities: Vec<i32> = self.interceptors.iter().map(|interceptor| interceptor.priority()).collect();
        f.debug_struct("InterceptorChain").field("priorities", &priorities).finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::transceiver::MockTransceive;
    use bytes::Bytes;
    use http::{Response, StatusCode};
    use parking_lot::Mutex;

    pub(crate) fn response(status: StatusCode) -> ClientResponse {
        let head = Response::builder().status(status).body(()).unwrap();
        ClientResponse::new(head, Bytes::new(), None)
    }

    struct Recording {
        name: &'static str,
        priority: i32,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Interceptor for Recording {
        fn priority(&self) -> i32 {
            self.priority
        }

        async fn proceed(&self, request: ClientRequest, next: Next<'_>) -> Result<ClientResponse, ClientError> {
            self.log.lock().push(self.name);
            next.run(request).await
        }
    }

    #[tokio::test]
    async fn runs_in_priority_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let recording = |name, priority| -> Arc<dyn Interceptor> { Arc::new(Recording { name, priority, log: Arc::clone(&log) }) };
        let chain = InterceptorChain::new(vec![recording("inner", 50), recording("outer", 10), recording("middle", 10)]);

        let mut transceiver = MockTransceive::new();
        transceiver.expect_transceive().times(1).returning(|_| Ok(response(StatusCode::OK)));

        let response = chain.execute(ClientRequest::get("http://example.com/").unwrap(), &transceiver).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(*log.lock(), ["outer", "middle", "inner"]);
    }

    #[tokio::test]
    async fn empty_chain_calls_the_transceiver() {
        let mut transceiver = MockTransceive::new();
        transceiver.expect_transceive().times(1).returning(|_| Err(ClientError::ClosedConnection));

        let chain = InterceptorChain::default();
        let result = chain.execute(ClientRequest::get("http://example.com/").unwrap(), &transceiver).await;
        assert!(matches!(result, Err(ClientError::ClosedConnection)));
    }
}
