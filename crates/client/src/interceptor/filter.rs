use super::{FILTER_PRIORITY, Interceptor, Next};
use crate::handle::panic_message;
use crate::{ClientError, ClientRequest, ClientResponse};
use async_trait::async_trait;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// Rewrites or rejects a request before it is sent.
#[async_trait]
pub trait RequestFilter: Send + Sync {
    async fn filter(&self, request: ClientRequest) -> Result<ClientRequest, ClientError>;
}

/// Rewrites or rejects a response before it is returned.
#[async_trait]
pub trait ResponseFilter: Send + Sync {
    async fn filter(&self, response: ClientResponse) -> Result<ClientResponse, ClientError>;
}

struct FnRequestFilter<F>(F);

#[async_trait]
impl<F> RequestFilter for FnRequestFilter<F>
where
    F: Fn(ClientRequest) -> Result<ClientRequest, ClientError> + Send + Sync,
{
    async fn filter(&self, request: ClientRequest) -> Result<ClientRequest, ClientError> {
        (self.0)(request)
    }
}

pub fn fn_request_filter<F>(f: F) -> impl RequestFilter
where
    F: Fn(ClientRequest) -> Result<ClientRequest, ClientError> + Send + Sync,
{
    FnRequestFilter(f)
}

struct FnResponseFilter<F>(F);

#[async_trait]
impl<F> ResponseFilter for FnResponseFilter<F>
where
    F: Fn(ClientResponse) -> Result<ClientResponse, ClientError> + Send + Sync,
{
    async fn filter(&self, response: ClientResponse) -> Result<ClientResponse, ClientError> {
        (self.0)(response)
    }
}

pub fn fn_response_filter<F>(f: F) -> impl ResponseFilter
where
    F: Fn(ClientResponse) -> Result<ClientResponse, ClientError> + Send + Sync,
{
    FnResponseFilter(f)
}

/// Runs request filters in order, then the rest of the chain, then response
/// filters in order. A filter that panics fails the request with
/// [`ClientError::Filter`].
#[derive(Clone, Default)]
pub struct FilterInterceptor {
    request_filters: Vec<Arc<dyn RequestFilter>>,
    response_filters: Vec<Arc<dyn ResponseFilter>>,
}

impl FilterInterceptor {
    pub fn new(request_filters: Vec<Arc<dyn RequestFilter>>, response_filters: Vec<Arc<dyn ResponseFilter>>) -> Self {
        Self { request_filters, response_filters }
    }

    pub fn is_empty(&self) -> bool {
        self.request_filters.is_empty() && self.response_filters.is_empty()
    }
}

impl std::fmt::Debug for FilterInterceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterInterceptor")
            .field("request_filters", &self.request_filters.len())
            .field("response_filters", &self.response_filters.len())
            .finish()
    }
}

async fn guarded<T>(fut: impl Future<Output = Result<T, ClientError>>) -> Result<T, ClientError> {
    AssertUnwindSafe(fut).catch_unwind().await.map_err(|panic| ClientError::Filter(panic_message(panic.as_ref())))?
}

#[async_trait]
impl Interceptor for FilterInterceptor {
    fn priority(&self) -> i32 {
        FILTER_PRIORITY
    }

    async fn proceed(&self, mut request: ClientRequest, next: Next<'_>) -> Result<ClientResponse, ClientError> {
        for filter in &self.request_filters {
            request = guarded(filter.filter(request)).await?;
        }
        let mut response = next.run(request).await?;
        for filter in &self.response_filters {
            response = guarded(filter.filter(response)).await?;
        }
        Ok(response)
    }
}
