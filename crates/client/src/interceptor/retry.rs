//! Retry with backoff.
//!
//! The retry counter lives in the request's context, so it keeps counting
//! across every attempt of one logical request, including attempts started by
//! a redirect.

use super::{Interceptor, Next, RETRY_PRIORITY};
use crate::{AcquireError, ClientError, ClientRequest, ClientResponse};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Decides whether an attempt's outcome is worth another attempt.
#[cfg_attr(test, mockall::automock)]
pub trait RetryPredicate: Send + Sync {
    /// `retries` counts the retries already made.
    fn should_retry(&self, request: &ClientRequest, outcome: &Result<ClientResponse, ClientError>, retries: u32) -> bool;
}

impl<F> RetryPredicate for F
where
    F: Fn(&ClientRequest, &Result<ClientResponse, ClientError>, u32) -> bool + Send + Sync,
{
    fn should_retry(&self, request: &ClientRequest, outcome: &Result<ClientResponse, ClientError>, retries: u32) -> bool {
        (self)(request, outcome, retries)
    }
}

/// The default predicate: retry only when the request never reached the peer.
///
/// Covers connect-class failures and pool acquire timeouts or exhaustion.
/// A closed pool stays fatal.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConnectFailures;

impl RetryPredicate for ConnectFailures {
    fn should_retry(&self, _request: &ClientRequest, outcome: &Result<ClientResponse, ClientError>, _retries: u32) -> bool {
        match outcome {
            Err(ClientError::Acquire(AcquireError::PoolClosed)) => false,
            Err(e) => e.is_connect_class() || e.is_acquire(),
            Ok(_) => false,
        }
    }
}

/// The delay before retry number `attempt`, counting from 1.
pub trait Backoff: Send + Sync {
    fn delay(&self, attempt: u32) -> Option<Duration>;
}

impl<F> Backoff for F
where
    F: Fn(u32) -> Option<Duration> + Send + Sync,
{
    fn delay(&self, attempt: u32) -> Option<Duration> {
        (self)(attempt)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoBackoff;

impl Backoff for NoBackoff {
    fn delay(&self, _attempt: u32) -> Option<Duration> {
        None
    }
}

/// `base * 2^(attempt - 1)`, capped at `max`.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff for ExponentialBackoff {
    fn delay(&self, attempt: u32) -> Option<Duration> {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        Some(self.base.saturating_mul(factor).min(self.max))
    }
}

#[derive(Clone)]
pub struct RetryInterceptor {
    predicate: Arc<dyn RetryPredicate>,
    backoff: Arc<dyn Backoff>,
}

impl Default for RetryInterceptor {
    fn default() -> Self {
        Self::new(Arc::new(ConnectFailures), Arc::new(NoBackoff))
    }
}

impl RetryInterceptor {
    pub fn new(predicate: Arc<dyn RetryPredicate>, backoff: Arc<dyn Backoff>) -> Self {
        Self { predicate, backoff }
    }
}

impl fmt::Debug for RetryInterceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryInterceptor").finish_non_exhaustive()
    }
}

#[async_trait]
impl Interceptor for RetryInterceptor {
    fn priority(&self) -> i32 {
        RETRY_PRIORITY
    }

    async fn proceed(&self, request: ClientRequest, next: Next<'_>) -> Result<ClientResponse, ClientError> {
        let context = Arc::clone(request.context());
        let max_retries = context.max_retries();
        // a streamed body is consumed by its first attempt
        if max_retries < 1 || request.is_streaming() {
            return next.run(request).await;
        }

        loop {
            let outcome = next.run(request.clone()).await;
            if !self.predicate.should_retry(&request, &outcome, context.retry_count()) {
                return outcome;
            }
            if context.retry_count() >= max_retries {
                return match outcome {
                    Ok(response) => Ok(response),
                    Err(e) => Err(ClientError::RetryExhausted { max_retries, source: Box::new(e) }),
                };
            }

            let attempt = context.increment_retry();
            let delay = self.backoff.delay(attempt).unwrap_or_default();
            match &outcome {
                Err(e) => debug!(uri = %request.uri(), attempt, max_retries, ?delay, cause = %e, "retrying request"),
                Ok(response) => debug!(uri = %request.uri(), attempt, max_retries, ?delay, status = %response.status(), "retrying request"),
            }
            let cancellation = context.cancellation();
            if cancellation.is_cancelled() {
                return Err(ClientError::RetryInterrupted);
            }
            if !delay.is_zero() {
                tokio::select! {
                    () = cancellation.cancelled() => return Err(ClientError::RetryInterrupted),
                    () = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interceptor::InterceptorChain;
    use crate::interceptor::tests::response;
    use crate::transceiver::MockTransceive;
    use crate::writer::SegmentChannel;
    use http::StatusCode;
    use std::io;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn chain(interceptor: RetryInterceptor) -> InterceptorChain {
        InterceptorChain::new(vec![Arc::new(interceptor)])
    }

    fn request(max_retries: u32) -> ClientRequest {
        let request = ClientRequest::get("http://example.com/").unwrap();
        request.context().set_max_retries(max_retries);
        request
    }

    fn failing(times: usize, error: fn() -> ClientError) -> MockTransceive {
        let mut transceiver = MockTransceive::new();
        transceiver.expect_transceive().times(times).returning(move |_| Err(error()));
        transceiver
    }

    #[tokio::test]
    async fn zero_retries_calls_next_once() {
        let result = chain(RetryInterceptor::default()).execute(request(0), &failing(1, || ClientError::ConnectionInactive)).await;
        assert!(matches!(result, Err(ClientError::ConnectionInactive)));
    }

    #[tokio::test]
    async fn connect_failures_exhaust_the_budget() {
        let request = request(2);
        let context = Arc::clone(request.context());
        let result = chain(RetryInterceptor::default()).execute(request, &failing(3, || ClientError::ConnectionInactive)).await;

        let Err(ClientError::RetryExhausted { max_retries, source }) = result else { panic!("expected exhausted retries") };
        assert_eq!(max_retries, 2);
        assert!(matches!(*source, ClientError::ConnectionInactive));
        assert_eq!(context.retry_count(), 2);
    }

    #[tokio::test]
    async fn acquire_timeouts_are_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut transceiver = MockTransceive::new();
        let counter = Arc::clone(&calls);
        transceiver.expect_transceive().times(2).returning(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(ClientError::Acquire(AcquireError::Timeout(Duration::from_millis(50))))
            } else {
                Ok(response(StatusCode::OK))
            }
        });

        let request = request(1);
        let context = Arc::clone(request.context());
        let response = chain(RetryInterceptor::default()).execute(request, &transceiver).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(context.retry_count(), 1);
    }

    #[tokio::test]
    async fn exhausted_pools_are_retried_but_closed_pools_are_not() {
        let exhausted = || ClientError::Acquire(AcquireError::PoolExhausted { max_pending: 4 });
        let result = chain(RetryInterceptor::default()).execute(request(1), &failing(2, exhausted)).await;
        assert!(matches!(result, Err(ClientError::RetryExhausted { .. })));

        let closed = || ClientError::Acquire(AcquireError::PoolClosed);
        let result = chain(RetryInterceptor::default()).execute(request(3), &failing(1, closed)).await;
        assert!(matches!(result, Err(ClientError::Acquire(AcquireError::PoolClosed))));
    }

    #[tokio::test]
    async fn body_write_failures_are_not_retried() {
        let broken = || ClientError::io(io::Error::from(io::ErrorKind::BrokenPipe));
        let result = chain(RetryInterceptor::default()).execute(request(3), &failing(1, broken)).await;
        assert!(matches!(result, Err(ClientError::Io(_))));
    }

    #[tokio::test]
    async fn streamed_requests_are_never_retried() {
        let request = ClientRequest::post("http://example.com/").unwrap().streaming(SegmentChannel::chunked());
        request.context().set_max_retries(5);
        let result = chain(RetryInterceptor::default()).execute(request, &failing(1, || ClientError::ConnectionInactive)).await;
        assert!(matches!(result, Err(ClientError::ConnectionInactive)));
    }

    #[tokio::test]
    async fn custom_predicate_retries_responses() {
        let mut predicate = MockRetryPredicate::new();
        predicate
            .expect_should_retry()
            .returning(|_, outcome, _| matches!(outcome, Ok(response) if response.status() == StatusCode::SERVICE_UNAVAILABLE));

        let calls = Arc::new(AtomicU32::new(0));
        let mut transceiver = MockTransceive::new();
        let counter = Arc::clone(&calls);
        transceiver.expect_transceive().times(2).returning(move |_| {
            let status = if counter.fetch_add(1, Ordering::SeqCst) == 0 { StatusCode::SERVICE_UNAVAILABLE } else { StatusCode::OK };
            Ok(response(status))
        });

        let interceptor = RetryInterceptor::new(Arc::new(predicate), Arc::new(NoBackoff));
        let response = chain(interceptor).execute(request(1), &transceiver).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_is_applied_between_attempts() {
        let started = tokio::time::Instant::now();
        let backoff = ExponentialBackoff { base: Duration::from_millis(100), max: Duration::from_secs(1) };
        let interceptor = RetryInterceptor::new(Arc::new(ConnectFailures), Arc::new(backoff));
        let result = chain(interceptor).execute(request(2), &failing(3, || ClientError::WriteBufferFull)).await;

        assert!(matches!(result, Err(ClientError::RetryExhausted { .. })));
        assert_eq!(started.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_the_backoff() {
        let request = request(3);
        let context = Arc::clone(request.context());
        let backoff = |_attempt: u32| Some(Duration::from_secs(60));
        let interceptor = RetryInterceptor::new(Arc::new(ConnectFailures), Arc::new(backoff));

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            context.cancel();
        });
        let result = chain(interceptor).execute(request, &failing(1, || ClientError::ConnectionInactive)).await;
        assert!(matches!(result, Err(ClientError::RetryInterrupted)));
        canceller.await.unwrap();
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let backoff = ExponentialBackoff { base: Duration::from_millis(100), max: Duration::from_millis(500) };
        assert_eq!(backoff.delay(1), Some(Duration::from_millis(100)));
        assert_eq!(backoff.delay(3), Some(Duration::from_millis(400)));
        assert_eq!(backoff.delay(4), Some(Duration::from_millis(500)));
        assert_eq!(backoff.delay(64), Some(Duration::from_millis(500)));
    }
}
