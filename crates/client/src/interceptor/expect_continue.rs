use super::{EXPECT_CONTINUE_PRIORITY, Interceptor, Next};
use crate::{ClientError, ClientRequest, ClientResponse};
use async_trait::async_trait;
use http::{HeaderValue, header};
use std::sync::Arc;
use tracing::trace;

/// Adds `Expect: 100-continue` to requests whose context asks for it.
///
/// Streamed bodies of unknown length and provably empty bodies turn the flag
/// off instead, there is nothing worth holding back.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExpectContinueInterceptor;

#[async_trait]
impl Interceptor for ExpectContinueInterceptor {
    fn priority(&self) -> i32 {
        EXPECT_CONTINUE_PRIORITY
    }

    async fn proceed(&self, mut request: ClientRequest, next: Next<'_>) -> Result<ClientResponse, ClientError> {
        let context = Arc::clone(request.context());
        if context.expect_continue() {
            if request.has_unknown_length() || request.body_is_empty() {
                trace!(uri = %request.uri(), "expect-continue disabled for this body");
                context.set_expect_continue(false);
            } else if !request.headers().contains_key(header::EXPECT) {
                request.headers_mut().insert(header::EXPECT, HeaderValue::from_static("100-continue"));
            }
        }
        next.run(request).await
    }
}
