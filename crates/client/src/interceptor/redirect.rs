use super::{Interceptor, Next, REDIRECT_PRIORITY};
use crate::{ClientError, ClientRequest, ClientResponse, Payload};
use async_trait::async_trait;
use http::uri::{Authority, PathAndQuery, Scheme};
use http::{Method, StatusCode, Uri, header};
use std::sync::Arc;
use tracing::debug;

/// Follows 301, 302, 303, 307 and 308 responses up to the context's
/// `max_redirects`.
///
/// 303, and 301/302 for anything but GET or HEAD, continue as a bodiless GET.
/// 307 and 308 resend the same method and body, so they stop at a body that
/// can't be replayed. The last 3xx is returned when the limit is reached or
/// the `Location` is missing or unusable.
#[derive(Debug, Default, Clone, Copy)]
pub struct RedirectInterceptor;

#[async_trait]
impl Interceptor for RedirectInterceptor {
    fn priority(&self) -> i32 {
        REDIRECT_PRIORITY
    }

    async fn proceed(&self, mut request: ClientRequest, next: Next<'_>) -> Result<ClientResponse, ClientError> {
        let context = Arc::clone(request.context());
        let max_redirects = context.max_redirects();
        if max_redirects == 0 {
            return next.run(request).await;
        }

        loop {
            let response = next.run(request.clone()).await?;
            let status = response.status();
            if !matches!(status.as_u16(), 301 | 302 | 303 | 307 | 308) || context.redirect_count() >= max_redirects {
                return Ok(response);
            }
            let Some(location) = response.headers().get(header::LOCATION).and_then(|value| value.to_str().ok()) else {
                return Ok(response);
            };
            let Some(target) = resolve(request.uri(), location) else {
                debug!(location, "unusable redirect location");
                return Ok(response);
            };

            let becomes_get = status == StatusCode::SEE_OTHER
                || (matches!(status, StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND)
                    && request.method() != Method::GET
                    && request.method() != Method::HEAD);
            if becomes_get {
                if request.method() != Method::HEAD {
                    request.set_method(Method::GET);
                }
                request.set_payload(Payload::Empty);
                let headers = request.headers_mut();
                for name in [header::CONTENT_TYPE, header::CONTENT_LENGTH, header::TRANSFER_ENCODING, header::EXPECT] {
                    headers.remove(name);
                }
                context.set_expect_continue(false);
            } else if !request.is_replayable() {
                return Ok(response);
            }

            if !same_origin(request.uri(), &target) {
                let headers = request.headers_mut();
                headers.remove(header::AUTHORIZATION);
                headers.remove(header::PROXY_AUTHORIZATION);
                headers.remove(header::COOKIE);
            }
            request.headers_mut().remove(header::HOST);

            let hop = context.increment_redirect();
            debug!(from = %request.uri(), to = %target, status = %status, hop, max_redirects, "following redirect");
            request.set_uri(target);
        }
    }
}

fn same_origin(a: &Uri, b: &Uri) -> bool {
    a.scheme() == b.scheme() && a.authority() == b.authority()
}

/// Resolves `location` against the uri of the request that was redirected.
fn resolve(base: &Uri, location: &str) -> Option<Uri> {
    let location = location.trim();
    if location.is_empty() {
        return None;
    }
    if let Ok(uri) = location.parse::<Uri>()
        && uri.scheme().is_some()
    {
        return uri.authority().is_some().then_some(uri);
    }

    let scheme = base.scheme().cloned().unwrap_or(Scheme::HTTP);
    if let Some(rest) = location.strip_prefix("//") {
        return format!("{scheme}://{rest}").parse().ok();
    }

    let authority: Authority = base.authority()?.clone();
    let path_and_query = if location.starts_with('/') {
        location.to_owned()
    } else if location.starts_with('?') {
        format!("{}{location}", base.path())
    } else {
        let path = base.path();
        let directory = path.rfind('/').map_or("/", |idx| &path[..=idx]);
        format!("{directory}{location}")
    };
    let path_and_query: PathAndQuery = path_and_query.parse().ok()?;
    Uri::builder().scheme(scheme).authority(authority).path_and_query(path_and_query).build().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interceptor::InterceptorChain;
    use crate::interceptor::tests::response;
    use crate::transceiver::MockTransceive;
    use crate::writer::SegmentChannel;
    use http::HeaderValue;

    fn chain() -> InterceptorChain {
        InterceptorChain::new(vec![Arc::new(RedirectInterceptor)])
    }

    fn redirect(status: StatusCode, location: &'static str) -> ClientResponse {
        let mut response = response(status);
        response.headers_mut().insert(header::LOCATION, HeaderValue::from_static(location));
        response
    }

    #[test]
    fn resolves_locations() {
        let base: Uri = "http://example.com/a/b?x=1".parse().unwrap();
        assert_eq!(resolve(&base, "https://other.org/c").unwrap(), "https://other.org/c");
        assert_eq!(resolve(&base, "//cdn.example.com/d").unwrap(), "http://cdn.example.com/d");
        assert_eq!(resolve(&base, "/root?y=2").unwrap(), "http://example.com/root?y=2");
        assert_eq!(resolve(&base, "sibling").unwrap(), "http://example.com/a/sibling");
        assert_eq!(resolve(&base, "?page=2").unwrap(), "http://example.com/a/b?page=2");
        assert!(resolve(&base, "").is_none());
    }

    #[tokio::test]
    async fn see_other_continues_as_get() {
        let request = ClientRequest::post("http://example.com/submit")
            .unwrap()
            .body("name=zava")
            .header(header::CONTENT_TYPE, HeaderValue::from_static("application/x-www-form-urlencoded"));
        request.context().set_max_redirects(3);
        let context = Arc::clone(request.context());

        let mut transceiver = MockTransceive::new();
        transceiver
            .expect_transceive()
            .withf(|request| request.uri().path() == "/submit")
            .times(1)
            .returning(|_| Ok(redirect(StatusCode::SEE_OTHER, "/done")));
        transceiver
            .expect_transceive()
            .withf(|request| {
                request.uri() == "http://example.com/done"
                    && request.method() == Method::GET
                    && request.body_is_empty()
                    && !request.headers().contains_key(header::CONTENT_TYPE)
            })
            .times(1)
            .returning(|_| Ok(response(StatusCode::OK)));

        let response = chain().execute(request, &transceiver).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(context.redirect_count(), 1);
    }

    #[tokio::test]
    async fn temporary_redirect_keeps_method_and_body() {
        let request = ClientRequest::put("http://example.com/v1/item").unwrap().body("payload");
        request.context().set_max_redirects(1);

        let mut transceiver = MockTransceive::new();
        transceiver
            .expect_transceive()
            .withf(|request| request.uri().path() == "/v1/item")
            .times(1)
            .returning(|_| Ok(redirect(StatusCode::TEMPORARY_REDIRECT, "/v2/item")));
        transceiver
            .expect_transceive()
            .withf(|request| {
                request.method() == Method::PUT && matches!(request.payload(), Payload::Buffer(body) if body.as_ref() == b"payload")
            })
            .times(1)
            .returning(|_| Ok(response(StatusCode::CREATED)));

        let response = chain().execute(request, &transceiver).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn limit_returns_the_last_redirect() {
        let request = ClientRequest::get("http://example.com/loop").unwrap();
        request.context().set_max_redirects(2);

        let mut transceiver = MockTransceive::new();
        transceiver.expect_transceive().times(3).returning(|_| Ok(redirect(StatusCode::FOUND, "/loop")));

        let response = chain().execute(request, &transceiver).await.unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
    }

    #[tokio::test]
    async fn cross_origin_drops_credentials() {
        let request = ClientRequest::get("http://example.com/private")
            .unwrap()
            .header(header::AUTHORIZATION, HeaderValue::from_static("Bearer secret"));
        request.context().set_max_redirects(1);

        let mut transceiver = MockTransceive::new();
        transceiver
            .expect_transceive()
            .withf(|request| request.uri().host() == Some("example.com"))
            .times(1)
            .returning(|_| Ok(redirect(StatusCode::MOVED_PERMANENTLY, "http://other.org/public")));
        transceiver
            .expect_transceive()
            .withf(|request| request.uri().host() == Some("other.org") && !request.headers().contains_key(header::AUTHORIZATION))
            .times(1)
            .returning(|_| Ok(response(StatusCode::OK)));

        chain().execute(request, &transceiver).await.unwrap();
    }

    #[tokio::test]
    async fn streamed_body_is_not_resent() {
        let request = ClientRequest::post("http://example.com/upload").unwrap().streaming(SegmentChannel::chunked());
        request.context().set_max_redirects(5);

        let mut transceiver = MockTransceive::new();
        transceiver.expect_transceive().times(1).returning(|_| Ok(redirect(StatusCode::PERMANENT_REDIRECT, "/elsewhere")));

        let response = chain().execute(request, &transceiver).await.unwrap();
        assert_eq!(response.status(), StatusCode::PERMANENT_REDIRECT);
    }

    #[tokio::test]
    async fn disabled_by_default() {
        let mut transceiver = MockTransceive::new();
        transceiver.expect_transceive().times(1).returning(|_| Ok(redirect(StatusCode::FOUND, "/next")));

        let response = chain().execute(ClientRequest::get("http://example.com/").unwrap(), &transceiver).await.unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
    }
}
