use crate::ClientError;
use bytes::Bytes;
use http::{HeaderMap, Response, StatusCode, Version};
use http_body_util::Full;
use micro_client_proto::protocol::ResponseHead;
use serde::de::DeserializeOwned;
use std::time::Duration;

/// Time from the start of the request write until the response head was decoded.
///
/// Stored in the head's extensions, never as a header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeToFirstByte(pub Duration);

/// A complete response: head, aggregated body and optional trailers.
#[derive(Debug)]
pub struct ClientResponse {
    head: ResponseHead,
    body: Bytes,
    trailers: Option<HeaderMap>,
}

impl ClientResponse {
    pub fn new(head: ResponseHead, body: Bytes, trailers: Option<HeaderMap>) -> Self {
        Self { head, body, trailers }
    }

    pub fn status(&self) -> StatusCode {
        self.head.status()
    }

    pub fn version(&self) -> Version {
        self.head.version()
    }

    pub fn headers(&self) -> &HeaderMap {
        self.head.headers()
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        self.head.headers_mut()
    }

    pub fn head(&self) -> &ResponseHead {
        &self.head
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn set_body(&mut self, body: Bytes) {
        self.body = body;
    }

    pub fn trailers(&self) -> Option<&HeaderMap> {
        self.trailers.as_ref()
    }

    pub fn time_to_first_byte(&self) -> Option<Duration> {
        self.head.extensions().get::<TimeToFirstByte>().map(|ttfb| ttfb.0)
    }

    pub fn into_parts(self) -> (ResponseHead, Bytes, Option<HeaderMap>) {
        (self.head, self.body, self.trailers)
    }

    pub fn text(&self) -> Result<String, ClientError> {
        String::from_utf8(self.body.to_vec()).map_err(|e| ClientError::protocol(format!("response body is not utf-8: {e}")))
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ClientError> {
        serde_json::from_slice(&self.body).map_err(|e| ClientError::protocol(format!("invalid json body: {e}")))
    }

    /// Convert into an `http::Response`; trailers are dropped.
    pub fn into_http(self) -> Response<Full<Bytes>> {
        let (parts, ()) = self.head.into_parts();
        Response::from_parts(parts, Full::new(self.body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    fn response(body: &'static str) -> ClientResponse {
        let mut head = Response::builder().status(StatusCode::OK).body(()).unwrap();
        head.extensions_mut().insert(TimeToFirstByte(Duration::from_millis(12)));
        ClientResponse::new(head, Bytes::from_static(body.as_bytes()), None)
    }

    #[test]
    fn json_body() {
        let value: serde_json::Value = response(r#"{"ok":true}"#).json().unwrap();
        assert_eq!(value["ok"], true);
        assert!(response("{").json::<serde_json::Value>().is_err());
    }

    #[test]
    fn ttfb_is_not_a_header() {
        let response = response("hi");
        assert_eq!(response.time_to_first_byte(), Some(Duration::from_millis(12)));
        assert!(response.headers().is_empty());
    }

    #[tokio::test]
    async fn into_http_keeps_body() {
        let http = response("hello").into_http();
        assert_eq!(http.status(), StatusCode::OK);
        let body = http.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"hello");
    }
}
