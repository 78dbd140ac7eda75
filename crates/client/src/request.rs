//! The client request: a head, a payload and the context shared by its attempts.

use crate::ClientError;
use crate::context::RequestContext;
use crate::multipart::Form;
use crate::writer::SegmentChannel;
use bytes::Bytes;
use http::header::{self, HeaderName, HeaderValue};
use http::{HeaderMap, Method, Uri};
use micro_client_proto::protocol::RequestHead;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

/// What a request sends as its body.
#[derive(Debug, Clone, Default)]
pub enum Payload {
    #[default]
    Empty,
    Buffer(Bytes),
    File(PathBuf),
    Form(Form),
    /// A body written by the caller while the request is in flight.
    Segment(SegmentChannel),
}

/// A request ready for [`Client::execute`](crate::Client::execute).
///
/// Clones share the [`RequestContext`], so attributes and counters set on one
/// attempt are visible to the next.
#[derive(Debug, Clone)]
pub struct ClientRequest {
    head: RequestHead,
    payload: Payload,
    context: Arc<RequestContext>,
}

impl ClientRequest {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self { head: RequestHead::new(method, uri), payload: Payload::Empty, context: Arc::new(RequestContext::new()) }
    }

    fn parse(method: Method, uri: &str) -> Result<Self, ClientError> {
        let uri = uri.parse::<Uri>().map_err(|e| ClientError::invalid_request(format!("invalid uri {uri}: {e}")))?;
        Ok(Self::new(method, uri))
    }

    pub fn get(uri: &str) -> Result<Self, ClientError> {
        Self::parse(Method::GET, uri)
    }

    pub fn post(uri: &str) -> Result<Self, ClientError> {
        Self::parse(Method::POST, uri)
    }

    pub fn put(uri: &str) -> Result<Self, ClientError> {
        Self::parse(Method::PUT, uri)
    }

    pub fn delete(uri: &str) -> Result<Self, ClientError> {
        Self::parse(Method::DELETE, uri)
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.head.headers_mut().insert(name, value);
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.payload = Payload::Buffer(body.into());
        self
    }

    /// Send the file at `path`; its length is taken when the request is written.
    pub fn file(mut self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        if !self.head.headers().contains_key(header::CONTENT_TYPE) {
            let mime = mime_guess::from_path(&path).first_or_octet_stream();
            if let Ok(value) = HeaderValue::from_str(mime.as_ref()) {
                self.head.headers_mut().insert(header::CONTENT_TYPE, value);
            }
        }
        self.payload = Payload::File(path);
        self
    }

    pub fn form(mut self, form: Form) -> Result<Self, ClientError> {
        let content_type = HeaderValue::try_from(form.content_type())
            .map_err(|e| ClientError::invalid_request(format!("invalid form content type: {e}")))?;
        self.head.headers_mut().insert(header::CONTENT_TYPE, content_type);
        self.payload = Payload::Form(form);
        Ok(self)
    }

    pub fn json<T: Serialize + ?Sized>(mut self, value: &T) -> Result<Self, ClientError> {
        let body = serde_json::to_vec(value).map_err(|e| ClientError::invalid_request(format!("can't encode json body: {e}")))?;
        self.head.headers_mut().insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self.payload = Payload::Buffer(Bytes::from(body));
        Ok(self)
    }

    pub fn form_urlencoded<T: Serialize + ?Sized>(mut self, value: &T) -> Result<Self, ClientError> {
        let body = serde_urlencoded::to_string(value).map_err(|e| ClientError::invalid_request(format!("can't encode form: {e}")))?;
        self.head
            .headers_mut()
            .insert(header::CONTENT_TYPE, HeaderValue::from_static(mime::APPLICATION_WWW_FORM_URLENCODED.as_ref()));
        self.payload = Payload::Buffer(Bytes::from(body));
        Ok(self)
    }

    /// Stream the body through `channel` while the request is in flight.
    pub fn streaming(mut self, channel: SegmentChannel) -> Self {
        self.payload = Payload::Segment(channel);
        self
    }

    pub fn with_context(mut self, context: Arc<RequestContext>) -> Self {
        self.context = context;
        self
    }

    pub fn method(&self) -> &Method {
        self.head.method()
    }

    pub fn set_method(&mut self, method: Method) {
        *self.head.method_mut() = method;
    }

    pub fn uri(&self) -> &Uri {
        self.head.uri()
    }

    pub fn set_uri(&mut self, uri: Uri) {
        *self.head.uri_mut() = uri;
    }

    pub fn headers(&self) -> &HeaderMap {
        self.head.headers()
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        self.head.headers_mut()
    }

    pub fn head(&self) -> &RequestHead {
        &self.head
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn set_payload(&mut self, payload: Payload) {
        self.payload = payload;
    }

    pub fn context(&self) -> &Arc<RequestContext> {
        &self.context
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.payload, Payload::Segment(_))
    }

    /// A streamed body without a declared length.
    pub fn has_unknown_length(&self) -> bool {
        matches!(&self.payload, Payload::Segment(channel) if channel.length().is_none())
    }

    /// Whether the body can be sent again on another attempt.
    pub fn is_replayable(&self) -> bool {
        !self.is_streaming()
    }

    /// No file, no form fields and no buffered bytes.
    pub fn body_is_empty(&self) -> bool {
        match &self.payload {
            Payload::Empty => true,
            Payload::Buffer(data) => data.is_empty(),
            Payload::Form(form) => form.is_empty(),
            Payload::Segment(channel) => channel.length() == Some(0),
            Payload::File(_) => false,
        }
    }

    /// Keep-alive as the request's `Connection` header asks, else `default`.
    pub fn keep_alive(&self, default: bool) -> bool {
        let Some(connection) = self.head.headers().get(header::CONNECTION).and_then(|value| value.to_str().ok()) else {
            return default;
        };
        let has = |token: &str| connection.split(',').any(|value| value.trim().eq_ignore_ascii_case(token));
        if has("close") {
            false
        } else if has("keep-alive") {
            true
        } else {
            default
        }
    }

    pub(crate) fn into_parts(self) -> (RequestHead, Payload, Arc<RequestContext>) {
        (self.head, self.payload, self.context)
    }
}
