//! HTTP request head handling implementation.
//!
//! This module provides the request head sent by the client. It carries the
//! method, uri, version and header fields of an outgoing request, and is the
//! shared input of the HTTP/1 request encoder and the HTTP/2 header encoder.

use http::request::Parts;
use http::{HeaderMap, Method, Request, Uri, Version};

/// The head of an outgoing request, detached from any body.
///
/// Unlike `http::Request<()>` this type is cheap to clone, so a request can
/// be replayed by retry and redirect handling.
#[derive(Debug, Clone)]
pub struct RequestHead {
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
}

impl RequestHead {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self { method, uri, version: Version::HTTP_11, headers: HeaderMap::new() }
    }

    #[inline]
    pub fn method(&self) -> &Method {
        &self.method
    }

    #[inline]
    pub fn method_mut(&mut self) -> &mut Method {
        &mut self.method
    }

    #[inline]
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    #[inline]
    pub fn uri_mut(&mut self) -> &mut Uri {
        &mut self.uri
    }

    #[inline]
    pub fn version(&self) -> Version {
        self.version
    }

    #[inline]
    pub fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    #[inline]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    #[inline]
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// The origin-form request target: path and query, `/` when the uri has none.
    pub fn request_target(&self) -> &str {
        if self.method == Method::CONNECT {
            return self.uri.authority().map_or("/", http::uri::Authority::as_str);
        }
        self.uri.path_and_query().map_or("/", http::uri::PathAndQuery::as_str)
    }

    /// Whether the method defines semantics for an enclosed body, in which case an
    /// empty body is announced with `content-length: 0`.
    pub fn expects_body(&self) -> bool {
        matches!(self.method, Method::POST | Method::PUT | Method::PATCH)
    }

    #[inline]
    pub fn is_head(&self) -> bool {
        self.method == Method::HEAD
    }

    /// Attach a body, producing a regular `http::Request`.
    pub fn body<T>(self, body: T) -> Request<T> {
        let mut request = Request::new(body);
        *request.method_mut() = self.method;
        *request.uri_mut() = self.uri;
        *request.version_mut() = self.version;
        *request.headers_mut() = self.headers;
        request
    }
}

impl From<Parts> for RequestHead {
    fn from(parts: Parts) -> Self {
        Self { method: parts.method, uri: parts.uri, version: parts.version, headers: parts.headers }
    }
}

impl<T> From<Request<T>> for RequestHead {
    fn from(request: Request<T>) -> Self {
        let (parts, _body) = request.into_parts();
        parts.into()
    }
}
