//! HTTP response head handling implementation.
//!
//! Both the HTTP/1 header decoder and the HTTP/2 header decoder produce a
//! `http::Response<()>`; the body is delivered separately as payload items.

use http::Response;

/// Type alias for a decoded HTTP response head.
pub type ResponseHead = Response<()>;
