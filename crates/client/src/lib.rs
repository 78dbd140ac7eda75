//! An async HTTP/1.1 and HTTP/2 client transport core.
//!
//! Requests run through an [interceptor chain](interceptor) into a
//! transceiver, which takes a connection from the destination's pool, writes
//! the request and waits for the response. Connections are driven by one
//! task each; HTTP/2 connections multiplex many requests.
//!
//! # Example
//!
//! ```no_run
//! use micro_client::{Client, ClientConfig, ClientRequest};
//! use std::time::Duration;
//!
//! # async fn run() -> Result<(), micro_client::ClientError> {
//! let config = ClientConfig { max_retries: 2, read_timeout: Some(Duration::from_secs(5)), ..ClientConfig::default() };
//! let client = Client::builder().config(config).build()?;
//!
//! let request = ClientRequest::post("http://example.com/items")?.json(&serde_json::json!({ "name": "zava" }))?;
//! let response = client.execute(request).await?;
//! println!("{}", response.status());
//! # Ok(())
//! # }
//! ```

mod client;
mod config;
mod conn;
mod connect;
mod context;
mod destination;
mod error;
mod handle;
mod listener;
mod multipart;
mod pool;
mod request;
mod resources;
mod response;
mod timer;
mod transceiver;
mod writer;

pub mod interceptor;

pub use client::{Client, ClientBuilder, StreamingRequest};
pub use config::{CacheOptions, ClientConfig, Http2Options, PoolOptions, ProtocolPreference};
pub use conn::Protocol;
pub use connect::{BoxIo, Connect, Connected, GaiResolver, Io, Resolve, SecureSession, SecureSessionFactory, TcpConnector};
pub use context::RequestContext;
pub use destination::Destination;
pub use error::{AcquireError, ClientError};
pub use handle::{ResponseCallbacks, ResponseHandler};
pub use listener::{EventListener, NoopListener};
pub use multipart::{Form, FormEncoding, Part, TempFile};
pub use pool::PoolMetrics;
pub use request::{ClientRequest, Payload};
pub use resources::Resources;
pub use response::{ClientResponse, TimeToFirstByte};
pub use transceiver::Transceive;
pub use writer::SegmentChannel;
