//! Establishing transports: resolution, TCP, the secure session and protocol negotiation.
//!
//! A [`Connect`] implementation hands back a [`Connected`] transport with its
//! protocol already decided. The pool never looks at the protocol again after
//! that; it only spawns the matching connection actor.

mod resolve;
mod upgrade;

pub use resolve::{GaiResolver, Resolve};

use crate::config::{Http2Options, ProtocolPreference};
use crate::conn::Protocol;
use crate::{ClientConfig, ClientError, Destination};
use async_trait::async_trait;
use bytes::Bytes;
use micro_client_proto::codec::h2::Settings;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, trace};

/// A bidirectional byte stream a connection can run on.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxIo = Box<dyn Io>;

/// A transport ready for a connection actor.
pub struct Connected {
    pub(crate) io: BoxIo,
    pub(crate) protocol: Protocol,
    pub(crate) secure: bool,
    pub(crate) leftover: Bytes,
    pub(crate) upgraded: bool,
}

impl Connected {
    pub fn new(io: BoxIo, protocol: Protocol, secure: bool) -> Self {
        Self { io, protocol, secure, leftover: Bytes::new(), upgraded: false }
    }

    /// Bytes already read from `io` that belong to the first response.
    pub fn with_leftover(mut self, leftover: Bytes) -> Self {
        self.leftover = leftover;
        self
    }

    fn upgraded(mut self) -> Self {
        self.upgraded = true;
        self
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }
}

impl fmt::Debug for Connected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connected")
            .field("protocol", &self.protocol)
            .field("secure", &self.secure)
            .field("leftover", &self.leftover.len())
            .field("upgraded", &self.upgraded)
            .finish_non_exhaustive()
    }
}

/// Creates transports for a destination.
#[async_trait]
pub trait Connect: Send + Sync {
    async fn connect(&self, destination: &Destination) -> Result<Connected, ClientError>;
}

/// An established secure session and the protocol ALPN selected, if any.
pub struct SecureSession {
    pub io: BoxIo,
    pub alpn: Option<String>,
}

impl fmt::Debug for SecureSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureSession").field("alpn", &self.alpn).finish_non_exhaustive()
    }
}

/// Wraps a TCP stream in a secure session. Certificates and trust live behind this trait.
#[async_trait]
pub trait SecureSessionFactory: Send + Sync {
    async fn handshake(&self, host: &str, port: u16, alpn: &[&str], io: BoxIo) -> io::Result<SecureSession>;
}

/// The default connector: TCP with `TCP_NODELAY`, an optional secure session and protocol negotiation.
#[derive(Clone)]
pub struct TcpConnector {
    resolver: Arc<dyn Resolve>,
    secure: Option<Arc<dyn SecureSessionFactory>>,
    preference: ProtocolPreference,
    connect_timeout: Duration,
    http2: Http2Options,
}

impl TcpConnector {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            resolver: Arc::new(GaiResolver),
            secure: None,
            preference: config.protocol,
            connect_timeout: config.connect_timeout,
            http2: config.http2.clone(),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn Resolve>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_secure_session_factory(mut self, factory: Arc<dyn SecureSessionFactory>) -> Self {
        self.secure = Some(factory);
        self
    }

    fn alpn(&self) -> &'static [&'static str] {
        match self.preference {
            ProtocolPreference::Http1 | ProtocolPreference::H2cUpgrade => &["http/1.1"],
            ProtocolPreference::Http2 => &["h2", "http/1.1"],
            ProtocolPreference::Http2PriorKnowledge => &["h2"],
        }
    }

    fn upgrade_settings(&self) -> Settings {
        Settings {
            enable_push: Some(self.http2.enable_push),
            initial_window_size: Some(self.http2.initial_stream_window_size),
            max_frame_size: Some(self.http2.max_frame_size),
            ..Settings::default()
        }
    }

    /// Try each resolved address in turn, all within the connect timeout.
    async fn connect_tcp(&self, destination: &Destination) -> Result<TcpStream, ClientError> {
        let attempt = async {
            let addrs = self.resolver.resolve(destination.resolve_host(), destination.port()).await?;
            let mut last_error = io::Error::new(io::ErrorKind::NotFound, format!("no addresses for {destination}"));
            for addr in addrs {
                trace!(%addr, %destination, "connecting");
                match TcpStream::connect(addr).await {
                    Ok(stream) => return Ok(stream),
                    Err(e) => last_error = e,
                }
            }
            Err(last_error)
        };

        let stream = match tokio::time::timeout(self.connect_timeout, attempt).await {
            Ok(result) => result.map_err(ClientError::connect)?,
            Err(_elapsed) => {
                return Err(ClientError::connect(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {destination} timed out after {:?}", self.connect_timeout),
                )));
            }
        };
        stream.set_nodelay(true).map_err(ClientError::connect)?;
        Ok(stream)
    }
}

#[async_trait]
impl Connect for TcpConnector {
    async fn connect(&self, destination: &Destination) -> Result<Connected, ClientError> {
        let mut stream = self.connect_tcp(destination).await?;

        if destination.is_secure() {
            let Some(factory) = &self.secure else {
                return Err(ClientError::config(format!("no secure session factory configured for {destination}")));
            };
            let session = factory
                .handshake(destination.resolve_host(), destination.port(), self.alpn(), Box::new(stream))
                .await
                .map_err(ClientError::connect)?;
            let protocol = match (session.alpn.as_deref(), self.preference) {
                (Some("h2"), _) | (None, ProtocolPreference::Http2PriorKnowledge) => Protocol::Http2,
                _ => Protocol::Http1,
            };
            debug!(%destination, alpn = ?session.alpn, ?protocol, "secure session established");
            return Ok(Connected::new(session.io, protocol, true));
        }

        match self.preference {
            ProtocolPreference::Http1 | ProtocolPreference::Http2 => Ok(Connected::new(Box::new(stream), Protocol::Http1, false)),
            ProtocolPreference::Http2PriorKnowledge => Ok(Connected::new(Box::new(stream), Protocol::Http2, false)),
            ProtocolPreference::H2cUpgrade => match upgrade::h2c(&mut stream, &destination.authority(), &self.upgrade_settings()).await? {
                upgrade::Upgrade::Switched(leftover) => {
                    Ok(Connected::new(Box::new(stream), Protocol::Http2, false).with_leftover(leftover).upgraded())
                }
                upgrade::Upgrade::Refused { leftover, reusable: true } => {
                    Ok(Connected::new(Box::new(stream), Protocol::Http1, false).with_leftover(leftover))
                }
                upgrade::Upgrade::Refused { reusable: false, .. } => {
                    debug!(%destination, "upgrade response closed the connection, reconnecting");
                    let stream = self.connect_tcp(destination).await?;
                    Ok(Connected::new(Box::new(stream), Protocol::Http1, false))
                }
            },
        }
    }
}

impl fmt::Debug for TcpConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConnector")
            .field("preference", &self.preference)
            .field("connect_timeout", &self.connect_timeout)
            .field("secure", &self.secure.is_some())
            .finish_non_exhaustive()
    }
}
