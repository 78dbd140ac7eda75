//! Client configuration.
//!
//! [`ClientConfig`] is plain data: every field has a default, so a partial
//! JSON document is enough to override a few values.
//!
//! ```
//! use micro_client::ClientConfig;
//!
//! let config = ClientConfig::from_json(r#"{ "max_retries": 2, "pool": { "max_size": 4 } }"#).unwrap();
//! assert_eq!(config.max_retries, 2);
//! assert_eq!(config.pool.max_size, 4);
//! assert!(config.keep_alive);
//! ```

use crate::ClientError;
use serde::Deserialize;
use std::time::Duration;

/// Which protocol new connections try to speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolPreference {
    /// HTTP/1.1 only.
    #[default]
    Http1,
    /// HTTP/2 when ALPN selects `h2` on a secure connection, HTTP/1.1 otherwise.
    Http2,
    /// HTTP/2 without negotiation, on both secure and cleartext connections.
    Http2PriorKnowledge,
    /// Cleartext HTTP/2 through the `Upgrade: h2c` handshake, falling back to HTTP/1.1.
    H2cUpgrade,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub keep_alive: bool,
    pub protocol: ProtocolPreference,
    #[serde(with = "millis")]
    pub connect_timeout: Duration,
    #[serde(with = "millis_option")]
    pub read_timeout: Option<Duration>,
    pub max_retries: u32,
    pub max_redirects: u32,
    pub expect_continue: bool,
    pub max_content_length: Option<u64>,
    pub write_buffer_high_watermark: usize,
    pub decompress: bool,
    /// Run response callbacks on a dedicated runtime with this many threads.
    pub callback_threads: Option<usize>,
    pub pool: PoolOptions,
    pub cache: CacheOptions,
    pub http2: Http2Options,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            keep_alive: true,
            protocol: ProtocolPreference::Http1,
            connect_timeout: Duration::from_secs(10),
            read_timeout: Some(Duration::from_secs(60)),
            max_retries: 0,
            max_redirects: 0,
            expect_continue: false,
            max_content_length: None,
            write_buffer_high_watermark: 64 * 1024,
            decompress: false,
            callback_threads: None,
            pool: PoolOptions::default(),
            cache: CacheOptions::default(),
            http2: Http2Options::default(),
        }
    }
}

impl ClientConfig {
    pub fn from_json(json: &str) -> Result<Self, ClientError> {
        serde_json::from_str(json).map_err(|e| ClientError::config(format!("invalid client config: {e}")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PoolOptions {
    pub max_size: usize,
    pub max_pending_acquires: usize,
    #[serde(with = "millis")]
    pub acquire_timeout: Duration,
    /// Connections idle for longer are closed on the next acquire.
    #[serde(with = "millis_option")]
    pub idle_timeout: Option<Duration>,
    /// How long `close_gracefully` waits for in-flight requests.
    #[serde(with = "millis")]
    pub shutdown_grace: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_size: 16,
            max_pending_acquires: 1024,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Some(Duration::from_secs(60)),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheOptions {
    pub max_pools: usize,
    #[serde(with = "millis")]
    pub idle_ttl: Duration,
    #[serde(with = "millis")]
    pub sweep_interval: Duration,
    #[serde(with = "millis")]
    pub eviction_grace: Duration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            max_pools: 1024,
            idle_ttl: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(30),
            eviction_grace: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Http2Options {
    pub initial_stream_window_size: u32,
    pub initial_connection_window_size: u32,
    pub max_frame_size: u32,
    pub enable_push: bool,
    /// Stream limit used until the peer announces its own.
    pub max_concurrent_streams: u32,
}

impl Default for Http2Options {
    fn default() -> Self {
        Self {
            initial_stream_window_size: 1 << 20,
            initial_connection_window_size: 1 << 20,
            max_frame_size: 16_384,
            enable_push: false,
            max_concurrent_streams: 100,
        }
    }
}

/// Durations are configured as milliseconds.
mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod millis_option {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|millis| millis.map(Duration::from_millis))
    }
}
