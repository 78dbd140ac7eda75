use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use tracing::trace;

/// Hostname to address resolution used by [`TcpConnector`](super::TcpConnector).
#[async_trait]
pub trait Resolve: Send + Sync {
    /// Every address of `host`, in the order they should be tried, each carrying `port`.
    async fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>>;
}

/// Resolves through the system's `getaddrinfo` on tokio's blocking pool.
#[derive(Debug, Clone, Copy, Default)]
pub struct GaiResolver;

#[async_trait]
impl Resolve for GaiResolver {
    async fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
        trace!(host, port, "resolving");
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port)).await?.collect();
        if addrs.is_empty() {
            return Err(io::Error::new(io::ErrorKind::NotFound, format!("no addresses for {host}")));
        }
        Ok(addrs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ip_literals_resolve_to_themselves() {
        let addrs = GaiResolver.resolve("127.0.0.1", 8080).await.unwrap();
        assert_eq!(addrs, vec!["127.0.0.1:8080".parse::<SocketAddr>().unwrap()]);
    }
}
