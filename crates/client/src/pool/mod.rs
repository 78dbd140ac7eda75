//! Connection pools, one per destination, and the cache that owns them.

mod cache;
mod connection_pool;

pub(crate) use cache::PoolCache;
pub(crate) use connection_pool::ConnectionPool;

use crate::Destination;
use crate::config::PoolOptions;

/// A point-in-time view of one destination's pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolMetrics {
    pub destination: Destination,
    pub max_size: usize,
    /// Open connections.
    pub connections: usize,
    /// Connections serving at least one request.
    pub active: usize,
    pub idle: usize,
    /// Requests in flight across all connections.
    pub in_flight: usize,
    /// Callers suspended in `acquire`.
    pub pending_acquires: usize,
    pub options: PoolOptions,
}

#[cfg(test)]
pub(crate) use connection_pool::tests as connection_pool_tests;
