//! The destination to pool map.
//!
//! Pools are created on first use under the map's shard lock, so concurrent
//! first requests for one destination share a single pool. Entries expire
//! after an idle TTL, and the least recently used entry goes when the cache
//! grows past its capacity. Evicted and replaced pools are closed in the
//! background after a grace period so their in-flight requests can finish.

use super::{ConnectionPool, PoolMetrics};
use crate::config::CacheOptions;
use crate::{ClientError, Destination};
use arc_swap::ArcSwap;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tracing::{debug, info};

struct CacheEntry {
    pool: ArcSwap<ConnectionPool>,
    last_access: Mutex<Instant>,
}

impl CacheEntry {
    fn new(pool: Arc<ConnectionPool>) -> Self {
        Self { pool: ArcSwap::new(pool), last_access: Mutex::new(Instant::now()) }
    }

    fn touch(&self) -> Arc<ConnectionPool> {
        *self.last_access.lock() = Instant::now();
        self.pool.load_full()
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.duration_since(*self.last_access.lock())
    }
}

pub(crate) struct PoolCache {
    options: CacheOptions,
    entries: DashMap<Destination, Arc<CacheEntry>>,
    closed: AtomicBool,
}

impl PoolCache {
    pub(crate) fn new(options: CacheOptions) -> Self {
        Self { options, entries: DashMap::new(), closed: AtomicBool::new(false) }
    }

    fn ensure_open(&self) -> Result<(), ClientError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::config("connection pool cache is closed"));
        }
        Ok(())
    }

    /// The cached pool for `destination`, created by `factory` on first use.
    ///
    /// Without keep-alive the pool is built fresh and never cached.
    pub(crate) fn get_or_create(
        &self,
        destination: &Destination,
        keep_alive: bool,
        factory: impl FnOnce() -> ConnectionPool,
    ) -> Result<Arc<ConnectionPool>, ClientError> {
        self.ensure_open()?;
        if !keep_alive {
            return Ok(Arc::new(factory()));
        }

        if let Some(entry) = self.entries.get(destination) {
            return Ok(entry.touch());
        }

        let (entry, created) = {
            let mut created = false;
            let slot = self.entries.entry(destination.clone()).or_insert_with(|| {
                created = true;
                debug!(%destination, "creating connection pool");
                Arc::new(CacheEntry::new(Arc::new(factory())))
            });
            (Arc::clone(&slot), created)
        };
        if created {
            self.discard_if_closed(destination, &entry)?;
            self.enforce_capacity(destination);
        }
        Ok(entry.touch())
    }

    /// Undo an insert that raced with [`close_all`](Self::close_all).
    ///
    /// `close_all` flips the flag before it collects the entries, so an insert
    /// it missed always sees the flag here.
    fn discard_if_closed(&self, destination: &Destination, entry: &Arc<CacheEntry>) -> Result<(), ClientError> {
        if !self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        if self.entries.remove_if(destination, |_, current| Arc::ptr_eq(current, entry)).is_some() {
            debug!(%destination, "closing pool created during shutdown");
            entry.pool.load().close();
        }
        Err(ClientError::config("connection pool cache is closed"))
    }

    pub(crate) fn get_if_present(&self, destination: &Destination) -> Option<Arc<ConnectionPool>> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        self.entries.get(destination).map(|entry| entry.touch())
    }

    /// Swap in `pool` for `destination`; the pool it replaces is closed after the grace period.
    pub(crate) fn replace(&self, destination: &Destination, pool: ConnectionPool) -> Result<(), ClientError> {
        self.ensure_open()?;
        let pool = Arc::new(pool);
        let previous = match self.entries.entry(destination.clone()) {
            Entry::Occupied(occupied) => {
                let entry = Arc::clone(occupied.get());
                drop(occupied);
                let previous = entry.pool.swap(pool);
                entry.touch();
                Some(previous)
            }
            Entry::Vacant(vacant) => {
                let entry = Arc::clone(&vacant.insert(Arc::new(CacheEntry::new(pool))));
                self.discard_if_closed(destination, &entry)?;
                None
            }
        };
        match previous {
            Some(previous) => {
                debug!(%destination, "connection pool replaced");
                self.schedule_close(previous);
            }
            None => self.enforce_capacity(destination),
        }
        Ok(())
    }

    /// Drop `destination`'s pool from the cache and close it in the background.
    pub(crate) fn evict(&self, destination: &Destination) -> bool {
        match self.entries.remove(destination) {
            Some((_, entry)) => {
                debug!(%destination, "evicting connection pool");
                self.schedule_close(entry.pool.load_full());
                true
            }
            None => false,
        }
    }

    /// Evict pools untouched for longer than the idle TTL and expire idle connections in the rest.
    pub(crate) fn sweep(&self) {
        let now = Instant::now();
        let expired: Vec<Destination> = self
            .entries
            .iter()
            .filter(|entry| entry.idle_for(now) >= self.options.idle_ttl && entry.pool.load().is_idle())
            .map(|entry| entry.key().clone())
            .collect();
        for destination in &expired {
            self.evict(destination);
        }
        for entry in &self.entries {
            entry.pool.load().prune_idle();
        }
    }

    /// Evict least recently used pools while over capacity, never `keep`.
    fn enforce_capacity(&self, keep: &Destination) {
        while self.entries.len() > self.options.max_pools {
            let now = Instant::now();
            let oldest = self
                .entries
                .iter()
                .filter(|entry| entry.key() != keep)
                .max_by_key(|entry| entry.idle_for(now))
                .map(|entry| entry.key().clone());
            match oldest {
                Some(destination) => {
                    self.evict(&destination);
                }
                None => break,
            }
        }
    }

    fn schedule_close(&self, pool: Arc<ConnectionPool>) {
        let grace = self.options.eviction_grace;
        match Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    pool.close_gracefully(grace).await;
                    debug!(destination = %pool.destination(), "evicted pool closed");
                });
            }
            Err(_no_runtime) => pool.close(),
        }
    }

    /// Close every pool. Afterwards every cache operation fails with a configuration error.
    pub(crate) fn close_all(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let destinations: Vec<Destination> = self.entries.iter().map(|entry| entry.key().clone()).collect();
        info!(pools = destinations.len(), "closing connection pool cache");

        let runtime = Handle::try_current().ok();
        for destination in destinations {
            let Some((_, entry)) = self.entries.remove(&destination) else {
                continue;
            };
            let pool = entry.pool.load_full();
            let grace = pool.options().shutdown_grace;
            match &runtime {
                Some(runtime) if !grace.is_zero() => {
                    runtime.spawn(async move {
                        pool.close_gracefully(grace).await;
                        info!(destination = %pool.destination(), "connection pool closed");
                    });
                }
                _ => pool.close(),
            }
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn metrics(&self) -> Vec<PoolMetrics> {
        self.entries.iter().map(|entry| entry.pool.load().metrics()).collect()
    }

    /// Run [`sweep`](Self::sweep) every sweep interval until the cache is dropped or closed.
    pub(crate) fn spawn_sweeper(self: &Arc<Self>) {
        let Ok(runtime) = Handle::try_current() else {
            debug!("no runtime, idle pools are only swept on demand");
            return;
        };
        let cache: Weak<PoolCache> = Arc::downgrade(self);
        let period = self.options.sweep_interval;
        runtime.spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(cache) = cache.upgrade() else { break };
                if cache.is_closed() {
                    break;
                }
                cache.sweep();
            }
        });
    }
}

impl fmt::Debug for PoolCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolCache").field("pools", &self.entries.len()).field("closed", &self.is_closed()).finish_non_exhaustive()
    }
}
