use super::PoolMetrics;
use crate::config::PoolOptions;
use crate::conn::{self, ConnectionSettings, PooledConnection};
use crate::connect::Connect;
use crate::error::AcquireError;
use crate::listener::EventListener;
use crate::{ClientError, Destination};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, trace};

/// A bounded set of connections to one destination.
///
/// Callers suspend in [`acquire`](Self::acquire) while every connection is busy
/// and the pool is full, up to `max_pending_acquires` of them at a time.
pub(crate) struct ConnectionPool {
    destination: Destination,
    options: PoolOptions,
    settings: ConnectionSettings,
    connector: Arc<dyn Connect>,
    listener: Arc<dyn EventListener>,
    state: Mutex<PoolState>,
    available: Notify,
}

#[derive(Default)]
struct PoolState {
    connections: Vec<PooledConnection>,
    connecting: usize,
    waiters: usize,
    closed: bool,
}

enum Step<'a> {
    Ready(PooledConnection),
    Connect(ConnectingSlot<'a>),
    Wait,
}

/// One caller counted in `waiters`, uncounted when dropped.
struct WaiterSlot<'a> {
    pool: &'a ConnectionPool,
}

impl Drop for WaiterSlot<'_> {
    fn drop(&mut self) {
        self.pool.state.lock().waiters -= 1;
    }
}

/// A connection counted in `connecting`. Dropping it unfinished gives the
/// slot back and wakes the waiters.
struct ConnectingSlot<'a> {
    pool: &'a ConnectionPool,
    claimed: bool,
}

impl ConnectingSlot<'_> {
    fn finish(mut self, state: &mut PoolState) {
        state.connecting -= 1;
        self.claimed = false;
    }
}

impl Drop for ConnectingSlot<'_> {
    fn drop(&mut self) {
        if self.claimed {
            self.pool.state.lock().connecting -= 1;
            self.pool.available.notify_waiters();
        }
    }
}

impl ConnectionPool {
    pub(crate) fn new(
        destination: Destination,
        options: PoolOptions,
        settings: ConnectionSettings,
        connector: Arc<dyn Connect>,
        listener: Arc<dyn EventListener>,
    ) -> Self {
        Self { destination, options, settings, connector, listener, state: Mutex::new(PoolState::default()), available: Notify::new() }
    }

    pub(crate) fn destination(&self) -> &Destination {
        &self.destination
    }

    pub(crate) fn options(&self) -> &PoolOptions {
        &self.options
    }

    /// Hand out a connection with a reserved request slot.
    ///
    /// Dropping the returned future at any point leaves the pool's counts as
    /// they were before the call.
    pub(crate) async fn acquire(&self) -> Result<PooledConnection, ClientError> {
        let deadline = Instant::now() + self.options.acquire_timeout;
        let mut waiter = None;

        let result = loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.next_step(&mut waiter) {
                Ok(Step::Ready(connection)) => break Ok(connection),
                Ok(Step::Connect(slot)) => break self.connect(slot).await,
                Ok(Step::Wait) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        break Err(AcquireError::Timeout(self.options.acquire_timeout).into());
                    }
                }
                Err(e) => break Err(e),
            }
        };
        drop(waiter);

        if let Ok(connection) = &result {
            trace!(connection = connection.id(), destination = %self.destination, "connection acquired");
            self.listener.on_connection_acquired(&self.destination, connection.id());
        }
        result
    }

    fn next_step<'a>(&'a self, waiter: &mut Option<WaiterSlot<'a>>) -> Result<Step<'a>, ClientError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(AcquireError::PoolClosed.into());
        }
        self.expire(&mut state);

        if let Some(connection) = state.connections.iter().find(|c| c.is_active() && c.is_reusable() && c.try_reserve()) {
            return Ok(Step::Ready(connection.clone()));
        }
        if state.connections.len() + state.connecting < self.options.max_size {
            state.connecting += 1;
            return Ok(Step::Connect(ConnectingSlot { pool: self, claimed: true }));
        }
        if waiter.is_none() {
            if state.waiters >= self.options.max_pending_acquires {
                return Err(AcquireError::PoolExhausted { max_pending: self.options.max_pending_acquires }.into());
            }
            state.waiters += 1;
            *waiter = Some(WaiterSlot { pool: self });
        }
        Ok(Step::Wait)
    }

    /// Open a new connection outside the lock, in the `connecting` slot claimed by the caller.
    async fn connect(&self, slot: ConnectingSlot<'_>) -> Result<PooledConnection, ClientError> {
        let result = self.connector.connect(&self.destination).await;

        let mut state = self.state.lock();
        slot.finish(&mut state);
        let connected = match result {
            Ok(connected) => connected,
            Err(e) => {
                drop(state);
                debug!(destination = %self.destination, cause = %e, "connect failed");
                self.available.notify_waiters();
                return Err(e);
            }
        };

        let connection = conn::spawn(connected, self.destination.clone(), &self.settings);
        if state.closed {
            connection.close();
            return Err(AcquireError::PoolClosed.into());
        }
        connection.try_reserve();
        state.connections.push(connection.clone());
        drop(state);

        // an HTTP/2 connection can serve the waiters too
        self.available.notify_waiters();
        Ok(connection)
    }

    /// Drop dead connections and close the ones idle for too long.
    fn expire(&self, state: &mut PoolState) {
        let idle_timeout = self.options.idle_timeout;
        let now = Instant::now();
        state.connections.retain(|connection| {
            if !connection.is_active() {
                return false;
            }
            let expired = idle_timeout.zip(connection.idle_since()).is_some_and(|(timeout, since)| now.duration_since(since) >= timeout);
            if expired {
                debug!(connection = connection.id(), destination = %self.destination, "closing idle connection");
                connection.close();
            }
            !expired
        });
    }

    /// Give back the slot taken by `acquire`.
    pub(crate) fn release(&self, connection: &PooledConnection) {
        connection.release_slot();
        {
            let mut state = self.state.lock();
            let retire = !connection.is_active() || (!connection.is_reusable() && connection.in_flight() == 0);
            if retire {
                state.connections.retain(|c| c.id() != connection.id());
                connection.close();
            }
        }
        self.available.notify_waiters();
    }

    pub(crate) fn prune_idle(&self) {
        let mut state = self.state.lock();
        self.expire(&mut state);
    }

    /// No request is in flight and no caller is waiting.
    pub(crate) fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.waiters == 0 && state.connecting == 0 && state.connections.iter().all(|c| c.in_flight() == 0)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Close every connection now; requests still in flight fail with a closed-connection error.
    pub(crate) fn close(&self) {
        let connections = {
            let mut state = self.state.lock();
            state.closed = true;
            std::mem::take(&mut state.connections)
        };
        debug!(destination = %self.destination, connections = connections.len(), "closing pool");
        for connection in connections {
            connection.close();
        }
        self.available.notify_waiters();
    }

    /// Refuse new acquires, let in-flight requests finish for up to `grace`, then close.
    pub(crate) async fn close_gracefully(&self, grace: Duration) {
        self.state.lock().closed = true;
        self.available.notify_waiters();

        let deadline = Instant::now() + grace;
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let busy = self.state.lock().connections.iter().filter(|c| c.is_active() && c.in_flight() > 0).count();
            if busy == 0 {
                break;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                info!(destination = %self.destination, busy, "grace period elapsed, closing busy connections");
                break;
            }
        }
        self.close();
    }

    pub(crate) fn metrics(&self) -> PoolMetrics {
        let state = self.state.lock();
        let active = state.connections.iter().filter(|c| c.in_flight() > 0).count();
        PoolMetrics {
            destination: self.destination.clone(),
            max_size: self.options.max_size,
            connections: state.connections.len(),
            active,
            idle: state.connections.len() - active,
            in_flight: state.connections.iter().map(|c| c.in_flight() as usize).sum(),
            pending_acquires: state.waiters,
            options: self.options.clone(),
        }
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool").field("destination", &self.destination).field("options", &self.options).finish_non_exhaustive()
    }
}
