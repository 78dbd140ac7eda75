//! One write/read cycle for one request attempt.
//!
//! The transceiver picks the destination's pool, takes a connection slot,
//! writes the request and waits for the response handle to settle. Every
//! exit, successful or not, releases the slot exactly once through the
//! handle's terminal hook.

use crate::conn::{ConnectionSettings, PooledConnection};
use crate::connect::Connect;
use crate::handle::ResponseHandle;
use crate::listener::EventListener;
use crate::pool::{ConnectionPool, PoolCache};
use crate::request::{ClientRequest, Payload};
use crate::timer::TimerKey;
use crate::writer::{RequestWriter, WriteContext, expects_continue};
use crate::{ClientConfig, ClientError, ClientResponse, Destination, PoolOptions, Resources};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, trace};

/// The innermost step of the interceptor chain.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transceive: Send + Sync {
    async fn transceive(&self, request: ClientRequest) -> Result<ClientResponse, ClientError>;
}

pub(crate) struct Transceiver {
    config: Arc<ClientConfig>,
    settings: ConnectionSettings,
    cache: Arc<PoolCache>,
    connector: Arc<dyn Connect>,
    listener: Arc<dyn EventListener>,
    resources: Resources,
}

impl Transceiver {
    pub(crate) fn new(
        config: Arc<ClientConfig>,
        cache: Arc<PoolCache>,
        connector: Arc<dyn Connect>,
        listener: Arc<dyn EventListener>,
        resources: Resources,
    ) -> Self {
        let settings = ConnectionSettings::from_config(&config);
        Self { config, settings, cache, connector, listener, resources }
    }

    pub(crate) fn cache(&self) -> &Arc<PoolCache> {
        &self.cache
    }

    fn new_pool(&self, destination: Destination) -> ConnectionPool {
        self.pool_with_options(destination, self.config.pool.clone())
    }

    pub(crate) fn pool_with_options(&self, destination: Destination, options: PoolOptions) -> ConnectionPool {
        ConnectionPool::new(destination, options, self.settings.clone(), Arc::clone(&self.connector), Arc::clone(&self.listener))
    }

    /// Take a connection slot that can accept a request right now.
    async fn acquire(&self, pool: &ConnectionPool) -> Result<PooledConnection, ClientError> {
        let connection = pool.acquire().await?;
        if !connection.is_active() {
            debug!(connection = connection.id(), "acquired connection is inactive");
            pool.release(&connection);
            return Err(ClientError::ConnectionInactive);
        }
        if !connection.is_writable() {
            debug!(connection = connection.id(), "acquired connection is over its write buffer watermark");
            pool.release(&connection);
            return Err(ClientError::WriteBufferFull);
        }
        Ok(connection)
    }
}

#[async_trait]
impl Transceive for Transceiver {
    async fn transceive(&self, request: ClientRequest) -> Result<ClientResponse, ClientError> {
        let destination = Destination::from_uri(request.uri())?;
        let keep_alive = request.keep_alive(self.config.keep_alive);
        let (head, payload, context) = request.into_parts();
        let segment = match &payload {
            Payload::Segment(channel) => Some(channel.clone()),
            _ => None,
        };

        let prepared = async {
            let writer = RequestWriter::for_payload(&payload).await?;
            self.listener.on_pool_attempt(&destination);
            let pool = self.cache.get_or_create(&destination, keep_alive, || self.new_pool(destination.clone()))?;
            let connection = self.acquire(&pool).await?;
            Ok::<_, ClientError>((writer, pool, connection))
        };
        let (writer, pool, connection) = match prepared.await {
            Ok(prepared) => prepared,
            Err(e) => {
                if let Some(channel) = &segment {
                    channel.fail(&e);
                }
                return Err(e);
            }
        };
        trace!(connection = connection.id(), %destination, keep_alive, "connection acquired");

        let (handle, response) = ResponseHandle::new(Arc::clone(&context), Arc::clone(&self.listener), self.resources.callback_handle().as_ref());
        let timer_slot: Arc<Mutex<Option<TimerKey>>> = Arc::new(Mutex::new(None));
        {
            let registered = handle.clone();
            let connection = connection.clone();
            let resources = self.resources.clone();
            let timer_slot = Arc::clone(&timer_slot);
            let segment = segment.clone();
            handle.on_terminal(move || {
                connection.registry().remove_if(registered.id(), |entry| entry.same(&registered));
                if let Some(key) = timer_slot.lock().take() {
                    resources.timer().cancel(key);
                }
                if !keep_alive {
                    connection.mark_unreusable();
                }
                pool.release(&connection);
                if let Some(channel) = segment {
                    channel.close();
                }
            });
        }

        // the wait for an interim 100 already counts against the read timeout
        let waits_for_continue = expects_continue(&head).then(Instant::now);
        let cx = WriteContext { connection: &connection, handle: &handle, head, keep_alive, listener: self.listener.as_ref() };
        if let Err(failure) = writer.write(cx).await {
            let e = failure.into_error();
            debug!(connection = connection.id(), id = handle.id(), cause = %e, "request write failed");
            if let Some(channel) = &segment {
                channel.fail(&e);
            }
            handle.on_error(e);
        }

        if let Some(timeout) = context.read_timeout()
            && !handle.is_ended()
        {
            let remaining = waits_for_continue.map_or(timeout, |since| timeout.saturating_sub(since.elapsed()));
            let timed_out = handle.clone();
            let connection = connection.clone();
            let key = self.resources.timer().schedule(
                remaining,
                Box::new(move || {
                    if timed_out.is_ended() {
                        return;
                    }
                    debug!(connection = connection.id(), id = timed_out.id(), ?timeout, "read timed out");
                    // retire the connection before the slot goes back to the pool
                    connection.mark_unreusable();
                    timed_out.on_error(ClientError::Timeout(timeout));
                    connection.close();
                }),
            );
            *timer_slot.lock() = Some(key);
            if handle.is_ended()
                && let Some(key) = timer_slot.lock().take()
            {
                self.resources.timer().cancel(key);
            }
        }

        response.await.unwrap_or(Err(ClientError::ClosedConnection))
    }
}

impl fmt::Debug for Transceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transceiver").field("cache", &self.cache).field("resources", &self.resources).finish_non_exhaustive()
    }
}
