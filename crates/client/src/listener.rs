//! Observability hooks for the request lifecycle.
//!
//! Listener methods are called inline on the task that produced the event.
//! They must not block and they never influence control flow.

use crate::{ClientError, ClientResponse, Destination};
use micro_client_proto::protocol::{RequestHead, ResponseHead};

#[allow(unused_variables, reason = "the default methods ignore every event")]
pub trait EventListener: Send + Sync {
    /// The transceiver is about to acquire a pool and a connection.
    fn on_pool_attempt(&self, destination: &Destination) {}

    fn on_connection_acquired(&self, destination: &Destination, connection_id: u64) {}

    fn on_write_attempt(&self, head: &RequestHead) {}

    fn on_write_done(&self, head: &RequestHead) {}

    fn on_message_received(&self, head: &ResponseHead) {}

    fn on_completed(&self, response: &ClientResponse) {}

    fn on_error(&self, error: &ClientError) {}
}

/// The listener used when none is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl EventListener for NoopListener {}
