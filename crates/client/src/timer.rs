//! The shared read-timeout timer.
//!
//! One `DelayQueue` serves every connection of every client that shares the
//! same [`Resources`](crate::Resources). Scheduling and cancelling only push a
//! command onto an unbounded channel, so the request path never takes a lock.
//! The driving task is started lazily on first use, from within the runtime.

use futures::StreamExt;
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::time::DelayQueue;
use tokio_util::time::delay_queue;
use tracing::trace;

pub(crate) type TimerAction = Box<dyn FnOnce() + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct TimerKey(u64);

enum TimerCommand {
    Schedule { key: TimerKey, delay: Duration, action: TimerAction },
    Cancel(TimerKey),
}

pub(crate) struct ReadTimer {
    next_key: AtomicU64,
    driver: OnceCell<(mpsc::UnboundedSender<TimerCommand>, JoinHandle<()>)>,
}

impl fmt::Debug for ReadTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadTimer").field("started", &self.driver.get().is_some()).finish()
    }
}

impl ReadTimer {
    pub(crate) fn new() -> Self {
        Self { next_key: AtomicU64::new(0), driver: OnceCell::new() }
    }

    /// Run `action` after `delay` unless cancelled first. Must be called from within a tokio runtime.
    pub(crate) fn schedule(&self, delay: Duration, action: TimerAction) -> TimerKey {
        let key = TimerKey(self.next_key.fetch_add(1, Ordering::Relaxed));
        let (sender, _) = self.driver.get_or_init(|| {
            let (sender, receiver) = mpsc::unbounded_channel();
            (sender, tokio::spawn(drive(receiver)))
        });
        // the driver only stops when the timer is dropped
        let _ = sender.send(TimerCommand::Schedule { key, delay, action });
        key
    }

    pub(crate) fn cancel(&self, key: TimerKey) {
        if let Some((sender, _)) = self.driver.get() {
            let _ = sender.send(TimerCommand::Cancel(key));
        }
    }
}

impl Drop for ReadTimer {
    fn drop(&mut self) {
        if let Some((_, task)) = self.driver.get() {
            task.abort();
        }
    }
}

async fn drive(mut commands: mpsc::UnboundedReceiver<TimerCommand>) {
    let mut queue = DelayQueue::new();
    let mut entries: HashMap<TimerKey, (delay_queue::Key, TimerAction)> = HashMap::new();

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(TimerCommand::Schedule { key, delay, action }) => {
                    let queue_key = queue.insert(key, delay);
                    entries.insert(key, (queue_key, action));
                }
                Some(TimerCommand::Cancel(key)) => {
                    if let Some((queue_key, _)) = entries.remove(&key) {
                        queue.remove(&queue_key);
                    }
                }
                None => break,
            },
            Some(expired) = queue.next() => {
                let key = expired.into_inner();
                if let Some((_, action)) = entries.remove(&key) {
                    trace!(key = key.0, "read timer fired");
                    action();
                }
            }
        }
    }
}
