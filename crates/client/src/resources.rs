use crate::ClientError;
use crate::timer::ReadTimer;
use std::fmt;
use std::sync::Arc;
use tokio::runtime::{Handle, Runtime};

/// Process-wide resources shared by clients: the read-timeout timer and the
/// optional runtime that runs response callbacks off the connection tasks.
///
/// Cloning is cheap. When the last clone is dropped the timer task stops and the
/// callback runtime is shut down in the background.
#[derive(Clone)]
pub struct Resources {
    inner: Arc<ResourcesInner>,
}

struct ResourcesInner {
    timer: ReadTimer,
    callback_runtime: Option<Runtime>,
}

impl Resources {
    /// Resources without a callback runtime: callbacks run inline on the connection task.
    pub fn new() -> Self {
        Self { inner: Arc::new(ResourcesInner { timer: ReadTimer::new(), callback_runtime: None }) }
    }

    /// Resources with a dedicated multi-threaded runtime of `threads` workers for response callbacks.
    pub fn with_callback_threads(threads: usize) -> Result<Self, ClientError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(threads.max(1))
            .thread_name("micro-client-callback")
            .enable_all()
            .build()
            .map_err(|e| ClientError::config(format!("can't build callback runtime: {e}")))?;
        Ok(Self { inner: Arc::new(ResourcesInner { timer: ReadTimer::new(), callback_runtime: Some(runtime) }) })
    }

    pub(crate) fn timer(&self) -> &ReadTimer {
        &self.inner.timer
    }

    pub(crate) fn callback_handle(&self) -> Option<Handle> {
        self.inner.callback_runtime.as_ref().map(|runtime| runtime.handle().clone())
    }

    /// Number of live references, clients included.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl Default for Resources {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resources")
            .field("timer", &self.inner.timer)
            .field("callback_runtime", &self.inner.callback_runtime.is_some())
            .finish()
    }
}

impl Drop for ResourcesInner {
    fn drop(&mut self) {
        if let Some(runtime) = self.callback_runtime.take() {
            runtime.shutdown_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callbacks_run_on_dedicated_runtime() {
        let resources = Resources::with_callback_threads(1).unwrap();
        let clone = resources.clone();
        assert_eq!(resources.ref_count(), 2);
        drop(clone);
        assert_eq!(resources.ref_count(), 1);

        let handle = resources.callback_handle().unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        handle.spawn(async move { tx.send(std::thread::current().name().map(str::to_owned)).unwrap() });
        assert_eq!(rx.recv().unwrap().as_deref(), Some("micro-client-callback"));
    }

    #[test]
    fn inline_resources_have_no_callback_runtime() {
        assert!(Resources::new().callback_handle().is_none());
    }
}
