//! Connectivity monitor.
//!
//! Holds the last observed online/offline value reported by the host and
//! fans every edge out to registered handlers. Handlers run synchronously on
//! the thread that reported the change, after the new value is visible to
//! `current_status`.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::info;

use crate::models::Connectivity;

type Handler = Arc<dyn Fn(Connectivity) + Send + Sync>;

struct Inner {
    status: Connectivity,
    next_id: u64,
    handlers: BTreeMap<u64, Handler>,
}

/// Shared handle to the host's connectivity signal.
#[derive(Clone)]
pub struct ConnectivityMonitor {
    inner: Arc<Mutex<Inner>>,
}

impl ConnectivityMonitor {
    pub fn new(initial: Connectivity) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                status: initial,
                next_id: 0,
                handlers: BTreeMap::new(),
            })),
        }
    }

    /// Last observed value. Never blocks on anything but the handler registry.
    pub fn current_status(&self) -> Connectivity {
        self.lock().status
    }

    pub fn is_online(&self) -> bool {
        self.current_status().is_online()
    }

    /// Feed a new reading from the host. Returns `true` if it was an edge.
    pub fn set_status(&self, status: Connectivity) -> bool {
        let handlers: Vec<Handler> = {
            let mut inner = self.lock();
            if inner.status == status {
                return false;
            }
            inner.status = status;
            inner.handlers.values().cloned().collect()
        };
        info!(?status, subscribers = handlers.len(), "connectivity changed");
        for handler in handlers {
            handler(status);
        }
        true
    }

    /// Register `handler` for every transition. Dropping the returned
    /// subscription deregisters it.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(Connectivity) + Send + Sync + 'static,
    {
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.handlers.insert(id, Arc::new(handler));
        Subscription {
            monitor: Arc::downgrade(&self.inner),
            id: Some(id),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().handlers.len()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ConnectivityMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("ConnectivityMonitor")
            .field("status", &inner.status)
            .field("subscribers", &inner.handlers.len())
            .finish()
    }
}

/// Scoped registration returned by [`ConnectivityMonitor::subscribe`].
#[must_use = "dropping a subscription cancels it"]
pub struct Subscription {
    monitor: Weak<Mutex<Inner>>,
    id: Option<u64>,
}

impl Subscription {
    pub fn cancel(mut self) {
        self.release();
    }

    fn release(&mut self) {
        let Some(id) = self.id.take() else { return };
        if let Some(inner) = self.monitor.upgrade() {
            inner
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .handlers
                .remove(&id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}
