//! Teardown bookkeeping shared by every adapter.
//!
//! The aggregator owns the resources registered with it and closes each of them
//! exactly once. Background tasks are spawned on its [`TaskTracker`], so `close`
//! can wait for them to drain before returning.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::errors::{BoxError, CloseErrors, ShutdownError};

/// A resource whose teardown is owned by a [`ShutdownAggregator`].
pub trait Closer: Send + Sync {
    fn name(&self) -> String;

    fn close(&self) -> Result<(), BoxError>;
}

pub struct ShutdownAggregator {
    // `None` once drained
    closers: Mutex<Option<Vec<Arc<dyn Closer>>>>,
    tracker: TaskTracker,
}

impl Default for ShutdownAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownAggregator {
    pub fn new() -> Self {
        Self {
            closers: Mutex::new(Some(Vec::new())),
            tracker: TaskTracker::new(),
        }
    }

    /// Takes ownership of `resource`'s teardown and returns the shared task
    /// tracker its background work should be spawned on.
    ///
    /// Callers must stop registering before calling [`close`](Self::close). A
    /// registration that arrives after the aggregator drained is closed on the spot.
    pub fn register(&self, resource: Arc<dyn Closer>) -> TaskTracker {
        let mut closers = self.lock();
        if let Some(set) = closers.as_mut() {
            debug!("Registered {} for shutdown", resource.name());
            set.push(resource);
            return self.tracker.clone();
        }
        drop(closers);

        warn!(
            "{} registered after shutdown, closing immediately",
            resource.name()
        );
        if let Err(e) = resource.close() {
            warn!("Failed to close {}: {}", resource.name(), e);
        }
        self.tracker.clone()
    }

    pub fn tracker(&self) -> TaskTracker {
        self.tracker.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().is_none()
    }

    /// Closes every registered resource, then waits for all tracked tasks.
    ///
    /// Every close failure is kept; none short-circuits the others.
    pub async fn close(&self) -> Result<(), ShutdownError> {
        let set = self.lock().take().ok_or(ShutdownError::AlreadyClosed)?;

        info!("Closing {} registered resource(s)", set.len());
        let mut errors = CloseErrors::default();
        for resource in &set {
            if let Err(e) = resource.close() {
                warn!("Failed to close {}: {}", resource.name(), e);
                errors.push(e);
            }
        }

        self.tracker.close();
        self.tracker.wait().await;
        debug!("All background tasks drained");
        drop(set);

        errors.into_result().map_err(ShutdownError::from)
    }

    fn lock(&self) -> MutexGuard<'_, Option<Vec<Arc<dyn Closer>>>> {
        // a poisoned registry is still a valid registry
        self.closers.lock().unwrap_or_else(|e| e.into_inner())
    }
}
