//! Shutdown state shared by every long-lived component.
//!
//! A [`Lifecycle`] owns an "in shutdown" flag and the set of resources
//! (listeners, server codecs, consumer clients) that are open right now.
//! Once shutdown has begun, new resources are refused so the caller can tear
//! them down on the spot instead of registering them.
//!
//! Providers drain through [`Lifecycle::drain`]: it repeatedly asks tracked
//! codecs to close if idle and returns once no listener or codec is left, or
//! once the caller's cancellation token fires.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Upper bound for the interval between two drain polls.
pub const SHUTDOWN_POLL_INTERVAL_MAX: Duration = Duration::from_millis(500);

/// First interval used by the drain poll loop.
const SHUTDOWN_POLL_INTERVAL_BASE: Duration = Duration::from_millis(1);

pub type ResourceId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Listener,
    Codec,
    Client,
}

/// Something a [`Lifecycle`] can close during shutdown.
pub trait Resource: Send + Sync {
    /// Close the resource unconditionally.
    fn close(&self) -> io::Result<()>;

    /// Close the resource only if it is not in the middle of any work.
    ///
    /// Returns `Ok(true)` once the resource is closed.
    fn close_if_idle(&self) -> io::Result<bool> {
        self.close().map(|_| true)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("shutdown cancelled with {listeners} listener(s) and {codecs} codec(s) still open")]
    Cancelled { listeners: usize, codecs: usize },

    #[error("failed to close listener: {0}")]
    Listener(#[source] io::Error),
}

struct Tracked {
    kind: ResourceKind,
    resource: Arc<dyn Resource>,
}

#[derive(Default)]
pub struct Lifecycle {
    in_shutdown: AtomicBool,
    next_id: AtomicU64,
    resources: Mutex<HashMap<ResourceId, Tracked>>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.in_shutdown.load(Ordering::SeqCst)
    }

    /// Flip the shutdown flag. Returns false if shutdown had already begun.
    pub fn begin_shutdown(&self) -> bool {
        !self.in_shutdown.swap(true, Ordering::SeqCst)
    }

    /// Allocate an id for a resource that is about to be tracked.
    pub fn next_id(&self) -> ResourceId {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Start tracking a resource.
    ///
    /// Returns false once shutdown has begun; the caller owns the resource
    /// and must close it itself.
    pub fn track(&self, id: ResourceId, kind: ResourceKind, resource: Arc<dyn Resource>) -> bool {
        let mut resources = self.lock();
        // Checked under the lock so a concurrent shutdown either sees this
        // resource in its snapshot or makes us refuse it.
        if self.is_shutting_down() {
            return false;
        }
        resources.insert(id, Tracked { kind, resource });
        true
    }

    /// Stop tracking a resource. Unknown ids are ignored.
    pub fn untrack(&self, id: ResourceId) {
        self.lock().remove(&id);
    }

    pub fn count(&self, kind: ResourceKind) -> usize {
        self.lock().values().filter(|t| t.kind == kind).count()
    }

    /// True when no listener and no codec is tracked.
    pub fn is_drained(&self) -> bool {
        !self
            .lock()
            .values()
            .any(|t| matches!(t.kind, ResourceKind::Listener | ResourceKind::Codec))
    }

    /// Close every tracked resource of `kind`, returning the first error.
    pub fn close_all(&self, kind: ResourceKind) -> io::Result<()> {
        let mut first_err = None;
        for resource in self.snapshot(kind) {
            if let Err(e) = resource.close() {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Ask every tracked resource of `kind` to close if idle.
    ///
    /// Returns whether all of them are closed now.
    pub fn close_idle(&self, kind: ResourceKind) -> io::Result<bool> {
        let mut all_closed = true;
        let mut first_err = None;
        for resource in self.snapshot(kind) {
            match resource.close_if_idle() {
                Ok(closed) => all_closed &= closed,
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }
        first_err.map_or(Ok(all_closed), Err)
    }

    /// Wait until no listener or codec is tracked.
    ///
    /// Idle codecs are closed on every poll. Polls back off exponentially
    /// with jitter, capped at [`SHUTDOWN_POLL_INTERVAL_MAX`].
    pub async fn drain(&self, cancel: &CancellationToken) -> Result<(), LifecycleError> {
        let mut base = SHUTDOWN_POLL_INTERVAL_BASE;
        loop {
            if let Err(e) = self.close_idle(ResourceKind::Codec) {
                debug!(error = %e, "error closing idle codec");
            }
            if self.is_drained() {
                return Ok(());
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(self.cancelled_error()),
                _ = tokio::time::sleep(next_poll_interval(&mut base)) => {}
            }
        }
    }

    /// The error reported when a drain is cut short.
    pub fn cancelled_error(&self) -> LifecycleError {
        LifecycleError::Cancelled {
            listeners: self.count(ResourceKind::Listener),
            codecs: self.count(ResourceKind::Codec),
        }
    }

    fn snapshot(&self, kind: ResourceKind) -> Vec<Arc<dyn Resource>> {
        self.lock()
            .values()
            .filter(|t| t.kind == kind)
            .map(|t| t.resource.clone())
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ResourceId, Tracked>> {
        self.resources.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Return the current poll interval plus up to 10% jitter, then double
/// `base` for next time, clamped to [`SHUTDOWN_POLL_INTERVAL_MAX`].
pub fn next_poll_interval(base: &mut Duration) -> Duration {
    let jitter_cap = (*base / 10).as_nanos() as u64;
    let jitter = if jitter_cap > 0 {
        rand::rng().random_range(0..jitter_cap)
    } else {
        0
    };
    let interval = *base + Duration::from_nanos(jitter);

    *base = (*base * 2).min(SHUTDOWN_POLL_INTERVAL_MAX);
    interval
}
