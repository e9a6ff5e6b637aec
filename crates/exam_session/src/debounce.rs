//! Cancel-and-reschedule debouncing for remote saves.
//!
//! At most one save is pending per window: scheduling again replaces a
//! pending task that is still waiting. A task whose delay already elapsed is
//! left to finish so an in-flight remote write is never cut off.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;

struct Pending {
    handle: JoinHandle<()>,
    /// Set once the delay elapsed and the action began
    started: Arc<AtomicBool>,
}

/// Single-slot debouncer on the tokio timer
pub struct Debouncer {
    delay: Duration,
    pending: Mutex<Option<Pending>>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: Mutex::new(None),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Run `action` once `delay` has passed without another `schedule` call
    ///
    /// Must be called from within a tokio runtime; outside one the call is
    /// logged and dropped.
    pub fn schedule<F, Fut>(&self, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("Debounced save dropped: no async runtime");
            return;
        };

        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = pending.take() {
            if !previous.started.load(Ordering::SeqCst) {
                previous.handle.abort();
            }
        }

        let started = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&started);
        let delay = self.delay;
        let handle = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            flag.store(true, Ordering::SeqCst);
            action().await;
        });

        *pending = Some(Pending { handle, started });
    }

    /// Whether a scheduled action has not run yet
    pub fn is_pending(&self) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(false, |p| !p.started.load(Ordering::SeqCst) && !p.handle.is_finished())
    }

    /// Drop the pending action if it has not started yet
    pub fn cancel_pending(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if pending
            .as_ref()
            .is_some_and(|p| !p.started.load(Ordering::SeqCst))
        {
            if let Some(previous) = pending.take() {
                previous.handle.abort();
            }
        }
    }

    /// Drop the pending action, aborting it even if it already started
    pub fn cancel(&self) {
        if let Some(previous) = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            previous.handle.abort();
        }
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.cancel();
    }
}
