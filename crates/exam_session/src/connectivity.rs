//! Connectivity monitor.
//!
//! A single shared online/offline flag. Every component that needs to know
//! whether a remote write is worth attempting reads it from here; the host
//! feeds platform signals in through [`ConnectivityMonitor::set_online`].

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Tag used when registering a deferred background sync
pub const BACKGROUND_SYNC_TAG: &str = "exam-progress-sync";

/// A change of connectivity
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transition {
    Online,
    Offline,
}

/// Optional platform capability for deferred sync after reconnect
///
/// Registration is best effort; a failure is logged and otherwise ignored.
pub trait BackgroundSyncRegistrar: Send + Sync {
    fn register(&self, tag: &str) -> Result<(), String>;
}

/// Shared online/offline state
#[derive(Clone, Debug)]
pub struct ConnectivityMonitor {
    online: Arc<watch::Sender<bool>>,
}

impl ConnectivityMonitor {
    /// Create a monitor from the platform's initial connectivity signal
    pub fn new(initially_online: bool) -> Self {
        let (online, _) = watch::channel(initially_online);
        Self {
            online: Arc::new(online),
        }
    }

    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    /// Report the platform's current connectivity
    ///
    /// Returns the transition, or `None` if the state did not change.
    pub fn set_online(&self, online: bool) -> Option<Transition> {
        let changed = self.online.send_if_modified(|current| {
            if *current == online {
                return false;
            }
            *current = online;
            true
        });

        if !changed {
            return None;
        }

        let transition = if online {
            Transition::Online
        } else {
            Transition::Offline
        };
        tracing::info!(?transition, "Connectivity changed");
        Some(transition)
    }

    /// Watch the online flag
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.online.subscribe()
    }

    /// Run `handler` on every offline to online transition
    ///
    /// The listener lives until the returned task is aborted or the monitor
    /// and all its clones are dropped.
    pub fn on_reconnect<F, Fut>(&self, mut handler: F) -> JoinHandle<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut rx = self.subscribe();
        // Sampled now so a reconnect before the task is first polled still counts
        let mut was_online = *rx.borrow_and_update();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let online = *rx.borrow_and_update();
                if online && !was_online {
                    handler().await;
                }
                was_online = online;
            }
        })
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Register a deferred sync if the platform supports it
pub fn register_background_sync(registrar: Option<&dyn BackgroundSyncRegistrar>) {
    let Some(registrar) = registrar else {
        return;
    };
    match registrar.register(BACKGROUND_SYNC_TAG) {
        Ok(()) => tracing::debug!("Background sync registered"),
        Err(e) => tracing::warn!("Background sync registration failed: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[test]
    fn test_transitions() {
        let monitor = ConnectivityMonitor::new(false);
        assert!(!monitor.is_online());

        assert_eq!(monitor.set_online(true), Some(Transition::Online));
        assert!(monitor.is_online());
        assert_eq!(monitor.set_online(true), None);
        assert_eq!(monitor.set_online(false), Some(Transition::Offline));
    }

    #[test]
    fn test_clones_share_state() {
        let monitor = ConnectivityMonitor::new(true);
        let other = monitor.clone();
        other.set_online(false);
        assert!(!monitor.is_online());
    }

    #[tokio::test]
    async fn test_on_reconnect_fires_only_on_online_edge() {
        let monitor = ConnectivityMonitor::new(true);
        let count = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&count);
        let listener = monitor.on_reconnect(move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        monitor.set_online(false);
        tokio::task::yield_now().await;
        monitor.set_online(true);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);

        listener.abort();
    }

    struct RecordingRegistrar {
        tags: Mutex<Vec<String>>,
        fail: bool,
    }

    impl BackgroundSyncRegistrar for RecordingRegistrar {
        fn register(&self, tag: &str) -> Result<(), String> {
            self.tags.lock().unwrap().push(tag.to_string());
            if self.fail {
                Err("unsupported".to_string())
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn test_register_background_sync() {
        let registrar = RecordingRegistrar {
            tags: Mutex::new(Vec::new()),
            fail: true,
        };
        // Failure is not propagated
        register_background_sync(Some(&registrar));
        register_background_sync(None);
        assert_eq!(*registrar.tags.lock().unwrap(), vec![BACKGROUND_SYNC_TAG.to_string()]);
    }
}
