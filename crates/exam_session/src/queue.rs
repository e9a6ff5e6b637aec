//! Offline sync queue.
//!
//! Pending remote writes are persisted as one JSON object under
//! `offline-sync-queue`, keyed by session id (or session id plus a `#suffix`
//! for specialized payloads such as the final submission). Entries are
//! upserted latest-write-wins, delivered by [`OfflineSyncQueue::drain`], and
//! abandoned once they have failed `max_retries` times.
//!
//! Every operation re-reads the store, so several queue handles, an app
//! restart, or a drain racing an enqueue all see the durable state.

use chrono::{DateTime, Utc};
use kv_store::{KeyValueStore, KvResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{broadcast, watch};

use crate::error::{RemoteError, SessionError, SessionResult};
use crate::remote::{RemotePatch, RemoteRecordService};
use crate::time::TimeSource;

/// Store key holding the whole queue
pub const QUEUE_KEY: &str = "offline-sync-queue";
/// Failures after which an entry is dropped
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Separates the session id from a payload suffix in queue keys
pub const KEY_SUFFIX_SEPARATOR: char = '#';

const EVENT_CAPACITY: usize = 64;

/// Build a queue key for a specialized payload of `session_id`
pub fn suffixed_key(session_id: &str, suffix: &str) -> String {
    format!("{}{}{}", session_id, KEY_SUFFIX_SEPARATOR, suffix)
}

/// Remote record id addressed by a queue key
pub fn record_id(key: &str) -> &str {
    key.split_once(KEY_SUFFIX_SEPARATOR).map_or(key, |(id, _)| id)
}

/// A pending remote write
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncQueueItem {
    /// Exactly the fields to write remotely
    pub payload: RemotePatch,
    /// When this payload was enqueued
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
}

/// Diagnostic events emitted by the queue
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueueEvent {
    Enqueued { key: String },
    Delivered { key: String },
    RetryScheduled { key: String, retry_count: u32, error: RemoteError },
    /// The entry hit the retry bound and was dropped; its update is lost
    Abandoned { key: String, retry_count: u32, error: RemoteError },
}

/// Outcome of one drain pass
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub delivered: Vec<String>,
    pub retried: Vec<String>,
    pub abandoned: Vec<String>,
    /// Entries removed or replaced by someone else during the pass
    pub superseded: Vec<String>,
    /// Another drain was already running; nothing was attempted
    pub already_running: bool,
}

impl DrainReport {
    fn skipped() -> Self {
        Self {
            already_running: true,
            ..Default::default()
        }
    }

    /// Number of remote attempts made
    pub fn attempted(&self) -> usize {
        self.delivered.len() + self.retried.len() + self.abandoned.len()
    }
}

enum Settle {
    Removed,
    Retry(u32),
    Abandon(u32),
    Superseded,
}

type QueueMap = BTreeMap<String, SyncQueueItem>;

/// Durable retry queue for remote writes
pub struct OfflineSyncQueue {
    kv: Arc<dyn KeyValueStore>,
    time: Arc<dyn TimeSource>,
    max_retries: u32,
    /// Serializes read-modify-write cycles on the queue blob
    write_lock: Mutex<()>,
    drain_lock: tokio::sync::Mutex<()>,
    pending_count: watch::Sender<usize>,
    events: broadcast::Sender<QueueEvent>,
}

impl OfflineSyncQueue {
    pub fn new(kv: Arc<dyn KeyValueStore>, time: Arc<dyn TimeSource>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let queue = Self {
            kv,
            time,
            max_retries: DEFAULT_MAX_RETRIES,
            write_lock: Mutex::new(()),
            drain_lock: tokio::sync::Mutex::new(()),
            pending_count: watch::channel(0).0,
            events,
        };
        queue.recount();
        queue
    }

    /// Set the failure bound
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    // ========== Queue Management ==========

    /// Insert or replace the entry for `key` with a fresh retry count
    ///
    /// Returns `Ok(false)` if the entry could not be persisted.
    pub fn enqueue(&self, key: &str, payload: RemotePatch) -> SessionResult<bool> {
        if key.trim().is_empty() || record_id(key).trim().is_empty() {
            return Err(SessionError::MissingSessionId);
        }

        let item = SyncQueueItem {
            payload,
            timestamp: self.time.now(),
            retry_count: 0,
        };
        let persisted = self.update(|queue| {
            queue.insert(key.to_string(), item);
        });

        if persisted.is_some() {
            tracing::debug!(key, "Queued remote write");
            self.emit(QueueEvent::Enqueued { key: key.to_string() });
        }
        Ok(persisted.is_some())
    }

    /// Remove and return the entry for `key`
    pub fn dequeue(&self, key: &str) -> Option<SyncQueueItem> {
        self.update(|queue| queue.remove(key)).flatten()
    }

    /// Remove the entry for `key` if it was enqueued at or before `cutoff`
    ///
    /// Used after a direct remote write succeeds so an older queued payload
    /// cannot be replayed over it.
    pub fn dequeue_stale(&self, key: &str, cutoff: DateTime<Utc>) -> bool {
        if !self.read().get(key).is_some_and(|item| item.timestamp <= cutoff) {
            return false;
        }
        self.update(|queue| match queue.get(key) {
            Some(item) if item.timestamp <= cutoff => queue.remove(key).is_some(),
            _ => false,
        })
        .unwrap_or(false)
    }

    /// Fresh read of every entry
    pub fn list(&self) -> QueueMap {
        self.read()
    }

    /// Fresh read of one entry
    pub fn get(&self, key: &str) -> Option<SyncQueueItem> {
        self.read().remove(key)
    }

    /// Last published number of pending entries
    pub fn pending_count(&self) -> usize {
        *self.pending_count.borrow()
    }

    /// Re-read the store and publish the pending count; performs no writes
    pub fn recount(&self) -> usize {
        let count = self.read().len();
        self.pending_count.send_replace(count);
        count
    }

    /// Watch the pending count
    pub fn watch_pending(&self) -> watch::Receiver<usize> {
        self.pending_count.subscribe()
    }

    /// Subscribe to queue events
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    // ========== Delivery ==========

    /// Attempt delivery of every queued entry
    ///
    /// Call only while online. Works on a fresh snapshot of the store; an
    /// entry replaced by a newer enqueue while its write was in flight is
    /// kept (the newer payload has not been sent). A second drain started
    /// while one is running returns immediately.
    pub async fn drain<R: RemoteRecordService>(&self, remote: &R) -> DrainReport {
        let Ok(_guard) = self.drain_lock.try_lock() else {
            tracing::debug!("Drain already in progress");
            return DrainReport::skipped();
        };

        let mut report = DrainReport::default();
        let entries = self.read();
        if !entries.is_empty() {
            tracing::info!(count = entries.len(), "Draining offline sync queue");
        }

        for (key, item) in entries {
            let result = remote.update(record_id(&key), &item.payload).await;

            match result {
                Ok(()) => match self.settle_success(&key, &item) {
                    Settle::Removed => {
                        tracing::debug!(key = %key, "Delivered queued write");
                        self.emit(QueueEvent::Delivered { key: key.clone() });
                        report.delivered.push(key);
                    }
                    _ => {
                        tracing::debug!(key = %key, "Queued write superseded during delivery");
                        report.superseded.push(key);
                    }
                },
                Err(error) => match self.settle_failure(&key, &item) {
                    Settle::Retry(retry_count) => {
                        tracing::debug!(key = %key, retry_count, "Queued write failed: {}", error);
                        self.emit(QueueEvent::RetryScheduled {
                            key: key.clone(),
                            retry_count,
                            error,
                        });
                        report.retried.push(key);
                    }
                    Settle::Abandon(retry_count) => {
                        tracing::warn!(
                            key = %key,
                            retry_count,
                            "Abandoning queued write after repeated failures: {}",
                            error
                        );
                        self.emit(QueueEvent::Abandoned {
                            key: key.clone(),
                            retry_count,
                            error,
                        });
                        report.abandoned.push(key);
                    }
                    _ => {
                        tracing::debug!(key = %key, "Queued write not found after failure");
                        report.superseded.push(key);
                    }
                },
            }
        }

        self.recount();
        report
    }

    fn settle_success(&self, key: &str, sent: &SyncQueueItem) -> Settle {
        self.update(|queue| match queue.get(key) {
            Some(current) if same_payload(current, sent) => {
                queue.remove(key);
                Settle::Removed
            }
            _ => Settle::Superseded,
        })
        .unwrap_or(Settle::Superseded)
    }

    fn settle_failure(&self, key: &str, sent: &SyncQueueItem) -> Settle {
        let max_retries = self.max_retries;
        self.update(|queue| {
            let Some(current) = queue.get_mut(key) else {
                return Settle::Superseded;
            };
            if !same_payload(current, sent) {
                return Settle::Superseded;
            }

            current.retry_count += 1;
            let retry_count = current.retry_count;
            if retry_count >= max_retries {
                queue.remove(key);
                Settle::Abandon(retry_count)
            } else {
                Settle::Retry(retry_count)
            }
        })
        .unwrap_or(Settle::Superseded)
    }

    // ========== Persistence ==========

    fn read(&self) -> QueueMap {
        self.try_read().unwrap_or_else(|e| {
            tracing::warn!("Failed to read offline sync queue: {}", e);
            QueueMap::new()
        })
    }

    /// Read the queue; only a store failure is an error, corrupt data is empty
    fn try_read(&self) -> KvResult<QueueMap> {
        let Some(raw) = self.kv.get(QUEUE_KEY)? else {
            return Ok(QueueMap::new());
        };

        Ok(serde_json::from_str(&raw).unwrap_or_else(|e| {
            tracing::warn!("Ignoring corrupt offline sync queue: {}", e);
            QueueMap::new()
        }))
    }

    /// Apply `f` to a fresh read and persist the result
    ///
    /// Returns `None` if the read or the write failed; the store is left as
    /// it was.
    fn update<T>(&self, f: impl FnOnce(&mut QueueMap) -> T) -> Option<T> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut queue = match self.try_read() {
            Ok(queue) => queue,
            Err(e) => {
                tracing::warn!("Offline sync queue unreadable, not modified: {}", e);
                return None;
            }
        };
        let result = f(&mut queue);

        let written = if queue.is_empty() {
            self.kv.remove(QUEUE_KEY)
        } else {
            match serde_json::to_string(&queue) {
                Ok(json) => self.kv.set(QUEUE_KEY, &json),
                Err(e) => Err(e.into()),
            }
        };

        match written {
            Ok(()) => {
                self.pending_count.send_replace(queue.len());
                Some(result)
            }
            Err(e) => {
                tracing::warn!("Failed to persist offline sync queue: {}", e);
                None
            }
        }
    }

    fn emit(&self, event: QueueEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

fn same_payload(a: &SyncQueueItem, b: &SyncQueueItem) -> bool {
    a.timestamp == b.timestamp && a.payload == b.payload
}
