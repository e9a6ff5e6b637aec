//! Remote record service interface.
//!
//! The runtime treats the backend as a key-addressed record supporting a
//! partial `update`. Anything beyond that (fetching, authorization,
//! scoring) belongs to the host application.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::RemoteError;

/// Remote field names written by the runtime
pub mod fields {
    pub const ANSWERS: &str = "answers";
    pub const TIME_SPENT: &str = "timeSpent";
    pub const PINNED: &str = "pinned";
    pub const STATUS: &str = "status";
    pub const COMPLETED_AT: &str = "completedAt";
}

/// A partial record update: remote field name to JSON value
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemotePatch(BTreeMap<String, Value>);

impl RemotePatch {
    /// Create an empty patch
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.insert(field, value);
        self
    }

    /// Set `field`, replacing any previous value
    pub fn insert(&mut self, field: &str, value: impl Into<Value>) {
        self.0.insert(field.to_string(), value.into());
    }

    /// Get a field value
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// Check if the patch writes `field`
    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    /// Field names in the patch, sorted
    pub fn field_names(&self) -> Vec<&str> {
        self.0.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Apply this patch on top of `target`, field by field
    pub fn apply_to(&self, target: &mut RemotePatch) {
        for (field, value) in &self.0 {
            target.0.insert(field.clone(), value.clone());
        }
    }
}

/// Lifecycle status of the remote session record
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RemoteStatus {
    #[default]
    NotStarted,
    InProgress,
    Completed,
}

impl RemoteStatus {
    /// Whether the record is in a terminal state
    pub fn is_terminal(self) -> bool {
        matches!(self, RemoteStatus::Completed)
    }

    /// Value written into the remote `status` field
    pub fn as_str(self) -> &'static str {
        match self {
            RemoteStatus::NotStarted => "not_started",
            RemoteStatus::InProgress => "in_progress",
            RemoteStatus::Completed => "completed",
        }
    }
}

/// What the host already knows about the remote record when opening a session
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSessionRecord {
    pub status: RemoteStatus,
    #[serde(default)]
    pub time_spent: u64,
    #[serde(default)]
    pub answers: BTreeMap<u32, u32>,
    #[serde(default)]
    pub pinned: BTreeSet<u32>,
}

impl RemoteSessionRecord {
    /// A record that exists and is ready to be taken
    pub fn in_progress() -> Self {
        Self {
            status: RemoteStatus::InProgress,
            ..Default::default()
        }
    }
}

/// Remote record service
///
/// Implementations report every failure, including ownership rejections, as
/// a `RemoteError`; the runtime retries both kinds the same way.
#[trait_variant::make(Send)]
pub trait RemoteRecordService: Send + Sync {
    /// Apply `patch` to the record identified by `session_id`
    async fn update(&self, session_id: &str, patch: &RemotePatch) -> Result<(), RemoteError>;
}

/// In-process remote store with scriptable failures
///
/// Used by tests and the simulator. Successful updates are merged field by
/// field into the stored record; every attempt is logged.
#[derive(Debug, Default)]
pub struct MemoryRemoteStore {
    records: Mutex<HashMap<String, RemotePatch>>,
    attempts: Mutex<Vec<(String, RemotePatch)>>,
    /// Outcomes consumed one per call before falling back to `fallback`
    scripted: Mutex<VecDeque<Option<RemoteError>>>,
    fallback: Mutex<Option<RemoteError>>,
    latency: Option<Duration>,
}

impl MemoryRemoteStore {
    /// Create a store that accepts every update
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every update by `latency` (tokio time)
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Default::default()
        }
    }

    /// Fail the next `count` calls with `error`
    pub fn fail_next(&self, count: usize, error: RemoteError) {
        if let Ok(mut scripted) = self.scripted.lock() {
            scripted.extend(std::iter::repeat(Some(error)).take(count));
        }
    }

    /// Accept the next call regardless of the fallback
    pub fn succeed_next(&self) {
        if let Ok(mut scripted) = self.scripted.lock() {
            scripted.push_back(None);
        }
    }

    /// Fail every unscripted call with `error`
    pub fn fail_always(&self, error: RemoteError) {
        if let Ok(mut fallback) = self.fallback.lock() {
            *fallback = Some(error);
        }
    }

    /// Accept every unscripted call
    pub fn succeed_always(&self) {
        if let Ok(mut fallback) = self.fallback.lock() {
            *fallback = None;
        }
    }

    /// Current merged record for `session_id`
    pub fn record(&self, session_id: &str) -> Option<RemotePatch> {
        self.records.lock().ok()?.get(session_id).cloned()
    }

    /// Number of update attempts, successful or not
    pub fn attempt_count(&self) -> usize {
        self.attempts.lock().map(|a| a.len()).unwrap_or(0)
    }

    /// Every attempt in call order
    pub fn attempts(&self) -> Vec<(String, RemotePatch)> {
        self.attempts.lock().map(|a| a.clone()).unwrap_or_default()
    }

    /// Attempts made for one session id
    pub fn attempts_for(&self, session_id: &str) -> Vec<RemotePatch> {
        self.attempts()
            .into_iter()
            .filter(|(id, _)| id == session_id)
            .map(|(_, patch)| patch)
            .collect()
    }

    fn next_outcome(&self) -> Option<RemoteError> {
        let scripted = self.scripted.lock().ok().and_then(|mut s| s.pop_front());
        match scripted {
            Some(outcome) => outcome,
            None => self.fallback.lock().ok().and_then(|f| f.clone()),
        }
    }
}

impl RemoteRecordService for MemoryRemoteStore {
    async fn update(&self, session_id: &str, patch: &RemotePatch) -> Result<(), RemoteError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        if let Ok(mut attempts) = self.attempts.lock() {
            attempts.push((session_id.to_string(), patch.clone()));
        }

        if let Some(error) = self.next_outcome() {
            return Err(error);
        }

        let mut records = self
            .records
            .lock()
            .map_err(|_| RemoteError::Transport("remote store unavailable".to_string()))?;
        patch.apply_to(records.entry(session_id.to_string()).or_default());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_patch_builder() {
        let patch = RemotePatch::new()
            .with(fields::TIME_SPENT, 42)
            .with(fields::STATUS, "completed");

        assert_eq!(patch.len(), 2);
        assert_eq!(patch.get(fields::TIME_SPENT), Some(&json!(42)));
        assert_eq!(patch.field_names(), vec!["status", "timeSpent"]);
    }

    #[test]
    fn test_patch_serializes_as_plain_object() {
        let patch = RemotePatch::new().with(fields::PINNED, json!([1, 3]));
        assert_eq!(serde_json::to_string(&patch).unwrap(), r#"{"pinned":[1,3]}"#);
    }

    #[test]
    fn test_remote_status() {
        assert!(RemoteStatus::Completed.is_terminal());
        assert!(!RemoteStatus::InProgress.is_terminal());
        assert_eq!(RemoteStatus::Completed.as_str(), "completed");
    }

    #[test]
    fn test_record_deserializes_with_defaults() {
        let record: RemoteSessionRecord =
            serde_json::from_str(r#"{"status":"inProgress","timeSpent":12}"#).unwrap();
        assert_eq!(record.status, RemoteStatus::InProgress);
        assert_eq!(record.time_spent, 12);
        assert!(record.answers.is_empty());
    }

    #[tokio::test]
    async fn test_memory_remote_merges_fields() {
        let remote = MemoryRemoteStore::new();
        remote
            .update("s1", &RemotePatch::new().with(fields::TIME_SPENT, 10))
            .await
            .unwrap();
        remote
            .update("s1", &RemotePatch::new().with(fields::PINNED, json!([2])))
            .await
            .unwrap();

        let record = remote.record("s1").unwrap();
        assert_eq!(record.get(fields::TIME_SPENT), Some(&json!(10)));
        assert_eq!(record.get(fields::PINNED), Some(&json!([2])));
        assert_eq!(remote.attempt_count(), 2);
    }

    #[tokio::test]
    async fn test_memory_remote_scripted_failures() {
        let remote = MemoryRemoteStore::new();
        remote.fail_next(2, RemoteError::Transport("down".into()));

        let patch = RemotePatch::new().with(fields::TIME_SPENT, 1);
        assert!(remote.update("s1", &patch).await.is_err());
        assert!(remote.update("s1", &patch).await.is_err());
        assert!(remote.update("s1", &patch).await.is_ok());
        assert_eq!(remote.attempts_for("s1").len(), 3);
    }

    #[tokio::test]
    async fn test_memory_remote_fallback() {
        let remote = MemoryRemoteStore::new();
        remote.fail_always(RemoteError::Rejected("not owner".into()));
        remote.succeed_next();

        let patch = RemotePatch::new().with(fields::TIME_SPENT, 1);
        assert!(remote.update("s1", &patch).await.is_ok());
        assert_eq!(
            remote.update("s1", &patch).await,
            Err(RemoteError::Rejected("not owner".into()))
        );

        remote.succeed_always();
        assert!(remote.update("s1", &patch).await.is_ok());
    }
}
