//! Change detection and sync status for remote progress writes.
//!
//! Only `answers`, `timeSpent` and `pinned` are written to the remote record
//! during a session. The detector remembers the serialized form of each of
//! those fields as of the last successful remote write and builds a patch
//! containing every field that differs. Because the baseline only moves on
//! success, a later patch always covers the fields of an earlier failed one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::remote::{fields, RemotePatch};
use crate::snapshot::ExamProgressSnapshot;

/// Remote sync status shown to the user
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    #[default]
    Idle,
    Syncing,
    Success,
    Error,
    Offline,
}

/// Observable remote persistence state
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    pub status: SyncStatus,
    pub last_saved: Option<DateTime<Utc>>,
    pub has_unsaved_changes: bool,
}

impl SyncState {
    /// Local changes exist that the remote has not seen
    pub fn mark_dirty(&mut self) {
        self.has_unsaved_changes = true;
    }

    /// No remote write attempted because the client is offline
    pub fn mark_offline(&mut self) {
        self.status = SyncStatus::Offline;
        self.has_unsaved_changes = true;
    }

    /// A remote write is in flight
    pub fn mark_syncing(&mut self) {
        self.status = SyncStatus::Syncing;
    }

    /// The remote write succeeded
    ///
    /// `still_dirty` reports mutations that landed while the write was in flight.
    pub fn mark_success(&mut self, at: DateTime<Utc>, still_dirty: bool) {
        self.status = SyncStatus::Success;
        self.last_saved = Some(at);
        self.has_unsaved_changes = still_dirty;
    }

    /// The remote write failed; the payload went to the offline queue
    pub fn mark_error(&mut self) {
        self.status = SyncStatus::Error;
        self.has_unsaved_changes = true;
    }

    /// Short label for status indicators
    pub fn label(&self) -> &'static str {
        match self.status {
            SyncStatus::Idle if self.has_unsaved_changes => "Unsaved changes",
            SyncStatus::Idle => "Idle",
            SyncStatus::Syncing => "Saving...",
            SyncStatus::Success => "Saved",
            SyncStatus::Error => "Save failed - will retry",
            SyncStatus::Offline => "Offline - saved locally",
        }
    }
}

/// Serialize the remote-relevant fields of a snapshot
pub fn tracked_fields(snapshot: &ExamProgressSnapshot) -> BTreeMap<&'static str, Value> {
    BTreeMap::from([
        (fields::ANSWERS, to_value(&snapshot.answers)),
        (fields::TIME_SPENT, Value::from(snapshot.time_spent)),
        (fields::PINNED, to_value(&snapshot.pinned)),
    ])
}

fn to_value<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

/// A patch ready to send, with the fingerprints it will commit on success
#[derive(Clone, Debug, PartialEq)]
pub struct PendingSync {
    pub patch: RemotePatch,
    fingerprints: BTreeMap<&'static str, String>,
}

/// Remembers what the remote record last acknowledged
#[derive(Clone, Debug, Default)]
pub struct ChangeDetector {
    synced: BTreeMap<&'static str, String>,
}

impl ChangeDetector {
    /// Detector with no baseline: every field counts as changed
    pub fn new() -> Self {
        Self::default()
    }

    /// Detector whose baseline is the given remote-known state
    pub fn with_baseline(snapshot: &ExamProgressSnapshot) -> Self {
        Self {
            synced: fingerprints(snapshot),
        }
    }

    /// Whether any tracked field differs from the baseline
    pub fn is_dirty(&self, snapshot: &ExamProgressSnapshot) -> bool {
        fingerprints(snapshot) != self.synced
    }

    /// Build the patch to send, or `None` when nothing changed and not forced
    ///
    /// A forced call with no changes sends every tracked field.
    pub fn pending(&self, snapshot: &ExamProgressSnapshot, force: bool) -> Option<PendingSync> {
        let current = fingerprints(snapshot);
        let values = tracked_fields(snapshot);

        let mut patch = RemotePatch::new();
        for (field, fingerprint) in &current {
            if self.synced.get(field) != Some(fingerprint) {
                patch.insert(field, values[field].clone());
            }
        }

        if patch.is_empty() {
            if !force {
                return None;
            }
            for (field, value) in values {
                patch.insert(field, value);
            }
        }

        Some(PendingSync {
            patch,
            fingerprints: current,
        })
    }

    /// Move the baseline to what `pending` sent
    pub fn mark_synced(&mut self, pending: &PendingSync) {
        for field in pending.patch.field_names() {
            if let Some((name, fingerprint)) = pending.fingerprints.get_key_value(field) {
                self.synced.insert(*name, fingerprint.clone());
            }
        }
    }
}

fn fingerprints(snapshot: &ExamProgressSnapshot) -> BTreeMap<&'static str, String> {
    tracked_fields(snapshot)
        .into_iter()
        .map(|(field, value)| (field, value.to_string()))
        .collect()
}
