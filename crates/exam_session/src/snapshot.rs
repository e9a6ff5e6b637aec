//! Local snapshot store.
//!
//! Writes the whole session snapshot to the durable local key/value store on
//! every relevant change. This is a best-effort safety net: write failures
//! (quota, serialization) are logged and swallowed, and corrupt stored data
//! reads back as absent.
//!
//! # Keys
//!
//! ```text
//! session-state:<sessionId>          latest ExamProgressSnapshot
//! session-final-pending:<sessionId>  finalize payload awaiting remote confirmation
//! ```

use chrono::{DateTime, Utc};
use kv_store::KeyValueStore;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::error::{SessionError, SessionResult};
use crate::remote::RemotePatch;
use crate::time::TimeSource;

/// Key prefix for live session snapshots
pub const SESSION_STATE_PREFIX: &str = "session-state:";
/// Key prefix for pending final submissions
pub const FINAL_PENDING_PREFIX: &str = "session-final-pending:";

/// Complete serializable progress of one session
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamProgressSnapshot {
    /// Question index to chosen option index
    pub answers: BTreeMap<u32, u32>,
    pub pinned: BTreeSet<u32>,
    pub current_question_index: u32,
    pub time_spent: u64,
    pub time_left: Option<u64>,
    pub is_submitted: bool,
    /// Set by the store when the snapshot is written
    #[serde(default)]
    pub saved_at: Option<DateTime<Utc>>,
}

/// Finalize payload persisted before the remote finalize call
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingFinalSubmission {
    pub payload: RemotePatch,
    pub created_at: DateTime<Utc>,
}

/// Build the live snapshot key for a session
pub fn state_key(session_id: &str) -> String {
    format!("{}{}", SESSION_STATE_PREFIX, session_id)
}

/// Build the pending final submission key for a session
pub fn final_pending_key(session_id: &str) -> String {
    format!("{}{}", FINAL_PENDING_PREFIX, session_id)
}

/// Synchronous snapshot persistence over a `KeyValueStore`
#[derive(Clone)]
pub struct LocalSnapshotStore {
    kv: Arc<dyn KeyValueStore>,
    time: Arc<dyn TimeSource>,
}

impl LocalSnapshotStore {
    pub fn new(kv: Arc<dyn KeyValueStore>, time: Arc<dyn TimeSource>) -> Self {
        Self { kv, time }
    }

    /// Write the snapshot, stamped with `saved_at`
    ///
    /// Returns `Ok(false)` when the write failed; the failure is only logged.
    pub fn save(&self, session_id: &str, snapshot: &ExamProgressSnapshot) -> SessionResult<bool> {
        require_id(session_id)?;

        let mut stamped = snapshot.clone();
        stamped.saved_at = Some(self.time.now());
        Ok(self.write_json(&state_key(session_id), &stamped))
    }

    /// Read the snapshot, or `None` if absent or unreadable
    pub fn load(&self, session_id: &str) -> SessionResult<Option<ExamProgressSnapshot>> {
        require_id(session_id)?;
        Ok(self.read_json(&state_key(session_id)))
    }

    /// Remove the live snapshot and any pending final submission
    pub fn clear(&self, session_id: &str) -> SessionResult<()> {
        require_id(session_id)?;
        self.remove_key(&state_key(session_id));
        self.remove_key(&final_pending_key(session_id));
        Ok(())
    }

    /// Record the finalize payload before attempting the remote write
    pub fn save_final_pending(&self, session_id: &str, payload: &RemotePatch) -> SessionResult<bool> {
        require_id(session_id)?;

        let pending = PendingFinalSubmission {
            payload: payload.clone(),
            created_at: self.time.now(),
        };
        Ok(self.write_json(&final_pending_key(session_id), &pending))
    }

    /// Read a finalize payload left behind by an unconfirmed submission
    pub fn load_final_pending(&self, session_id: &str) -> SessionResult<Option<PendingFinalSubmission>> {
        require_id(session_id)?;
        Ok(self.read_json(&final_pending_key(session_id)))
    }

    /// Drop the pending finalize record once the remote confirmed it
    pub fn clear_final_pending(&self, session_id: &str) -> SessionResult<()> {
        require_id(session_id)?;
        self.remove_key(&final_pending_key(session_id));
        Ok(())
    }

    fn write_json<T: Serialize>(&self, key: &str, value: &T) -> bool {
        let json = match serde_json::to_string(value) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!("Failed to serialize {}: {}", key, e);
                return false;
            }
        };

        match self.kv.set(key, &json) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Local save of {} failed: {}", key, e);
                false
            }
        }
    }

    fn read_json<T: for<'de> Deserialize<'de>>(&self, key: &str) -> Option<T> {
        let raw = match self.kv.get(key) {
            Ok(raw) => raw?,
            Err(e) => {
                tracing::warn!("Local read of {} failed: {}", key, e);
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!("Ignoring corrupt local data under {}: {}", key, e);
                None
            }
        }
    }

    fn remove_key(&self, key: &str) {
        if let Err(e) = self.kv.remove(key) {
            tracing::warn!("Failed to remove {}: {}", key, e);
        }
    }
}

fn require_id(session_id: &str) -> SessionResult<()> {
    if session_id.trim().is_empty() {
        return Err(SessionError::MissingSessionId);
    }
    Ok(())
}
