//! Session navigation and answer state.
//!
//! Pure synchronous state: which question is shown, the chosen option per
//! question, the pinned set and the submission phase. Persistence and remote
//! sync are driven by the runtime around these mutations.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::clock::ClockState;
use crate::error::{SessionError, SessionResult};
use crate::remote::{RemoteSessionRecord, RemoteStatus};
use crate::snapshot::ExamProgressSnapshot;

/// Lifecycle phase of a session
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionPhase {
    #[default]
    NotStarted,
    InProgress,
    /// Terminal
    Submitted,
}

/// Answers, pins and position within one exam
#[derive(Clone, Debug)]
pub struct ExamSession {
    session_id: String,
    user_id: String,
    question_count: u32,
    phase: SessionPhase,
    answers: BTreeMap<u32, u32>,
    pinned: BTreeSet<u32>,
    current_question_index: u32,
}

impl ExamSession {
    /// Create a not-started session
    pub fn new(session_id: &str, user_id: &str, question_count: u32) -> SessionResult<Self> {
        if session_id.trim().is_empty() {
            return Err(SessionError::MissingSessionId);
        }
        if user_id.trim().is_empty() {
            return Err(SessionError::MissingUserId);
        }

        Ok(Self {
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            question_count,
            phase: SessionPhase::NotStarted,
            answers: BTreeMap::new(),
            pinned: BTreeSet::new(),
            current_question_index: 0,
        })
    }

    /// Seed state from the remote record and any local snapshot
    ///
    /// A completed remote record or a locally submitted snapshot opens the
    /// session as submitted. Otherwise the local snapshot, being at least as
    /// recent as the remote record, wins for answers and position. Returns the
    /// seconds already spent.
    pub fn begin(&mut self, remote: &RemoteSessionRecord, local: Option<&ExamProgressSnapshot>) -> u64 {
        self.answers = remote.answers.clone();
        self.pinned = remote.pinned.clone();
        let mut time_spent = remote.time_spent;

        if remote.status == RemoteStatus::Completed {
            self.phase = SessionPhase::Submitted;
            tracing::info!(session_id = %self.session_id, "Session already completed");
            return time_spent;
        }

        if let Some(local) = local {
            self.answers = local.answers.clone();
            self.pinned = local.pinned.clone();
            self.current_question_index = local.current_question_index;
            time_spent = time_spent.max(local.time_spent);
        }
        self.retain_valid();

        self.phase = if local.is_some_and(|l| l.is_submitted) {
            SessionPhase::Submitted
        } else {
            SessionPhase::InProgress
        };
        tracing::info!(
            session_id = %self.session_id,
            phase = ?self.phase,
            restored = local.is_some(),
            "Session opened"
        );
        time_spent
    }

    // ========== Accessors ==========

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn question_count(&self) -> u32 {
        self.question_count
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn is_in_progress(&self) -> bool {
        self.phase == SessionPhase::InProgress
    }

    pub fn is_submitted(&self) -> bool {
        self.phase == SessionPhase::Submitted
    }

    pub fn answers(&self) -> &BTreeMap<u32, u32> {
        &self.answers
    }

    pub fn answer(&self, question: u32) -> Option<u32> {
        self.answers.get(&question).copied()
    }

    pub fn answered_count(&self) -> usize {
        self.answers.len()
    }

    pub fn pinned(&self) -> &BTreeSet<u32> {
        &self.pinned
    }

    pub fn is_pinned(&self, question: u32) -> bool {
        self.pinned.contains(&question)
    }

    pub fn current_question_index(&self) -> u32 {
        self.current_question_index
    }

    // ========== Mutations ==========
    //
    // Each returns whether state changed. Mutations are ignored outside the
    // in-progress phase and for out-of-range questions.

    /// Choose `option` for `question`
    pub fn select_answer(&mut self, question: u32, option: u32) -> bool {
        if !self.accepts(question) {
            return false;
        }
        self.answers.insert(question, option) != Some(option)
    }

    /// Remove the answer for `question`
    pub fn clear_answer(&mut self, question: u32) -> bool {
        if !self.accepts(question) {
            return false;
        }
        self.answers.remove(&question).is_some()
    }

    /// Pin or unpin `question`
    pub fn toggle_pin(&mut self, question: u32) -> bool {
        if !self.accepts(question) {
            return false;
        }
        if !self.pinned.remove(&question) {
            self.pinned.insert(question);
        }
        true
    }

    /// Jump to `question`
    pub fn go_to(&mut self, question: u32) -> bool {
        if !self.accepts(question) || self.current_question_index == question {
            return false;
        }
        self.current_question_index = question;
        true
    }

    /// Move forward one question, stopping at the last
    pub fn next(&mut self) -> bool {
        self.go_to(self.current_question_index.saturating_add(1))
    }

    /// Move back one question, stopping at the first
    pub fn previous(&mut self) -> bool {
        match self.current_question_index.checked_sub(1) {
            Some(index) => self.go_to(index),
            None => false,
        }
    }

    /// Enter the terminal phase
    ///
    /// Returns `true` only for the call that performed the transition.
    pub fn mark_submitted(&mut self) -> bool {
        if self.phase == SessionPhase::Submitted {
            return false;
        }
        self.phase = SessionPhase::Submitted;
        true
    }

    /// Full snapshot for local persistence
    pub fn snapshot(&self, clock: &ClockState) -> ExamProgressSnapshot {
        ExamProgressSnapshot {
            answers: self.answers.clone(),
            pinned: self.pinned.clone(),
            current_question_index: self.current_question_index,
            time_spent: clock.time_spent,
            time_left: clock.time_left,
            is_submitted: self.is_submitted(),
            saved_at: None,
        }
    }

    fn accepts(&self, question: u32) -> bool {
        if self.phase != SessionPhase::InProgress {
            tracing::debug!(session_id = %self.session_id, phase = ?self.phase, "Ignoring mutation");
            return false;
        }
        if question >= self.question_count {
            tracing::debug!(question, count = self.question_count, "Ignoring out-of-range question");
            return false;
        }
        true
    }

    fn retain_valid(&mut self) {
        let count = self.question_count;
        self.answers.retain(|question, _| *question < count);
        self.pinned.retain(|question| *question < count);
        if self.current_question_index >= count {
            self.current_question_index = count.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(count: u32) -> ExamSession {
        let mut session = ExamSession::new("exam-1", "user-1", count).unwrap();
        session.begin(&RemoteSessionRecord::in_progress(), None);
        session
    }

    #[test]
    fn test_new_requires_ids() {
        assert_eq!(
            ExamSession::new("", "u", 3).unwrap_err(),
            SessionError::MissingSessionId
        );
        assert_eq!(
            ExamSession::new("s", " ", 3).unwrap_err(),
            SessionError::MissingUserId
        );
    }

    #[test]
    fn test_not_started_ignores_mutations() {
        let mut session = ExamSession::new("exam-1", "user-1", 5).unwrap();
        assert_eq!(session.phase(), SessionPhase::NotStarted);
        assert!(!session.select_answer(0, 1));
        assert!(session.answers().is_empty());
    }

    #[test]
    fn test_answers() {
        let mut session = started(5);
        assert!(session.select_answer(1, 2));
        assert!(!session.select_answer(1, 2));
        assert!(session.select_answer(1, 3));
        assert_eq!(session.answer(1), Some(3));

        assert!(session.clear_answer(1));
        assert!(!session.clear_answer(1));
        assert_eq!(session.answered_count(), 0);
    }

    #[test]
    fn test_out_of_range_question_ignored() {
        let mut session = started(3);
        assert!(!session.select_answer(3, 0));
        assert!(!session.toggle_pin(7));
        assert!(!session.go_to(3));
    }

    #[test]
    fn test_toggle_pin() {
        let mut session = started(3);
        assert!(session.toggle_pin(2));
        assert!(session.is_pinned(2));
        assert!(session.toggle_pin(2));
        assert!(!session.is_pinned(2));
    }

    #[test]
    fn test_navigation_clamps() {
        let mut session = started(3);
        assert!(!session.previous());
        assert!(session.next());
        assert!(session.next());
        assert_eq!(session.current_question_index(), 2);
        assert!(!session.next());
        assert!(session.previous());
        assert_eq!(session.current_question_index(), 1);
    }

    #[test]
    fn test_submitted_is_terminal() {
        let mut session = started(3);
        session.select_answer(0, 1);
        assert!(session.mark_submitted());
        assert!(!session.mark_submitted());

        assert!(!session.select_answer(0, 2));
        assert!(!session.toggle_pin(0));
        assert_eq!(session.answer(0), Some(1));
    }

    #[test]
    fn test_begin_restores_local_snapshot() {
        let mut session = ExamSession::new("exam-1", "user-1", 4).unwrap();
        let remote = RemoteSessionRecord {
            status: RemoteStatus::InProgress,
            time_spent: 30,
            answers: BTreeMap::from([(0, 0)]),
            pinned: BTreeSet::new(),
        };
        let local = ExamProgressSnapshot {
            answers: BTreeMap::from([(0, 1), (2, 3), (9, 9)]),
            pinned: BTreeSet::from([2]),
            current_question_index: 2,
            time_spent: 45,
            ..Default::default()
        };

        let spent = session.begin(&remote, Some(&local));
        assert_eq!(spent, 45);
        assert!(session.is_in_progress());
        assert_eq!(session.answers(), &BTreeMap::from([(0, 1), (2, 3)]));
        assert_eq!(session.current_question_index(), 2);
    }

    #[test]
    fn test_begin_keeps_larger_remote_time() {
        let mut session = ExamSession::new("exam-1", "user-1", 4).unwrap();
        let remote = RemoteSessionRecord {
            time_spent: 90,
            ..RemoteSessionRecord::in_progress()
        };
        let local = ExamProgressSnapshot {
            time_spent: 60,
            ..Default::default()
        };
        assert_eq!(session.begin(&remote, Some(&local)), 90);
    }

    #[test]
    fn test_begin_completed_remote_is_submitted() {
        let mut session = ExamSession::new("exam-1", "user-1", 4).unwrap();
        let remote = RemoteSessionRecord {
            status: RemoteStatus::Completed,
            time_spent: 100,
            answers: BTreeMap::from([(1, 1)]),
            pinned: BTreeSet::new(),
        };
        let local = ExamProgressSnapshot {
            answers: BTreeMap::from([(1, 2)]),
            ..Default::default()
        };

        assert_eq!(session.begin(&remote, Some(&local)), 100);
        assert!(session.is_submitted());
        assert_eq!(session.answer(1), Some(1));
    }

    #[test]
    fn test_begin_locally_submitted_snapshot() {
        let mut session = ExamSession::new("exam-1", "user-1", 4).unwrap();
        let local = ExamProgressSnapshot {
            is_submitted: true,
            ..Default::default()
        };
        session.begin(&RemoteSessionRecord::in_progress(), Some(&local));
        assert!(session.is_submitted());
    }

    #[test]
    fn test_snapshot_mirrors_clock() {
        let mut session = started(3);
        session.select_answer(2, 0);
        session.go_to(2);
        let clock = ClockState {
            time_limit: Some(60),
            time_spent: 12,
            time_left: Some(48),
            is_running: true,
            is_time_up: false,
        };

        let snapshot = session.snapshot(&clock);
        assert_eq!(snapshot.time_spent, 12);
        assert_eq!(snapshot.time_left, Some(48));
        assert_eq!(snapshot.current_question_index, 2);
        assert!(!snapshot.is_submitted);
    }
}
