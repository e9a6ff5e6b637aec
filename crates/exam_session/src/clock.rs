//! Exam clock engine.
//!
//! Elapsed time is derived from wall-clock deltas instead of counting ticks,
//! so a late, skipped, or throttled tick never loses time. Each run records a
//! reference timestamp back-computed as `now - accumulated`; every tick then
//! recomputes `time_spent` from that reference.
//!
//! The engine itself owns no timer. A driver (see `SessionRuntime::mount`)
//! calls [`ExamClock::tick`] at 1 Hz and polls [`ExamClock::take_time_up`] to
//! dispatch the time-up notification outside the tick computation.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::time::TimeSource;

/// Read-only view of the clock
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClockState {
    /// Configured limit in seconds, `None` for untimed sessions
    pub time_limit: Option<u64>,
    /// Whole seconds spent so far
    pub time_spent: u64,
    /// Whole seconds remaining, `None` for untimed sessions
    pub time_left: Option<u64>,
    pub is_running: bool,
    pub is_time_up: bool,
}

impl ClockState {
    /// Format the remaining time as `MM:SS`, or `H:MM:SS` past an hour
    pub fn format_remaining(&self) -> Option<String> {
        self.time_left.map(format_seconds)
    }

    /// Format the elapsed time as `MM:SS`, or `H:MM:SS` past an hour
    pub fn format_spent(&self) -> String {
        format_seconds(self.time_spent)
    }
}

fn format_seconds(total: u64) -> String {
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{:02}:{:02}", minutes, seconds)
    }
}

/// Drift-free exam clock
pub struct ExamClock {
    state: ClockState,
    /// Milliseconds folded in from completed runs
    accumulated_ms: i64,
    /// Back-computed start of the current run
    reference_ms: Option<i64>,
    /// Set on the transition into time-up, cleared by `take_time_up`
    time_up_pending: bool,
    time: Arc<dyn TimeSource>,
}

impl ExamClock {
    /// Create a clock for a session that has already spent `already_spent` seconds
    pub fn new(time_limit: Option<u64>, already_spent: u64, time: Arc<dyn TimeSource>) -> Self {
        let mut clock = Self {
            state: ClockState::default(),
            accumulated_ms: 0,
            reference_ms: None,
            time_up_pending: false,
            time,
        };
        clock.configure(time_limit, already_spent);
        clock
    }

    /// Reinitialize for a (possibly different) limit and prior spent time
    ///
    /// A clock configured with `already_spent >= time_limit` starts out timed
    /// up and refuses to start. No time-up notification is raised for it.
    pub fn configure(&mut self, time_limit: Option<u64>, already_spent: u64) {
        let time_spent = match time_limit {
            Some(limit) => already_spent.min(limit),
            None => already_spent,
        };
        let time_left = time_limit.map(|limit| limit.saturating_sub(time_spent));

        self.accumulated_ms = (time_spent as i64).saturating_mul(1000);
        self.reference_ms = None;
        self.time_up_pending = false;
        self.state = ClockState {
            time_limit,
            time_spent,
            time_left,
            is_running: false,
            is_time_up: time_left == Some(0),
        };
    }

    /// Current state
    pub fn state(&self) -> ClockState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state.is_running
    }

    pub fn is_time_up(&self) -> bool {
        self.state.is_time_up
    }

    /// Start or resume the clock
    ///
    /// Returns `false` without changing anything for untimed sessions, for a
    /// clock with no time left, or if it is already running.
    pub fn start(&mut self) -> bool {
        if self.state.is_running || matches!(self.state.time_left, None | Some(0)) {
            return false;
        }

        let now = self.time.now_ms();
        self.reference_ms = Some(now - self.accumulated_ms);
        self.state.is_running = true;
        tracing::debug!(time_spent = self.state.time_spent, "Clock started");
        true
    }

    /// Recompute elapsed time; called by the 1 Hz driver
    pub fn tick(&mut self) -> ClockState {
        if self.state.is_running {
            let now = self.time.now_ms();
            self.recompute(now);
        }
        self.state
    }

    /// Fold the running interval into the accumulated base and stop
    ///
    /// No-op while not running.
    pub fn pause(&mut self) {
        self.halt("paused");
    }

    /// Halt ticking, keeping accumulated time (used on submission)
    pub fn stop(&mut self) {
        self.halt("stopped");
    }

    /// Discard all accumulated time and start over, not running
    pub fn reset(&mut self, new_limit: Option<u64>) {
        self.configure(new_limit, 0);
    }

    /// Returns `true` exactly once after the clock runs out
    pub fn take_time_up(&mut self) -> bool {
        std::mem::take(&mut self.time_up_pending)
    }

    fn halt(&mut self, reason: &str) {
        if !self.state.is_running {
            return;
        }

        let now = self.time.now_ms();
        self.recompute(now);

        // recompute may already have stopped the clock at time-up
        if self.state.is_running {
            self.state.is_running = false;
            self.reference_ms = None;
        }
        tracing::debug!(time_spent = self.state.time_spent, "Clock {}", reason);
    }

    fn recompute(&mut self, now: i64) {
        let Some(reference) = self.reference_ms else {
            return;
        };

        // A wall clock stepping backwards must not un-spend time
        let spent_ms = (now - reference).max(self.accumulated_ms);
        let mut time_spent = ((spent_ms / 1000) as u64).max(self.state.time_spent);

        if let Some(limit) = self.state.time_limit {
            time_spent = time_spent.min(limit);
            let time_left = limit - time_spent;
            self.state.time_left = Some(time_left);

            if time_left == 0 {
                self.state.time_spent = time_spent;
                self.accumulated_ms = (limit as i64).saturating_mul(1000);
                self.reference_ms = None;
                self.state.is_running = false;
                if !self.state.is_time_up {
                    self.state.is_time_up = true;
                    self.time_up_pending = true;
                    tracing::info!(limit, "Exam time is up");
                }
                return;
            }
        }

        self.state.time_spent = time_spent;
        self.accumulated_ms = spent_ms;
    }
}

impl std::fmt::Debug for ExamClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExamClock")
            .field("state", &self.state)
            .field("accumulated_ms", &self.accumulated_ms)
            .field("reference_ms", &self.reference_ms)
            .finish()
    }
}
