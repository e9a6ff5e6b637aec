//! Wall-clock sources.
//!
//! The clock engine and the persistence layer never call `Utc::now()`
//! directly; they read a `TimeSource` so tests can drive time explicitly.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, Ordering};

/// Source of the current wall-clock time
pub trait TimeSource: Send + Sync {
    /// Current time
    fn now(&self) -> DateTime<Utc>;

    /// Current time as milliseconds since the Unix epoch
    fn now_ms(&self) -> i64 {
        self.now().timestamp_millis()
    }
}

/// System wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for deterministic tests and simulations
#[derive(Debug)]
pub struct ManualTimeSource {
    now_ms: AtomicI64,
}

impl ManualTimeSource {
    /// Create a source frozen at `start_ms` milliseconds since the epoch
    pub fn new(start_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(start_ms),
        }
    }

    /// Move time forward by `ms` milliseconds
    pub fn advance_ms(&self, ms: i64) {
        self.now_ms.fetch_add(ms, Ordering::SeqCst);
    }

    /// Jump to an absolute time
    pub fn set_ms(&self, ms: i64) {
        self.now_ms.store(ms, Ordering::SeqCst);
    }
}

impl Default for ManualTimeSource {
    fn default() -> Self {
        // 2024-01-01T00:00:00Z
        Self::new(1_704_067_200_000)
    }
}

impl TimeSource for ManualTimeSource {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.now_ms()).unwrap_or_default()
    }

    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// Wall clock that follows the tokio timer
///
/// Anchored to the system time at creation and advanced by
/// `tokio::time::Instant`, so a paused tokio runtime (`start_paused`) moves
/// the session clock and the tick timers together.
#[derive(Debug)]
pub struct TokioTimeSource {
    anchor_ms: i64,
    started: tokio::time::Instant,
}

impl TokioTimeSource {
    /// Anchor to the current system time
    pub fn new() -> Self {
        Self::anchored_at(Utc::now().timestamp_millis())
    }

    /// Anchor to an explicit wall-clock time
    pub fn anchored_at(anchor_ms: i64) -> Self {
        Self {
            anchor_ms,
            started: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioTimeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for TokioTimeSource {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.now_ms()).unwrap_or_default()
    }

    fn now_ms(&self) -> i64 {
        self.anchor_ms + self.started.elapsed().as_millis() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_time_source() {
        let source = ManualTimeSource::new(1_000);
        assert_eq!(source.now_ms(), 1_000);

        source.advance_ms(2_500);
        assert_eq!(source.now_ms(), 3_500);
        assert_eq!(source.now().timestamp_millis(), 3_500);

        source.set_ms(10);
        assert_eq!(source.now_ms(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_time_source_follows_paused_clock() {
        let source = TokioTimeSource::anchored_at(5_000);
        assert_eq!(source.now_ms(), 5_000);

        tokio::time::advance(std::time::Duration::from_millis(1_500)).await;
        assert_eq!(source.now_ms(), 6_500);
    }
}
