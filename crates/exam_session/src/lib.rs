//! Exam Session - offline-tolerant runtime for timed exams
//!
//! This crate keeps a long, timed, multi-question exam consistent with a
//! remote record while the network comes and goes:
//!
//! - `clock`: drift-free elapsed/remaining time that survives pause and reload
//! - `snapshot`: synchronous full-state snapshots in a local key/value store
//! - `progress`: change detection over the remote field subset and sync status
//! - `debounce`: cancel-and-reschedule scheduling of remote writes
//! - `queue`: durable offline queue with bounded retries
//! - `connectivity`: shared online/offline signal and reconnect hook
//! - `session`: navigation, answers, pins and submission phase
//! - `runtime`: `SessionRuntime`, tying the pieces together under one lock

mod clock;
mod config;
mod connectivity;
mod debounce;
mod error;
mod progress;
mod queue;
mod remote;
mod runtime;
mod session;
mod snapshot;
mod time;

pub use clock::*;
pub use config::*;
pub use connectivity::*;
pub use debounce::*;
pub use error::*;
pub use progress::*;
pub use queue::*;
pub use remote::*;
pub use runtime::*;
pub use session::*;
pub use snapshot::*;
pub use time::*;
