//! Session runtime.
//!
//! `SessionRuntime` owns one exam session: the clock, the answer state, the
//! change detector and the observable sync state, all behind a single mutex
//! that is never held across an await. Timer tasks (clock ticker, queue
//! recount, reconnect listener, debounced save) hold weak handles and stop
//! on [`SessionRuntime::teardown`].
//!
//! Every mutation is written to the local snapshot store synchronously.
//! Remote writes go through the debounced [`SessionRuntime::save_progress`];
//! anything that cannot be delivered is parked in the offline sync queue and
//! drained when connectivity returns.

use chrono::{DateTime, Utc};
use kv_store::KeyValueStore;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::clock::{ClockState, ExamClock};
use crate::config::RuntimeConfig;
use crate::connectivity::{register_background_sync, BackgroundSyncRegistrar, ConnectivityMonitor};
use crate::debounce::Debouncer;
use crate::error::SessionResult;
use crate::progress::{tracked_fields, ChangeDetector, PendingSync, SyncState};
use crate::queue::{suffixed_key, DrainReport, OfflineSyncQueue};
use crate::remote::{fields, RemotePatch, RemoteRecordService, RemoteSessionRecord, RemoteStatus};
use crate::session::{ExamSession, SessionPhase};
use crate::snapshot::{ExamProgressSnapshot, LocalSnapshotStore, PendingFinalSubmission};
use crate::time::{SystemTimeSource, TimeSource};

/// Queue key suffix for final submissions
pub const FINAL_SUFFIX: &str = "final";

/// Collaborators shared with the host application
pub struct RuntimeDeps<R> {
    pub kv: Arc<dyn KeyValueStore>,
    pub remote: Arc<R>,
    pub connectivity: ConnectivityMonitor,
    pub time: Arc<dyn TimeSource>,
    pub background_sync: Option<Arc<dyn BackgroundSyncRegistrar>>,
    /// Queue shared with other sessions; a private one is created if unset
    pub queue: Option<Arc<OfflineSyncQueue>>,
}

impl<R> RuntimeDeps<R> {
    pub fn new(kv: Arc<dyn KeyValueStore>, remote: Arc<R>, connectivity: ConnectivityMonitor) -> Self {
        Self {
            kv,
            remote,
            connectivity,
            time: Arc::new(SystemTimeSource),
            background_sync: None,
            queue: None,
        }
    }

    pub fn with_time(mut self, time: Arc<dyn TimeSource>) -> Self {
        self.time = time;
        self
    }

    pub fn with_background_sync(mut self, registrar: Arc<dyn BackgroundSyncRegistrar>) -> Self {
        self.background_sync = Some(registrar);
        self
    }

    pub fn with_queue(mut self, queue: Arc<OfflineSyncQueue>) -> Self {
        self.queue = Some(queue);
        self
    }
}

/// Parameters for opening a session
#[derive(Clone, Debug)]
pub struct OpenSession {
    pub session_id: String,
    pub user_id: String,
    pub question_count: u32,
    /// Seconds, `None` for untimed exams
    pub time_limit: Option<u64>,
    /// What the host already fetched from the remote store
    pub remote: RemoteSessionRecord,
}

impl OpenSession {
    pub fn new(session_id: impl Into<String>, user_id: impl Into<String>, question_count: u32) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: user_id.into(),
            question_count,
            time_limit: None,
            remote: RemoteSessionRecord::in_progress(),
        }
    }

    pub fn with_time_limit(mut self, seconds: u64) -> Self {
        self.time_limit = Some(seconds);
        self
    }

    pub fn with_remote(mut self, remote: RemoteSessionRecord) -> Self {
        self.remote = remote;
        self
    }
}

/// Result of a progress save
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Nothing changed since the last successful remote write
    Unchanged,
    /// The remote write succeeded
    Saved,
    /// Offline; the payload was queued
    Offline,
    /// The remote write failed; the payload was queued
    Failed,
    /// The session is not in progress or the runtime was torn down
    Skipped,
}

/// Result of a submission attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The remote record was finalized
    Confirmed,
    /// The finalize payload is waiting in the offline queue
    Queued,
    AlreadySubmitted,
    NotStarted,
    /// The runtime was torn down
    Detached,
}

/// Snapshot of everything a UI needs to render
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub session_id: String,
    pub phase: SessionPhase,
    pub question_count: u32,
    pub current_question_index: u32,
    pub answers: BTreeMap<u32, u32>,
    pub pinned: BTreeSet<u32>,
    pub clock: ClockState,
    pub sync: SyncState,
    pub pending_sync_count: usize,
    pub is_online: bool,
    pub has_pending_final: bool,
}

type TimeUpCallback = Arc<dyn Fn() + Send + Sync>;

struct Core {
    session: ExamSession,
    clock: ExamClock,
    detector: ChangeDetector,
    sync: SyncState,
    /// Last progress payload handed to the queue
    queued: Option<PendingSync>,
}

impl Core {
    fn snapshot(&self) -> ExamProgressSnapshot {
        self.session.snapshot(&self.clock.state())
    }

    /// Bring the clock up to date; returns whether time ran out
    fn refresh_clock(&mut self) -> bool {
        self.clock.tick();
        self.clock.take_time_up()
    }
}

struct RuntimeInner<R> {
    session_id: String,
    config: RuntimeConfig,
    remote: Arc<R>,
    snapshots: LocalSnapshotStore,
    queue: Arc<OfflineSyncQueue>,
    connectivity: ConnectivityMonitor,
    background_sync: Option<Arc<dyn BackgroundSyncRegistrar>>,
    time: Arc<dyn TimeSource>,
    core: Mutex<Core>,
    debouncer: Debouncer,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    on_time_up: Mutex<Option<TimeUpCallback>>,
    mounted: AtomicBool,
    torn_down: AtomicBool,
}

/// Handle to a running exam session
pub struct SessionRuntime<R> {
    inner: Arc<RuntimeInner<R>>,
}

impl<R> Clone for SessionRuntime<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: RemoteRecordService + 'static> SessionRuntime<R> {
    /// Open a session, restoring any local snapshot
    ///
    /// Fails only for a missing session or user id. No timers run until
    /// [`mount`](Self::mount).
    pub fn open(config: RuntimeConfig, deps: RuntimeDeps<R>, params: OpenSession) -> SessionResult<Self> {
        let mut session = ExamSession::new(&params.session_id, &params.user_id, params.question_count)?;
        let session_id = params.session_id.clone();

        let snapshots = LocalSnapshotStore::new(Arc::clone(&deps.kv), Arc::clone(&deps.time));
        let queue = deps.queue.unwrap_or_else(|| {
            Arc::new(
                OfflineSyncQueue::new(Arc::clone(&deps.kv), Arc::clone(&deps.time))
                    .with_max_retries(config.max_retries),
            )
        });

        let remote_completed = params.remote.status == RemoteStatus::Completed;
        let local = if remote_completed {
            // Remote is authoritative once finalized
            snapshots.clear(&session_id)?;
            queue.dequeue(&session_id);
            queue.dequeue(&final_key(&session_id));
            None
        } else {
            snapshots.load(&session_id)?
        };

        let time_spent = session.begin(&params.remote, local.as_ref());
        let clock = ExamClock::new(params.time_limit, time_spent, Arc::clone(&deps.time));

        let remote_known = ExamProgressSnapshot {
            answers: params.remote.answers.clone(),
            pinned: params.remote.pinned.clone(),
            time_spent: params.remote.time_spent,
            ..Default::default()
        };
        let detector = ChangeDetector::with_baseline(&remote_known);

        let mut core = Core {
            session,
            clock,
            detector,
            sync: SyncState::default(),
            queued: None,
        };
        if core.session.is_in_progress() && core.detector.is_dirty(&core.snapshot()) {
            core.sync.mark_dirty();
        }

        // An unconfirmed submission from a previous run goes back in the queue
        if core.session.is_submitted() && !remote_completed {
            if let Some(pending) = snapshots.load_final_pending(&session_id)? {
                let key = final_key(&session_id);
                if queue.get(&key).is_none() {
                    queue.enqueue(&key, pending.payload)?;
                }
                core.sync.mark_dirty();
            }
        }

        tracing::info!(
            session_id = %session_id,
            phase = ?core.session.phase(),
            time_spent,
            time_limit = ?params.time_limit,
            "Session runtime opened"
        );

        Ok(Self {
            inner: Arc::new(RuntimeInner {
                session_id,
                debouncer: Debouncer::new(config.debounce()),
                config,
                remote: deps.remote,
                snapshots,
                queue,
                connectivity: deps.connectivity,
                background_sync: deps.background_sync,
                time: deps.time,
                core: Mutex::new(core),
                tasks: Mutex::new(Vec::new()),
                on_time_up: Mutex::new(None),
                mounted: AtomicBool::new(false),
                torn_down: AtomicBool::new(false),
            }),
        })
    }

    // ========== Lifecycle ==========

    /// Start the clock and the background timers
    ///
    /// Must be called from within a tokio runtime. Returns `false` if the
    /// runtime was already mounted or torn down.
    pub fn mount(&self) -> bool {
        if self.is_torn_down() || self.inner.mounted.swap(true, Ordering::SeqCst) {
            return false;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("Cannot mount session runtime outside an async runtime");
            self.inner.mounted.store(false, Ordering::SeqCst);
            return false;
        };

        let already_up = {
            let mut core = self.core();
            if core.session.is_in_progress() {
                core.clock.start();
            }
            core.session.is_in_progress() && core.clock.is_time_up()
        };

        let mut tasks = Vec::with_capacity(4);

        let weak = self.downgrade();
        let tick_interval = self.inner.config.tick_interval();
        tasks.push(runtime.spawn(async move {
            let mut interval = tokio::time::interval(tick_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(rt) = Self::upgrade(&weak) else { break };
                rt.on_tick();
            }
        }));

        let weak = self.downgrade();
        let recount_interval = self.inner.config.queue_recount();
        tasks.push(runtime.spawn(async move {
            let mut interval = tokio::time::interval(recount_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(rt) = Self::upgrade(&weak) else { break };
                rt.inner.queue.recount();
            }
        }));

        let weak = self.downgrade();
        tasks.push(self.inner.connectivity.on_reconnect(move || {
            let weak = weak.clone();
            async move {
                if let Some(rt) = Self::upgrade(&weak) {
                    rt.handle_reconnect().await;
                }
            }
        }));

        if self.inner.connectivity.is_online() {
            let rt = self.clone();
            tasks.push(runtime.spawn(async move {
                rt.drain_queue().await;
            }));
        }

        self.lock_tasks().extend(tasks);
        tracing::info!(session_id = %self.inner.session_id, "Session runtime mounted");

        if already_up {
            self.dispatch_time_up();
        }
        true
    }

    /// Stop every timer and listener
    ///
    /// The clock is paused and a final local snapshot written. Remote calls
    /// already in flight complete, but their results are discarded.
    pub fn teardown(&self) {
        if self.inner.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }

        self.inner.debouncer.cancel();
        for task in self.lock_tasks().drain(..) {
            task.abort();
        }

        let mut core = self.core();
        core.clock.pause();
        // A time-up latched here has no one left to act on it
        core.clock.take_time_up();
        self.save_local(&core);
        tracing::info!(session_id = %self.inner.session_id, "Session runtime torn down");
    }

    pub fn is_torn_down(&self) -> bool {
        self.inner.torn_down.load(Ordering::SeqCst)
    }

    /// Final synchronous local save when the host page goes away
    pub fn on_unload(&self) {
        let mut core = self.core();
        core.clock.tick();
        self.save_local(&core);
        tracing::debug!(session_id = %self.inner.session_id, "Saved snapshot on unload");
    }

    /// Register a callback invoked once when the clock runs out
    pub fn on_time_up(&self, callback: impl Fn() + Send + Sync + 'static) {
        *self
            .inner
            .on_time_up
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callback));
    }

    // ========== Answer & Navigation ==========

    pub fn select_answer(&self, question: u32, option: u32) -> bool {
        self.mutate(true, |session| session.select_answer(question, option))
    }

    pub fn clear_answer(&self, question: u32) -> bool {
        self.mutate(true, |session| session.clear_answer(question))
    }

    pub fn toggle_pin(&self, question: u32) -> bool {
        self.mutate(true, |session| session.toggle_pin(question))
    }

    pub fn go_to(&self, question: u32) -> bool {
        self.mutate(false, |session| session.go_to(question))
    }

    pub fn next(&self) -> bool {
        self.mutate(false, ExamSession::next)
    }

    pub fn previous(&self) -> bool {
        self.mutate(false, ExamSession::previous)
    }

    fn mutate(&self, remote_relevant: bool, f: impl FnOnce(&mut ExamSession) -> bool) -> bool {
        if self.is_torn_down() {
            return false;
        }

        {
            let mut core = self.core();
            if !f(&mut core.session) {
                return false;
            }
            self.save_local(&core);
            if remote_relevant {
                core.sync.mark_dirty();
            }
        }

        if remote_relevant {
            self.schedule_save();
        }
        true
    }

    fn schedule_save(&self) {
        let weak = self.downgrade();
        self.inner.debouncer.schedule(move || async move {
            if let Some(rt) = Self::upgrade(&weak) {
                rt.save_progress(false).await;
            }
        });
    }

    // ========== Clock ==========

    pub fn pause_clock(&self) {
        let fired = {
            let mut core = self.core();
            core.clock.pause();
            self.save_local(&core);
            core.clock.take_time_up()
        };
        if fired {
            self.dispatch_time_up();
        }
    }

    /// Resume the clock; returns whether it started
    pub fn resume_clock(&self) -> bool {
        if self.is_torn_down() {
            return false;
        }
        let mut core = self.core();
        core.session.is_in_progress() && core.clock.start()
    }

    fn on_tick(&self) {
        if self.is_torn_down() {
            return;
        }
        let fired = self.core().refresh_clock();
        if fired {
            self.dispatch_time_up();
        }
    }

    fn dispatch_time_up(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("Time-up reached outside an async runtime");
            return;
        };
        let weak = self.downgrade();
        runtime.spawn(async move {
            if let Some(rt) = Self::upgrade(&weak) {
                rt.handle_time_up().await;
            }
        });
    }

    async fn handle_time_up(&self) {
        if self.is_torn_down() {
            return;
        }
        tracing::info!(session_id = %self.inner.session_id, "Exam time expired");

        let callback = self
            .inner
            .on_time_up
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(callback) = callback {
            callback();
        }

        if self.inner.config.auto_submit_on_time_up {
            self.submit().await;
        }
    }

    // ========== Sync ==========

    /// Write changed progress to the remote record
    ///
    /// The local snapshot is always written first. Offline or failed writes
    /// go to the offline queue; nothing is retried synchronously.
    pub async fn save_progress(&self, force: bool) -> SaveOutcome {
        if self.is_torn_down() {
            return SaveOutcome::Skipped;
        }

        let (pending, sent, started_at, fired) = {
            let mut core = self.core();
            if !core.session.is_in_progress() {
                return SaveOutcome::Skipped;
            }
            let fired = core.refresh_clock();
            let snapshot = core.snapshot();

            let Some(pending) = core.detector.pending(&snapshot, force) else {
                drop(core);
                if fired {
                    self.dispatch_time_up();
                }
                return SaveOutcome::Unchanged;
            };
            self.save_local(&core);

            if !self.inner.connectivity.is_online() {
                core.sync.mark_offline();
                self.enqueue_progress(&mut core, pending);
                drop(core);
                if fired {
                    self.dispatch_time_up();
                }
                tracing::debug!(session_id = %self.inner.session_id, "Offline, progress queued");
                return SaveOutcome::Offline;
            }

            core.sync.mark_syncing();
            (pending, snapshot, self.inner.time.now(), fired)
        };
        if fired {
            self.dispatch_time_up();
        }

        let result = self
            .inner
            .remote
            .update(&self.inner.session_id, &pending.patch)
            .await;

        if self.is_torn_down() {
            return SaveOutcome::Skipped;
        }

        let mut core = self.core();
        if !core.session.is_in_progress() {
            // Submitted while in flight; the finalize payload carries every field
            return match result {
                Ok(()) => SaveOutcome::Saved,
                Err(_) => SaveOutcome::Skipped,
            };
        }
        match result {
            Ok(()) => {
                core.detector.mark_synced(&pending);
                let mut current = core.snapshot();
                current.time_spent = sent.time_spent;
                let still_dirty = core.detector.is_dirty(&current);
                core.sync.mark_success(self.inner.time.now(), still_dirty);

                if self.inner.queue.dequeue_stale(&self.inner.session_id, started_at) {
                    core.queued = None;
                }
                tracing::debug!(
                    session_id = %self.inner.session_id,
                    fields = ?pending.patch.field_names(),
                    "Progress saved"
                );
                SaveOutcome::Saved
            }
            Err(e) => {
                if e.is_rejection() {
                    tracing::warn!(session_id = %self.inner.session_id, "Progress write rejected: {}", e);
                } else {
                    tracing::debug!(session_id = %self.inner.session_id, "Progress write failed: {}", e);
                }
                core.sync.mark_error();
                self.enqueue_progress(&mut core, pending);
                SaveOutcome::Failed
            }
        }
    }

    fn enqueue_progress(&self, core: &mut Core, pending: PendingSync) {
        match self.inner.queue.enqueue(&self.inner.session_id, pending.patch.clone()) {
            Ok(true) => core.queued = Some(pending),
            Ok(false) => {}
            Err(e) => tracing::warn!("Failed to queue progress: {}", e),
        }
    }

    /// Deliver queued writes; no-op while offline
    pub async fn drain_queue(&self) -> DrainReport {
        if !self.inner.connectivity.is_online() {
            tracing::debug!("Skipping queue drain while offline");
            return DrainReport::default();
        }

        let report = self.inner.queue.drain(self.inner.remote.as_ref()).await;
        if self.is_torn_down() {
            return report;
        }

        let session_key = &self.inner.session_id;
        let final_entry = final_key(session_key);
        let now = self.inner.time.now();
        let mut core = self.core();

        if report.delivered.contains(&final_entry) {
            self.clear_final_pending();
            core.queued = None;
            core.sync.mark_success(now, false);
            tracing::info!(session_id = %session_key, "Queued submission confirmed");
        } else if report.delivered.contains(session_key) && self.inner.queue.get(session_key).is_none() {
            if let Some(queued) = core.queued.take() {
                core.detector.mark_synced(&queued);
            }
            let still_dirty = core.session.is_in_progress() && core.detector.is_dirty(&core.snapshot());
            core.sync.mark_success(now, still_dirty);
        } else if report.abandoned.contains(session_key) || report.abandoned.contains(&final_entry) {
            core.queued = None;
            core.sync.mark_error();
        }

        report
    }

    async fn handle_reconnect(&self) {
        if self.is_torn_down() {
            return;
        }
        tracing::info!(session_id = %self.inner.session_id, "Back online, draining queue");
        self.drain_queue().await;
        register_background_sync(self.inner.background_sync.as_deref());
    }

    // ========== Submission ==========

    /// Finalize the session
    ///
    /// Idempotent: only the first call stops the clock and sends the
    /// finalize payload. The payload is persisted locally before the remote
    /// write and queued if that write cannot complete.
    pub async fn submit(&self) -> SubmitOutcome {
        if self.is_torn_down() {
            return SubmitOutcome::Detached;
        }

        let payload = {
            let mut core = self.core();
            match core.session.phase() {
                SessionPhase::Submitted => return SubmitOutcome::AlreadySubmitted,
                SessionPhase::NotStarted => return SubmitOutcome::NotStarted,
                SessionPhase::InProgress => {}
            }
            core.session.mark_submitted();
            core.clock.stop();
            core.clock.take_time_up();
            self.inner.debouncer.cancel_pending();

            let snapshot = core.snapshot();
            let payload = finalize_payload(&snapshot, self.inner.time.now());
            self.save_final_pending(&payload);
            self.save_local(&core);

            // The finalize payload covers every progress field
            self.inner.queue.dequeue(&self.inner.session_id);
            core.queued = None;

            tracing::info!(
                session_id = %self.inner.session_id,
                answered = core.session.answered_count(),
                time_spent = snapshot.time_spent,
                "Submitting session"
            );

            if !self.inner.connectivity.is_online() {
                core.sync.mark_offline();
                self.enqueue_final(&payload);
                return SubmitOutcome::Queued;
            }
            core.sync.mark_syncing();
            payload
        };

        self.send_final(payload).await
    }

    /// Finalize payload persisted by an unconfirmed submission
    pub fn pending_final_submission(&self) -> Option<PendingFinalSubmission> {
        self.inner
            .snapshots
            .load_final_pending(&self.inner.session_id)
            .ok()
            .flatten()
    }

    /// Send a persisted finalize payload again
    ///
    /// Returns `None` when no submission is pending.
    pub async fn retry_final_submission(&self) -> Option<SubmitOutcome> {
        if self.is_torn_down() {
            return Some(SubmitOutcome::Detached);
        }
        let pending = self.pending_final_submission()?;

        if !self.inner.connectivity.is_online() {
            self.enqueue_final(&pending.payload);
            self.core().sync.mark_offline();
            return Some(SubmitOutcome::Queued);
        }
        self.core().sync.mark_syncing();
        Some(self.send_final(pending.payload).await)
    }

    async fn send_final(&self, payload: RemotePatch) -> SubmitOutcome {
        let result = self.inner.remote.update(&self.inner.session_id, &payload).await;
        if self.is_torn_down() {
            return SubmitOutcome::Detached;
        }

        let mut core = self.core();
        match result {
            Ok(()) => {
                self.clear_final_pending();
                self.inner.queue.dequeue(&final_key(&self.inner.session_id));
                core.sync.mark_success(self.inner.time.now(), false);
                tracing::info!(session_id = %self.inner.session_id, "Submission confirmed");
                SubmitOutcome::Confirmed
            }
            Err(e) => {
                tracing::warn!(session_id = %self.inner.session_id, "Submission failed, queued: {}", e);
                core.sync.mark_error();
                self.enqueue_final(&payload);
                SubmitOutcome::Queued
            }
        }
    }

    fn enqueue_final(&self, payload: &RemotePatch) {
        if let Err(e) = self
            .inner
            .queue
            .enqueue(&final_key(&self.inner.session_id), payload.clone())
        {
            tracing::warn!("Failed to queue submission: {}", e);
        }
    }

    // ========== State ==========

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn phase(&self) -> SessionPhase {
        self.core().session.phase()
    }

    pub fn clock_state(&self) -> ClockState {
        self.core().clock.state()
    }

    pub fn sync_state(&self) -> SyncState {
        self.core().sync.clone()
    }

    pub fn pending_sync_count(&self) -> usize {
        self.inner.queue.pending_count()
    }

    /// Current full snapshot, as it would be written locally
    pub fn snapshot(&self) -> ExamProgressSnapshot {
        self.core().snapshot()
    }

    pub fn queue(&self) -> &Arc<OfflineSyncQueue> {
        &self.inner.queue
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.inner.connectivity
    }

    pub fn view(&self) -> SessionView {
        let has_pending_final = self.pending_final_submission().is_some();
        let core = self.core();
        SessionView {
            session_id: self.inner.session_id.clone(),
            phase: core.session.phase(),
            question_count: core.session.question_count(),
            current_question_index: core.session.current_question_index(),
            answers: core.session.answers().clone(),
            pinned: core.session.pinned().clone(),
            clock: core.clock.state(),
            sync: core.sync.clone(),
            pending_sync_count: self.inner.queue.pending_count(),
            is_online: self.inner.connectivity.is_online(),
            has_pending_final,
        }
    }

    // ========== Helpers ==========

    fn core(&self) -> MutexGuard<'_, Core> {
        self.inner.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.inner.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn downgrade(&self) -> Weak<RuntimeInner<R>> {
        Arc::downgrade(&self.inner)
    }

    fn upgrade(weak: &Weak<RuntimeInner<R>>) -> Option<Self> {
        let inner = weak.upgrade()?;
        if inner.torn_down.load(Ordering::SeqCst) {
            return None;
        }
        Some(Self { inner })
    }

    fn save_local(&self, core: &Core) {
        if let Err(e) = self.inner.snapshots.save(&self.inner.session_id, &core.snapshot()) {
            tracing::warn!("Local snapshot skipped: {}", e);
        }
    }

    fn save_final_pending(&self, payload: &RemotePatch) {
        if let Err(e) = self.inner.snapshots.save_final_pending(&self.inner.session_id, payload) {
            tracing::warn!("Pending submission not recorded: {}", e);
        }
    }

    fn clear_final_pending(&self) {
        if let Err(e) = self.inner.snapshots.clear_final_pending(&self.inner.session_id) {
            tracing::warn!("Pending submission not cleared: {}", e);
        }
    }
}

/// Queue key for the final submission of `session_id`
pub fn final_key(session_id: &str) -> String {
    suffixed_key(session_id, FINAL_SUFFIX)
}

/// Remote fields written when a session is finalized
pub fn finalize_payload(snapshot: &ExamProgressSnapshot, completed_at: DateTime<Utc>) -> RemotePatch {
    let mut patch = RemotePatch::new()
        .with(fields::STATUS, RemoteStatus::Completed.as_str())
        .with(fields::COMPLETED_AT, completed_at.to_rfc3339());
    for (field, value) in tracked_fields(snapshot) {
        patch.insert(field, value);
    }
    patch
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{RemoteError, SessionError};
    use crate::progress::SyncStatus;
    use crate::remote::MemoryRemoteStore;
    use crate::time::ManualTimeSource;
    use kv_store::MemoryKvStore;
    use serde_json::json;

    struct Fixture {
        kv: Arc<MemoryKvStore>,
        remote: Arc<MemoryRemoteStore>,
        connectivity: ConnectivityMonitor,
        time: Arc<ManualTimeSource>,
    }

    impl Fixture {
        fn new(online: bool) -> Self {
            Self {
                kv: Arc::new(MemoryKvStore::new()),
                remote: Arc::new(MemoryRemoteStore::new()),
                connectivity: ConnectivityMonitor::new(online),
                time: Arc::new(ManualTimeSource::default()),
            }
        }

        fn deps(&self) -> RuntimeDeps<MemoryRemoteStore> {
            RuntimeDeps::new(self.kv.clone(), self.remote.clone(), self.connectivity.clone())
                .with_time(self.time.clone())
        }

        fn open(&self, params: OpenSession) -> SessionRuntime<MemoryRemoteStore> {
            SessionRuntime::open(RuntimeConfig::default(), self.deps(), params).unwrap()
        }
    }

    fn params() -> OpenSession {
        OpenSession::new("exam-1", "user-1", 5).with_time_limit(600)
    }

    #[test]
    fn test_open_requires_ids() {
        let fx = Fixture::new(true);
        let err = SessionRuntime::open(RuntimeConfig::default(), fx.deps(), OpenSession::new("", "u", 3));
        assert_eq!(err.err(), Some(SessionError::MissingSessionId));

        let err = SessionRuntime::open(RuntimeConfig::default(), fx.deps(), OpenSession::new("s", "", 3));
        assert_eq!(err.err(), Some(SessionError::MissingUserId));
    }

    #[test]
    fn test_mutation_writes_local_snapshot() {
        let fx = Fixture::new(true);
        let rt = fx.open(params());

        assert!(rt.select_answer(2, 1));
        let raw = fx.kv.get("session-state:exam-1").unwrap().unwrap();
        let stored: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(stored["answers"]["2"], 1);
        assert!(rt.sync_state().has_unsaved_changes);
    }

    #[test]
    fn test_navigation_does_not_mark_dirty() {
        let fx = Fixture::new(true);
        let rt = fx.open(params());

        assert!(rt.next());
        assert_eq!(rt.view().current_question_index, 1);
        assert!(!rt.sync_state().has_unsaved_changes);
    }

    #[tokio::test]
    async fn test_save_progress_unchanged_short_circuits() {
        let fx = Fixture::new(true);
        let rt = fx.open(params());

        assert_eq!(rt.save_progress(false).await, SaveOutcome::Unchanged);
        assert_eq!(fx.remote.attempt_count(), 0);
        assert!(fx.kv.get("session-state:exam-1").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_progress_sends_changed_fields() {
        let fx = Fixture::new(true);
        let rt = fx.open(params());
        rt.select_answer(0, 3);

        assert_eq!(rt.save_progress(false).await, SaveOutcome::Saved);
        let sent = fx.remote.attempts_for("exam-1");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].field_names(), vec!["answers"]);
        assert_eq!(sent[0].get("answers"), Some(&json!({"0": 3})));

        let sync = rt.sync_state();
        assert_eq!(sync.status, SyncStatus::Success);
        assert_eq!(sync.last_saved, Some(fx.time.now()));
        assert!(!sync.has_unsaved_changes);

        assert_eq!(rt.save_progress(false).await, SaveOutcome::Unchanged);
    }

    #[tokio::test]
    async fn test_failed_save_is_queued() {
        let fx = Fixture::new(true);
        fx.remote.fail_next(1, RemoteError::Transport("timeout".into()));
        let rt = fx.open(params());
        rt.toggle_pin(4);

        assert_eq!(rt.save_progress(false).await, SaveOutcome::Failed);
        assert_eq!(rt.sync_state().status, SyncStatus::Error);
        assert!(rt.sync_state().has_unsaved_changes);
        assert_eq!(rt.pending_sync_count(), 1);

        let report = rt.drain_queue().await;
        assert_eq!(report.delivered, vec!["exam-1".to_string()]);
        let sync = rt.sync_state();
        assert_eq!(sync.status, SyncStatus::Success);
        assert!(!sync.has_unsaved_changes);
        assert_eq!(rt.save_progress(false).await, SaveOutcome::Unchanged);
    }

    #[tokio::test]
    async fn test_success_drops_older_queued_payload() {
        let fx = Fixture::new(false);
        let rt = fx.open(params());
        rt.select_answer(0, 1);
        assert_eq!(rt.save_progress(false).await, SaveOutcome::Offline);

        fx.connectivity.set_online(true);
        fx.time.advance_ms(1_000);
        rt.select_answer(0, 2);
        assert_eq!(rt.save_progress(false).await, SaveOutcome::Saved);

        // The stale offline payload must not be replayed
        assert_eq!(rt.pending_sync_count(), 0);
        assert_eq!(rt.drain_queue().await.attempted(), 0);
        let record = fx.remote.record("exam-1").unwrap();
        assert_eq!(record.get("answers"), Some(&json!({"0": 2})));
    }

    #[tokio::test]
    async fn test_submit_is_idempotent() {
        let fx = Fixture::new(true);
        let rt = fx.open(params());
        rt.select_answer(1, 1);

        assert_eq!(rt.submit().await, SubmitOutcome::Confirmed);
        assert_eq!(rt.submit().await, SubmitOutcome::AlreadySubmitted);
        assert_eq!(fx.remote.attempt_count(), 1);

        let record = fx.remote.record("exam-1").unwrap();
        assert_eq!(record.get("status"), Some(&json!("completed")));
        assert!(record.contains("completedAt"));
        assert!(rt.pending_final_submission().is_none());

        // Terminal: mutations are ignored
        assert!(!rt.select_answer(1, 2));
        assert_eq!(rt.save_progress(true).await, SaveOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_offline_submit_persists_pending_final() {
        let fx = Fixture::new(false);
        let rt = fx.open(params());
        rt.select_answer(0, 0);

        assert_eq!(rt.submit().await, SubmitOutcome::Queued);
        assert!(rt.pending_final_submission().is_some());
        assert!(rt.view().has_pending_final);
        assert!(rt.queue().get("exam-1#final").is_some());

        fx.connectivity.set_online(true);
        let report = rt.drain_queue().await;
        assert_eq!(report.delivered, vec!["exam-1#final".to_string()]);
        assert!(rt.pending_final_submission().is_none());
        assert_eq!(rt.sync_state().status, SyncStatus::Success);
    }

    #[tokio::test]
    async fn test_retry_final_submission() {
        let fx = Fixture::new(true);
        fx.remote.fail_next(1, RemoteError::Rejected("busy".into()));
        let rt = fx.open(params());

        assert_eq!(rt.submit().await, SubmitOutcome::Queued);
        assert_eq!(rt.retry_final_submission().await, Some(SubmitOutcome::Confirmed));
        assert_eq!(rt.retry_final_submission().await, None);
        assert_eq!(rt.pending_sync_count(), 0);
    }

    #[tokio::test]
    async fn test_reopen_after_completed_remote_clears_local() {
        let fx = Fixture::new(true);
        {
            let rt = fx.open(params());
            rt.select_answer(0, 1);
        }
        assert!(fx.kv.contains("session-state:exam-1").unwrap());

        let completed = RemoteSessionRecord {
            status: RemoteStatus::Completed,
            ..Default::default()
        };
        let rt = fx.open(params().with_remote(completed));
        assert_eq!(rt.phase(), SessionPhase::Submitted);
        assert!(!fx.kv.contains("session-state:exam-1").unwrap());
        assert_eq!(rt.submit().await, SubmitOutcome::AlreadySubmitted);
    }

    #[test]
    fn test_pause_and_resume_clock() {
        let fx = Fixture::new(true);
        let rt = fx.open(params());

        assert!(rt.resume_clock());
        fx.time.advance_ms(10_000);
        rt.pause_clock();
        assert_eq!(rt.clock_state().time_spent, 10);
        assert!(!rt.clock_state().is_running);

        fx.time.advance_ms(60_000);
        assert!(rt.resume_clock());
        fx.time.advance_ms(5_000);
        rt.pause_clock();
        assert_eq!(rt.clock_state().time_spent, 15);
    }

    #[test]
    fn test_teardown_saves_and_detaches() {
        let fx = Fixture::new(true);
        let rt = fx.open(params());
        rt.resume_clock();
        fx.time.advance_ms(3_000);

        rt.teardown();
        assert!(rt.is_torn_down());
        assert!(!rt.select_answer(0, 0));
        assert!(!rt.resume_clock());

        let raw = fx.kv.get("session-state:exam-1").unwrap().unwrap();
        let stored: ExamProgressSnapshot = serde_json::from_str(&raw).unwrap();
        assert_eq!(stored.time_spent, 3);
    }

    #[test]
    fn test_finalize_payload_fields() {
        let snapshot = ExamProgressSnapshot {
            answers: BTreeMap::from([(0, 1)]),
            time_spent: 30,
            ..Default::default()
        };
        let payload = finalize_payload(&snapshot, Utc::now());
        assert_eq!(
            payload.field_names(),
            vec!["answers", "completedAt", "pinned", "status", "timeSpent"]
        );
    }
}
