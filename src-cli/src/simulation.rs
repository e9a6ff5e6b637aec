//! Scripted exam session
//!
//! Answers every question in order, optionally dropping the network for a
//! range of questions, then forces a save, drains the queue and submits.

use anyhow::Context;
use exam_session::{
    ConnectivityMonitor, MemoryRemoteStore, OpenSession, RemoteError, RemotePatch, RuntimeConfig,
    RuntimeDeps, SessionPhase, SessionRuntime, SessionView, SubmitOutcome, TokioTimeSource,
};
use kv_store::KeyValueStore;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// What the simulated user does
#[derive(Debug, Clone)]
pub struct Scenario {
    pub session_id: String,
    pub user_id: String,
    pub questions: u32,
    pub time_limit: Option<u64>,
    pub step: Duration,
    /// Question range `[from, to)` answered while offline
    pub offline: Option<(u32, u32)>,
    pub fail_writes: usize,
    pub latency: Duration,
    pub submit: bool,
}

/// Final state printed by the simulator
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationReport {
    pub session_id: String,
    pub restored_answers: usize,
    pub submit_outcome: Option<String>,
    pub view: SessionView,
    pub remote_record: Option<RemotePatch>,
    pub remote_attempts: usize,
    /// Keys left in the local store after the run
    pub store_keys: Vec<String>,
}

pub async fn run(
    config: RuntimeConfig,
    kv: Arc<dyn KeyValueStore>,
    scenario: Scenario,
) -> anyhow::Result<SimulationReport> {
    let remote = Arc::new(MemoryRemoteStore::with_latency(scenario.latency));
    if scenario.fail_writes > 0 {
        remote.fail_next(
            scenario.fail_writes,
            RemoteError::Transport("simulated outage".to_string()),
        );
    }

    let connectivity = ConnectivityMonitor::new(true);
    let deps = RuntimeDeps::new(Arc::clone(&kv), Arc::clone(&remote), connectivity.clone())
        .with_time(Arc::new(TokioTimeSource::new()));

    let mut params = OpenSession::new(&scenario.session_id, &scenario.user_id, scenario.questions);
    if let Some(limit) = scenario.time_limit {
        params = params.with_time_limit(limit);
    }

    let max_retries = config.max_retries;
    let rt = SessionRuntime::open(config, deps, params).context("Failed to open session")?;
    rt.on_time_up(|| tracing::warn!("Time is up, submitting automatically"));

    let restored_answers = rt.view().answers.len();
    if restored_answers > 0 {
        tracing::info!("Restored {} answers from local snapshot", restored_answers);
    }
    rt.mount();

    for question in 0..scenario.questions {
        if let Some((from, to)) = scenario.offline {
            if question == from {
                connectivity.set_online(false);
            }
            if question == to {
                connectivity.set_online(true);
            }
        }

        rt.go_to(question);
        rt.select_answer(question, question % 4);
        if question % 3 == 2 {
            rt.toggle_pin(question);
        }
        tokio::time::sleep(scenario.step).await;

        if rt.phase() == SessionPhase::Submitted {
            tracing::info!("Session ended at question {}", question);
            break;
        }
    }

    connectivity.set_online(true);
    rt.save_progress(true).await;
    rt.drain_queue().await;

    let outcome = if scenario.submit {
        Some(rt.submit().await)
    } else {
        rt.on_unload();
        None
    };

    for _ in 0..max_retries {
        if rt.pending_sync_count() == 0 {
            break;
        }
        rt.drain_queue().await;
    }
    if outcome == Some(SubmitOutcome::Queued) && rt.pending_final_submission().is_some() {
        tracing::warn!("Submission still unconfirmed; it will be retried on the next run");
    }

    let view = rt.view();
    rt.teardown();
    let store_keys = kv.keys().context("Failed to list local store")?;

    Ok(SimulationReport {
        session_id: scenario.session_id.clone(),
        restored_answers,
        submit_outcome: outcome.map(|o| format!("{:?}", o)),
        view,
        remote_record: remote.record(&scenario.session_id),
        remote_attempts: remote.attempt_count(),
        store_keys,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use kv_store::MemoryKvStore;
    use serde_json::json;

    fn scenario() -> Scenario {
        Scenario {
            session_id: "sim-1".to_string(),
            user_id: "user".to_string(),
            questions: 4,
            time_limit: Some(600),
            step: Duration::from_millis(10),
            offline: Some((1, 3)),
            fail_writes: 1,
            latency: Duration::from_millis(5),
            submit: true,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_scenario_submits_through_outage() {
        let config = RuntimeConfig::default().with_debounce_ms(100);
        let report = run(config, Arc::new(MemoryKvStore::new()), scenario())
            .await
            .unwrap();

        assert_eq!(report.view.phase, SessionPhase::Submitted);
        assert_eq!(report.view.answers.len(), 4);
        assert_eq!(report.view.pending_sync_count, 0);
        assert_eq!(report.submit_outcome.as_deref(), Some("Confirmed"));

        let record = report.remote_record.unwrap();
        assert_eq!(record.get("status"), Some(&json!("completed")));
        // Queue and pending submission are cleaned up
        assert_eq!(report.store_keys, vec!["session-state:sim-1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubmitted_session_is_restored() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKvStore::new());
        let first = Scenario {
            submit: false,
            fail_writes: 0,
            offline: None,
            ..scenario()
        };
        run(RuntimeConfig::default(), Arc::clone(&kv), first.clone())
            .await
            .unwrap();

        let report = run(RuntimeConfig::default(), kv, first).await.unwrap();
        assert_eq!(report.restored_answers, 4);
        assert_eq!(report.view.phase, SessionPhase::InProgress);
        assert_eq!(report.store_keys, vec!["session-state:sim-1".to_string()]);
    }
}
