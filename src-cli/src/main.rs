//! Exam Sim - drives a scripted exam session end to end
//!
//! Persists to a directory on disk and talks to an in-process remote store
//! that can be told to fail, so offline queueing, retries and restarts can
//! be observed from the logs.
//!
//! Usage:
//!   exam-sim --data-dir ./exam-data --questions 12 --offline-from 4 --offline-to 8
//!
//! Run twice with the same `--session-id` and `--no-submit` to see a session
//! restored from its local snapshot.

mod simulation;

use anyhow::Context;
use clap::Parser;
use exam_session::RuntimeConfig;
use kv_store::FileKvStore;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use simulation::Scenario;

#[derive(Parser, Debug)]
#[command(name = "exam-sim")]
#[command(about = "Simulate an offline-tolerant exam session")]
#[command(version)]
struct Args {
    /// Directory for local snapshots and the offline queue
    #[arg(long, env = "EXAM_SIM_DATA_DIR", default_value = "exam-data")]
    data_dir: PathBuf,

    /// Runtime config file (JSON); defaults apply when missing
    #[arg(long, env = "EXAM_SIM_CONFIG")]
    config: Option<PathBuf>,

    /// Session to open (a new id is generated if omitted)
    #[arg(long)]
    session_id: Option<String>,

    #[arg(long, default_value = "sim-user")]
    user_id: String,

    #[arg(long, default_value_t = 10)]
    questions: u32,

    /// Time limit in seconds; untimed if omitted
    #[arg(long)]
    time_limit: Option<u64>,

    /// Delay between simulated user actions in milliseconds
    #[arg(long, default_value_t = 250)]
    step_ms: u64,

    /// Override the debounce window in milliseconds
    #[arg(long)]
    debounce_ms: Option<u64>,

    /// Question index at which the network drops
    #[arg(long)]
    offline_from: Option<u32>,

    /// Question index at which the network returns
    #[arg(long)]
    offline_to: Option<u32>,

    /// Number of remote writes to fail before succeeding
    #[arg(long, default_value_t = 0)]
    fail_writes: usize,

    /// Simulated remote latency in milliseconds
    #[arg(long, default_value_t = 50)]
    latency_ms: u64,

    /// Leave the session open instead of submitting
    #[arg(long)]
    no_submit: bool,

    /// Write the effective runtime config to this file and continue
    #[arg(long)]
    save_config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => RuntimeConfig::load_sync(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => RuntimeConfig::default(),
    };
    if let Some(ms) = args.debounce_ms {
        config = config.with_debounce_ms(ms);
    }
    if let Some(path) = &args.save_config {
        config
            .save_sync(path)
            .with_context(|| format!("Failed to save config to {}", path.display()))?;
        tracing::info!("Wrote runtime config to {}", path.display());
    }

    let kv = Arc::new(
        FileKvStore::new(&args.data_dir)
            .with_context(|| format!("Failed to open data directory {}", args.data_dir.display()))?,
    );

    let session_id = args
        .session_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    tracing::info!(
        "Starting exam simulation {} ({} questions, data in {})",
        session_id,
        args.questions,
        args.data_dir.display()
    );

    let scenario = Scenario {
        session_id,
        user_id: args.user_id,
        questions: args.questions,
        time_limit: args.time_limit,
        step: std::time::Duration::from_millis(args.step_ms),
        offline: args.offline_from.zip(args.offline_to),
        fail_writes: args.fail_writes,
        latency: std::time::Duration::from_millis(args.latency_ms),
        submit: !args.no_submit,
    };

    let report = simulation::run(config, kv.clone(), scenario).await?;
    match kv.total_size() {
        Ok(bytes) => tracing::info!(
            "Local store holds {} keys, {} bytes",
            report.store_keys.len(),
            bytes
        ),
        Err(e) => tracing::warn!("Failed to measure local store: {}", e),
    }
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
