//! session-monitor: polling daemon and operator CLI for the completion monitor.
//!
//! ## Subcommands
//!
//! - `run`: Start the scheduler loop (`--once` runs a single tick and exits)
//! - `process`: Manually process one session
//! - `status`: Print a session's record, including its agent fields
//! - `stale`: List claims older than the stale-claim threshold

mod logging;

use chrono::Utc;
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use tracing::{error, info};

use session_monitor_core::{
    load_runtime_config, process_one, run_tick, stale_cutoff, CommandPipeline, Monitor,
    MonitorError, RecordStore, RuntimeConfig, SqliteRecordStore, StoreError,
};

#[derive(Parser)]
#[command(name = "session-monitor")]
#[command(about = "Runs the agent pipeline for analyzed sessions")]
#[command(version)]
struct Cli {
    /// Config file (defaults to ~/.session-monitor/monitor.toml)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Session database, overriding `[store] path`
    #[arg(long, global = true, value_name = "PATH")]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll for completed sessions until interrupted
    ///
    /// Without `--once` the process parks until it is killed and never calls
    /// `Monitor::shutdown`, so an in-flight tick is cut off mid-record. The
    /// claim it held stays set until `stale_claim_after_secs` passes, after
    /// which the next poller takes the session over.
    Run {
        /// Run a single tick and exit
        #[arg(long)]
        once: bool,
    },

    /// Claim, process and record one session now
    Process {
        #[arg(value_name = "SESSION_ID")]
        session_id: String,
    },

    /// Print a session record as JSON
    Status {
        #[arg(value_name = "SESSION_ID")]
        session_id: String,
    },

    /// List sessions whose claim looks abandoned
    Stale,
}

fn main() {
    let cli = Cli::parse();

    let config = load_runtime_config(cli.config.clone());
    let log_directory = config
        .as_ref()
        .ok()
        .and_then(|config| config.logging.directory.clone());
    let _logging_guard = logging::init(log_directory.as_deref());

    let config = match config {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "Failed to load monitor config");
            std::process::exit(1);
        }
    };

    match execute(cli, config) {
        Ok(Some(output)) => println!("{}", output),
        Ok(None) => {}
        Err(err) => {
            error!(error = %err, "session-monitor failed");
            std::process::exit(1);
        }
    }
}

fn execute(cli: Cli, config: RuntimeConfig) -> Result<Option<String>, MonitorError> {
    let store_path = match cli.store {
        Some(path) => path,
        None => config.store.resolved_path()?,
    };
    let store = SqliteRecordStore::new(store_path)?;
    info!(path = %store.path().display(), "Session store opened");

    match cli.command {
        Commands::Run { once: true } => {
            let pipeline = pipeline_from_config(&config)?;
            let report = run_tick(&store, &pipeline, &config.monitor);
            if let Some(reason) = &report.aborted {
                return Err(MonitorError::Store(StoreError::Unavailable {
                    context: "Tick aborted".to_string(),
                    details: reason.clone(),
                }));
            }
            to_json(&report).map(Some)
        }
        Commands::Run { once: false } => {
            let pipeline = pipeline_from_config(&config)?;
            let monitor = Monitor::new(Arc::new(store), Arc::new(pipeline), config.monitor);
            monitor.start()?;
            // The loop thread does all the work. A signal ends the process without
            // a shutdown; stale-claim recovery picks up whatever was in flight.
            loop {
                thread::park();
            }
        }
        Commands::Process { session_id } => {
            let pipeline = pipeline_from_config(&config)?;
            let result = process_one(&store, &pipeline, &config.monitor, &session_id)?;
            to_json(&result).map(Some)
        }
        Commands::Status { session_id } => {
            let record = store
                .get_by_id(&session_id)?
                .ok_or(MonitorError::NotFound(session_id))?;
            to_json(&record).map(Some)
        }
        Commands::Stale => {
            let cutoff = stale_cutoff(&config.monitor, Utc::now());
            let stale: Vec<Value> = store
                .list_stale_claims(cutoff)?
                .into_iter()
                .map(|record| {
                    serde_json::json!({
                        "sessionId": record.session_id,
                        "agentProcessingStarted": record.agent.agent_processing_started,
                        "agentAttemptCount": record.agent.agent_attempt_count,
                    })
                })
                .collect();
            info!(count = stale.len(), "Stale claims listed");
            to_json(&stale).map(Some)
        }
    }
}

fn pipeline_from_config(config: &RuntimeConfig) -> Result<CommandPipeline, MonitorError> {
    CommandPipeline::from_config(&config.pipeline).ok_or_else(|| MonitorError::Config {
        path: PathBuf::from("[pipeline] program"),
        details: "No pipeline program configured".to_string(),
    })
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, MonitorError> {
    serde_json::to_string_pretty(value).map_err(|err| MonitorError::Config {
        path: PathBuf::from("stdout"),
        details: format!("Failed to serialize output: {}", err),
    })
}
