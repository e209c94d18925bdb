//! Scheduler loop and the manual single-record trigger.
//!
//! Each tick runs Selector → (Claim → Execute → Record) sequentially for every
//! candidate. A failed record never aborts the tick; a store failure does,
//! since nothing further can be claimed or recorded.
//!
//! [`Monitor::start`] spawns one background thread that ticks immediately and
//! then once per poll interval. [`Monitor::stop`] only prevents future ticks;
//! [`Monitor::shutdown`] also waits for an in-flight tick to finish.

use chrono::Utc;
use serde_json::Value;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::claim::{claim, ClaimMode};
use crate::config::MonitorConfig;
use crate::error::{MonitorError, Result, StoreError};
use crate::executor::execute;
use crate::pipeline::AnalysisActionPipeline;
use crate::recorder::record_outcome;
use crate::selector::select_candidates;
use crate::store::RecordStore;
use crate::types::{ClaimStatus, FailureKind, Outcome, TickReport};

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);
const THREAD_NAME: &str = "session-monitor";

// ═══════════════════════════════════════════════════════════════════════════════
// Single Attempt
// ═══════════════════════════════════════════════════════════════════════════════

enum Attempt {
    Rejected(ClaimStatus),
    Finished(Outcome),
}

fn attempt(
    store: &dyn RecordStore,
    pipeline: &dyn AnalysisActionPipeline,
    config: &MonitorConfig,
    session_id: &str,
    mode: ClaimMode,
) -> std::result::Result<Attempt, StoreError> {
    match claim(store, config, session_id, mode, Utc::now())? {
        ClaimStatus::Granted => {}
        status => return Ok(Attempt::Rejected(status)),
    }

    let outcome = execute(store, pipeline, session_id);
    // Always release the claim, whatever the outcome. A record deleted
    // mid-attempt has no claim left to release.
    match record_outcome(store, session_id, &outcome, Utc::now()) {
        Ok(()) => {}
        Err(StoreError::RecordNotFound(_)) => {
            warn!(session_id = %session_id, "Session deleted before its outcome was recorded");
        }
        Err(err) => return Err(err),
    }
    Ok(Attempt::Finished(outcome))
}

/// Runs one scheduler tick against `store`.
pub fn run_tick(
    store: &dyn RecordStore,
    pipeline: &dyn AnalysisActionPipeline,
    config: &MonitorConfig,
) -> TickReport {
    let mut report = TickReport::default();

    let candidates = match select_candidates(store, config, Utc::now()) {
        Ok(candidates) => candidates,
        Err(err) => {
            warn!(error = %err, "Candidate selection failed; skipping tick");
            report.aborted = Some(err.to_string());
            return report;
        }
    };
    report.selected = candidates.len();

    for candidate in &candidates {
        let session_id = candidate.session_id.as_str();
        match attempt(store, pipeline, config, session_id, ClaimMode::Scheduled) {
            Ok(Attempt::Finished(Outcome::Success { .. })) => report.succeeded += 1,
            Ok(Attempt::Finished(Outcome::Failure(failure))) => {
                warn!(
                    session_id = %session_id,
                    kind = ?failure.kind,
                    error = %failure.message,
                    "Agent processing attempt failed"
                );
                report.failed += 1;
                if failure.kind == FailureKind::Store {
                    report.aborted = Some(failure.message);
                    break;
                }
            }
            Ok(Attempt::Rejected(status)) => {
                debug!(session_id = %session_id, status = ?status, "Candidate skipped");
                report.skipped += 1;
            }
            Err(err) => {
                warn!(
                    session_id = %session_id,
                    error = %err,
                    "Record store failed; abandoning rest of tick"
                );
                report.aborted = Some(err.to_string());
                break;
            }
        }
    }

    if report.selected > 0 || report.aborted.is_some() {
        info!(
            selected = report.selected,
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            aborted = report.aborted.is_some(),
            "Monitor tick finished"
        );
    } else {
        debug!("Monitor tick found no candidates");
    }
    report
}

/// Manual trigger: claim, execute and record one session synchronously.
///
/// Ignores the attempt cap and re-runs already processed sessions. Every
/// failure is recorded on the session (best effort) before it is returned.
pub fn process_one(
    store: &dyn RecordStore,
    pipeline: &dyn AnalysisActionPipeline,
    config: &MonitorConfig,
    session_id: &str,
) -> Result<Value> {
    info!(session_id = %session_id, "Manual agent processing requested");
    match attempt(store, pipeline, config, session_id, ClaimMode::Manual)? {
        Attempt::Finished(Outcome::Success { result }) => Ok(result),
        Attempt::Finished(Outcome::Failure(failure)) => Err(match failure.kind {
            FailureKind::NotFound => MonitorError::NotFound(session_id.to_string()),
            FailureKind::Precondition => MonitorError::Precondition {
                session_id: session_id.to_string(),
                message: failure.message,
            },
            FailureKind::Pipeline => MonitorError::Pipeline {
                session_id: session_id.to_string(),
                message: failure.message,
            },
            FailureKind::Store => MonitorError::Store(StoreError::Unavailable {
                context: format!("Failed to load session {}", session_id),
                details: failure.message,
            }),
        }),
        Attempt::Rejected(ClaimStatus::NotFound) => {
            Err(MonitorError::NotFound(session_id.to_string()))
        }
        Attempt::Rejected(_) => Err(MonitorError::AlreadyClaimed(session_id.to_string())),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Scheduler
// ═══════════════════════════════════════════════════════════════════════════════

enum SchedulerState {
    Stopped,
    Running {
        stop_tx: mpsc::Sender<()>,
        thread: JoinHandle<()>,
    },
}

/// Completion monitor bound to one store and one pipeline.
pub struct Monitor {
    store: Arc<dyn RecordStore>,
    pipeline: Arc<dyn AnalysisActionPipeline>,
    config: MonitorConfig,
    poll_interval: Duration,
    state: Mutex<SchedulerState>,
    // Loop threads that were told to stop but may still be finishing a tick.
    retired: Mutex<Vec<JoinHandle<()>>>,
}

impl Monitor {
    pub fn new(
        store: Arc<dyn RecordStore>,
        pipeline: Arc<dyn AnalysisActionPipeline>,
        config: MonitorConfig,
    ) -> Self {
        let poll_interval = config.poll_interval();
        Self {
            store,
            pipeline,
            config,
            poll_interval,
            state: Mutex::new(SchedulerState::Stopped),
            retired: Mutex::new(Vec::new()),
        }
    }

    /// Overrides the configured poll interval, e.g. for sub-second ticks.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Starts the periodic loop. Returns `Ok(false)` if it was already running.
    pub fn start(&self) -> Result<bool> {
        let mut state = lock(&self.state);
        if matches!(*state, SchedulerState::Running { .. }) {
            info!("Completion monitor already running; start ignored");
            return Ok(false);
        }

        let (stop_tx, stop_rx) = mpsc::channel();
        let store = Arc::clone(&self.store);
        let pipeline = Arc::clone(&self.pipeline);
        let config = self.config.clone();
        let interval = self.poll_interval.max(MIN_POLL_INTERVAL);

        let thread = thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || run_loop(store, pipeline, config, interval, stop_rx))
            .map_err(MonitorError::Spawn)?;

        *state = SchedulerState::Running { stop_tx, thread };
        info!(
            interval_ms = interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "Completion monitor started"
        );
        Ok(true)
    }

    /// Cancels future ticks without waiting for an in-flight one. Returns
    /// `false` if the monitor was not running.
    pub fn stop(&self) -> bool {
        let mut state = lock(&self.state);
        match std::mem::replace(&mut *state, SchedulerState::Stopped) {
            SchedulerState::Stopped => {
                debug!("Completion monitor not running; stop ignored");
                false
            }
            SchedulerState::Running { stop_tx, thread } => {
                // A send error means the loop already exited.
                let _ = stop_tx.send(());
                lock(&self.retired).push(thread);
                info!("Completion monitor stopped");
                true
            }
        }
    }

    /// Stops the loop and blocks until every loop thread has exited.
    pub fn shutdown(&self) {
        self.stop();
        let threads: Vec<_> = lock(&self.retired).drain(..).collect();
        for thread in threads {
            if thread.join().is_err() {
                warn!("Completion monitor thread panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(*lock(&self.state), SchedulerState::Running { .. })
    }

    /// Runs one tick on the calling thread.
    pub fn tick(&self) -> TickReport {
        run_tick(self.store.as_ref(), self.pipeline.as_ref(), &self.config)
    }

    pub fn process_one(&self, session_id: &str) -> Result<Value> {
        process_one(
            self.store.as_ref(),
            self.pipeline.as_ref(),
            &self.config,
            session_id,
        )
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_loop(
    store: Arc<dyn RecordStore>,
    pipeline: Arc<dyn AnalysisActionPipeline>,
    config: MonitorConfig,
    interval: Duration,
    stop_rx: mpsc::Receiver<()>,
) {
    loop {
        run_tick(store.as_ref(), pipeline.as_ref(), &config);
        match stop_rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("Completion monitor loop exited");
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
