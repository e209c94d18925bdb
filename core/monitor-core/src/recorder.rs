//! Terminal transitions for an attempt.
//!
//! Both paths release the claim unconditionally; that release is what keeps
//! records from getting stuck. Side effects already happened in the executor,
//! so re-running either function only repeats the store write.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::info;

use crate::error::StoreError;
use crate::store::RecordStore;
use crate::types::{AgentPatch, AttemptFailure, Outcome};

pub fn record_success(
    store: &dyn RecordStore,
    session_id: &str,
    result: &Value,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    let patch = AgentPatch::new()
        .processing(false)
        .processed(true)
        .processing_completed(now)
        .result(Some(result.clone()))
        .processing_error(None);
    store.update_fields(session_id, &patch)?;
    info!(session_id = %session_id, "Agent processing recorded as complete");
    Ok(())
}

/// Leaves `agentProcessed` and `agentResult` as they were, so a record that
/// never succeeded stays eligible for the next tick.
pub fn record_failure(
    store: &dyn RecordStore,
    session_id: &str,
    failure: &AttemptFailure,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    let patch = AgentPatch::new()
        .processing(false)
        .processing_error(Some(failure.message.clone()))
        .processing_failed(now);
    store.update_fields(session_id, &patch)?;
    info!(
        session_id = %session_id,
        kind = ?failure.kind,
        error = %failure.message,
        "Agent processing recorded as failed"
    );
    Ok(())
}

pub fn record_outcome(
    store: &dyn RecordStore,
    session_id: &str,
    outcome: &Outcome,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    match outcome {
        Outcome::Success { result } => record_success(store, session_id, result, now),
        Outcome::Failure(failure) => record_failure(store, session_id, failure, now),
    }
}
