//! Runs the external pipeline for one claimed session and classifies the
//! result. Never swallows pipeline errors: every failure becomes a tagged
//! [`Outcome::Failure`] for the recorder.

use tracing::{info, warn};

use crate::pipeline::AnalysisActionPipeline;
use crate::store::RecordStore;
use crate::types::{FailureKind, Outcome, SessionStatus};

pub fn execute(
    store: &dyn RecordStore,
    pipeline: &dyn AnalysisActionPipeline,
    session_id: &str,
) -> Outcome {
    // Re-fetch: the selector's snapshot may be minutes old by now.
    let record = match store.get_by_id(session_id) {
        Ok(Some(record)) => record,
        Ok(None) => {
            return Outcome::failure(
                FailureKind::NotFound,
                format!("Session not found: {}", session_id),
            )
        }
        Err(err) => return Outcome::failure(FailureKind::Store, err.to_string()),
    };

    if record.status != SessionStatus::Completed {
        warn!(
            session_id = %session_id,
            status = %record.status,
            "Session no longer completed; skipping pipeline"
        );
        return Outcome::failure(
            FailureKind::Precondition,
            format!(
                "expected status completed, found {}",
                record.status.as_str()
            ),
        );
    }

    match pipeline.process(session_id) {
        Ok(result) => {
            info!(session_id = %session_id, "Pipeline completed");
            Outcome::Success { result }
        }
        Err(err) => {
            warn!(session_id = %session_id, error = %err, "Pipeline failed");
            Outcome::failure(FailureKind::Pipeline, err.message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use crate::store::MemoryRecordStore;
    use crate::types::SessionRecord;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn returns_pipeline_result_verbatim() {
        let store = MemoryRecordStore::new();
        store.insert(SessionRecord::new("S1", SessionStatus::Completed));
        let pipeline =
            |_: &str| -> Result<Value, PipelineError> { Ok(json!({"severity": "low"})) };

        let outcome = execute(&store, &pipeline, "S1");
        assert_eq!(
            outcome,
            Outcome::Success {
                result: json!({"severity": "low"})
            }
        );
    }

    #[test]
    fn regressed_status_fails_fast_without_calling_pipeline() {
        let store = MemoryRecordStore::new();
        store.insert(SessionRecord::new("S1", SessionStatus::Processing));
        let calls = AtomicUsize::new(0);
        let pipeline = |_: &str| -> Result<Value, PipelineError> {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Null)
        };

        let outcome = execute(&store, &pipeline, "S1");
        assert!(matches!(
            outcome,
            Outcome::Failure(ref failure) if failure.kind == FailureKind::Precondition
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn pipeline_error_is_classified_with_message() {
        let store = MemoryRecordStore::new();
        store.insert(SessionRecord::new("S3", SessionStatus::Completed));
        let pipeline =
            |_: &str| -> Result<Value, PipelineError> { Err(PipelineError::new("rate limited")) };

        let outcome = execute(&store, &pipeline, "S3");
        assert_eq!(outcome, Outcome::failure(FailureKind::Pipeline, "rate limited"));
    }

    #[test]
    fn store_outage_is_classified() {
        let store = MemoryRecordStore::new();
        store.set_unavailable(true);
        let pipeline = |_: &str| -> Result<Value, PipelineError> { Ok(Value::Null) };

        let outcome = execute(&store, &pipeline, "S1");
        assert!(matches!(
            outcome,
            Outcome::Failure(ref failure) if failure.kind == FailureKind::Store
        ));
    }
}
