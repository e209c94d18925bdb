//! Session record and agent-processing types shared by every component.
//!
//! The upload/analysis pipeline owns `status` and the opaque `document`;
//! the monitor owns [`AgentState`] and only ever writes it through an
//! [`AgentPatch`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Lifecycle status written by the external video-analysis pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Uploaded,
    Processing,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Uploaded => "uploaded",
            SessionStatus::Processing => "processing",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "uploaded" => Some(SessionStatus::Uploaded),
            "processing" => Some(SessionStatus::Processing),
            "completed" => Some(SessionStatus::Completed),
            "failed" => Some(SessionStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `agent*` fields of a session record.
///
/// Serialized with the document-store field names so a JSON dump of a
/// record reads the same as the collection it mirrors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentState {
    #[serde(default)]
    pub agent_processed: bool,
    #[serde(default)]
    pub agent_processing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_processing_started: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_processing_completed: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_processing_failed: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_processing_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_result: Option<Value>,
    #[serde(default)]
    pub agent_attempt_count: u32,
}

impl AgentState {
    /// True when a claim is held and was taken at or after `stale_before`.
    pub fn has_live_claim(&self, stale_before: DateTime<Utc>) -> bool {
        self.agent_processing
            && self
                .agent_processing_started
                .map(|started| started >= stale_before)
                .unwrap_or(false)
    }

    /// Never claimed by any monitor instance.
    pub fn never_attempted(&self) -> bool {
        self.agent_processing_started.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_id: String,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis_completed_at: Option<DateTime<Utc>>,
    /// Every non-agent field owned by the upload/analysis pipeline.
    #[serde(default)]
    pub document: Value,
    #[serde(flatten)]
    pub agent: AgentState,
}

impl SessionRecord {
    pub fn new(session_id: impl Into<String>, status: SessionStatus) -> Self {
        Self {
            session_id: session_id.into(),
            status,
            analysis_completed_at: None,
            document: Value::Object(Default::default()),
            agent: AgentState::default(),
        }
    }

    pub fn with_analysis_completed_at(mut self, at: DateTime<Utc>) -> Self {
        self.analysis_completed_at = Some(at);
        self
    }

    pub fn with_document(mut self, document: Value) -> Self {
        self.document = document;
        self
    }

    pub fn to_ref(&self) -> RecordRef {
        RecordRef {
            session_id: self.session_id.clone(),
            analysis_completed_at: self.analysis_completed_at,
        }
    }
}

/// Snapshot returned by candidate selection. Stale by the time it is used;
/// the executor always re-fetches the full record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordRef {
    pub session_id: String,
    pub analysis_completed_at: Option<DateTime<Utc>>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Field patches
// ─────────────────────────────────────────────────────────────────────────────

/// A single agent-owned field write.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentField {
    Processed(bool),
    Processing(bool),
    ProcessingStarted(DateTime<Utc>),
    ProcessingCompleted(DateTime<Utc>),
    ProcessingFailed(DateTime<Utc>),
    ProcessingError(Option<String>),
    Result(Option<Value>),
    IncrementAttempts,
}

/// Field-level merge applied by `RecordStore::update_fields`.
///
/// Fields not named in the patch are left as they are.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentPatch {
    fields: Vec<AgentField>,
}

impl AgentPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: AgentField) -> Self {
        self.fields.push(field);
        self
    }

    pub fn processed(self, value: bool) -> Self {
        self.set(AgentField::Processed(value))
    }

    pub fn processing(self, value: bool) -> Self {
        self.set(AgentField::Processing(value))
    }

    pub fn processing_started(self, at: DateTime<Utc>) -> Self {
        self.set(AgentField::ProcessingStarted(at))
    }

    pub fn processing_completed(self, at: DateTime<Utc>) -> Self {
        self.set(AgentField::ProcessingCompleted(at))
    }

    pub fn processing_failed(self, at: DateTime<Utc>) -> Self {
        self.set(AgentField::ProcessingFailed(at))
    }

    pub fn processing_error(self, message: Option<String>) -> Self {
        self.set(AgentField::ProcessingError(message))
    }

    pub fn result(self, result: Option<Value>) -> Self {
        self.set(AgentField::Result(result))
    }

    pub fn increment_attempts(self) -> Self {
        self.set(AgentField::IncrementAttempts)
    }

    pub fn fields(&self) -> &[AgentField] {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn apply(&self, state: &mut AgentState) {
        for field in &self.fields {
            match field {
                AgentField::Processed(value) => state.agent_processed = *value,
                AgentField::Processing(value) => state.agent_processing = *value,
                AgentField::ProcessingStarted(at) => state.agent_processing_started = Some(*at),
                AgentField::ProcessingCompleted(at) => {
                    state.agent_processing_completed = Some(*at)
                }
                AgentField::ProcessingFailed(at) => state.agent_processing_failed = Some(*at),
                AgentField::ProcessingError(message) => {
                    state.agent_processing_error = message.clone()
                }
                AgentField::Result(result) => state.agent_result = result.clone(),
                AgentField::IncrementAttempts => {
                    state.agent_attempt_count = state.agent_attempt_count.saturating_add(1)
                }
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Outcomes
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimStatus {
    Granted,
    AlreadyClaimed,
    /// Another worker finished the record after it was selected.
    AlreadyProcessed,
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    NotFound,
    Precondition,
    Pipeline,
    Store,
}

impl FailureKind {
    /// Whether the next tick may pick the record up again.
    pub fn is_transient(&self) -> bool {
        matches!(self, FailureKind::Pipeline | FailureKind::Store)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl AttemptFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Result of one processing attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Success { result: Value },
    Failure(AttemptFailure),
}

impl Outcome {
    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        Outcome::Failure(AttemptFailure::new(kind, message))
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }
}

/// Counters for one scheduler tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub selected: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aborted: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            SessionStatus::Uploaded,
            SessionStatus::Processing,
            SessionStatus::Completed,
            SessionStatus::Failed,
        ] {
            assert_eq!(SessionStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(SessionStatus::from_str("done"), None);
    }

    #[test]
    fn patch_merges_only_named_fields() {
        let now = Utc::now();
        let mut state = AgentState {
            agent_processing_error: Some("previous".to_string()),
            agent_attempt_count: 2,
            ..AgentState::default()
        };

        AgentPatch::new()
            .processing(true)
            .processing_started(now)
            .increment_attempts()
            .apply(&mut state);

        assert!(state.agent_processing);
        assert_eq!(state.agent_processing_started, Some(now));
        assert_eq!(state.agent_attempt_count, 3);
        assert_eq!(state.agent_processing_error.as_deref(), Some("previous"));
        assert!(!state.agent_processed);
    }

    #[test]
    fn live_claim_respects_stale_cutoff() {
        let now = Utc::now();
        let state = AgentState {
            agent_processing: true,
            agent_processing_started: Some(now - Duration::minutes(20)),
            ..AgentState::default()
        };

        assert!(state.has_live_claim(now - Duration::minutes(30)));
        assert!(!state.has_live_claim(now - Duration::minutes(10)));
    }

    #[test]
    fn agent_state_serializes_with_document_field_names() {
        let mut record = SessionRecord::new("s1", SessionStatus::Completed);
        record.agent.agent_processed = true;
        record.agent.agent_result = Some(json!({"severity": "low"}));

        let value = serde_json::to_value(&record).expect("serialize");
        assert_eq!(value["sessionId"], "s1");
        assert_eq!(value["status"], "completed");
        assert_eq!(value["agentProcessed"], true);
        assert_eq!(value["agentResult"]["severity"], "low");
        assert!(value.get("agentProcessingError").is_none());
    }

    #[test]
    fn outcome_is_tagged() {
        let outcome = Outcome::failure(FailureKind::Pipeline, "rate limited");
        let value = serde_json::to_value(&outcome).expect("serialize");
        assert_eq!(value["outcome"], "failure");
        assert_eq!(value["kind"], "pipeline");
        assert_eq!(value["message"], "rate limited");
    }
}
