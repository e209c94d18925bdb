//! Record store interface and adapters.
//! Add new backends here; the monitor only ever talks to [`RecordStore`].

mod memory;
mod sqlite;

pub use memory::MemoryRecordStore;
pub use sqlite::SqliteRecordStore;

use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::types::{AgentPatch, RecordRef, SessionRecord, SessionStatus};

/// Filter and page bound for candidate selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateQuery {
    pub limit: usize,
    /// Claims started before this instant are treated as abandoned.
    pub stale_before: DateTime<Utc>,
    /// Records with this many attempts or more are excluded. `None` = no cap.
    pub max_attempts: Option<u32>,
}

/// Guard evaluated atomically with a claim write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimCondition {
    /// Claims started before this instant are treated as abandoned.
    pub stale_before: DateTime<Utc>,
    /// Refuse records that already have `agentProcessed` set. Scheduled
    /// claims set this; the manual trigger clears it to re-run a record.
    pub require_unprocessed: bool,
}

impl ClaimCondition {
    /// Whether `record` may be claimed right now.
    pub fn admits(&self, record: &SessionRecord) -> bool {
        if self.require_unprocessed && record.agent.agent_processed {
            return false;
        }
        !record.agent.has_live_claim(self.stale_before)
    }
}

/// Typed access to the session collection.
///
/// Implementors must:
/// - Apply `update_fields` as a field-level merge, never a full overwrite
/// - Report a missing record as `StoreError::RecordNotFound`, never as an outage
/// - Order candidates never-attempted first, then most recently analyzed first
pub trait RecordStore: Send + Sync {
    fn find_candidates(&self, query: &CandidateQuery) -> Result<Vec<RecordRef>, StoreError>;

    /// Returns `Ok(None)` when no record has this id.
    fn get_by_id(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError>;

    fn update_fields(&self, session_id: &str, patch: &AgentPatch) -> Result<(), StoreError>;

    /// Applies `patch` only if `condition` admits the record, checked in the
    /// same atomic step as the write. Returns `Ok(false)` when the record is
    /// refused or missing.
    fn update_fields_if_unclaimed(
        &self,
        session_id: &str,
        condition: &ClaimCondition,
        patch: &AgentPatch,
    ) -> Result<bool, StoreError>;
}

/// Whether a record passes the candidate filter.
pub(crate) fn is_candidate(record: &SessionRecord, query: &CandidateQuery) -> bool {
    if record.status != SessionStatus::Completed || record.agent.agent_processed {
        return false;
    }
    if record.agent.has_live_claim(query.stale_before) {
        return false;
    }
    match query.max_attempts {
        Some(max) => record.agent.agent_attempt_count < max,
        None => true,
    }
}
