use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::{is_candidate, CandidateQuery, ClaimCondition, RecordStore};
use crate::error::StoreError;
use crate::types::{AgentPatch, RecordRef, SessionRecord, SessionStatus};

/// In-process record store with the same semantics as the SQLite adapter.
///
/// The mutex makes `update_fields_if_unclaimed` a true compare-and-set for
/// every monitor sharing the instance.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: Mutex<BTreeMap<String, SessionRecord>>,
    unavailable: AtomicBool,
    writes: AtomicUsize,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a whole record, as the upload pipeline does.
    pub fn insert(&self, record: SessionRecord) {
        self.lock()
            .insert(record.session_id.clone(), record);
    }

    /// Upload/analysis side status transition. Never touches agent fields.
    pub fn set_status(
        &self,
        session_id: &str,
        status: SessionStatus,
        analysis_completed_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let mut records = self.lock();
        let record = records
            .get_mut(session_id)
            .ok_or_else(|| StoreError::RecordNotFound(session_id.to_string()))?;
        record.status = status;
        if analysis_completed_at.is_some() {
            record.analysis_completed_at = analysis_completed_at;
        }
        Ok(())
    }

    /// Deletes a record, as an operator purging an upload would.
    pub fn remove(&self, session_id: &str) -> Option<SessionRecord> {
        self.lock().remove(session_id)
    }

    pub fn snapshot(&self, session_id: &str) -> Option<SessionRecord> {
        self.lock().get(session_id).cloned()
    }

    /// Simulates a network or auth outage for every subsequent call.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of agent-field writes applied so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, SessionRecord>> {
        // Writers only mutate under the guard, so a panicked holder leaves the
        // map in a consistent state.
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_available(&self, context: &str) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable {
                context: context.to_string(),
                details: "memory store marked unavailable".to_string(),
            });
        }
        Ok(())
    }
}

impl RecordStore for MemoryRecordStore {
    fn find_candidates(&self, query: &CandidateQuery) -> Result<Vec<RecordRef>, StoreError> {
        self.check_available("find candidates")?;
        let records = self.lock();
        let mut candidates: Vec<&SessionRecord> = records
            .values()
            .filter(|record| is_candidate(record, query))
            .collect();

        candidates.sort_by(|left, right| {
            let left_attempted = !left.agent.never_attempted();
            let right_attempted = !right.agent.never_attempted();
            left_attempted
                .cmp(&right_attempted)
                // Newest analysis first; records without a timestamp sort last.
                .then_with(|| right.analysis_completed_at.cmp(&left.analysis_completed_at))
                .then_with(|| left.session_id.cmp(&right.session_id))
        });

        Ok(candidates
            .into_iter()
            .take(query.limit)
            .map(SessionRecord::to_ref)
            .collect())
    }

    fn get_by_id(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        self.check_available("get session")?;
        Ok(self.lock().get(session_id).cloned())
    }

    fn update_fields(&self, session_id: &str, patch: &AgentPatch) -> Result<(), StoreError> {
        self.check_available("update session")?;
        let mut records = self.lock();
        let record = records
            .get_mut(session_id)
            .ok_or_else(|| StoreError::RecordNotFound(session_id.to_string()))?;
        patch.apply(&mut record.agent);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn update_fields_if_unclaimed(
        &self,
        session_id: &str,
        condition: &ClaimCondition,
        patch: &AgentPatch,
    ) -> Result<bool, StoreError> {
        self.check_available("claim session")?;
        let mut records = self.lock();
        let Some(record) = records.get_mut(session_id) else {
            return Ok(false);
        };
        if !condition.admits(record) {
            return Ok(false);
        }
        patch.apply(&mut record.agent);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn query(now: DateTime<Utc>) -> CandidateQuery {
        CandidateQuery {
            limit: 5,
            stale_before: now - Duration::minutes(10),
            max_attempts: None,
        }
    }

    #[test]
    fn orders_fresh_records_before_retries() {
        let now = Utc::now();
        let store = MemoryRecordStore::new();

        let mut retried = SessionRecord::new("retried", SessionStatus::Completed)
            .with_analysis_completed_at(now);
        retried.agent.agent_processing_started = Some(now - Duration::hours(1));
        retried.agent.agent_processing_error = Some("rate limited".to_string());
        store.insert(retried);
        store.insert(
            SessionRecord::new("older", SessionStatus::Completed)
                .with_analysis_completed_at(now - Duration::hours(2)),
        );
        store.insert(
            SessionRecord::new("newer", SessionStatus::Completed)
                .with_analysis_completed_at(now - Duration::hours(1)),
        );

        let ids: Vec<String> = store
            .find_candidates(&query(now))
            .expect("candidates")
            .into_iter()
            .map(|candidate| candidate.session_id)
            .collect();
        assert_eq!(ids, vec!["newer", "older", "retried"]);
    }

    #[test]
    fn conditional_update_rejects_live_claim() {
        let now = Utc::now();
        let store = MemoryRecordStore::new();
        store.insert(SessionRecord::new("s1", SessionStatus::Completed));

        let patch = AgentPatch::new().processing(true).processing_started(now);
        let condition = ClaimCondition {
            stale_before: now - Duration::minutes(10),
            require_unprocessed: true,
        };
        assert!(store
            .update_fields_if_unclaimed("s1", &condition, &patch)
            .expect("first claim"));
        assert!(!store
            .update_fields_if_unclaimed("s1", &condition, &patch)
            .expect("second claim"));
        assert!(!store
            .update_fields_if_unclaimed("missing", &condition, &patch)
            .expect("missing claim"));
        assert_eq!(store.write_count(), 1);
    }

    #[test]
    fn conditional_update_refuses_processed_record_unless_bypassed() {
        let now = Utc::now();
        let store = MemoryRecordStore::new();
        let mut record = SessionRecord::new("s1", SessionStatus::Completed);
        record.agent.agent_processed = true;
        store.insert(record);

        let patch = AgentPatch::new().processing(true).processing_started(now);
        let mut condition = ClaimCondition {
            stale_before: now - Duration::minutes(10),
            require_unprocessed: true,
        };
        assert!(!store
            .update_fields_if_unclaimed("s1", &condition, &patch)
            .expect("scheduled claim"));
        assert_eq!(store.write_count(), 0);

        condition.require_unprocessed = false;
        assert!(store
            .update_fields_if_unclaimed("s1", &condition, &patch)
            .expect("manual claim"));
    }

    #[test]
    fn update_on_missing_record_is_not_found() {
        let store = MemoryRecordStore::new();
        let err = store
            .update_fields("missing", &AgentPatch::new().processing(false))
            .expect_err("missing record");
        assert!(matches!(err, StoreError::RecordNotFound(id) if id == "missing"));
    }

    #[test]
    fn outage_is_distinct_from_not_found() {
        let store = MemoryRecordStore::new();
        store.set_unavailable(true);
        let err = store.get_by_id("s1").expect_err("outage");
        assert!(matches!(err, StoreError::Unavailable { .. }));

        store.set_unavailable(false);
        assert!(store.get_by_id("s1").expect("lookup").is_none());
    }
}
