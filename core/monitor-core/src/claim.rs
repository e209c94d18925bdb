//! Claim/lease handling via a conditional store write.
//!
//! Mutual exclusion is only as strong as the store's conditional update.
//! Both bundled adapters evaluate the condition and the write atomically, so
//! two pollers sharing one store cannot both be granted a live claim, and a
//! scheduled claim never lands on a record another poller already finished.
//! A store without that guarantee degrades to best-effort exclusion: two
//! workers may then process the same record, and the outcome recorder's
//! last-writer-wins terminal write keeps the record consistent while the
//! external side effects run twice.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::config::MonitorConfig;
use crate::error::StoreError;
use crate::selector::stale_cutoff;
use crate::store::{ClaimCondition, RecordStore};
use crate::types::{AgentPatch, ClaimStatus};

/// Who is asking for the claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimMode {
    /// The scheduler: only records that still need processing.
    Scheduled,
    /// The manual trigger: may re-run an already processed record.
    Manual,
}

/// Marks `session_id` as in progress unless another worker holds a live
/// claim. Granting a claim bumps the attempt counter.
pub fn claim(
    store: &dyn RecordStore,
    config: &MonitorConfig,
    session_id: &str,
    mode: ClaimMode,
    now: DateTime<Utc>,
) -> Result<ClaimStatus, StoreError> {
    let patch = AgentPatch::new()
        .processing(true)
        .processing_started(now)
        .increment_attempts();
    let condition = ClaimCondition {
        stale_before: stale_cutoff(config, now),
        require_unprocessed: mode == ClaimMode::Scheduled,
    };

    if store.update_fields_if_unclaimed(session_id, &condition, &patch)? {
        debug!(session_id = %session_id, mode = ?mode, "Claim granted");
        return Ok(ClaimStatus::Granted);
    }

    // The conditional write changed nothing: work out why.
    let status = match store.get_by_id(session_id)? {
        None => ClaimStatus::NotFound,
        Some(record) if condition.require_unprocessed && record.agent.agent_processed => {
            ClaimStatus::AlreadyProcessed
        }
        Some(_) => ClaimStatus::AlreadyClaimed,
    };
    debug!(session_id = %session_id, status = ?status, "Claim not granted");
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryRecordStore;
    use crate::types::{SessionRecord, SessionStatus};
    use chrono::Duration;

    #[test]
    fn grants_then_rejects_second_claim() {
        let store = MemoryRecordStore::new();
        store.insert(SessionRecord::new("S1", SessionStatus::Completed));
        let config = MonitorConfig::default();
        let now = Utc::now();

        assert_eq!(
            claim(&store, &config, "S1", ClaimMode::Scheduled, now).expect("claim"),
            ClaimStatus::Granted
        );
        assert_eq!(
            claim(&store, &config, "S1", ClaimMode::Manual, now).expect("claim"),
            ClaimStatus::AlreadyClaimed
        );

        let record = store.snapshot("S1").expect("record");
        assert!(record.agent.agent_processing);
        assert_eq!(record.agent.agent_processing_started, Some(now));
        assert_eq!(record.agent.agent_attempt_count, 1);
    }

    #[test]
    fn missing_record_is_not_found_without_writes() {
        let store = MemoryRecordStore::new();
        let status = claim(
            &store,
            &MonitorConfig::default(),
            "missing-id",
            ClaimMode::Manual,
            Utc::now(),
        )
        .expect("claim");
        assert_eq!(status, ClaimStatus::NotFound);
        assert_eq!(store.write_count(), 0);
    }

    #[test]
    fn abandoned_claim_can_be_taken_over() {
        let store = MemoryRecordStore::new();
        let mut record = SessionRecord::new("S1", SessionStatus::Completed);
        record.agent.agent_processing = true;
        record.agent.agent_processing_started = Some(Utc::now() - Duration::hours(2));
        store.insert(record);

        let status = claim(
            &store,
            &MonitorConfig::default(),
            "S1",
            ClaimMode::Scheduled,
            Utc::now(),
        )
        .expect("claim");
        assert_eq!(status, ClaimStatus::Granted);
    }

    #[test]
    fn processed_record_is_only_claimable_manually() {
        let store = MemoryRecordStore::new();
        let mut record = SessionRecord::new("S1", SessionStatus::Completed);
        record.agent.agent_processed = true;
        store.insert(record);
        let config = MonitorConfig::default();

        assert_eq!(
            claim(&store, &config, "S1", ClaimMode::Scheduled, Utc::now()).expect("claim"),
            ClaimStatus::AlreadyProcessed
        );
        assert_eq!(store.write_count(), 0);
        assert_eq!(
            claim(&store, &config, "S1", ClaimMode::Manual, Utc::now()).expect("claim"),
            ClaimStatus::Granted
        );
    }
}
