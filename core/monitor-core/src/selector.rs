//! Candidate selection: which completed sessions still need agent processing.

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::config::MonitorConfig;
use crate::error::StoreError;
use crate::store::{CandidateQuery, RecordStore};
use crate::types::RecordRef;

/// Builds the bounded query for one tick.
pub fn candidate_query(config: &MonitorConfig, now: DateTime<Utc>) -> CandidateQuery {
    CandidateQuery {
        limit: config.batch_size,
        stale_before: stale_cutoff(config, now),
        max_attempts: config.attempt_cap(),
    }
}

/// Claims started before this instant are considered abandoned.
pub fn stale_cutoff(config: &MonitorConfig, now: DateTime<Utc>) -> DateTime<Utc> {
    i64::try_from(config.stale_claim_after_secs)
        .ok()
        .and_then(Duration::try_seconds)
        .and_then(|lease| now.checked_sub_signed(lease))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Records with `status == completed` and `agentProcessed != true`, never
/// attempted first, then newest analysis first. An empty page is normal.
pub fn select_candidates(
    store: &dyn RecordStore,
    config: &MonitorConfig,
    now: DateTime<Utc>,
) -> Result<Vec<RecordRef>, StoreError> {
    let query = candidate_query(config, now);
    let candidates = store.find_candidates(&query)?;
    debug!(
        count = candidates.len(),
        limit = query.limit,
        "Candidate sessions selected"
    );
    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryRecordStore;
    use crate::types::{SessionRecord, SessionStatus};

    #[test]
    fn skips_sessions_still_in_analysis() {
        let store = MemoryRecordStore::new();
        store.insert(SessionRecord::new("S2", SessionStatus::Processing));
        store.insert(SessionRecord::new("uploaded", SessionStatus::Uploaded));
        store.insert(SessionRecord::new("failed", SessionStatus::Failed));

        let candidates =
            select_candidates(&store, &MonitorConfig::default(), Utc::now()).expect("select");
        assert!(candidates.is_empty());
    }

    #[test]
    fn page_is_bounded_by_batch_size() {
        let store = MemoryRecordStore::new();
        for index in 0..8 {
            store.insert(SessionRecord::new(
                format!("session-{}", index),
                SessionStatus::Completed,
            ));
        }
        let config = MonitorConfig {
            batch_size: 3,
            ..MonitorConfig::default()
        };

        let candidates = select_candidates(&store, &config, Utc::now()).expect("select");
        assert_eq!(candidates.len(), 3);
    }

    #[test]
    fn zero_attempt_cap_means_unbounded() {
        let now = Utc::now();
        let config = MonitorConfig {
            max_attempts: 0,
            ..MonitorConfig::default()
        };
        let query = candidate_query(&config, now);
        assert_eq!(query.max_attempts, None);
        assert_eq!(
            query.stale_before,
            now - Duration::seconds(config.stale_claim_after_secs as i64)
        );
    }
}
