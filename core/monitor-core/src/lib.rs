//! # session-monitor-core
//!
//! Completion monitor for analyzed session recordings: finds sessions whose
//! analysis finished, runs the external analysis/action pipeline once per
//! session, and records the outcome on the session record.
//!
//! ## Design Principles
//!
//! - **Synchronous**: No async runtime dependency. The scheduler owns one OS thread.
//! - **Store-enforced claims**: Mutual exclusion comes from the store's conditional
//!   update, never from in-process locks, so several monitors may share one store.
//! - **Field-level merges**: The monitor only ever writes `agent*` fields.
//! - **No retry logic**: A failed attempt releases its claim and the session is
//!   simply selected again on a later tick.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use session_monitor_core::{Monitor, MonitorConfig, SqliteRecordStore};
//! use std::sync::Arc;
//!
//! let store = Arc::new(SqliteRecordStore::new(path)?);
//! let monitor = Monitor::new(store, Arc::new(pipeline), MonitorConfig::default());
//! monitor.start()?;
//! ```

// Public modules
pub mod claim;
pub mod config;
pub mod error;
pub mod executor;
pub mod monitor;
pub mod pipeline;
pub mod recorder;
pub mod selector;
pub mod store;
pub mod types;

// Re-export commonly used items at crate root
pub use claim::{claim, ClaimMode};
pub use config::{
    default_config_path, default_store_path, load_runtime_config, LoggingConfig, MonitorConfig,
    RuntimeConfig, StoreConfig,
};
pub use error::{MonitorError, PipelineError, Result, StoreError};
pub use executor::execute;
pub use monitor::{process_one, run_tick, Monitor};
pub use pipeline::{AnalysisActionPipeline, CommandPipeline, CommandPipelineConfig};
pub use recorder::{record_failure, record_outcome, record_success};
pub use selector::{candidate_query, select_candidates, stale_cutoff};
pub use store::{
    CandidateQuery, ClaimCondition, MemoryRecordStore, RecordStore, SqliteRecordStore,
};
pub use types::*;
