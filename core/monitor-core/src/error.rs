//! Error types for the completion monitor.
//! Store failures stay distinct from "record not found" so callers can tell
//! an outage apart from a bad session id.

use std::path::PathBuf;

// ═══════════════════════════════════════════════════════════════════════════════
// Store Errors
// ═══════════════════════════════════════════════════════════════════════════════

/// Failures raised by a [`RecordStore`](crate::store::RecordStore) adapter.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Session record not found: {0}")]
    RecordNotFound(String),

    #[error("Record store unavailable: {context}: {details}")]
    Unavailable { context: String, details: String },

    #[error("SQLite error: {context}: {source}")]
    Sqlite {
        context: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Corrupt session record {session_id}: {details}")]
    Corrupt { session_id: String, details: String },

    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    pub(crate) fn sqlite(context: impl Into<String>) -> impl FnOnce(rusqlite::Error) -> Self {
        let context = context.into();
        move |source| StoreError::Sqlite { context, source }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Pipeline Errors
// ═══════════════════════════════════════════════════════════════════════════════

/// Error thrown by the external analysis/action pipeline.
///
/// The monitor treats every pipeline error as transient: the claim is
/// released and the record stays eligible for the next tick.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct PipelineError {
    pub message: String,
}

impl PipelineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<String> for PipelineError {
    fn from(message: String) -> Self {
        PipelineError { message }
    }
}

impl From<&str> for PipelineError {
    fn from(message: &str) -> Self {
        PipelineError {
            message: message.to_string(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Monitor Errors
// ═══════════════════════════════════════════════════════════════════════════════

/// All errors surfaced by the monitor's public API.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    // ─────────────────────────────────────────────────────────────────────
    // Processing Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Session already claimed by another worker: {0}")]
    AlreadyClaimed(String),

    #[error("Session {session_id} is not ready for agent processing: {message}")]
    Precondition { session_id: String, message: String },

    #[error("Pipeline failed for session {session_id}: {message}")]
    Pipeline { session_id: String, message: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    // ─────────────────────────────────────────────────────────────────────
    // Runtime Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Failed to spawn monitor thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Configuration error: {path}: {details}")]
    Config { path: PathBuf, details: String },
}

/// Convenience type alias for Results using MonitorError.
pub type Result<T> = std::result::Result<T, MonitorError>;

impl From<MonitorError> for String {
    fn from(err: MonitorError) -> String {
        err.to_string()
    }
}
