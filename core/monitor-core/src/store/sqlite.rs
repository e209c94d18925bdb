//! SQLite-backed session collection.
//!
//! One row per session. Pipeline-owned fields live in `status`,
//! `analysis_completed_at` and the JSON `document` column; every `agent_*`
//! column belongs to the monitor. Each write names only the columns it
//! changes, so the two writers never clobber each other.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OpenFlags, OptionalExtension, Row};
use std::path::{Path, PathBuf};

use super::{CandidateQuery, ClaimCondition, RecordStore};
use crate::error::StoreError;
use crate::types::{AgentField, AgentPatch, AgentState, RecordRef, SessionRecord, SessionStatus};

const SESSION_COLUMNS: &str = "session_id, status, analysis_completed_at, document, \
     agent_processed, agent_processing, agent_processing_started, agent_processing_completed, \
     agent_processing_failed, agent_processing_error, agent_result, agent_attempt_count";

// A claim is free when nobody holds it, or when the holder started before
// the stale cutoff bound as the trailing parameter.
const UNCLAIMED_CONDITION: &str = "(agent_processing = 0 \
     OR agent_processing_started IS NULL \
     OR agent_processing_started < ?)";

pub struct SqliteRecordStore {
    path: PathBuf,
}

impl SqliteRecordStore {
    pub fn new(path: PathBuf) -> Result<Self, StoreError> {
        let store = Self { path };
        store.init_schema()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Inserts a session, or refreshes the pipeline-owned fields of an
    /// existing one. Agent columns are only written on first insert.
    pub fn upsert_session(&self, record: &SessionRecord) -> Result<(), StoreError> {
        let document = serde_json::to_string(&record.document).map_err(|err| {
            StoreError::Corrupt {
                session_id: record.session_id.clone(),
                details: format!("Failed to serialize document: {}", err),
            }
        })?;
        let agent_result = encode_result(&record.session_id, record.agent.agent_result.as_ref())?;
        let agent = &record.agent;

        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO sessions \
                    (session_id, status, analysis_completed_at, document, \
                     agent_processed, agent_processing, agent_processing_started, \
                     agent_processing_completed, agent_processing_failed, \
                     agent_processing_error, agent_result, agent_attempt_count) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12) \
                 ON CONFLICT(session_id) DO UPDATE SET \
                    status = excluded.status, \
                    analysis_completed_at = excluded.analysis_completed_at, \
                    document = excluded.document",
                params![
                    record.session_id,
                    record.status.as_str(),
                    record.analysis_completed_at.map(format_timestamp),
                    document,
                    agent.agent_processed,
                    agent.agent_processing,
                    agent.agent_processing_started.map(format_timestamp),
                    agent.agent_processing_completed.map(format_timestamp),
                    agent.agent_processing_failed.map(format_timestamp),
                    agent.agent_processing_error,
                    agent_result,
                    agent.agent_attempt_count,
                ],
            )
            .map_err(StoreError::sqlite("Failed to upsert session"))?;
            Ok(())
        })
    }

    /// Status transition performed by the analysis pipeline.
    pub fn set_status(
        &self,
        session_id: &str,
        status: SessionStatus,
        analysis_completed_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let changed = self.with_connection(|conn| {
            conn.execute(
                "UPDATE sessions SET \
                    status = ?1, \
                    analysis_completed_at = COALESCE(?2, analysis_completed_at) \
                 WHERE session_id = ?3",
                params![
                    status.as_str(),
                    analysis_completed_at.map(format_timestamp),
                    session_id
                ],
            )
            .map_err(StoreError::sqlite("Failed to update session status"))
        })?;

        if changed == 0 {
            return Err(StoreError::RecordNotFound(session_id.to_string()));
        }
        Ok(())
    }

    /// Claims still marked in progress but started before `stale_before`,
    /// oldest first.
    pub fn list_stale_claims(
        &self,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<SessionRecord>, StoreError> {
        self.with_connection(|conn| {
            let sql = format!(
                "SELECT {} FROM sessions \
                 WHERE agent_processing = 1 \
                   AND (agent_processing_started IS NULL OR agent_processing_started < ?1) \
                 ORDER BY agent_processing_started ASC, session_id ASC",
                SESSION_COLUMNS
            );
            let mut stmt = conn
                .prepare(&sql)
                .map_err(StoreError::sqlite("Failed to prepare stale claim query"))?;
            let rows = stmt
                .query_map(params![format_timestamp(stale_before)], read_row)
                .map_err(StoreError::sqlite("Failed to read stale claim rows"))?;

            let mut records = Vec::new();
            for row in rows {
                let row = row.map_err(StoreError::sqlite("Failed to decode session row"))?;
                records.push(row.into_record()?);
            }
            Ok(records)
        })
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "BEGIN;
                 CREATE TABLE IF NOT EXISTS sessions (
                    session_id TEXT PRIMARY KEY,
                    status TEXT NOT NULL,
                    analysis_completed_at TEXT,
                    document TEXT NOT NULL DEFAULT '{}',
                    agent_processed INTEGER NOT NULL DEFAULT 0,
                    agent_processing INTEGER NOT NULL DEFAULT 0,
                    agent_processing_started TEXT,
                    agent_processing_completed TEXT,
                    agent_processing_failed TEXT,
                    agent_processing_error TEXT,
                    agent_result TEXT
                 );
                 COMMIT;",
            )
            .map_err(StoreError::sqlite("Failed to initialize schema"))?;
            ensure_sessions_columns(conn)?;
            conn.execute_batch(
                "CREATE INDEX IF NOT EXISTS sessions_candidates \
                    ON sessions (status, agent_processed, analysis_completed_at)",
            )
            .map_err(StoreError::sqlite("Failed to create candidate index"))?;
            Ok(())
        })
    }

    fn with_connection<T>(
        &self,
        op: impl FnOnce(&mut Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.open()?;
        op(&mut conn)
    }

    fn open(&self) -> Result<Connection, StoreError> {
        if let Some(parent) = self.path.parent() {
            fs_err::create_dir_all(parent).map_err(|source| StoreError::Io {
                context: "Failed to create store data dir".to_string(),
                source,
            })?;
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

        let conn = Connection::open_with_flags(&self.path, flags)
            .map_err(StoreError::sqlite("Failed to open sqlite db"))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(StoreError::sqlite("Failed to enable WAL"))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(StoreError::sqlite("Failed to set synchronous"))?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .map_err(StoreError::sqlite("Failed to set busy_timeout"))?;

        Ok(conn)
    }
}

impl RecordStore for SqliteRecordStore {
    fn find_candidates(&self, query: &CandidateQuery) -> Result<Vec<RecordRef>, StoreError> {
        self.with_connection(|conn| {
            let sql = format!(
                "SELECT session_id, analysis_completed_at FROM sessions \
                 WHERE status = 'completed' \
                   AND agent_processed = 0 \
                   AND {} \
                   AND (? IS NULL OR agent_attempt_count < ?) \
                 ORDER BY (agent_processing_started IS NOT NULL) ASC, \
                          analysis_completed_at DESC, \
                          session_id ASC \
                 LIMIT ?",
                UNCLAIMED_CONDITION
            );
            let max_attempts = query.max_attempts.map(i64::from);
            let limit = i64::try_from(query.limit).unwrap_or(i64::MAX);

            let mut stmt = conn
                .prepare(&sql)
                .map_err(StoreError::sqlite("Failed to prepare candidate query"))?;
            let rows = stmt
                .query_map(
                    params![
                        format_timestamp(query.stale_before),
                        max_attempts,
                        max_attempts,
                        limit
                    ],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, Option<String>>(1)?,
                        ))
                    },
                )
                .map_err(StoreError::sqlite("Failed to read candidate rows"))?;

            let mut candidates = Vec::new();
            for row in rows {
                let (session_id, analysis_completed_at) =
                    row.map_err(StoreError::sqlite("Failed to decode candidate row"))?;
                let analysis_completed_at =
                    parse_optional_timestamp(&session_id, analysis_completed_at)?;
                candidates.push(RecordRef {
                    session_id,
                    analysis_completed_at,
                });
            }
            Ok(candidates)
        })
    }

    fn get_by_id(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        let row = self.with_connection(|conn| {
            let sql = format!("SELECT {} FROM sessions WHERE session_id = ?1", SESSION_COLUMNS);
            conn.query_row(&sql, params![session_id], read_row)
                .optional()
                .map_err(StoreError::sqlite("Failed to query session"))
        })?;
        row.map(SessionRow::into_record).transpose()
    }

    fn update_fields(&self, session_id: &str, patch: &AgentPatch) -> Result<(), StoreError> {
        let (assignments, mut values) = patch_assignments(session_id, patch)?;
        let changed = self.with_connection(|conn| {
            if assignments.is_empty() {
                return conn
                    .query_row(
                        "SELECT COUNT(*) FROM sessions WHERE session_id = ?1",
                        params![session_id],
                        |row| row.get::<_, i64>(0),
                    )
                    .map(|count| count as usize)
                    .map_err(StoreError::sqlite("Failed to query session"));
            }

            let sql = format!(
                "UPDATE sessions SET {} WHERE session_id = ?",
                assignments.join(", ")
            );
            values.push(SqlValue::Text(session_id.to_string()));
            conn.execute(&sql, params_from_iter(values))
                .map_err(StoreError::sqlite("Failed to update session fields"))
        })?;

        if changed == 0 {
            return Err(StoreError::RecordNotFound(session_id.to_string()));
        }
        Ok(())
    }

    fn update_fields_if_unclaimed(
        &self,
        session_id: &str,
        condition: &ClaimCondition,
        patch: &AgentPatch,
    ) -> Result<bool, StoreError> {
        let (assignments, mut values) = patch_assignments(session_id, patch)?;
        if assignments.is_empty() {
            return Ok(false);
        }

        let changed = self.with_connection(|conn| {
            let sql = format!(
                "UPDATE sessions SET {} WHERE session_id = ? AND {}{}",
                assignments.join(", "),
                UNCLAIMED_CONDITION,
                if condition.require_unprocessed {
                    " AND agent_processed = 0"
                } else {
                    ""
                }
            );
            values.push(SqlValue::Text(session_id.to_string()));
            values.push(SqlValue::Text(format_timestamp(condition.stale_before)));
            conn.execute(&sql, params_from_iter(values))
                .map_err(StoreError::sqlite("Failed to claim session"))
        })?;

        Ok(changed > 0)
    }
}

struct SessionRow {
    session_id: String,
    status: String,
    analysis_completed_at: Option<String>,
    document: String,
    agent_processed: bool,
    agent_processing: bool,
    agent_processing_started: Option<String>,
    agent_processing_completed: Option<String>,
    agent_processing_failed: Option<String>,
    agent_processing_error: Option<String>,
    agent_result: Option<String>,
    agent_attempt_count: u32,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<SessionRow> {
    Ok(SessionRow {
        session_id: row.get(0)?,
        status: row.get(1)?,
        analysis_completed_at: row.get(2)?,
        document: row.get(3)?,
        agent_processed: row.get(4)?,
        agent_processing: row.get(5)?,
        agent_processing_started: row.get(6)?,
        agent_processing_completed: row.get(7)?,
        agent_processing_failed: row.get(8)?,
        agent_processing_error: row.get(9)?,
        agent_result: row.get(10)?,
        agent_attempt_count: row.get(11)?,
    })
}

impl SessionRow {
    fn into_record(self) -> Result<SessionRecord, StoreError> {
        let session_id = self.session_id;
        let status = SessionStatus::from_str(&self.status).ok_or_else(|| StoreError::Corrupt {
            session_id: session_id.clone(),
            details: format!("Unknown status: {}", self.status),
        })?;
        let document = serde_json::from_str(&self.document).map_err(|err| StoreError::Corrupt {
            session_id: session_id.clone(),
            details: format!("Failed to parse document: {}", err),
        })?;
        let agent_result = match self.agent_result {
            Some(raw) => Some(serde_json::from_str(&raw).map_err(|err| StoreError::Corrupt {
                session_id: session_id.clone(),
                details: format!("Failed to parse agent_result: {}", err),
            })?),
            None => None,
        };

        Ok(SessionRecord {
            status,
            analysis_completed_at: parse_optional_timestamp(&session_id, self.analysis_completed_at)?,
            document,
            agent: AgentState {
                agent_processed: self.agent_processed,
                agent_processing: self.agent_processing,
                agent_processing_started: parse_optional_timestamp(
                    &session_id,
                    self.agent_processing_started,
                )?,
                agent_processing_completed: parse_optional_timestamp(
                    &session_id,
                    self.agent_processing_completed,
                )?,
                agent_processing_failed: parse_optional_timestamp(
                    &session_id,
                    self.agent_processing_failed,
                )?,
                agent_processing_error: self.agent_processing_error,
                agent_result,
                agent_attempt_count: self.agent_attempt_count,
            },
            session_id,
        })
    }
}

/// Translates a patch into `column = ?` assignments plus their bound values,
/// in order.
fn patch_assignments(
    session_id: &str,
    patch: &AgentPatch,
) -> Result<(Vec<String>, Vec<SqlValue>), StoreError> {
    let mut assignments = Vec::with_capacity(patch.fields().len());
    let mut values = Vec::with_capacity(patch.fields().len());

    for field in patch.fields() {
        let (column, value) = match field {
            AgentField::Processed(value) => ("agent_processed", bool_value(*value)),
            AgentField::Processing(value) => ("agent_processing", bool_value(*value)),
            AgentField::ProcessingStarted(at) => {
                ("agent_processing_started", timestamp_value(*at))
            }
            AgentField::ProcessingCompleted(at) => {
                ("agent_processing_completed", timestamp_value(*at))
            }
            AgentField::ProcessingFailed(at) => ("agent_processing_failed", timestamp_value(*at)),
            AgentField::ProcessingError(message) => (
                "agent_processing_error",
                message
                    .as_ref()
                    .map(|message| SqlValue::Text(message.clone()))
                    .unwrap_or(SqlValue::Null),
            ),
            AgentField::Result(result) => (
                "agent_result",
                encode_result(session_id, result.as_ref())?
                    .map(SqlValue::Text)
                    .unwrap_or(SqlValue::Null),
            ),
            AgentField::IncrementAttempts => {
                assignments.push("agent_attempt_count = agent_attempt_count + 1".to_string());
                continue;
            }
        };
        assignments.push(format!("{} = ?", column));
        values.push(value);
    }

    Ok((assignments, values))
}

fn encode_result(
    session_id: &str,
    result: Option<&serde_json::Value>,
) -> Result<Option<String>, StoreError> {
    result
        .map(|value| {
            serde_json::to_string(value).map_err(|err| StoreError::Corrupt {
                session_id: session_id.to_string(),
                details: format!("Failed to serialize agent_result: {}", err),
            })
        })
        .transpose()
}

fn bool_value(value: bool) -> SqlValue {
    SqlValue::Integer(i64::from(value))
}

fn timestamp_value(at: DateTime<Utc>) -> SqlValue {
    SqlValue::Text(format_timestamp(at))
}

/// Fixed-width UTC form so lexical order in SQL matches chronological order.
fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_optional_timestamp(
    session_id: &str,
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>, StoreError> {
    value
        .map(|value| {
            DateTime::parse_from_rfc3339(&value)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|err| StoreError::Corrupt {
                    session_id: session_id.to_string(),
                    details: format!("Invalid timestamp {}: {}", value, err),
                })
        })
        .transpose()
}

fn ensure_sessions_columns(conn: &Connection) -> Result<(), StoreError> {
    let mut stmt = conn
        .prepare("PRAGMA table_info(sessions)")
        .map_err(StoreError::sqlite("Failed to read sessions schema"))?;
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(1))
        .map_err(StoreError::sqlite("Failed to read sessions schema rows"))?;

    let mut columns = Vec::new();
    for row in rows {
        columns.push(row.map_err(StoreError::sqlite("Failed to decode schema row"))?);
    }

    if !columns.iter().any(|name| name == "agent_attempt_count") {
        conn.execute(
            "ALTER TABLE sessions ADD COLUMN agent_attempt_count INTEGER NOT NULL DEFAULT 0",
            [],
        )
        .map_err(StoreError::sqlite("Failed to add agent_attempt_count column"))?;
    }

    Ok(())
}
