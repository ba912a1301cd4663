//! Relational metadata store.
//!
//! Embedded SQLite behind a single connection handle. Invariants that span
//! rows are enforced here, at the write boundary: unique live fingerprint
//! per owner, contiguous version sequences, at most one non-terminal
//! analysis per version, at most one active monitor job per document, and
//! the analysis state machine (transitions are conditional updates, so they
//! linearize at the database).
//!
//! All multi-row writes that cross entities run inside one transaction.

mod analyses;
mod audit;
mod compliance;
mod documents;
mod jobs;
mod purge;
mod reads;
mod rules;
mod schema;

pub use analyses::{AnalysisPatch, NewFinding};
pub use documents::NewDocument;
pub(crate) use documents::NewVersion;
pub use purge::{PurgeReport, PurgeService};
pub use reads::CachedReads;

use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::Connection;

use crate::error::{Error, Result};

/// Handle to the metadata database.
pub struct MetadataStore {
    conn: Mutex<Connection>,
}

impl MetadataStore {
    /// In-memory database; used by tests and single-process runs.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    /// On-disk database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        // The journal_mode pragma returns a row, so query it instead of
        // executing it.
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(schema::SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }
}

// ─── Column codecs ───────────────────────────────────────────────────────────

/// Fixed-width RFC 3339 so that lexicographic SQL comparisons order
/// timestamps correctly.
pub(crate) fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

pub(crate) fn opt_ts(dt: Option<DateTime<Utc>>) -> Option<String> {
    dt.map(ts)
}

pub(crate) fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| Error::Storage(format!("bad timestamp {s:?}: {e}")))
}

pub(crate) fn parse_opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.map(|s| parse_ts(&s)).transpose()
}

pub(crate) fn parse_uuid(s: &str) -> Result<uuid::Uuid> {
    uuid::Uuid::parse_str(s).map_err(|e| Error::Storage(format!("bad uuid {s:?}: {e}")))
}

pub(crate) fn parse_opt_uuid(s: Option<String>) -> Result<Option<uuid::Uuid>> {
    s.map(|s| parse_uuid(&s)).transpose()
}

pub(crate) fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

pub(crate) fn from_json<T: serde::de::DeserializeOwned>(s: &str) -> Result<T> {
    Ok(serde_json::from_str(s)?)
}

pub(crate) fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}
