//! Append-only attendance ledger with duplicate-window suppression.

use crate::db::{from_micros, to_micros, Database, DbError};
use crate::types::{AttendanceEvent, AttendanceRow, Identity, RecordResult};
use crate::window::DuplicateWindow;
use chrono::{DateTime, Utc};
use rusqlite::{params, TransactionBehavior};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("no enrolled identity with key {0}")]
    UnknownIdentity(String),
    #[error("timestamp {attempted} for {identity_key} precedes its latest event at {latest}")]
    NonMonotonic {
        identity_key: String,
        latest: DateTime<Utc>,
        attempted: DateTime<Utc>,
    },
    #[error(transparent)]
    Db(#[from] DbError),
}

impl From<rusqlite::Error> for LedgerError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Db(e.into())
    }
}

/// Per-identity, time-ordered attendance log.
pub trait AttendanceLedger: Send + Sync {
    /// Append an event unless the identity already has one inside the
    /// duplicate window of `timestamp`. The check and the append are atomic.
    fn record(
        &self,
        identity: &Identity,
        timestamp: DateTime<Utc>,
    ) -> Result<RecordResult, LedgerError>;

    /// Events newest first, optionally restricted to one identity.
    fn history(&self, identity_key: Option<&str>) -> Result<Vec<AttendanceEvent>, LedgerError>;

    /// Events joined with their identity, newest first.
    fn report(&self, identity_key: Option<&str>) -> Result<Vec<AttendanceRow>, LedgerError>;

    fn window(&self) -> DuplicateWindow;
}

/// SQLite-backed attendance ledger
#[derive(Clone, Debug)]
pub struct SqliteAttendanceLedger {
    db: Database,
    window: DuplicateWindow,
}

impl SqliteAttendanceLedger {
    pub fn new(db: Database, window: DuplicateWindow) -> Self {
        Self { db, window }
    }
}

impl AttendanceLedger for SqliteAttendanceLedger {
    fn record(
        &self,
        identity: &Identity,
        timestamp: DateTime<Utc>,
    ) -> Result<RecordResult, LedgerError> {
        let key = identity.identity_key.as_str();
        let timestamp = from_micros(to_micros(timestamp))?;

        let mut conn = self.db.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let known: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM identities WHERE identity_key = ?1)",
            [key],
            |row| row.get(0),
        )?;
        if !known {
            return Err(LedgerError::UnknownIdentity(key.to_string()));
        }

        if let Some((start, end)) = self.window.bounds(timestamp) {
            let covered: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM attendance
                 WHERE identity_key = ?1 AND ts_us >= ?2 AND ts_us < ?3)",
                params![key, to_micros(start), to_micros(end)],
                |row| row.get(0),
            )?;
            if covered {
                tracing::debug!(
                    identity = key,
                    %timestamp,
                    "attendance suppressed inside duplicate window"
                );
                return Ok(RecordResult::Suppressed);
            }
        }

        let latest: Option<i64> = tx.query_row(
            "SELECT MAX(ts_us) FROM attendance WHERE identity_key = ?1",
            [key],
            |row| row.get(0),
        )?;
        if let Some(latest) = latest.map(from_micros).transpose()? {
            if latest > timestamp {
                return Err(LedgerError::NonMonotonic {
                    identity_key: key.to_string(),
                    latest,
                    attempted: timestamp,
                });
            }
        }

        tx.execute(
            "INSERT INTO attendance (identity_key, ts_us) VALUES (?1, ?2)",
            params![key, to_micros(timestamp)],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        tracing::info!(identity = key, event = id, %timestamp, "attendance recorded");

        Ok(RecordResult::Recorded(AttendanceEvent {
            id,
            identity_key: key.to_string(),
            timestamp,
        }))
    }

    fn history(&self, identity_key: Option<&str>) -> Result<Vec<AttendanceEvent>, LedgerError> {
        let rows = {
            let conn = self.db.lock()?;
            let mut stmt = conn.prepare(
                "SELECT id, identity_key, ts_us FROM attendance
                 WHERE ?1 IS NULL OR identity_key = ?1
                 ORDER BY ts_us DESC, id DESC",
            )?;
            let rows = stmt
                .query_map([identity_key], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, i64>(2)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        rows.into_iter()
            .map(|(id, identity_key, ts_us)| {
                Ok(AttendanceEvent {
                    id,
                    identity_key,
                    timestamp: from_micros(ts_us)?,
                })
            })
            .collect()
    }

    fn report(&self, identity_key: Option<&str>) -> Result<Vec<AttendanceRow>, LedgerError> {
        let rows = {
            let conn = self.db.lock()?;
            let mut stmt = conn.prepare(
                "SELECT i.identity_key, i.display_name, i.group_attribute, a.ts_us
                 FROM attendance a
                 JOIN identities i ON a.identity_key = i.identity_key
                 WHERE ?1 IS NULL OR a.identity_key = ?1
                 ORDER BY a.ts_us DESC, a.id DESC",
            )?;
            let rows = stmt
                .query_map([identity_key], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        rows.into_iter()
            .map(|(identity_key, display_name, group_attribute, ts_us)| {
                Ok(AttendanceRow {
                    identity_key,
                    display_name,
                    group_attribute,
                    timestamp: from_micros(ts_us)?,
                })
            })
            .collect()
    }

    fn window(&self) -> DuplicateWindow {
        self.window
    }
}
