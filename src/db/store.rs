//! SQLite store for one tenant's isolated data.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),
    #[error("Not found")]
    NotFound,
    #[error("Connection lock poisoned")]
    Poisoned,
}

/// Tables holding append-only time-series rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeSeriesTable {
    ServerSnapshots,
    RunningQuerySnapshots,
    ActivityLog,
}

impl TimeSeriesTable {
    pub const ALL: [TimeSeriesTable; 3] = [
        TimeSeriesTable::ServerSnapshots,
        TimeSeriesTable::RunningQuerySnapshots,
        TimeSeriesTable::ActivityLog,
    ];

    pub fn table(&self) -> &'static str {
        match self {
            TimeSeriesTable::ServerSnapshots => "server_snapshots",
            TimeSeriesTable::RunningQuerySnapshots => "running_query_snapshots",
            TimeSeriesTable::ActivityLog => "activity_log",
        }
    }

    fn time_column(&self) -> &'static str {
        match self {
            TimeSeriesTable::ActivityLog => "created_at",
            _ => "collected_at",
        }
    }
}

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) a tenant database and apply the schema.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA journal_mode = WAL;")?;
        conn.execute_batch(include_str!("../../migrations/tenant/000001_init.up.sql"))
            .map_err(|e| DbError::Migration(format!("Tenant migration 1 failed: {}", e)))?;
        Ok(())
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    // --- Settings ---

    /// Read a JSON setting, if present.
    pub fn get_setting(&self, key: &str) -> Result<Option<serde_json::Value>, DbError> {
        let conn = self.conn()?;
        let raw: Option<String> = conn
            .query_row("SELECT value FROM settings WHERE key = ?1", params![key], |row| row.get(0))
            .optional()?;
        match raw {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    /// Integer setting with a fallback.
    pub fn get_setting_i64(&self, key: &str, default: i64) -> Result<i64, DbError> {
        Ok(self
            .get_setting(key)?
            .and_then(|v| v.as_i64())
            .unwrap_or(default))
    }

    pub fn get_setting_f64(&self, key: &str, default: f64) -> Result<f64, DbError> {
        Ok(self
            .get_setting(key)?
            .and_then(|v| v.as_f64())
            .unwrap_or(default))
    }

    pub fn set_setting(&self, key: &str, value: &serde_json::Value) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, serde_json::to_string(value)?, fmt_db_time(Utc::now())],
        )?;
        Ok(())
    }

    // --- Time-series cleanup ---

    /// Delete up to `batch_size` rows older than `cutoff` from `table`.
    ///
    /// One statement per batch, so a single call never holds a write lock
    /// over more than `batch_size` rows.
    pub fn delete_batch_before(
        &self,
        table: TimeSeriesTable,
        cutoff: DateTime<Utc>,
        batch_size: usize,
    ) -> Result<usize, DbError> {
        let conn = self.conn()?;
        let sql = format!(
            "DELETE FROM {t} WHERE id IN (
                SELECT id FROM {t} WHERE {col} < ?1 ORDER BY id LIMIT ?2
             )",
            t = table.table(),
            col = table.time_column()
        );
        let limit = i64::try_from(batch_size).unwrap_or(i64::MAX);
        let deleted = conn.execute(&sql, params![fmt_db_time(cutoff), limit])?;
        Ok(deleted)
    }

    /// Number of rows currently in `table`.
    pub fn count_rows(&self, table: TimeSeriesTable) -> Result<i64, DbError> {
        let conn = self.conn()?;
        let sql = format!("SELECT COUNT(*) FROM {}", table.table());
        Ok(conn.query_row(&sql, [], |row| row.get(0))?)
    }
}

/// Format a timestamp for storage.
pub fn fmt_db_time(dt: DateTime<Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S%.9f").to_string()
}

pub(crate) fn fmt_opt_time(dt: Option<DateTime<Utc>>) -> Option<String> {
    dt.map(fmt_db_time)
}

/// Parse a datetime string from the database.
pub fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [
        "%Y-%m-%d %H:%M:%S%.9f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    None
}

// --- Row decoding helpers shared by the table modules ---

pub(crate) fn time_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    parse_db_time(&s).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("invalid timestamp {:?}", s).into(),
        )
    })
}

pub(crate) fn opt_time_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let s: Option<String> = row.get(idx)?;
    Ok(s.as_deref().and_then(parse_db_time))
}

pub(crate) fn enum_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let s: String = row.get(idx)?;
    s.parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn json_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<serde_json::Value> {
    let s: String = row.get(idx)?;
    serde_json::from_str(&s)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn opt_json_col(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<serde_json::Value>> {
    let s: Option<String> = row.get(idx)?;
    match s {
        Some(s) => serde_json::from_str(&s)
            .map(Some)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))),
        None => Ok(None),
    }
}
