//! DuckDB-based desired-state store
//!
//! One row per monitor record in table `monitors`. Timestamps are stored as
//! RFC 3339 strings, handles and counters as BIGINT.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use duckdb::{params, Connection, Row};
use parking_lot::Mutex;
use streamward_common::{MonitorId, MonitorRecord, MonitorStatus};
use uuid::Uuid;

const SELECT_COLUMNS: &str = "SELECT id, owner_id, is_privileged, channel, process_handle, status, \
     started_at, session_started_at, stopped_at, restarted_at, restart_count FROM monitors";

/// Storage layer wrapping DuckDB
#[derive(Clone)]
pub struct Storage {
    conn: Arc<Mutex<Connection>>,
}

/// Raw column values, converted to a record after the lock is released
struct MonitorRow {
    id: String,
    owner_id: String,
    is_privileged: bool,
    channel: String,
    process_handle: Option<i64>,
    status: String,
    started_at: String,
    session_started_at: Option<String>,
    stopped_at: Option<String>,
    restarted_at: Option<String>,
    restart_count: i64,
}

impl MonitorRow {
    fn from_row(row: &Row<'_>) -> duckdb::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            is_privileged: row.get(2)?,
            channel: row.get(3)?,
            process_handle: row.get(4)?,
            status: row.get(5)?,
            started_at: row.get(6)?,
            session_started_at: row.get(7)?,
            stopped_at: row.get(8)?,
            restarted_at: row.get(9)?,
            restart_count: row.get(10)?,
        })
    }

    fn into_record(self) -> Result<MonitorRecord> {
        let status: MonitorStatus = self.status.parse()?;
        // Only running and paused records own a pipeline
        let process_handle = self
            .process_handle
            .filter(|_| status.holds_handle())
            .map(u32::try_from)
            .transpose()
            .context("process handle out of range")?;
        Ok(MonitorRecord {
            id: Uuid::parse_str(&self.id).with_context(|| format!("bad id {}", self.id))?,
            owner_id: self.owner_id,
            is_privileged: self.is_privileged,
            channel: self.channel,
            process_handle,
            status,
            started_at: parse_time(&self.started_at)?,
            session_started_at: self.session_started_at.as_deref().map(parse_time).transpose()?,
            stopped_at: self.stopped_at.as_deref().map(parse_time).transpose()?,
            restarted_at: self.restarted_at.as_deref().map(parse_time).transpose()?,
            restart_count: u32::try_from(self.restart_count).unwrap_or(u32::MAX),
        })
    }
}

fn format_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("bad timestamp {value}"))?
        .with_timezone(&Utc))
}

impl Storage {
    /// Open a file-backed store, creating the parent directory if needed
    pub fn new(db_path: Option<&Path>) -> Result<Self> {
        let conn = match db_path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)
                        .context("Failed to create database directory")?;
                }
                Connection::open(path)
                    .with_context(|| format!("Failed to open database {}", path.display()))?
            }
            None => Connection::open_in_memory()?,
        };

        let storage = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        storage.initialize_schema()?;
        Ok(storage)
    }

    /// In-memory store
    pub fn in_memory() -> Result<Self> {
        Self::new(None)
    }

    fn initialize_schema(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS monitors (
                id VARCHAR PRIMARY KEY,
                owner_id VARCHAR NOT NULL,
                is_privileged BOOLEAN NOT NULL DEFAULT FALSE,
                channel VARCHAR NOT NULL,
                process_handle BIGINT,
                status VARCHAR NOT NULL,
                started_at VARCHAR NOT NULL,
                session_started_at VARCHAR,
                stopped_at VARCHAR,
                restarted_at VARCHAR,
                restart_count BIGINT NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_monitors_owner ON monitors(owner_id);
            CREATE INDEX IF NOT EXISTS idx_monitors_channel ON monitors(channel);
            "#,
        )?;
        Ok(())
    }

    /// Insert a new monitor record
    pub fn insert_monitor(&self, record: &MonitorRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO monitors (id, owner_id, is_privileged, channel, process_handle, status,
                started_at, session_started_at, stopped_at, restarted_at, restart_count)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                record.id.to_string(),
                record.owner_id,
                record.is_privileged,
                record.channel,
                record.process_handle.map(i64::from),
                record.status.as_str(),
                format_time(&record.started_at),
                record.session_started_at.as_ref().map(format_time),
                record.stopped_at.as_ref().map(format_time),
                record.restarted_at.as_ref().map(format_time),
                i64::from(record.restart_count),
            ],
        )
        .with_context(|| format!("Failed to insert monitor {}", record.id))?;
        Ok(())
    }

    /// Overwrite the mutable columns of a record; `false` if it no longer exists
    pub fn update_monitor(&self, record: &MonitorRecord) -> Result<bool> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            r#"
            UPDATE monitors SET
                is_privileged = ?,
                process_handle = ?,
                status = ?,
                started_at = ?,
                session_started_at = ?,
                stopped_at = ?,
                restarted_at = ?,
                restart_count = ?
            WHERE id = ?
            "#,
            params![
                record.is_privileged,
                record.process_handle.map(i64::from),
                record.status.as_str(),
                format_time(&record.started_at),
                record.session_started_at.as_ref().map(format_time),
                record.stopped_at.as_ref().map(format_time),
                record.restarted_at.as_ref().map(format_time),
                i64::from(record.restart_count),
                record.id.to_string(),
            ],
        )
        .with_context(|| format!("Failed to update monitor {}", record.id))?;
        Ok(updated > 0)
    }

    pub fn get_monitor(&self, id: &MonitorId) -> Result<Option<MonitorRecord>> {
        let mut records = self.query(&format!("{SELECT_COLUMNS} WHERE id = ?"), &[&id.to_string()])?;
        Ok(records.pop())
    }

    /// All records of an owner, newest first
    pub fn monitors_for_owner(&self, owner_id: &str) -> Result<Vec<MonitorRecord>> {
        self.query(
            &format!("{SELECT_COLUMNS} WHERE owner_id = ? ORDER BY started_at DESC"),
            &[&owner_id],
        )
    }

    /// All records for a channel across owners, newest first
    pub fn monitors_for_channel(&self, channel: &str) -> Result<Vec<MonitorRecord>> {
        self.query(
            &format!("{SELECT_COLUMNS} WHERE channel = ? ORDER BY started_at DESC"),
            &[&channel],
        )
    }

    pub fn monitors_with_status(&self, status: MonitorStatus) -> Result<Vec<MonitorRecord>> {
        self.query(
            &format!("{SELECT_COLUMNS} WHERE status = ? ORDER BY started_at DESC"),
            &[&status.as_str()],
        )
    }

    /// Records that should own a live pipeline (`running` or `paused`)
    pub fn active_monitors(&self) -> Result<Vec<MonitorRecord>> {
        self.query(
            &format!(
                "{SELECT_COLUMNS} WHERE status IN ('running', 'paused') ORDER BY started_at DESC"
            ),
            &[],
        )
    }

    pub fn all_monitors(&self) -> Result<Vec<MonitorRecord>> {
        self.query(&format!("{SELECT_COLUMNS} ORDER BY started_at DESC"), &[])
    }

    /// Delete a record; `false` if it was already gone
    pub fn delete_monitor(&self, id: &MonitorId) -> Result<bool> {
        let conn = self.conn.lock();
        let deleted = conn.execute("DELETE FROM monitors WHERE id = ?", params![id.to_string()])?;
        Ok(deleted > 0)
    }

    pub fn monitor_count(&self) -> Result<i64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM monitors", [], |row| row.get(0))?;
        Ok(count)
    }

    fn query(&self, sql: &str, params: &[&dyn duckdb::ToSql]) -> Result<Vec<MonitorRecord>> {
        let rows = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map(params, MonitorRow::from_row)?;
            let mut results = Vec::new();
            for row in rows {
                results.push(row?);
            }
            results
        };

        // A corrupt row must not hide the rest of the table from the sweeps
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let id = row.id.clone();
                match row.into_record() {
                    Ok(record) => Some(record),
                    Err(e) => {
                        tracing::warn!(record_id = %id, error = %e, "Skipping unreadable monitor row");
                        None
                    }
                }
            })
            .collect())
    }
}
