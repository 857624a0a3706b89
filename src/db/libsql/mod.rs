//! libSQL/Turso backend for the trust store.
//!
//! Embedded SQLite-compatible database using Turso's libSQL fork. Two modes:
//! - Local embedded (file-based, no server needed)
//! - In-memory (for testing)

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase};

use crate::db::TrustStore;
use crate::error::DatabaseError;
use crate::registry::{TrustRecord, TrustStatus};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS trust_records (
    team_id TEXT PRIMARY KEY,
    role_arn TEXT,
    external_id TEXT NOT NULL,
    status TEXT NOT NULL,
    stack_name TEXT,
    failure_reason TEXT,
    issued_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_trust_records_external_id ON trust_records(external_id);
CREATE INDEX IF NOT EXISTS idx_trust_records_stack_name ON trust_records(stack_name);
"#;

/// Explicit column list (matches positional access in `row_to_trust_record`).
const TRUST_COLUMNS: &str = "\
    team_id, role_arn, external_id, status, stack_name, failure_reason, issued_at, updated_at";

/// libSQL trust store.
pub struct LibSqlTrustStore {
    db: Arc<LibSqlDatabase>,
}

impl LibSqlTrustStore {
    /// Create a new local embedded database.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {}", e))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {}", e)))?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Create a new in-memory database (for testing).
    ///
    /// Each connection to `:memory:` sees its own database, so this is only
    /// useful for single-connection checks.
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {}", e))
            })?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Create a new connection to the database.
    ///
    /// Sets `PRAGMA busy_timeout = 5000` on every connection so concurrent
    /// writers wait up to 5 seconds instead of failing instantly with
    /// "database is locked".
    pub async fn connect(&self) -> Result<Connection, DatabaseError> {
        let conn = self
            .db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {}", e)))?;
        conn.query("PRAGMA busy_timeout = 5000", ())
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to set busy_timeout: {}", e)))?;
        Ok(conn)
    }

    async fn query_one(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Option<TrustRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn.query(sql, params).await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_trust_record(&row)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl TrustStore for LibSqlTrustStore {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let conn = self.connect().await?;
        // WAL mode persists in the database file: all future connections benefit.
        conn.query("PRAGMA journal_mode=WAL", ())
            .await
            .map_err(|e| DatabaseError::Migration(format!("Failed to enable WAL mode: {}", e)))?;
        conn.execute_batch(SCHEMA)
            .await
            .map_err(|e| DatabaseError::Migration(format!("libSQL migration failed: {}", e)))?;
        Ok(())
    }

    async fn get_trust_record(&self, team_id: &str) -> Result<Option<TrustRecord>, DatabaseError> {
        self.query_one(
            &format!("SELECT {TRUST_COLUMNS} FROM trust_records WHERE team_id = ?1"),
            libsql::params![team_id],
        )
        .await
    }

    async fn find_by_stack_name(
        &self,
        stack_name: &str,
    ) -> Result<Option<TrustRecord>, DatabaseError> {
        self.query_one(
            &format!(
                "SELECT {TRUST_COLUMNS} FROM trust_records \
                 WHERE stack_name = ?1 ORDER BY issued_at DESC LIMIT 1"
            ),
            libsql::params![stack_name],
        )
        .await
    }

    async fn upsert_pending(
        &self,
        team_id: &str,
        external_id: &str,
        stack_name: Option<&str>,
        issued_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let conn = self.connect().await?;
        let ts = fmt_ts(&issued_at);
        conn.execute(
            r#"
            INSERT INTO trust_records
                (team_id, external_id, status, stack_name, issued_at, updated_at)
            VALUES (?1, ?2, 'pending', ?3, ?4, ?4)
            ON CONFLICT (team_id) DO UPDATE SET
                external_id = excluded.external_id,
                status = 'pending',
                stack_name = excluded.stack_name,
                failure_reason = NULL,
                issued_at = excluded.issued_at,
                updated_at = excluded.updated_at
            "#,
            libsql::params![team_id, external_id, opt_text(stack_name), ts],
        )
        .await
        .map_err(map_write_error)?;
        Ok(())
    }

    async fn bind_pending(
        &self,
        team_id: &str,
        external_id: &str,
        role_arn: &str,
        bound_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let conn = self.connect().await?;
        let changed = conn
            .execute(
                r#"
                UPDATE trust_records
                SET status = 'bound', role_arn = ?3, updated_at = ?4
                WHERE team_id = ?1 AND external_id = ?2 AND status = 'pending'
                "#,
                libsql::params![team_id, external_id, role_arn, fmt_ts(&bound_at)],
            )
            .await
            .map_err(map_write_error)?;
        Ok(changed == 1)
    }

    async fn fail_pending(
        &self,
        team_id: &str,
        external_id: Option<&str>,
        reason: &str,
        failed_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let conn = self.connect().await?;
        let changed = conn
            .execute(
                r#"
                UPDATE trust_records
                SET status = 'failed', failure_reason = ?3, updated_at = ?4
                WHERE team_id = ?1 AND status = 'pending'
                  AND (?2 IS NULL OR external_id = ?2)
                "#,
                libsql::params![team_id, opt_text(external_id), reason, fmt_ts(&failed_at)],
            )
            .await
            .map_err(map_write_error)?;
        Ok(changed == 1)
    }
}

// ==================== Helper functions ====================

fn row_to_trust_record(row: &libsql::Row) -> Result<TrustRecord, DatabaseError> {
    let status_raw = get_text(row, 3);
    let status = TrustStatus::from_db(&status_raw)
        .ok_or_else(|| DatabaseError::Query(format!("unknown trust status: {status_raw:?}")))?;

    Ok(TrustRecord {
        team_id: get_text(row, 0),
        role_arn: get_opt_text(row, 1),
        external_id: get_text(row, 2),
        status,
        stack_name: get_opt_text(row, 4),
        failure_reason: get_opt_text(row, 5),
        issued_at: parse_timestamp(&get_text(row, 6)).map_err(DatabaseError::Query)?,
        updated_at: parse_timestamp(&get_text(row, 7)).map_err(DatabaseError::Query)?,
    })
}

fn map_write_error(e: libsql::Error) -> DatabaseError {
    let message = e.to_string();
    if message.contains("UNIQUE constraint failed") {
        DatabaseError::Constraint(message)
    } else {
        DatabaseError::LibSql(e)
    }
}

/// Parse an ISO-8601 timestamp string from SQLite into DateTime<Utc>.
///
/// Accepts RFC 3339 (our canonical write format) and SQLite's naive
/// `datetime()` output with or without fractional seconds.
pub(crate) fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(ndt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(ndt.and_utc());
    }
    if let Ok(ndt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Ok(ndt.and_utc());
    }
    Err(format!("unparseable timestamp: {:?}", s))
}

/// Format a DateTime<Utc> for SQLite storage (RFC 3339 with microsecond precision).
///
/// Fixed-width so that `ORDER BY issued_at` sorts chronologically.
pub(crate) fn fmt_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

/// Extract a text column from a libsql Row, returning empty string for NULL.
fn get_text(row: &libsql::Row, idx: i32) -> String {
    row.get::<String>(idx).unwrap_or_default()
}

/// Extract an optional text column. Returns None for SQL NULL.
fn get_opt_text(row: &libsql::Row, idx: i32) -> Option<String> {
    row.get::<String>(idx).ok()
}

/// Convert an `Option<&str>` to a `libsql::Value` (Text or Null).
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}
