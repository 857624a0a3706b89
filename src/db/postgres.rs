//! PostgreSQL backend for the trust store.
//!
//! Pooled with deadpool; schema managed by refinery migrations embedded
//! from `migrations/`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Config as PoolConfig, Pool, Runtime};
use secrecy::ExposeSecret;
use tokio_postgres::error::SqlState;
use tokio_postgres::{NoTls, Row};

use crate::config::DatabaseConfig;
use crate::db::TrustStore;
use crate::error::DatabaseError;
use crate::registry::{TrustRecord, TrustStatus};

const TRUST_COLUMNS: &str = "\
    team_id, role_arn, external_id, status, stack_name, failure_reason, issued_at, updated_at";

/// PostgreSQL trust store.
pub struct PgTrustStore {
    pool: Pool,
}

impl PgTrustStore {
    /// Create a pool from configuration and check that a connection can be made.
    pub async fn new(config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        let url = config
            .url
            .as_ref()
            .ok_or_else(|| DatabaseError::Pool("DATABASE_URL is not set".to_string()))?;

        let mut cfg = PoolConfig::new();
        cfg.url = Some(url.expose_secret().to_string());
        cfg.pool = Some(deadpool_postgres::PoolConfig {
            max_size: config.pool_size,
            ..Default::default()
        });

        let pool = cfg.create_pool(Some(Runtime::Tokio1), NoTls)?;
        let _ = pool.get().await?;
        Ok(Self { pool })
    }

    async fn query_opt(
        &self,
        sql: &str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
    ) -> Result<Option<TrustRecord>, DatabaseError> {
        let client = self.pool.get().await?;
        client
            .query_opt(sql, params)
            .await?
            .map(|row| row_to_trust_record(&row))
            .transpose()
    }
}

#[async_trait]
impl TrustStore for PgTrustStore {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        use refinery::embed_migrations;
        embed_migrations!("migrations");

        let mut client = self.pool.get().await?;
        migrations::runner()
            .run_async(&mut **client)
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;
        Ok(())
    }

    async fn get_trust_record(&self, team_id: &str) -> Result<Option<TrustRecord>, DatabaseError> {
        self.query_opt(
            &format!("SELECT {TRUST_COLUMNS} FROM trust_records WHERE team_id = $1"),
            &[&team_id],
        )
        .await
    }

    async fn find_by_stack_name(
        &self,
        stack_name: &str,
    ) -> Result<Option<TrustRecord>, DatabaseError> {
        self.query_opt(
            &format!(
                "SELECT {TRUST_COLUMNS} FROM trust_records \
                 WHERE stack_name = $1 ORDER BY issued_at DESC LIMIT 1"
            ),
            &[&stack_name],
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
        let client = self.pool.get().await?;
        client
            .execute(
                r#"
                INSERT INTO trust_records
                    (team_id, external_id, status, stack_name, issued_at, updated_at)
                VALUES ($1, $2, 'pending', $3, $4, $4)
                ON CONFLICT (team_id) DO UPDATE SET
                    external_id = EXCLUDED.external_id,
                    status = 'pending',
                    stack_name = EXCLUDED.stack_name,
                    failure_reason = NULL,
                    issued_at = EXCLUDED.issued_at,
                    updated_at = EXCLUDED.updated_at
                "#,
                &[&team_id, &external_id, &stack_name, &issued_at],
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
        let client = self.pool.get().await?;
        let changed = client
            .execute(
                r#"
                UPDATE trust_records
                SET status = 'bound', role_arn = $3, updated_at = $4
                WHERE team_id = $1 AND external_id = $2 AND status = 'pending'
                "#,
                &[&team_id, &external_id, &role_arn, &bound_at],
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
        let client = self.pool.get().await?;
        let changed = client
            .execute(
                r#"
                UPDATE trust_records
                SET status = 'failed', failure_reason = $3, updated_at = $4
                WHERE team_id = $1 AND status = 'pending'
                  AND ($2::text IS NULL OR external_id = $2)
                "#,
                &[&team_id, &external_id, &reason, &failed_at],
            )
            .await
            .map_err(map_write_error)?;
        Ok(changed == 1)
    }
}

fn row_to_trust_record(row: &Row) -> Result<TrustRecord, DatabaseError> {
    let status_raw: String = row.try_get("status")?;
    let status = TrustStatus::from_db(&status_raw)
        .ok_or_else(|| DatabaseError::Query(format!("unknown trust status: {status_raw:?}")))?;

    Ok(TrustRecord {
        team_id: row.try_get("team_id")?,
        role_arn: row.try_get("role_arn")?,
        external_id: row.try_get("external_id")?,
        status,
        stack_name: row.try_get("stack_name")?,
        failure_reason: row.try_get("failure_reason")?,
        issued_at: row.try_get("issued_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn map_write_error(e: tokio_postgres::Error) -> DatabaseError {
    if e.code() == Some(&SqlState::UNIQUE_VIOLATION) {
        DatabaseError::Constraint(e.to_string())
    } else {
        DatabaseError::Postgres(e)
    }
}
