//! Trust record persistence.
//!
//! Every backend implements [`TrustStore`]. State transitions are expressed
//! as conditional writes so that two concurrent callers can never both win:
//! the registry reads, decides, then asks the store to apply the change only
//! if the row still looks the way it did.

#[cfg(feature = "libsql")]
pub mod libsql;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::{DatabaseBackend, DatabaseConfig};
use crate::error::DatabaseError;
use crate::registry::TrustRecord;

/// Backend-agnostic storage for trust records.
#[async_trait]
pub trait TrustStore: Send + Sync {
    /// Create tables and indexes if they are missing.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    async fn get_trust_record(&self, team_id: &str) -> Result<Option<TrustRecord>, DatabaseError>;

    /// Most recently issued record whose launch used `stack_name`.
    async fn find_by_stack_name(
        &self,
        stack_name: &str,
    ) -> Result<Option<TrustRecord>, DatabaseError>;

    /// Insert or overwrite the team's correlation slot with a fresh PENDING token.
    ///
    /// Keeps any previously granted `role_arn`. Returns
    /// [`DatabaseError::Constraint`] if `external_id` is already in use.
    async fn upsert_pending(
        &self,
        team_id: &str,
        external_id: &str,
        stack_name: Option<&str>,
        issued_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// PENDING -> BOUND, only if the row still holds `external_id`.
    ///
    /// Returns whether a row changed.
    async fn bind_pending(
        &self,
        team_id: &str,
        external_id: &str,
        role_arn: &str,
        bound_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// PENDING -> FAILED. When `external_id` is given the row must still hold it.
    ///
    /// Returns whether a row changed.
    async fn fail_pending(
        &self,
        team_id: &str,
        external_id: Option<&str>,
        reason: &str,
        failed_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;
}

/// Open the configured backend and bring its schema up to date.
pub async fn connect_from_config(
    config: &DatabaseConfig,
) -> Result<Arc<dyn TrustStore>, DatabaseError> {
    let store: Arc<dyn TrustStore> = match config.backend {
        #[cfg(feature = "libsql")]
        DatabaseBackend::LibSql => {
            Arc::new(self::libsql::LibSqlTrustStore::new_local(&config.libsql_path).await?)
        }
        #[cfg(feature = "postgres")]
        DatabaseBackend::Postgres => Arc::new(self::postgres::PgTrustStore::new(config).await?),
        DatabaseBackend::Memory => {
            tracing::warn!("Using in-memory trust store; records are lost on restart");
            Arc::new(memory::MemoryTrustStore::new())
        }
        #[allow(unreachable_patterns)]
        other => return Err(DatabaseError::BackendUnavailable(other.to_string())),
    };

    store.run_migrations().await?;
    tracing::info!(backend = %config.backend, "Trust store ready");
    Ok(store)
}
