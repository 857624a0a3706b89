//! Process-local trust store.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::db::TrustStore;
use crate::error::DatabaseError;
use crate::registry::{TrustRecord, TrustStatus};

/// Trust store kept in a `HashMap`. Lost on restart.
#[derive(Default)]
pub struct MemoryTrustStore {
    records: Mutex<HashMap<String, TrustRecord>>,
}

impl MemoryTrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, TrustRecord>>, DatabaseError> {
        self.records
            .lock()
            .map_err(|_| DatabaseError::Pool("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl TrustStore for MemoryTrustStore {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        Ok(())
    }

    async fn get_trust_record(&self, team_id: &str) -> Result<Option<TrustRecord>, DatabaseError> {
        Ok(self.lock()?.get(team_id).cloned())
    }

    async fn find_by_stack_name(
        &self,
        stack_name: &str,
    ) -> Result<Option<TrustRecord>, DatabaseError> {
        Ok(self
            .lock()?
            .values()
            .filter(|r| r.stack_name.as_deref() == Some(stack_name))
            .max_by_key(|r| r.issued_at)
            .cloned())
    }

    async fn upsert_pending(
        &self,
        team_id: &str,
        external_id: &str,
        stack_name: Option<&str>,
        issued_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let mut records = self.lock()?;
        if records
            .values()
            .any(|r| r.external_id == external_id && r.team_id != team_id)
        {
            return Err(DatabaseError::Constraint(
                "trust_records.external_id must be unique".to_string(),
            ));
        }

        let role_arn = records.get(team_id).and_then(|r| r.role_arn.clone());
        records.insert(
            team_id.to_string(),
            TrustRecord {
                team_id: team_id.to_string(),
                role_arn,
                external_id: external_id.to_string(),
                status: TrustStatus::Pending,
                stack_name: stack_name.map(str::to_string),
                failure_reason: None,
                issued_at,
                updated_at: issued_at,
            },
        );
        Ok(())
    }

    async fn bind_pending(
        &self,
        team_id: &str,
        external_id: &str,
        role_arn: &str,
        bound_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let mut records = self.lock()?;
        match records.get_mut(team_id) {
            Some(r) if r.status == TrustStatus::Pending && r.external_id == external_id => {
                r.status = TrustStatus::Bound;
                r.role_arn = Some(role_arn.to_string());
                r.updated_at = bound_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn fail_pending(
        &self,
        team_id: &str,
        external_id: Option<&str>,
        reason: &str,
        failed_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let mut records = self.lock()?;
        match records.get_mut(team_id) {
            Some(r)
                if r.status == TrustStatus::Pending
                    && external_id.is_none_or(|id| r.external_id == id) =>
            {
                r.status = TrustStatus::Failed;
                r.failure_reason = Some(reason.to_string());
                r.updated_at = failed_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_keeps_role_arn_and_resets_status() {
        let store = MemoryTrustStore::new();
        let now = Utc::now();
        store.upsert_pending("t1", "tok-a", Some("s-1"), now).await.unwrap();
        assert!(store.bind_pending("t1", "tok-a", "arn:aws:iam::1:role/x", now).await.unwrap());

        store.upsert_pending("t1", "tok-b", Some("s-2"), now).await.unwrap();
        let record = store.get_trust_record("t1").await.unwrap().unwrap();
        assert_eq!(record.status, TrustStatus::Pending);
        assert_eq!(record.external_id, "tok-b");
        assert_eq!(record.role_arn.as_deref(), Some("arn:aws:iam::1:role/x"));
    }

    #[tokio::test]
    async fn external_id_is_unique_across_teams() {
        let store = MemoryTrustStore::new();
        let now = Utc::now();
        store.upsert_pending("t1", "tok", None, now).await.unwrap();
        let err = store.upsert_pending("t2", "tok", None, now).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Constraint(_)));
    }
}
