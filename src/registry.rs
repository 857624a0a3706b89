//! Trust registry: the per-team correlation slot.
//!
//! A team's record moves PENDING -> BOUND when the phone-home callback
//! presents the live external id, or PENDING -> FAILED when a failure is
//! reported. Issuing a new token always resets the slot to PENDING and
//! invalidates whatever token was there before.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::Serialize;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::db::TrustStore;
use crate::error::{DatabaseError, RegistryError};

/// Random bytes per correlation token (256 bits).
const TOKEN_BYTES: usize = 32;

/// Attempts before giving up on a unique token.
const ISSUE_ATTEMPTS: usize = 3;

/// Binding state of a team's cross-account trust.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrustStatus {
    /// No launch yet. Never stored; reported for teams without a record.
    Unbound,
    Pending,
    Bound,
    Failed,
}

impl TrustStatus {
    /// Column value used by the SQL backends.
    pub fn as_db(&self) -> &'static str {
        match self {
            Self::Unbound => "unbound",
            Self::Pending => "pending",
            Self::Bound => "bound",
            Self::Failed => "failed",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "unbound" => Some(Self::Unbound),
            "pending" => Some(Self::Pending),
            "bound" => Some(Self::Bound),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for TrustStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unbound => write!(f, "UNBOUND"),
            Self::Pending => write!(f, "PENDING"),
            Self::Bound => write!(f, "BOUND"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// One team's correlation slot.
#[derive(Clone, PartialEq)]
pub struct TrustRecord {
    pub team_id: String,
    pub role_arn: Option<String>,
    /// Token minted at the last launch. Kept after binding for audit.
    pub external_id: String,
    pub status: TrustStatus,
    /// Stack name generated for the last launch.
    pub stack_name: Option<String>,
    pub failure_reason: Option<String>,
    pub issued_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl std::fmt::Debug for TrustRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustRecord")
            .field("team_id", &self.team_id)
            .field("role_arn", &self.role_arn)
            .field("external_id", &token_fingerprint(&self.external_id))
            .field("status", &self.status)
            .field("stack_name", &self.stack_name)
            .field("failure_reason", &self.failure_reason)
            .field("issued_at", &self.issued_at)
            .field("updated_at", &self.updated_at)
            .finish()
    }
}

/// Result of a successful [`TrustRegistry::bind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindOutcome {
    /// PENDING -> BOUND happened on this call.
    Bound,
    /// The same token and role were already bound (redelivered callback).
    AlreadyBound,
}

/// Short, non-reversible tag for a token, safe to log.
pub fn token_fingerprint(token: &str) -> String {
    let digest = format!("{:x}", Sha256::digest(token.as_bytes()));
    digest[..8].to_string()
}

fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn tokens_match(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Durable team -> trust mapping plus the correlation token protocol.
pub struct TrustRegistry {
    store: Arc<dyn TrustStore>,
    token_ttl: Option<Duration>,
}

impl TrustRegistry {
    pub fn new(store: Arc<dyn TrustStore>, token_ttl: Option<Duration>) -> Self {
        Self { store, token_ttl }
    }

    pub async fn get(&self, team_id: &str) -> Result<TrustRecord, RegistryError> {
        self.store
            .get_trust_record(team_id)
            .await?
            .ok_or_else(|| RegistryError::NotFound {
                team_id: team_id.to_string(),
            })
    }

    /// Owner of the most recent launch that used `stack_name`.
    pub async fn find_by_stack_name(
        &self,
        stack_name: &str,
    ) -> Result<Option<TrustRecord>, RegistryError> {
        Ok(self.store.find_by_stack_name(stack_name).await?)
    }

    /// Mint a fresh token and make it the team's only live one.
    pub async fn issue_token(&self, team_id: &str) -> Result<String, RegistryError> {
        self.issue(team_id, None).await
    }

    /// Like [`issue_token`](Self::issue_token), also recording the stack name
    /// the launch link will create.
    pub async fn issue_token_for_launch(
        &self,
        team_id: &str,
        stack_name: &str,
    ) -> Result<String, RegistryError> {
        self.issue(team_id, Some(stack_name)).await
    }

    async fn issue(&self, team_id: &str, stack_name: Option<&str>) -> Result<String, RegistryError> {
        let mut last_err = None;
        for _ in 0..ISSUE_ATTEMPTS {
            let token = generate_token();
            match self
                .store
                .upsert_pending(team_id, &token, stack_name, Utc::now())
                .await
            {
                Ok(()) => {
                    tracing::info!(
                        team_id,
                        token = %token_fingerprint(&token),
                        stack_name = stack_name.unwrap_or_default(),
                        "Issued correlation token"
                    );
                    return Ok(token);
                }
                Err(DatabaseError::Constraint(msg)) => {
                    tracing::warn!(team_id, "Correlation token collision, regenerating");
                    last_err = Some(DatabaseError::Constraint(msg));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(last_err
            .unwrap_or_else(|| DatabaseError::Constraint("token collision".to_string()))
            .into())
    }

    /// Bind the team's role if `external_id` is its live PENDING token.
    ///
    /// Re-binding an already BOUND record with the same token and role is a
    /// success. Anything else that does not match is a [`RegistryError::TokenMismatch`].
    pub async fn bind(
        &self,
        team_id: &str,
        external_id: &str,
        role_arn: &str,
    ) -> Result<BindOutcome, RegistryError> {
        let record = self.get(team_id).await.inspect_err(|e| {
            if e.is_correlation_error() {
                tracing::warn!(team_id, token = %token_fingerprint(external_id), "Bind for unknown team");
            }
        })?;

        match self.classify_bind(&record, external_id, role_arn) {
            Ok(Some(outcome)) => return Ok(outcome),
            Ok(None) => {}
            Err(e @ RegistryError::TokenExpired { .. }) => {
                // Right token, too late. The attempt is over.
                self.store
                    .fail_pending(team_id, Some(external_id), "correlation token expired", Utc::now())
                    .await?;
                return Err(e);
            }
            Err(e) => return Err(e),
        }

        if self
            .store
            .bind_pending(team_id, external_id, role_arn, Utc::now())
            .await?
        {
            tracing::info!(team_id, role_arn, "Trust bound");
            return Ok(BindOutcome::Bound);
        }

        // Lost a race: the slot was rotated, failed, or bound by a concurrent
        // delivery of the same callback. Decide on what is there now.
        let current = self.get(team_id).await?;
        match self.classify_bind(&current, external_id, role_arn)? {
            Some(outcome) => Ok(outcome),
            None => Err(self.mismatch(team_id, external_id)),
        }
    }

    /// Decide a bind without writing. `None` means the CAS should be attempted.
    fn classify_bind(
        &self,
        record: &TrustRecord,
        external_id: &str,
        role_arn: &str,
    ) -> Result<Option<BindOutcome>, RegistryError> {
        if !tokens_match(&record.external_id, external_id) {
            return Err(self.mismatch(&record.team_id, external_id));
        }
        match record.status {
            TrustStatus::Bound if record.role_arn.as_deref() == Some(role_arn) => {
                tracing::debug!(team_id = %record.team_id, "Duplicate bind ignored");
                Ok(Some(BindOutcome::AlreadyBound))
            }
            TrustStatus::Pending => {
                self.check_not_expired(record)?;
                Ok(None)
            }
            _ => Err(self.mismatch(&record.team_id, external_id)),
        }
    }

    /// PENDING -> FAILED. Leaves BOUND and FAILED records alone.
    ///
    /// Returns the status the record has afterwards.
    pub async fn mark_failed(
        &self,
        team_id: &str,
        reason: &str,
    ) -> Result<TrustStatus, RegistryError> {
        if self
            .store
            .fail_pending(team_id, None, reason, Utc::now())
            .await?
        {
            tracing::info!(team_id, reason, "Trust marked failed");
            return Ok(TrustStatus::Failed);
        }
        Ok(self.get(team_id).await?.status)
    }

    /// Failure reported by the phone-home resource itself, authenticated by its token.
    pub async fn report_failure(
        &self,
        team_id: &str,
        external_id: &str,
        reason: &str,
    ) -> Result<(), RegistryError> {
        let record = self.get(team_id).await?;
        if !tokens_match(&record.external_id, external_id) {
            return Err(self.mismatch(team_id, external_id));
        }
        match record.status {
            TrustStatus::Failed => return Ok(()),
            TrustStatus::Pending => self.check_not_expired(&record)?,
            _ => return Err(self.mismatch(team_id, external_id)),
        }

        if self
            .store
            .fail_pending(team_id, Some(external_id), reason, Utc::now())
            .await?
        {
            tracing::info!(team_id, reason, "Trust marked failed by callback");
            return Ok(());
        }
        let current = self.get(team_id).await?;
        if current.status == TrustStatus::Failed && tokens_match(&current.external_id, external_id)
        {
            Ok(())
        } else {
            Err(self.mismatch(team_id, external_id))
        }
    }

    fn check_not_expired(&self, record: &TrustRecord) -> Result<(), RegistryError> {
        let Some(ttl) = self.token_ttl else {
            return Ok(());
        };
        let age = Utc::now()
            .signed_duration_since(record.issued_at)
            .to_std()
            .unwrap_or_default();
        if age > ttl {
            tracing::warn!(
                team_id = %record.team_id,
                token = %token_fingerprint(&record.external_id),
                age_secs = age.as_secs(),
                "Correlation token expired"
            );
            return Err(RegistryError::TokenExpired {
                team_id: record.team_id.clone(),
                ttl,
            });
        }
        Ok(())
    }

    fn mismatch(&self, team_id: &str, presented: &str) -> RegistryError {
        tracing::warn!(
            team_id,
            token = %token_fingerprint(presented),
            "Correlation token rejected"
        );
        RegistryError::TokenMismatch {
            team_id: team_id.to_string(),
        }
    }
}
