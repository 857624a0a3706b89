//! Error types for stackrelay.

use std::time::Duration;

use serde::Serialize;

/// Top-level error type for the service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Callback error: {0}")]
    Callback(#[from] CallbackError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("Launch error: {0}")]
    Launch(#[from] LaunchError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Backend {0} is not compiled into this build")]
    BackendUnavailable(String),

    #[cfg(feature = "postgres")]
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[cfg(feature = "postgres")]
    #[error("Pool build error: {0}")]
    PoolBuild(#[from] deadpool_postgres::CreatePoolError),

    #[cfg(feature = "postgres")]
    #[error("Pool runtime error: {0}")]
    PoolRuntime(#[from] deadpool_postgres::PoolError),

    #[cfg(feature = "libsql")]
    #[error("LibSQL error: {0}")]
    LibSql(#[from] libsql::Error),
}

/// Trust registry outcomes that are not successes.
///
/// `NotFound`, `TokenMismatch` and `TokenExpired` are correlation errors: the
/// callback surface must report all three identically.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("No trust record for team {team_id}")]
    NotFound { team_id: String },

    #[error("External id does not match the live token for team {team_id}")]
    TokenMismatch { team_id: String },

    #[error("External id for team {team_id} expired after {ttl:?}")]
    TokenExpired { team_id: String, ttl: Duration },

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl RegistryError {
    /// True for errors caused by what the caller presented rather than by storage.
    pub fn is_correlation_error(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. } | Self::TokenMismatch { .. } | Self::TokenExpired { .. }
        )
    }
}

/// Errors talking to the cloud provider's API.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Provider {provider} unavailable: {reason}")]
    Unavailable { provider: String, reason: String },

    #[error("Provider {provider} denied access: {reason}")]
    AccessDenied { provider: String, reason: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },
}

impl ProviderError {
    /// Structured payload surfaced to clients inside a `STATUS_UNAVAILABLE` event.
    pub fn to_status_payload(&self) -> StatusErrorPayload {
        match self {
            Self::Unavailable { .. } => {
                StatusErrorPayload::new("provider.unavailable", true, self.to_string())
            }
            Self::AccessDenied { .. } => {
                StatusErrorPayload::new("provider.access_denied", false, self.to_string())
            }
            Self::InvalidResponse { .. } => {
                StatusErrorPayload::new("provider.invalid_response", true, self.to_string())
            }
        }
    }
}

/// Errors raised while ingesting a phone-home callback.
#[derive(Debug, thiserror::Error)]
pub enum CallbackError {
    #[error("Missing required fields: {}", .0.join(", "))]
    MissingFields(Vec<&'static str>),

    #[error("Malformed callback: {0}")]
    Malformed(String),

    #[error("Callback rejected")]
    Rejected(#[source] RegistryError),

    #[error("Registry unavailable: {0}")]
    Registry(#[source] RegistryError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<RegistryError> for CallbackError {
    fn from(err: RegistryError) -> Self {
        if err.is_correlation_error() {
            Self::Rejected(err)
        } else {
            Self::Registry(err)
        }
    }
}

impl CallbackError {
    /// Message safe to hand back to an unauthenticated caller.
    ///
    /// Correlation failures collapse into one string so the response never
    /// reveals whether the team exists.
    pub fn public_message(&self) -> String {
        match self {
            Self::MissingFields(_) | Self::Malformed(_) => self.to_string(),
            Self::Rejected(_) => "Callback rejected".to_string(),
            Self::Registry(_) | Self::Internal(_) => "Internal error".to_string(),
        }
    }
}

/// Relay hub errors.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Relay hub is shut down")]
    Closed,

    #[error("Relay hub is at capacity ({max} connections)")]
    AtCapacity { max: usize },

    #[error("Unknown relay connection {0}")]
    UnknownConnection(u64),
}

/// Errors building a launch link.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("Unknown template reference: {0}")]
    UnknownTemplate(String),

    #[error("Invalid team id: {0}")]
    InvalidTeamId(String),

    #[error("Invalid stack name: {0}")]
    InvalidStackName(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Channel-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel {name} failed to start: {reason}")]
    StartupFailed { name: String, reason: String },

    #[error("Failed to send on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    #[error("HTTP error: {0}")]
    Http(String),
}

/// Structured error carried in status events so clients can decide whether to retry.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StatusErrorPayload {
    pub code: &'static str,
    pub retryable: bool,
    pub message: String,
}

impl StatusErrorPayload {
    fn new(code: &'static str, retryable: bool, message: impl Into<String>) -> Self {
        Self {
            code,
            retryable,
            message: message.into(),
        }
    }
}

/// Result type alias for the service.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correlation_errors_share_public_message() {
        let not_found = CallbackError::from(RegistryError::NotFound {
            team_id: "t1".to_string(),
        });
        let mismatch = CallbackError::from(RegistryError::TokenMismatch {
            team_id: "t1".to_string(),
        });
        let expired = CallbackError::from(RegistryError::TokenExpired {
            team_id: "t1".to_string(),
            ttl: Duration::from_secs(60),
        });

        assert!(matches!(not_found, CallbackError::Rejected(_)));
        assert_eq!(not_found.public_message(), mismatch.public_message());
        assert_eq!(mismatch.public_message(), expired.public_message());
        assert!(!not_found.public_message().contains("t1"));
    }

    #[test]
    fn storage_errors_are_not_rejections() {
        let err = CallbackError::from(RegistryError::Database(DatabaseError::Query(
            "disk full".to_string(),
        )));
        assert!(matches!(err, CallbackError::Registry(_)));
        assert_eq!(err.public_message(), "Internal error");
    }

    #[test]
    fn maps_provider_errors_to_status_payload() {
        let payload = ProviderError::Unavailable {
            provider: "cloudformation".to_string(),
            reason: "connect timeout".to_string(),
        }
        .to_status_payload();
        assert_eq!(payload.code, "provider.unavailable");
        assert!(payload.retryable);

        let payload = ProviderError::AccessDenied {
            provider: "cloudformation".to_string(),
            reason: "not authorized".to_string(),
        }
        .to_status_payload();
        assert_eq!(payload.code, "provider.access_denied");
        assert!(!payload.retryable);
    }

    #[test]
    fn missing_fields_lists_every_field() {
        let err = CallbackError::MissingFields(vec!["teamId", "roleArn"]);
        assert_eq!(err.to_string(), "Missing required fields: teamId, roleArn");
        assert_eq!(err.public_message(), err.to_string());
    }
}
