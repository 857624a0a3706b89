use std::time::Duration;

use crate::config::helpers::{optional_env, parse_env_or, split_list};
use crate::error::ConfigError;
use crate::settings::Settings;

/// Correlation token lifetime.
#[derive(Debug, Clone, Default)]
pub struct TrustConfig {
    /// Age after which a PENDING token can no longer bind. `None` keeps tokens valid until rotated.
    pub token_ttl: Option<Duration>,
}

impl TrustConfig {
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let ttl_secs: Option<u64> = parse_env_or("TRUST_TOKEN_TTL_SECS", settings.trust.token_ttl_secs)?;
        if ttl_secs == Some(0) {
            return Err(ConfigError::InvalidValue {
                key: "TRUST_TOKEN_TTL_SECS".to_string(),
                message: "must be greater than zero (unset it to disable expiry)".to_string(),
            });
        }
        Ok(Self {
            token_ttl: ttl_secs.map(Duration::from_secs),
        })
    }
}

/// Completion-signal delivery back to the provider's orchestration service.
#[derive(Debug, Clone)]
pub struct CallbackConfig {
    /// Host suffixes a response URL must match before we PUT to it.
    pub ack_allowed_hosts: Vec<String>,
    pub ack_timeout: Duration,
}

impl CallbackConfig {
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let ack_allowed_hosts = match optional_env("CALLBACK_ACK_ALLOWED_HOSTS")? {
            Some(raw) => split_list(&raw),
            None => settings
                .callback
                .ack_allowed_hosts
                .clone()
                .unwrap_or_else(|| vec!["amazonaws.com".to_string()]),
        };

        let timeout_ms: u64 =
            parse_env_or("CALLBACK_ACK_TIMEOUT_MS", settings.callback.ack_timeout_ms)?
                .unwrap_or(5000);

        Ok(Self {
            ack_allowed_hosts: ack_allowed_hosts
                .into_iter()
                .map(|h| h.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            ack_timeout: Duration::from_millis(timeout_ms),
        })
    }
}
