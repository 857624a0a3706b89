//! Configuration for stackrelay.
//!
//! Settings are loaded with priority: env var > `~/.stackrelay/config.toml` > default.
//! `.env` in the working directory and `~/.stackrelay/.env` are loaded via
//! dotenvy before anything is resolved.

mod channels;
mod database;
pub(crate) mod helpers;
mod provider;
mod relay;
mod trust;

use crate::error::ConfigError;
use crate::settings::Settings;

pub use self::channels::GatewayConfig;
pub use self::database::{DatabaseBackend, DatabaseConfig, default_libsql_path};
pub use self::provider::{
    DEFAULT_CONSOLE_BASE_URL, DEFAULT_REGION, DEFAULT_TEMPLATE_NAME, DEFAULT_TEMPLATE_URL,
    ProviderConfig,
};
pub use self::relay::{PollerConfig, RelayConfig};
pub use self::trust::{CallbackConfig, TrustConfig};

/// Main configuration for the service.
#[derive(Debug, Clone)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub database: DatabaseConfig,
    pub provider: ProviderConfig,
    pub callback: CallbackConfig,
    pub trust: TrustConfig,
    pub relay: RelayConfig,
    pub poller: PollerConfig,
}

impl Config {
    /// Load configuration from environment variables and the default TOML file.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_with_toml(None)
    }

    /// Load from env with an optional TOML config file overlay.
    pub fn from_env_with_toml(toml_path: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        crate::bootstrap::load_stackrelay_env();
        let settings = Self::load_toml_settings(toml_path)?;
        Self::build(&settings)
    }

    /// Load the TOML config file.
    ///
    /// If `explicit_path` is `Some`, loads from that path (a missing file is
    /// fatal). If `None`, tries `~/.stackrelay/config.toml` and ignores a
    /// missing file.
    fn load_toml_settings(explicit_path: Option<&std::path::Path>) -> Result<Settings, ConfigError> {
        let path = explicit_path
            .map(std::path::PathBuf::from)
            .unwrap_or_else(Settings::default_toml_path);

        match Settings::load_toml(&path) {
            Ok(Some(settings)) => {
                tracing::debug!("Loaded TOML config from {}", path.display());
                Ok(settings)
            }
            Ok(None) => {
                if explicit_path.is_some() {
                    return Err(ConfigError::ParseError(format!(
                        "Config file not found: {}",
                        path.display()
                    )));
                }
                Ok(Settings::default())
            }
            Err(e) => Err(ConfigError::ParseError(e)),
        }
    }

    /// Resolve every section from env vars, falling back to `settings`.
    pub fn build(settings: &Settings) -> Result<Self, ConfigError> {
        Ok(Self {
            gateway: GatewayConfig::resolve(settings)?,
            database: DatabaseConfig::resolve(settings)?,
            provider: ProviderConfig::resolve(settings)?,
            callback: CallbackConfig::resolve(settings)?,
            trust: TrustConfig::resolve(settings)?,
            relay: RelayConfig::resolve(settings)?,
            poller: PollerConfig::resolve(settings)?,
        })
    }
}

/// Serializes tests that read or mutate process environment.
#[cfg(test)]
pub(crate) static ENV_MUTEX: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::settings::{DatabaseSettings, RelaySettings};

    const KEYS: &[&str] = &[
        "GATEWAY_HOST",
        "GATEWAY_PORT",
        "GATEWAY_AUTH_TOKEN",
        "GATEWAY_ALLOWED_ORIGINS",
        "DATABASE_BACKEND",
        "DATABASE_URL",
        "DATABASE_POOL_SIZE",
        "LIBSQL_PATH",
        "AWS_REGION",
        "PROVIDER_CONSOLE_BASE_URL",
        "PROVIDER_ROLE_SESSION_NAME",
        "PROVIDER_USE_TEAM_ROLE",
        "PROVIDER_STACK_PREFIX",
        "TEMPLATE_CATALOG",
        "CALLBACK_ACK_ALLOWED_HOSTS",
        "CALLBACK_ACK_TIMEOUT_MS",
        "TRUST_TOKEN_TTL_SECS",
        "RELAY_CONNECTION_BUFFER",
        "RELAY_MAX_CONNECTIONS",
        "RELAY_REPLAY_LAST_EVENT",
        "RELAY_SEND_TIMEOUT_MS",
        "RELAY_REPLAY_CAPACITY",
        "POLLER_AUTO_WATCH",
        "POLLER_WATCH_INTERVAL_SECS",
        "POLLER_WATCH_MAX_POLLS",
    ];

    fn clear_env() {
        // SAFETY: Guarded by ENV_MUTEX in tests.
        unsafe {
            for key in KEYS {
                std::env::remove_var(key);
            }
        }
    }

    fn set_env(key: &str, value: &str) {
        // SAFETY: Guarded by ENV_MUTEX in tests.
        unsafe {
            std::env::set_var(key, value);
        }
    }

    #[test]
    fn defaults_without_env_or_file() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        clear_env();

        let config = Config::build(&Settings::default()).expect("build");
        assert_eq!(config.gateway.host, "127.0.0.1");
        assert_eq!(config.gateway.port, 3000);
        assert!(config.gateway.allowed_origins.is_empty());
        assert_eq!(config.database.backend, DatabaseBackend::LibSql);
        assert_eq!(config.provider.region, DEFAULT_REGION);
        assert_eq!(
            config.provider.templates.get(DEFAULT_TEMPLATE_NAME).map(String::as_str),
            Some(DEFAULT_TEMPLATE_URL)
        );
        assert!(!config.provider.use_team_role);
        assert_eq!(config.callback.ack_allowed_hosts, vec!["amazonaws.com"]);
        assert_eq!(config.callback.ack_timeout, Duration::from_millis(5000));
        assert!(config.trust.token_ttl.is_none());
        assert_eq!(config.relay.connection_buffer, 32);
        assert!(!config.relay.replay_last_event);
        assert_eq!(config.relay.send_timeout, Duration::from_millis(5000));
        assert!(config.poller.auto_watch);
        assert_eq!(config.poller.watch_max_polls, 80);
    }

    #[test]
    fn env_wins_over_toml_settings() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        clear_env();

        let settings = Settings {
            relay: RelaySettings {
                connection_buffer: Some(8),
                max_connections: Some(50),
                replay_last_event: Some(true),
                replay_capacity: None,
                send_timeout_ms: Some(2000),
            },
            ..Default::default()
        };
        set_env("RELAY_CONNECTION_BUFFER", "64");
        set_env("RELAY_SEND_TIMEOUT_MS", "250");
        set_env("TRUST_TOKEN_TTL_SECS", "900");

        let config = Config::build(&settings).expect("build");
        assert_eq!(config.relay.connection_buffer, 64);
        assert_eq!(config.relay.max_connections, 50);
        assert!(config.relay.replay_last_event);
        assert_eq!(config.relay.send_timeout, Duration::from_millis(250));
        assert_eq!(config.trust.token_ttl, Some(Duration::from_secs(900)));

        clear_env();
    }

    #[test]
    fn invalid_values_name_the_key() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        clear_env();

        set_env("GATEWAY_PORT", "not-a-port");
        let err = Config::build(&Settings::default()).unwrap_err();
        assert!(err.to_string().contains("GATEWAY_PORT"), "got: {err}");
        clear_env();

        set_env("RELAY_REPLAY_LAST_EVENT", "maybe");
        let err = Config::build(&Settings::default()).unwrap_err();
        assert!(err.to_string().contains("RELAY_REPLAY_LAST_EVENT"), "got: {err}");
        clear_env();

        set_env("RELAY_SEND_TIMEOUT_MS", "0");
        let err = Config::build(&Settings::default()).unwrap_err();
        assert!(err.to_string().contains("RELAY_SEND_TIMEOUT_MS"), "got: {err}");
        clear_env();

        set_env("TEMPLATE_CATALOG", "basic=http://insecure.example.com/t.yaml");
        let err = Config::build(&Settings::default()).unwrap_err();
        assert!(err.to_string().contains("https"), "got: {err}");
        clear_env();
    }

    #[test]
    fn postgres_backend_requires_url() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        clear_env();

        let settings = Settings {
            database: DatabaseSettings {
                backend: Some("postgres".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let err = Config::build(&settings).unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequired { ref key, .. } if key == "DATABASE_URL"));

        set_env("DATABASE_URL", "postgres://localhost/stackrelay");
        let config = Config::build(&settings).expect("build");
        assert_eq!(config.database.backend, DatabaseBackend::Postgres);
        clear_env();
    }

    #[test]
    fn explicit_missing_toml_is_fatal() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.toml");
        let err = Config::load_toml_settings(Some(&missing)).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
