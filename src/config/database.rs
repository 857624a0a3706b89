use std::path::PathBuf;

use secrecy::SecretString;

use crate::config::helpers::{optional_env, parse_env_or};
use crate::error::ConfigError;
use crate::settings::Settings;

/// Which store holds trust records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseBackend {
    Postgres,
    LibSql,
    /// Process-local, lost on restart. Useful for local runs and tests.
    Memory,
}

impl std::str::FromStr for DatabaseBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Ok(Self::Postgres),
            "libsql" | "turso" | "sqlite" => Ok(Self::LibSql),
            "memory" | "mem" => Ok(Self::Memory),
            other => Err(format!(
                "expected 'postgres', 'libsql' or 'memory', got '{other}'"
            )),
        }
    }
}

impl std::fmt::Display for DatabaseBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Postgres => write!(f, "postgres"),
            Self::LibSql => write!(f, "libsql"),
            Self::Memory => write!(f, "memory"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub backend: DatabaseBackend,
    pub url: Option<SecretString>,
    pub pool_size: usize,
    pub libsql_path: PathBuf,
}

impl DatabaseConfig {
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let backend = parse_env_or(
            "DATABASE_BACKEND",
            settings
                .database
                .backend
                .as_deref()
                .map(str::parse::<DatabaseBackend>)
                .transpose()
                .map_err(|message| ConfigError::InvalidValue {
                    key: "database.backend".to_string(),
                    message,
                })?,
        )?
        .unwrap_or(DatabaseBackend::LibSql);

        let url = optional_env("DATABASE_URL")?
            .or_else(|| settings.database.url.clone())
            .map(SecretString::from);

        if backend == DatabaseBackend::Postgres && url.is_none() {
            return Err(ConfigError::MissingRequired {
                key: "DATABASE_URL".to_string(),
                hint: "Set DATABASE_URL or choose DATABASE_BACKEND=libsql".to_string(),
            });
        }

        let pool_size = parse_env_or("DATABASE_POOL_SIZE", settings.database.pool_size)?
            .unwrap_or(10);
        if pool_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "DATABASE_POOL_SIZE".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            backend,
            url,
            pool_size,
            libsql_path: optional_env("LIBSQL_PATH")?
                .or_else(|| settings.database.libsql_path.clone())
                .map(PathBuf::from)
                .unwrap_or_else(default_libsql_path),
        })
    }
}

/// Default libSQL database file (~/.stackrelay/stackrelay.db).
pub fn default_libsql_path() -> PathBuf {
    crate::bootstrap::stackrelay_home().join("stackrelay.db")
}
