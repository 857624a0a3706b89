//! File-backed settings.
//!
//! Stored in `~/.stackrelay/config.toml`. Every field is optional; a value
//! present here is used only when the matching env var is unset.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Settings persisted to disk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub gateway: GatewaySettings,

    #[serde(default)]
    pub database: DatabaseSettings,

    #[serde(default)]
    pub provider: ProviderSettings,

    #[serde(default)]
    pub callback: CallbackSettings,

    #[serde(default)]
    pub trust: TrustSettings,

    #[serde(default)]
    pub relay: RelaySettings,

    #[serde(default)]
    pub poller: PollerSettings,
}

/// HTTP/WebSocket gateway.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatewaySettings {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub allowed_origins: Option<Vec<String>>,
}

/// Trust record storage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// "libsql", "postgres" or "memory".
    #[serde(default)]
    pub backend: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub pool_size: Option<usize>,
    #[serde(default)]
    pub libsql_path: Option<String>,
}

/// Cloud provider: console deep links and status lookups.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderSettings {
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub console_base_url: Option<String>,
    #[serde(default)]
    pub role_session_name: Option<String>,
    #[serde(default)]
    pub use_team_role: Option<bool>,
    #[serde(default)]
    pub stack_prefix: Option<String>,
    /// Named template references, e.g. `basic = "https://.../Basic.yaml"`.
    #[serde(default)]
    pub templates: Option<std::collections::BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallbackSettings {
    #[serde(default)]
    pub ack_allowed_hosts: Option<Vec<String>>,
    #[serde(default)]
    pub ack_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrustSettings {
    #[serde(default)]
    pub token_ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelaySettings {
    #[serde(default)]
    pub connection_buffer: Option<usize>,
    #[serde(default)]
    pub max_connections: Option<usize>,
    #[serde(default)]
    pub replay_last_event: Option<bool>,
    #[serde(default)]
    pub replay_capacity: Option<usize>,
    #[serde(default)]
    pub send_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PollerSettings {
    #[serde(default)]
    pub auto_watch: Option<bool>,
    #[serde(default)]
    pub watch_interval_secs: Option<u64>,
    #[serde(default)]
    pub watch_max_polls: Option<u32>,
}

impl Settings {
    /// Default TOML config file path (~/.stackrelay/config.toml).
    pub fn default_toml_path() -> PathBuf {
        crate::bootstrap::stackrelay_home().join("config.toml")
    }

    /// Load settings from a TOML file.
    ///
    /// Returns `None` if the file doesn't exist. Returns an error only
    /// if the file exists but can't be parsed.
    pub fn load_toml(path: &std::path::Path) -> Result<Option<Self>, String> {
        let data = match std::fs::read_to_string(path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(format!("failed to read {}: {}", path.display(), e)),
        };

        let settings: Self = toml::from_str(&data)
            .map_err(|e| format!("invalid TOML in {}: {}", path.display(), e))?;
        Ok(Some(settings))
    }

    /// Write a commented TOML config file with current settings.
    pub fn save_toml(&self, path: &std::path::Path) -> Result<(), String> {
        let raw = toml::to_string_pretty(self)
            .map_err(|e| format!("failed to serialize settings: {}", e))?;

        let content = format!(
            "# stackrelay configuration file.\n\
             #\n\
             # Priority: env var > this file > defaults.\n\
             # Run `stackrelay init-config` to regenerate this file.\n\
             \n\
             {raw}"
        );

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("failed to create {}: {}", parent.display(), e))?;
        }

        std::fs::write(path, content)
            .map_err(|e| format!("failed to write {}: {}", path.display(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_toml_path_under_stackrelay() {
        let path = Settings::default_toml_path();
        assert!(path.to_string_lossy().contains(".stackrelay"));
        assert!(path.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn missing_file_is_none() {
        let dir = tempdir().unwrap();
        let loaded = Settings::load_toml(&dir.path().join("nope.toml")).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn partial_toml_leaves_other_sections_default() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[relay]
connection_buffer = 8

[provider.templates]
basic = "https://bucket.s3.us-east-2.amazonaws.com/Basic.yaml"
"#,
        )
        .unwrap();

        let settings = Settings::load_toml(&path).unwrap().unwrap();
        assert_eq!(settings.relay.connection_buffer, Some(8));
        assert_eq!(settings.relay.max_connections, None);
        assert_eq!(settings.gateway, GatewaySettings::default());
        let templates = settings.provider.templates.unwrap();
        assert!(templates["basic"].ends_with("Basic.yaml"));
    }

    #[test]
    fn invalid_toml_is_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[relay\nconnection_buffer = ").unwrap();

        let err = Settings::load_toml(&path).unwrap_err();
        assert!(err.contains("invalid TOML"));
    }

    #[test]
    fn save_then_load_keeps_values() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let settings = Settings {
            trust: TrustSettings {
                token_ttl_secs: Some(3600),
            },
            poller: PollerSettings {
                auto_watch: Some(false),
                ..Default::default()
            },
            ..Default::default()
        };

        settings.save_toml(&path).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("# stackrelay configuration file."));

        let loaded = Settings::load_toml(&path).unwrap().unwrap();
        assert_eq!(loaded, settings);
    }
}
