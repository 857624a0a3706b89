use crate::config::helpers::{optional_env, split_list};
use crate::error::ConfigError;
use crate::settings::Settings;

/// Web gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Bearer token for authentication. Random hex generated at startup if unset.
    pub auth_token: Option<String>,
    /// Origins allowed to open the relay WebSocket. Empty means localhost only.
    pub allowed_origins: Vec<String>,
}

impl GatewayConfig {
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let port = optional_env("GATEWAY_PORT")?
            .map(|s| s.parse())
            .transpose()
            .map_err(|e| ConfigError::InvalidValue {
                key: "GATEWAY_PORT".to_string(),
                message: format!("must be a valid port number: {e}"),
            })?
            .or(settings.gateway.port)
            .unwrap_or(3000);

        let allowed_origins = match optional_env("GATEWAY_ALLOWED_ORIGINS")? {
            Some(raw) => split_list(&raw),
            None => settings.gateway.allowed_origins.clone().unwrap_or_default(),
        };
        for origin in &allowed_origins {
            url::Url::parse(origin).map_err(|e| ConfigError::InvalidValue {
                key: "GATEWAY_ALLOWED_ORIGINS".to_string(),
                message: format!("'{origin}' is not a valid origin: {e}"),
            })?;
        }

        Ok(Self {
            host: optional_env("GATEWAY_HOST")?
                .or_else(|| settings.gateway.host.clone())
                .unwrap_or_else(|| "127.0.0.1".to_string()),
            port,
            auth_token: optional_env("GATEWAY_AUTH_TOKEN")?,
            allowed_origins,
        })
    }
}
