use std::collections::BTreeMap;

use crate::config::helpers::{optional_env, parse_bool_env, split_list};
use crate::error::ConfigError;
use crate::settings::Settings;

pub const DEFAULT_REGION: &str = "us-east-2";
pub const DEFAULT_CONSOLE_BASE_URL: &str = "https://console.aws.amazon.com/cloudformation/home";
pub const DEFAULT_TEMPLATE_NAME: &str = "basic";
pub const DEFAULT_TEMPLATE_URL: &str = "https://opsconverge01.s3.us-east-2.amazonaws.com/Basic.yaml";

/// Cloud provider configuration: where deep links point and how stacks are queried.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub region: String,
    pub console_base_url: String,
    pub role_session_name: String,
    /// Query stack status through the team's bound role instead of ambient credentials.
    pub use_team_role: bool,
    pub stack_prefix: String,
    /// Named template references mapped to template URLs.
    pub templates: BTreeMap<String, String>,
}

impl ProviderConfig {
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let provider = &settings.provider;

        let region = optional_env("AWS_REGION")?
            .or_else(|| provider.region.clone())
            .unwrap_or_else(|| DEFAULT_REGION.to_string());

        let console_base_url = optional_env("PROVIDER_CONSOLE_BASE_URL")?
            .or_else(|| provider.console_base_url.clone())
            .unwrap_or_else(|| DEFAULT_CONSOLE_BASE_URL.to_string());
        require_https("PROVIDER_CONSOLE_BASE_URL", &console_base_url)?;

        let stack_prefix = optional_env("PROVIDER_STACK_PREFIX")?
            .or_else(|| provider.stack_prefix.clone())
            .unwrap_or_else(|| "stackrelay".to_string());
        if !stack_prefix
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic())
            || !stack_prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
            || stack_prefix.len() > 64
        {
            return Err(ConfigError::InvalidValue {
                key: "PROVIDER_STACK_PREFIX".to_string(),
                message: format!(
                    "'{stack_prefix}' must start with a letter and contain only letters, digits and '-'"
                ),
            });
        }

        let templates = match optional_env("TEMPLATE_CATALOG")? {
            Some(raw) => parse_template_catalog(&raw)?,
            None => provider.templates.clone().unwrap_or_else(|| {
                BTreeMap::from([(
                    DEFAULT_TEMPLATE_NAME.to_string(),
                    DEFAULT_TEMPLATE_URL.to_string(),
                )])
            }),
        };
        for url in templates.values() {
            require_https("TEMPLATE_CATALOG", url)?;
        }

        Ok(Self {
            region,
            console_base_url,
            role_session_name: optional_env("PROVIDER_ROLE_SESSION_NAME")?
                .or_else(|| provider.role_session_name.clone())
                .unwrap_or_else(|| "stackrelay-status".to_string()),
            use_team_role: parse_bool_env(
                "PROVIDER_USE_TEAM_ROLE",
                provider.use_team_role.unwrap_or(false),
            )?,
            stack_prefix,
            templates,
        })
    }
}

/// Parse `name=url,name=url` into a catalog.
pub(crate) fn parse_template_catalog(raw: &str) -> Result<BTreeMap<String, String>, ConfigError> {
    let mut catalog = BTreeMap::new();
    for entry in split_list(raw) {
        let (name, url) = entry
            .split_once('=')
            .ok_or_else(|| ConfigError::InvalidValue {
                key: "TEMPLATE_CATALOG".to_string(),
                message: format!("entry '{entry}' must look like name=https://..."),
            })?;
        let name = name.trim();
        if name.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "TEMPLATE_CATALOG".to_string(),
                message: format!("entry '{entry}' has an empty name"),
            });
        }
        catalog.insert(name.to_string(), url.trim().to_string());
    }
    if catalog.is_empty() {
        return Err(ConfigError::InvalidValue {
            key: "TEMPLATE_CATALOG".to_string(),
            message: "at least one template is required".to_string(),
        });
    }
    Ok(catalog)
}

fn require_https(key: &str, raw: &str) -> Result<(), ConfigError> {
    let parsed = url::Url::parse(raw).map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("'{raw}' is not a valid URL: {e}"),
    })?;
    if parsed.scheme() != "https" {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("'{raw}' must use https"),
        });
    }
    Ok(())
}
