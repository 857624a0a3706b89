//! Launch links: the console deep link a team opens to create its stack.
//!
//! Building a link issues a fresh correlation token, so a new link always
//! invalidates the previous one for that team.

use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};

use rand::Rng;
use regex::Regex;
use serde::Serialize;

use crate::config::{DEFAULT_TEMPLATE_NAME, ProviderConfig};
use crate::error::LaunchError;
use crate::registry::TrustRegistry;

/// CloudFormation stack names: a letter, then letters, digits and hyphens, 128 max.
static STACK_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z][A-Za-z0-9-]{0,127}$").expect("stack name pattern is valid")
});

static TEAM_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._:@-]{0,127}$").expect("team id pattern is valid")
});

pub fn is_valid_stack_name(name: &str) -> bool {
    STACK_NAME_RE.is_match(name)
}

pub fn is_valid_team_id(team_id: &str) -> bool {
    TEAM_ID_RE.is_match(team_id)
}

/// Named template references and the hosts raw template URLs may point at.
#[derive(Debug, Clone)]
pub struct TemplateCatalog {
    templates: BTreeMap<String, String>,
    allowed_hosts: Vec<String>,
}

impl TemplateCatalog {
    pub fn new(templates: BTreeMap<String, String>) -> Self {
        let mut allowed_hosts: Vec<String> = templates
            .values()
            .filter_map(|raw| url::Url::parse(raw).ok())
            .filter_map(|u| u.host_str().map(str::to_ascii_lowercase))
            .collect();
        allowed_hosts.sort();
        allowed_hosts.dedup();
        Self {
            templates,
            allowed_hosts,
        }
    }

    /// Resolve a catalog name, or accept an https URL on a catalog host.
    pub fn resolve(&self, template_ref: &str) -> Result<String, LaunchError> {
        let template_ref = template_ref.trim();
        if let Some(url) = self.templates.get(template_ref) {
            return Ok(url.clone());
        }
        match url::Url::parse(template_ref) {
            Ok(parsed)
                if parsed.scheme() == "https"
                    && parsed
                        .host_str()
                        .is_some_and(|h| self.allowed_hosts.iter().any(|a| a.eq_ignore_ascii_case(h))) =>
            {
                Ok(parsed.to_string())
            }
            _ => Err(LaunchError::UnknownTemplate(template_ref.to_string())),
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.templates.keys().map(String::as_str)
    }

    /// Template used when a launch names none: `basic` if present, else the first entry.
    pub fn default_name(&self) -> Option<&str> {
        if self.templates.contains_key(DEFAULT_TEMPLATE_NAME) {
            return Some(DEFAULT_TEMPLATE_NAME);
        }
        self.names().next()
    }
}

/// A minted launch link.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchLink {
    pub url: String,
    pub external_id: String,
    pub stack_name: String,
    pub template_url: String,
}

/// Builds console deep links, issuing a correlation token for each.
pub struct LaunchUrlBuilder {
    registry: Arc<TrustRegistry>,
    catalog: TemplateCatalog,
    console_base_url: String,
    region: String,
    stack_prefix: String,
}

impl LaunchUrlBuilder {
    pub fn new(registry: Arc<TrustRegistry>, provider: &ProviderConfig) -> Self {
        Self {
            registry,
            catalog: TemplateCatalog::new(provider.templates.clone()),
            console_base_url: provider.console_base_url.clone(),
            region: provider.region.clone(),
            stack_prefix: provider.stack_prefix.clone(),
        }
    }

    pub fn catalog(&self) -> &TemplateCatalog {
        &self.catalog
    }

    /// Issue a token for `team_id` and return the deep link embedding it.
    ///
    /// Inputs are validated before the registry is touched, so a bad
    /// template reference leaves the team's current token alone.
    pub async fn build_launch_url(
        &self,
        team_id: &str,
        template_ref: &str,
    ) -> Result<LaunchLink, LaunchError> {
        if !is_valid_team_id(team_id) {
            return Err(LaunchError::InvalidTeamId(team_id.to_string()));
        }
        let template_url = self.catalog.resolve(template_ref)?;
        let stack_name = generate_stack_name(&self.stack_prefix);
        if !is_valid_stack_name(&stack_name) {
            return Err(LaunchError::InvalidStackName(stack_name));
        }

        let external_id = self
            .registry
            .issue_token_for_launch(team_id, &stack_name)
            .await?;

        let url = quick_create_url(
            &self.console_base_url,
            &self.region,
            &template_url,
            &stack_name,
            &external_id,
            team_id,
        );
        tracing::info!(team_id, stack_name = %stack_name, template = template_ref, "Built launch link");

        Ok(LaunchLink {
            url,
            external_id,
            stack_name,
            template_url,
        })
    }
}

/// `{prefix}-{unix millis}-{6 hex}`.
pub fn generate_stack_name(prefix: &str) -> String {
    let millis = chrono::Utc::now().timestamp_millis();
    let suffix: u32 = rand::thread_rng().gen_range(0..0x100_0000);
    format!("{prefix}-{millis}-{suffix:06x}")
}

/// CloudFormation quick-create deep link. Every value is percent-encoded.
pub fn quick_create_url(
    console_base_url: &str,
    region: &str,
    template_url: &str,
    stack_name: &str,
    external_id: &str,
    team_id: &str,
) -> String {
    format!(
        "{base}?region={region}#/stacks/quickcreate?templateUrl={template}&stackName={stack}\
         &param_ExternalID={external}&param_TeamID={team}&capabilities=CAPABILITY_IAM",
        base = console_base_url.trim_end_matches('/'),
        region = urlencoding::encode(region),
        template = urlencoding::encode(template_url),
        stack = urlencoding::encode(stack_name),
        external = urlencoding::encode(external_id),
        team = urlencoding::encode(team_id),
    )
}
