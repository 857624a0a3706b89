//! CloudFormation stack status source.
//!
//! Uses ambient credentials from the environment, or assumes the team's
//! bound role with its external id when configured to.

use std::collections::BTreeMap;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_sdk_cloudformation::Client;
use aws_sdk_cloudformation::config::Credentials;
use aws_sdk_cloudformation::error::{DisplayErrorContext, ProvideErrorMetadata};
use aws_sdk_cloudformation::types::{Stack, StackStatus};

use crate::config::ProviderConfig;
use crate::error::ProviderError;
use crate::poller::{StackSnapshot, StackStatusSource, TeamRole};

const PROVIDER: &str = "cloudformation";

/// Error codes that mean the caller's credentials are the problem.
const ACCESS_DENIED_CODES: &[&str] = &[
    "AccessDenied",
    "AccessDeniedException",
    "ExpiredToken",
    "InvalidClientTokenId",
    "UnrecognizedClientException",
];

pub struct CloudFormationSource {
    sdk_config: SdkConfig,
    client: Client,
    sts: aws_sdk_sts::Client,
    role_session_name: String,
}

impl CloudFormationSource {
    /// Build clients from the default credential chain in the configured region.
    pub async fn from_env(provider: &ProviderConfig) -> Self {
        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(provider.region.clone()))
            .load()
            .await;
        Self::with_sdk_config(sdk_config, &provider.role_session_name)
    }

    pub fn with_sdk_config(sdk_config: SdkConfig, role_session_name: &str) -> Self {
        Self {
            client: Client::new(&sdk_config),
            sts: aws_sdk_sts::Client::new(&sdk_config),
            sdk_config,
            role_session_name: role_session_name.to_string(),
        }
    }

    async fn client_for(&self, role: Option<&TeamRole>) -> Result<Client, ProviderError> {
        let Some(role) = role else {
            return Ok(self.client.clone());
        };

        let assumed = self
            .sts
            .assume_role()
            .role_arn(&role.role_arn)
            .role_session_name(&self.role_session_name)
            .external_id(&role.external_id)
            .send()
            .await
            .map_err(|e| classify("sts", &e))?;

        let creds = assumed
            .credentials()
            .ok_or_else(|| ProviderError::InvalidResponse {
                provider: "sts".to_string(),
                reason: "AssumeRole returned no credentials".to_string(),
            })?;
        tracing::debug!(role_arn = %role.role_arn, "Assumed team role");

        let credentials = Credentials::new(
            creds.access_key_id.clone(),
            creds.secret_access_key.clone(),
            Some(creds.session_token.clone()),
            None,
            "stackrelay-assume-role",
        );
        let config = aws_sdk_cloudformation::config::Builder::from(&self.sdk_config)
            .credentials_provider(credentials)
            .build();
        Ok(Client::from_conf(config))
    }
}

#[async_trait]
impl StackStatusSource for CloudFormationSource {
    async fn describe_stack(
        &self,
        stack_name: &str,
        role: Option<&TeamRole>,
    ) -> Result<Option<StackSnapshot>, ProviderError> {
        let client = self.client_for(role).await?;
        let output = match client.describe_stacks().stack_name(stack_name).send().await {
            Ok(output) => output,
            Err(e) if is_missing_stack(e.code(), e.message()) => return Ok(None),
            Err(e) => return Err(classify(PROVIDER, &e)),
        };

        Ok(output.stacks().first().map(|stack| snapshot(stack_name, stack)))
    }
}

/// DescribeStacks reports an unknown stack as a ValidationError.
fn is_missing_stack(code: Option<&str>, message: Option<&str>) -> bool {
    code == Some("ValidationError") && message.is_some_and(|m| m.contains("does not exist"))
}

fn classify<E>(provider: &str, err: &E) -> ProviderError
where
    E: ProvideErrorMetadata + std::error::Error,
{
    let reason = DisplayErrorContext(err).to_string();
    if err.code().is_some_and(|code| ACCESS_DENIED_CODES.contains(&code)) {
        ProviderError::AccessDenied {
            provider: provider.to_string(),
            reason,
        }
    } else {
        ProviderError::Unavailable {
            provider: provider.to_string(),
            reason,
        }
    }
}

fn snapshot(requested: &str, stack: &Stack) -> StackSnapshot {
    let outputs: BTreeMap<String, String> = stack
        .outputs()
        .iter()
        .filter_map(|o| Some((o.output_key()?.to_string(), o.output_value()?.to_string())))
        .collect();

    // Required in current service models, optional in older ones.
    let name: Option<&String> = (&stack.stack_name).into();
    let status: Option<&StackStatus> = (&stack.stack_status).into();

    StackSnapshot {
        stack_name: name.map_or(requested, String::as_str).to_string(),
        status: status.map(|s| s.as_str().to_string()).unwrap_or_default(),
        status_reason: stack.stack_status_reason().map(str::to_string),
        outputs,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_stack_is_recognized_from_validation_error() {
        assert!(is_missing_stack(
            Some("ValidationError"),
            Some("Stack with id S1 does not exist")
        ));
        assert!(!is_missing_stack(Some("ValidationError"), Some("bad parameter")));
        assert!(!is_missing_stack(Some("Throttling"), Some("does not exist")));
        assert!(!is_missing_stack(None, None));
    }
}
