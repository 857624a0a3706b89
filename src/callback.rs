//! Phone-home callback ingestion.
//!
//! The bootstrap resource inside a freshly created customer stack posts its
//! team id, the correlation token it was launched with and the role it
//! created. Possession of the live token is the only credential.
//!
//! When the request carries a CloudFormation custom-resource envelope, a
//! completion signal is always PUT back to its response URL, whatever
//! happened while processing. CloudFormation blocks the stack on it.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::config::CallbackConfig;
use crate::error::{CallbackError, ChannelError, RegistryError};
use crate::registry::{BindOutcome, TrustRegistry, token_fingerprint};
use crate::relay::{DeploymentEvent, RelayHub, STATUS_CREATE_COMPLETE, STATUS_FAILED};

/// Properties a CloudFormation custom resource passes through to its handler.
#[derive(Debug, Clone, Default)]
pub struct ResourceProperties {
    pub team_id: Option<String>,
    pub external_id: Option<String>,
    pub role_arn: Option<String>,
    pub stack_name: Option<String>,
}

/// Raw callback body.
///
/// Accepts the portal's camelCase names, the names the bootstrap
/// Lambda uses, and a full custom-resource event.
#[derive(Debug, Clone, Default)]
pub struct CallbackRequest {
    pub team_id: Option<String>,
    pub external_id: Option<String>,
    pub role_arn: Option<String>,
    pub stack_name: Option<String>,
    pub request_type: Option<String>,
    /// `FAILED` reports a failure instead of binding.
    pub status: Option<String>,
    pub reason: Option<String>,

    pub response_url: Option<String>,
    pub stack_id: Option<String>,
    pub request_id: Option<String>,
    pub logical_resource_id: Option<String>,
    pub physical_resource_id: Option<String>,
    pub resource_properties: Option<ResourceProperties>,
}

// Accepted spellings per field, in precedence order.
const TEAM_ID_KEYS: &[&str] = &["teamId", "TeamID", "TeamId", "OpsConvergeID"];
const EXTERNAL_ID_KEYS: &[&str] = &["externalId", "ExternalID", "ExternalId", "ExternalIDOverride"];
const ROLE_ARN_KEYS: &[&str] = &["roleArn", "RoleArn", "RoleArnOverride"];
const STACK_NAME_KEYS: &[&str] = &["stackName", "StackName"];
const REQUEST_TYPE_KEYS: &[&str] = &["requestType", "RequestType"];
const STATUS_KEYS: &[&str] = &["status", "Status"];
const REASON_KEYS: &[&str] = &["reason", "Reason", "message"];
const RESPONSE_URL_KEYS: &[&str] = &["responseUrl", "ResponseURL", "responseURL"];
const STACK_ID_KEYS: &[&str] = &["stackId", "StackId"];
const REQUEST_ID_KEYS: &[&str] = &["requestId", "RequestId"];
const LOGICAL_ID_KEYS: &[&str] = &["logicalResourceId", "LogicalResourceId"];
const PHYSICAL_ID_KEYS: &[&str] = &["physicalResourceId", "PhysicalResourceId"];
const PROPERTIES_KEYS: &[&str] = &["resourceProperties", "ResourceProperties"];

type JsonMap = serde_json::Map<String, Value>;

/// First non-blank string under any of `keys`.
///
/// Several spellings may be present at once. Null is treated as absent; any
/// other non-string value is malformed.
fn string_field(map: &JsonMap, keys: &[&str]) -> Result<Option<String>, CallbackError> {
    let mut found = None;
    for key in keys {
        match map.get(*key) {
            None | Some(Value::Null) => {}
            Some(Value::String(s)) => {
                if found.is_none() && !s.trim().is_empty() {
                    found = Some(s.clone());
                }
            }
            Some(_) => return Err(CallbackError::Malformed(format!("{key} must be a string"))),
        }
    }
    Ok(found)
}

/// Like [`string_field`] but skips values of the wrong type.
fn lenient_field(map: &JsonMap, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| map.get(*key).and_then(Value::as_str))
        .find(|s| !s.trim().is_empty())
        .map(str::to_string)
}

impl ResourceProperties {
    fn from_map(map: &JsonMap) -> Result<Self, CallbackError> {
        Ok(Self {
            team_id: string_field(map, TEAM_ID_KEYS)?,
            external_id: string_field(map, EXTERNAL_ID_KEYS)?,
            role_arn: string_field(map, ROLE_ARN_KEYS)?,
            stack_name: string_field(map, STACK_NAME_KEYS)?,
        })
    }
}

impl CallbackRequest {
    /// Read a callback from a decoded JSON body.
    pub fn from_value(value: &Value) -> Result<Self, CallbackError> {
        let Some(map) = value.as_object() else {
            return Err(CallbackError::Malformed("expected a JSON object".to_string()));
        };
        let resource_properties = match PROPERTIES_KEYS.iter().find_map(|key| map.get(*key)) {
            None | Some(Value::Null) => None,
            Some(Value::Object(props)) => Some(ResourceProperties::from_map(props)?),
            Some(_) => {
                return Err(CallbackError::Malformed(
                    "ResourceProperties must be an object".to_string(),
                ));
            }
        };
        Ok(Self {
            team_id: string_field(map, TEAM_ID_KEYS)?,
            external_id: string_field(map, EXTERNAL_ID_KEYS)?,
            role_arn: string_field(map, ROLE_ARN_KEYS)?,
            stack_name: string_field(map, STACK_NAME_KEYS)?,
            request_type: string_field(map, REQUEST_TYPE_KEYS)?,
            status: string_field(map, STATUS_KEYS)?,
            reason: string_field(map, REASON_KEYS)?,
            response_url: string_field(map, RESPONSE_URL_KEYS)?,
            stack_id: string_field(map, STACK_ID_KEYS)?,
            request_id: string_field(map, REQUEST_ID_KEYS)?,
            logical_resource_id: string_field(map, LOGICAL_ID_KEYS)?,
            physical_resource_id: string_field(map, PHYSICAL_ID_KEYS)?,
            resource_properties,
        })
    }

    /// Only the custom-resource envelope, salvaged from a body that could
    /// not be read as a callback.
    pub fn envelope_of(value: &Value) -> Self {
        let Some(map) = value.as_object() else {
            return Self::default();
        };
        Self {
            response_url: lenient_field(map, RESPONSE_URL_KEYS),
            stack_id: lenient_field(map, STACK_ID_KEYS),
            request_id: lenient_field(map, REQUEST_ID_KEYS),
            logical_resource_id: lenient_field(map, LOGICAL_ID_KEYS),
            physical_resource_id: lenient_field(map, PHYSICAL_ID_KEYS),
            ..Self::default()
        }
    }
}

impl<'de> Deserialize<'de> for CallbackRequest {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(&value).map_err(serde::de::Error::custom)
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

impl CallbackRequest {
    fn prop<'a>(
        &'a self,
        top: &'a Option<String>,
        nested: impl Fn(&'a ResourceProperties) -> &'a Option<String>,
    ) -> Option<&'a str> {
        non_empty(top).or_else(|| self.resource_properties.as_ref().and_then(|p| non_empty(nested(p))))
    }

    pub fn team_id(&self) -> Option<&str> {
        self.prop(&self.team_id, |p| &p.team_id)
    }

    pub fn external_id(&self) -> Option<&str> {
        self.prop(&self.external_id, |p| &p.external_id)
    }

    pub fn role_arn(&self) -> Option<&str> {
        self.prop(&self.role_arn, |p| &p.role_arn)
    }

    pub fn stack_name(&self) -> Option<&str> {
        self.prop(&self.stack_name, |p| &p.stack_name)
    }

    pub fn request_kind(&self) -> RequestKind {
        match non_empty(&self.request_type) {
            Some(t) if t.eq_ignore_ascii_case("delete") => RequestKind::Delete,
            Some(t) if t.eq_ignore_ascii_case("update") => RequestKind::Update,
            _ => RequestKind::Create,
        }
    }

    pub fn reports_failure(&self) -> bool {
        non_empty(&self.status).is_some_and(|s| s.eq_ignore_ascii_case(STATUS_FAILED))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Create,
    Update,
    Delete,
}

/// Successful ingestion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackAck {
    Bound { team_id: String, outcome: BindOutcome },
    FailureRecorded { team_id: String },
    DeleteAcknowledged,
}

/// Custom-resource response body, in the shape CloudFormation expects.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CompletionSignal {
    pub status: &'static str,
    pub reason: String,
    pub physical_resource_id: String,
    pub stack_id: Option<String>,
    pub request_id: Option<String>,
    pub logical_resource_id: Option<String>,
    pub data: serde_json::Value,
}

/// Delivers completion signals to the provider's orchestration service.
#[async_trait]
pub trait CompletionNotifier: Send + Sync {
    async fn notify(&self, response_url: &str, signal: &CompletionSignal)
    -> Result<(), ChannelError>;
}

/// PUTs the signal to a pre-signed response URL over https.
pub struct HttpCompletionNotifier {
    client: reqwest::Client,
    allowed_hosts: Vec<String>,
}

impl HttpCompletionNotifier {
    pub fn new(config: &CallbackConfig) -> Result<Self, ChannelError> {
        let client = reqwest::Client::builder()
            .timeout(config.ack_timeout)
            .build()
            .map_err(|e| ChannelError::Http(format!("failed to build http client: {e}")))?;
        Ok(Self {
            client,
            allowed_hosts: config.ack_allowed_hosts.clone(),
        })
    }

    /// Only https URLs whose host is, or is under, an allowed suffix.
    pub fn is_allowed(&self, response_url: &str) -> bool {
        let Ok(parsed) = url::Url::parse(response_url) else {
            return false;
        };
        if parsed.scheme() != "https" {
            return false;
        }
        let Some(host) = parsed.host_str().map(str::to_ascii_lowercase) else {
            return false;
        };
        self.allowed_hosts
            .iter()
            .any(|suffix| host == *suffix || host.ends_with(&format!(".{suffix}")))
    }
}

#[async_trait]
impl CompletionNotifier for HttpCompletionNotifier {
    async fn notify(
        &self,
        response_url: &str,
        signal: &CompletionSignal,
    ) -> Result<(), ChannelError> {
        let send_failed = |reason: String| ChannelError::SendFailed {
            name: "completion-signal".to_string(),
            reason,
        };

        if !self.is_allowed(response_url) {
            return Err(send_failed("response URL host is not allowed".to_string()));
        }
        let body = serde_json::to_vec(signal).map_err(|e| send_failed(e.to_string()))?;

        // Pre-signed S3 URLs are signed for an empty content type.
        let response = self
            .client
            .put(response_url)
            .header(reqwest::header::CONTENT_TYPE, "")
            .body(body)
            .send()
            .await
            .map_err(|e| send_failed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(send_failed(format!("status {}", response.status())));
        }
        Ok(())
    }
}

/// Verifies callbacks against the registry, then publishes the result.
pub struct CallbackHandler {
    registry: Arc<TrustRegistry>,
    hub: Arc<RelayHub>,
    notifier: Arc<dyn CompletionNotifier>,
}

impl CallbackHandler {
    pub fn new(
        registry: Arc<TrustRegistry>,
        hub: Arc<RelayHub>,
        notifier: Arc<dyn CompletionNotifier>,
    ) -> Self {
        Self {
            registry,
            hub,
            notifier,
        }
    }

    /// Process a callback and always attempt the completion signal afterwards.
    pub async fn ingest(&self, request: &CallbackRequest) -> Result<CallbackAck, CallbackError> {
        let result = AssertUnwindSafe(self.process(request))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(CallbackError::Internal(panic_message(panic.as_ref()))));

        self.acknowledge(request, &result).await;
        result
    }

    /// Ingest a decoded JSON body.
    ///
    /// A body that cannot be read as a callback still gets a FAILED
    /// completion signal when it carries a response URL.
    pub async fn ingest_value(&self, body: &Value) -> Result<CallbackAck, CallbackError> {
        match CallbackRequest::from_value(body) {
            Ok(request) => self.ingest(&request).await,
            Err(e) => {
                tracing::debug!(error = %e, "Malformed callback body");
                let result = Err(e);
                self.acknowledge(&CallbackRequest::envelope_of(body), &result)
                    .await;
                result
            }
        }
    }

    async fn process(&self, request: &CallbackRequest) -> Result<CallbackAck, CallbackError> {
        if request.request_kind() == RequestKind::Delete {
            tracing::info!(
                stack_name = request.stack_name().unwrap_or_default(),
                "Delete callback acknowledged"
            );
            return Ok(CallbackAck::DeleteAcknowledged);
        }

        let failure = request.reports_failure();
        let mut missing = Vec::new();
        if request.team_id().is_none() {
            missing.push("teamId");
        }
        if request.external_id().is_none() {
            missing.push("externalId");
        }
        if !failure {
            if request.role_arn().is_none() {
                missing.push("roleArn");
            }
            if request.stack_name().is_none() {
                missing.push("stackName");
            }
        }
        let (Some(team_id), Some(external_id)) = (request.team_id(), request.external_id()) else {
            return Err(CallbackError::MissingFields(missing));
        };
        if !missing.is_empty() {
            return Err(CallbackError::MissingFields(missing));
        }

        if failure {
            return self.record_failure(request, team_id, external_id).await;
        }

        let role_arn = request.role_arn().unwrap_or_default();
        let stack_name = request.stack_name().unwrap_or_default();
        match self.registry.bind(team_id, external_id, role_arn).await {
            Ok(outcome) => {
                let event = DeploymentEvent::new(
                    team_id,
                    stack_name,
                    STATUS_CREATE_COMPLETE,
                    "Cross-account role connected.",
                    self.hub.stamp(),
                )
                .with_output("trustStatus", "BOUND")
                .with_output("roleArn", role_arn);
                self.hub.publish(event);

                tracing::info!(team_id, stack_name, ?outcome, "Callback bound trust");
                Ok(CallbackAck::Bound {
                    team_id: team_id.to_string(),
                    outcome,
                })
            }
            Err(RegistryError::TokenExpired { team_id: team, ttl }) => {
                self.hub.publish(
                    DeploymentEvent::new(
                        &team,
                        stack_name,
                        STATUS_FAILED,
                        "Launch link expired. Start a new deployment.",
                        self.hub.stamp(),
                    )
                    .with_output("trustStatus", "FAILED"),
                );
                Err(RegistryError::TokenExpired { team_id: team, ttl }.into())
            }
            Err(e) => {
                if e.is_correlation_error() {
                    tracing::warn!(
                        team_id,
                        token = %token_fingerprint(external_id),
                        error = %e,
                        "Callback rejected"
                    );
                }
                Err(e.into())
            }
        }
    }

    async fn record_failure(
        &self,
        request: &CallbackRequest,
        team_id: &str,
        external_id: &str,
    ) -> Result<CallbackAck, CallbackError> {
        let reason = non_empty(&request.reason).unwrap_or("Deployment reported failure");
        self.registry
            .report_failure(team_id, external_id, reason)
            .await?;

        let stack_name = request.stack_name().unwrap_or_default();
        self.hub.publish(
            DeploymentEvent::new(team_id, stack_name, STATUS_FAILED, reason, self.hub.stamp())
                .with_output("trustStatus", "FAILED"),
        );
        tracing::info!(team_id, stack_name, reason, "Callback reported failure");
        Ok(CallbackAck::FailureRecorded {
            team_id: team_id.to_string(),
        })
    }

    /// Send the completion signal if the request asked for one. Never fails.
    async fn acknowledge(
        &self,
        request: &CallbackRequest,
        result: &Result<CallbackAck, CallbackError>,
    ) {
        let Some(response_url) = non_empty(&request.response_url) else {
            return;
        };
        let signal = completion_signal(request, result);

        match AssertUnwindSafe(self.notifier.notify(response_url, &signal))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => {
                tracing::debug!(status = signal.status, "Completion signal sent");
            }
            Ok(Err(e)) => {
                tracing::error!(error = %e, status = signal.status, "Completion signal failed");
            }
            Err(panic) => {
                tracing::error!(
                    panic = %panic_message(panic.as_ref()),
                    "Completion signal panicked"
                );
            }
        }
    }
}

/// Build the custom-resource response for a processing result.
pub fn completion_signal(
    request: &CallbackRequest,
    result: &Result<CallbackAck, CallbackError>,
) -> CompletionSignal {
    let physical_resource_id = non_empty(&request.physical_resource_id)
        .map(str::to_string)
        .or_else(|| request.team_id().map(|t| format!("stackrelay-trust-{t}")))
        .unwrap_or_else(|| "stackrelay-trust".to_string());

    let (status, reason, data) = match result {
        Ok(CallbackAck::DeleteAcknowledged) => ("SUCCESS", "Delete acknowledged".to_string(), json!({})),
        Ok(CallbackAck::Bound { .. }) => (
            "SUCCESS",
            "Cross-account role connected".to_string(),
            json!({ "RoleArn": request.role_arn().unwrap_or_default() }),
        ),
        Ok(CallbackAck::FailureRecorded { .. }) => {
            ("SUCCESS", "Failure recorded".to_string(), json!({}))
        }
        Err(e) => {
            let message = e.public_message();
            ("FAILED", message.clone(), json!({ "Error": message }))
        }
    };

    CompletionSignal {
        status,
        reason,
        physical_resource_id,
        stack_id: request.stack_id.clone(),
        request_id: request.request_id.clone(),
        logical_resource_id: request.logical_resource_id.clone(),
        data,
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use tokio::time::timeout;

    use super::*;
    use crate::config::RelayConfig;
    use crate::db::memory::MemoryTrustStore;
    use crate::registry::TrustStatus;

    const ROLE: &str = "arn:aws:iam::123456789012:role/OpsConvergeRole";

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<(String, CompletionSignal)>>,
        fail: bool,
    }

    #[async_trait]
    impl CompletionNotifier for RecordingNotifier {
        async fn notify(
            &self,
            response_url: &str,
            signal: &CompletionSignal,
        ) -> Result<(), ChannelError> {
            self.sent
                .lock()
                .unwrap()
                .push((response_url.to_string(), signal.clone()));
            if self.fail {
                return Err(ChannelError::SendFailed {
                    name: "test".to_string(),
                    reason: "unreachable".to_string(),
                });
            }
            Ok(())
        }
    }

    struct Fixture {
        registry: Arc<TrustRegistry>,
        hub: Arc<RelayHub>,
        notifier: Arc<RecordingNotifier>,
        handler: CallbackHandler,
    }

    fn fixture_with(notifier: RecordingNotifier) -> Fixture {
        let registry = Arc::new(TrustRegistry::new(Arc::new(MemoryTrustStore::new()), None));
        let hub = Arc::new(RelayHub::new(RelayConfig::default()));
        let notifier = Arc::new(notifier);
        let handler = CallbackHandler::new(
            Arc::clone(&registry),
            Arc::clone(&hub),
            Arc::clone(&notifier) as Arc<dyn CompletionNotifier>,
        );
        Fixture {
            registry,
            hub,
            notifier,
            handler,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(RecordingNotifier::default())
    }

    fn body(value: serde_json::Value) -> CallbackRequest {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn bind_publishes_to_team_subscribers() {
        let f = fixture();
        let token = f.registry.issue_token("T1").await.unwrap();
        let mut t1 = f.hub.connect().unwrap();
        let mut t2 = f.hub.connect().unwrap();
        t1.subscribe("T1").unwrap();
        t2.subscribe("T2").unwrap();

        let ack = f
            .handler
            .ingest(&body(json!({
                "teamId": "T1",
                "externalId": token,
                "roleArn": ROLE,
                "stackName": "S1",
                "requestType": "Create",
            })))
            .await
            .unwrap();
        assert_eq!(
            ack,
            CallbackAck::Bound {
                team_id: "T1".to_string(),
                outcome: BindOutcome::Bound
            }
        );
        assert_eq!(f.registry.get("T1").await.unwrap().status, TrustStatus::Bound);

        let event = timeout(Duration::from_secs(1), t1.recv()).await.unwrap().unwrap();
        assert_eq!(event.status, STATUS_CREATE_COMPLETE);
        assert_eq!(event.stack_name, "S1");
        assert_eq!(event.outputs["roleArn"], ROLE);
        assert!(timeout(Duration::from_millis(50), t2.recv()).await.is_err());
    }

    #[tokio::test]
    async fn unknown_token_is_rejected_without_side_effects() {
        let f = fixture();
        f.registry.issue_token("T1").await.unwrap();
        let mut sub = f.hub.connect().unwrap();
        sub.subscribe("T1").unwrap();

        let err = f
            .handler
            .ingest(&body(json!({
                "teamId": "T1", "externalId": "Y", "roleArn": ROLE,
                "stackName": "S1", "requestType": "Create",
            })))
            .await
            .unwrap_err();
        assert!(matches!(err, CallbackError::Rejected(_)));
        assert_eq!(f.registry.get("T1").await.unwrap().status, TrustStatus::Pending);
        assert!(timeout(Duration::from_millis(50), sub.recv()).await.is_err());
    }

    #[tokio::test]
    async fn unknown_team_and_bad_token_look_identical() {
        let f = fixture();
        f.registry.issue_token("T1").await.unwrap();

        let unknown = f
            .handler
            .ingest(&body(json!({
                "teamId": "ghost", "externalId": "x", "roleArn": ROLE, "stackName": "S",
            })))
            .await
            .unwrap_err();
        let mismatch = f
            .handler
            .ingest(&body(json!({
                "teamId": "T1", "externalId": "x", "roleArn": ROLE, "stackName": "S",
            })))
            .await
            .unwrap_err();
        assert_eq!(unknown.public_message(), mismatch.public_message());
        assert_eq!(unknown.to_string(), mismatch.to_string());
    }

    #[tokio::test]
    async fn delete_succeeds_without_registry_or_events() {
        let f = fixture();
        let mut sub = f.hub.connect().unwrap();
        sub.subscribe("T1").unwrap();

        let ack = f
            .handler
            .ingest(&body(json!({ "teamId": "T1", "requestType": "Delete" })))
            .await
            .unwrap();
        assert_eq!(ack, CallbackAck::DeleteAcknowledged);
        assert!(matches!(
            f.registry.get("T1").await,
            Err(RegistryError::NotFound { .. })
        ));
        assert!(timeout(Duration::from_millis(50), sub.recv()).await.is_err());
    }

    #[tokio::test]
    async fn missing_fields_are_listed() {
        let f = fixture();
        let err = f
            .handler
            .ingest(&body(json!({ "teamId": "T1", "roleArn": "  " })))
            .await
            .unwrap_err();
        match err {
            CallbackError::MissingFields(fields) => {
                assert_eq!(fields, vec!["externalId", "roleArn", "stackName"]);
            }
            other => panic!("Expected MissingFields, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn lambda_property_names_are_accepted() {
        let f = fixture();
        let token = f.registry.issue_token("T1").await.unwrap();
        let ack = f
            .handler
            .ingest(&body(json!({
                "OpsConvergeID": "T1",
                "ExternalIDOverride": token,
                "RoleArnOverride": ROLE,
                "StackName": "S1",
                "RequestType": "Update",
            })))
            .await
            .unwrap();
        assert!(matches!(ack, CallbackAck::Bound { .. }));
    }

    #[tokio::test]
    async fn custom_resource_envelope_gets_success_signal() {
        let f = fixture();
        let token = f.registry.issue_token("T1").await.unwrap();
        f.handler
            .ingest(&body(json!({
                "RequestType": "Create",
                "ResponseURL": "https://cloudformation-custom-resource-response-useast2.s3.us-east-2.amazonaws.com/x",
                "StackId": "arn:aws:cloudformation:us-east-2:1:stack/S1/abc",
                "RequestId": "req-1",
                "LogicalResourceId": "PortalCallback",
                "ResourceProperties": {
                    "TeamID": "T1",
                    "ExternalID": token,
                    "RoleArn": ROLE,
                    "StackName": "S1",
                },
            })))
            .await
            .unwrap();

        let sent = f.notifier.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let (_, signal) = &sent[0];
        assert_eq!(signal.status, "SUCCESS");
        assert_eq!(signal.request_id.as_deref(), Some("req-1"));
        assert_eq!(signal.logical_resource_id.as_deref(), Some("PortalCallback"));
        assert_eq!(signal.data["RoleArn"], ROLE);
    }

    #[tokio::test]
    async fn rejected_envelope_still_gets_failed_signal() {
        let f = fixture();
        f.registry.issue_token("T1").await.unwrap();
        let result = f
            .handler
            .ingest(&body(json!({
                "RequestType": "Create",
                "ResponseURL": "https://s3.amazonaws.com/x",
                "ResourceProperties": {
                    "TeamID": "T1", "ExternalID": "forged", "RoleArn": ROLE, "StackName": "S1",
                },
            })))
            .await;
        assert!(result.is_err());

        let sent = f.notifier.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1.status, "FAILED");
        assert_eq!(sent[0].1.reason, "Callback rejected");
    }

    #[tokio::test]
    async fn notifier_failure_does_not_change_result() {
        let f = fixture_with(RecordingNotifier {
            fail: true,
            ..Default::default()
        });
        let token = f.registry.issue_token("T1").await.unwrap();
        let ack = f
            .handler
            .ingest(&body(json!({
                "teamId": "T1", "externalId": token, "roleArn": ROLE, "stackName": "S1",
                "responseUrl": "https://s3.amazonaws.com/x",
            })))
            .await;
        assert!(ack.is_ok());
        assert_eq!(f.notifier.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn redelivered_callback_is_idempotent() {
        let f = fixture();
        let token = f.registry.issue_token("T1").await.unwrap();
        let request = body(json!({
            "teamId": "T1", "externalId": token, "roleArn": ROLE, "stackName": "S1",
        }));
        f.handler.ingest(&request).await.unwrap();
        let again = f.handler.ingest(&request).await.unwrap();
        assert_eq!(
            again,
            CallbackAck::Bound {
                team_id: "T1".to_string(),
                outcome: BindOutcome::AlreadyBound
            }
        );
    }

    #[tokio::test]
    async fn explicit_failure_marks_failed_and_publishes() {
        let f = fixture();
        let token = f.registry.issue_token("T1").await.unwrap();
        let mut sub = f.hub.connect().unwrap();
        sub.subscribe("T1").unwrap();

        let ack = f
            .handler
            .ingest(&body(json!({
                "teamId": "T1", "externalId": token, "stackName": "S1",
                "status": "FAILED", "reason": "IAM role creation failed",
            })))
            .await
            .unwrap();
        assert!(matches!(ack, CallbackAck::FailureRecorded { .. }));
        assert_eq!(f.registry.get("T1").await.unwrap().status, TrustStatus::Failed);

        let event = timeout(Duration::from_secs(1), sub.recv()).await.unwrap().unwrap();
        assert_eq!(event.status, STATUS_FAILED);
        assert_eq!(event.message, "IAM role creation failed");

        // The failed token can no longer bind.
        let err = f
            .handler
            .ingest(&body(json!({
                "teamId": "T1", "externalId": token, "roleArn": ROLE, "stackName": "S1",
            })))
            .await
            .unwrap_err();
        assert!(matches!(err, CallbackError::Rejected(_)));
    }

    #[test]
    fn repeated_spellings_take_first_non_empty() {
        let request = body(json!({
            "ResourceProperties": {
                "TeamID": "T1",
                "OpsConvergeID": "T2",
                "ExternalID": "",
                "ExternalIDOverride": "tok",
                "RoleArn": null,
                "RoleArnOverride": ROLE,
            },
            "ResponseURL": "https://s3.amazonaws.com/a",
            "responseURL": "https://s3.amazonaws.com/b",
        }));
        assert_eq!(request.team_id(), Some("T1"));
        assert_eq!(request.external_id(), Some("tok"));
        assert_eq!(request.role_arn(), Some(ROLE));
        assert_eq!(request.response_url.as_deref(), Some("https://s3.amazonaws.com/a"));
    }

    #[test]
    fn non_string_values_are_malformed() {
        let err = CallbackRequest::from_value(&json!({ "TeamID": 42 })).unwrap_err();
        assert_eq!(err.public_message(), "Malformed callback: TeamID must be a string");
        assert!(CallbackRequest::from_value(&json!({ "ResourceProperties": [] })).is_err());
        assert!(CallbackRequest::from_value(&json!("T1")).is_err());
        assert!(serde_json::from_value::<CallbackRequest>(json!({ "teamId": true })).is_err());
    }

    #[tokio::test]
    async fn malformed_envelope_still_gets_failed_signal() {
        let f = fixture();
        let err = f
            .handler
            .ingest_value(&json!({
                "RequestType": "Create",
                "ResponseURL": "https://s3.amazonaws.com/x",
                "StackId": "arn:aws:cloudformation:us-east-2:1:stack/S1/abc",
                "RequestId": "req-1",
                "LogicalResourceId": "PortalCallback",
                "ResourceProperties": { "TeamID": { "id": "T1" } },
            }))
            .await
            .unwrap_err();
        assert!(matches!(err, CallbackError::Malformed(_)));

        let sent = f.notifier.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let (url, signal) = &sent[0];
        assert_eq!(url, "https://s3.amazonaws.com/x");
        assert_eq!(signal.status, "FAILED");
        assert_eq!(signal.request_id.as_deref(), Some("req-1"));
        assert_eq!(signal.logical_resource_id.as_deref(), Some("PortalCallback"));
        assert_eq!(signal.physical_resource_id, "stackrelay-trust");
    }

    #[tokio::test]
    async fn malformed_body_without_envelope_sends_nothing() {
        let f = fixture();
        let result = f.handler.ingest_value(&json!([1, 2, 3])).await;
        assert!(matches!(result, Err(CallbackError::Malformed(_))));
        assert!(f.notifier.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn allowlist_checks_scheme_and_host_suffix() {
        let notifier = HttpCompletionNotifier::new(&CallbackConfig {
            ack_allowed_hosts: vec!["amazonaws.com".to_string()],
            ack_timeout: Duration::from_secs(1),
        })
        .unwrap();
        assert!(notifier.is_allowed("https://bucket.s3.us-east-2.amazonaws.com/signed?x=1"));
        assert!(notifier.is_allowed("https://amazonaws.com/x"));
        assert!(!notifier.is_allowed("http://bucket.s3.amazonaws.com/x"));
        assert!(!notifier.is_allowed("https://amazonaws.com.evil.example/x"));
        assert!(!notifier.is_allowed("https://evilamazonaws.com/x"));
        assert!(!notifier.is_allowed("not a url"));
    }

    #[test]
    fn completion_signal_serializes_pascal_case() {
        let request = body(json!({ "teamId": "T1", "RequestId": "r", "StackId": "s" }));
        let signal = completion_signal(&request, &Ok(CallbackAck::DeleteAcknowledged));
        let value = serde_json::to_value(&signal).unwrap();
        assert_eq!(value["Status"], "SUCCESS");
        assert_eq!(value["PhysicalResourceId"], "stackrelay-trust-T1");
        assert_eq!(value["RequestId"], "r");
        assert_eq!(value["StackId"], "s");
    }
}
