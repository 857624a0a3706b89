//! Request and response types for the web gateway.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ChannelError;
use crate::poller::PollOutcome;
use crate::registry::{TrustRecord, TrustStatus};
use crate::relay::{DeploymentEvent, RelayStats};

// --- Launch ---

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchRequest {
    /// Catalog name or template URL. Falls back to the default template.
    #[serde(default, alias = "template")]
    pub template_ref: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchResponse {
    pub url: String,
    pub external_id: String,
    pub stack_name: String,
    pub template_url: String,
}

// --- Trust ---

/// Trust record as shown to the portal. The external id is never included.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustView {
    pub team_id: String,
    pub status: TrustStatus,
    pub role_arn: Option<String>,
    pub stack_name: Option<String>,
    pub failure_reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<TrustRecord> for TrustView {
    fn from(record: TrustRecord) -> Self {
        Self {
            team_id: record.team_id,
            status: record.status,
            role_arn: record.role_arn,
            stack_name: record.stack_name,
            failure_reason: record.failure_reason,
            updated_at: record.updated_at,
        }
    }
}

// --- Refresh ---

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    #[serde(default, alias = "StackName")]
    pub stack_name: Option<String>,
}

/// Body of a refresh that did not produce a `Found` event.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshMiss {
    pub error: &'static str,
    pub stack_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<DeploymentEvent>,
}

impl RefreshMiss {
    pub fn from_outcome(outcome: PollOutcome) -> Option<Self> {
        match outcome {
            PollOutcome::Found(_) => None,
            PollOutcome::NotFound { stack_name } => Some(Self {
                error: "Stack not found",
                stack_name,
                event: None,
            }),
            PollOutcome::Unavailable(event) => Some(Self {
                error: "Stack status unavailable",
                stack_name: event.stack_name.clone(),
                event: Some(event),
            }),
        }
    }
}

// --- Callback ---

#[derive(Debug, Serialize)]
pub struct CallbackResponse {
    pub success: bool,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

// --- WebSocket ---

/// Message sent by a relay client.
///
/// A bare `{"teamId": "..."}` without a `type` is a subscribe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsClientMessage {
    Subscribe { team_id: String },
    Unsubscribe,
    Ping,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum TaggedClientMessage {
    #[serde(rename = "subscribe")]
    Subscribe {
        #[serde(rename = "teamId", alias = "team_id")]
        team_id: String,
    },
    #[serde(rename = "unsubscribe")]
    Unsubscribe,
    #[serde(rename = "ping")]
    Ping,
}

#[derive(Deserialize)]
struct BareSubscribe {
    #[serde(rename = "teamId", alias = "team_id")]
    team_id: String,
}

impl WsClientMessage {
    pub fn parse(text: &str) -> Result<Self, ChannelError> {
        let invalid = |e: serde_json::Error| ChannelError::InvalidMessage(e.to_string());
        let value: serde_json::Value = serde_json::from_str(text).map_err(invalid)?;
        if value.get("type").is_none() {
            let bare: BareSubscribe = serde_json::from_value(value).map_err(invalid)?;
            return Ok(Self::Subscribe {
                team_id: bare.team_id,
            });
        }
        Ok(match serde_json::from_value(value).map_err(invalid)? {
            TaggedClientMessage::Subscribe { team_id } => Self::Subscribe { team_id },
            TaggedClientMessage::Unsubscribe => Self::Unsubscribe,
            TaggedClientMessage::Ping => Self::Ping,
        })
    }
}

/// Message sent by the server to a relay client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum WsServerMessage {
    #[serde(rename = "deployment_update")]
    DeploymentUpdate(DeploymentEvent),
    #[serde(rename = "subscribed")]
    Subscribed {
        #[serde(rename = "teamId")]
        team_id: String,
    },
    #[serde(rename = "unsubscribed")]
    Unsubscribed,
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "error")]
    Error { message: String },
}

// --- Health / status ---

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
}

#[derive(Debug, Serialize)]
pub struct RelayStatusResponse {
    pub connections: usize,
    pub subscriptions: usize,
    pub teams: usize,
    pub closed: bool,
    pub active_watches: usize,
}

impl RelayStatusResponse {
    pub fn new(stats: RelayStats, closed: bool, active_watches: usize) -> Self {
        Self {
            connections: stats.connections,
            subscriptions: stats.subscriptions,
            teams: stats.teams,
            closed,
            active_watches,
        }
    }
}
