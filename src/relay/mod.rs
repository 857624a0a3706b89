//! Deployment status relay.
//!
//! A [`RelayHub`] fans [`DeploymentEvent`]s out to live client connections,
//! partitioned by team. Producers (callback ingestion, the status poller)
//! stamp events with the hub's [`EventClock`] so clients can discard an
//! event older than the last one they rendered.

mod clock;
mod hub;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use self::clock::EventClock;
pub use self::hub::{ConnectionId, PublishReport, RelayConnection, RelayHub, RelayStats};

/// Terminal: the stack finished creating.
pub const STATUS_CREATE_COMPLETE: &str = "CREATE_COMPLETE";
/// Terminal: the deployment or the trust binding failed.
pub const STATUS_FAILED: &str = "FAILED";
/// The provider could not be queried. Not terminal; the client may refresh again.
pub const STATUS_UNAVAILABLE: &str = "STATUS_UNAVAILABLE";

/// One status transition for one team's deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentEvent {
    pub team_id: String,
    pub stack_name: String,
    /// Provider status string, or one of the sentinels in this module.
    pub status: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub outputs: BTreeMap<String, serde_json::Value>,
}

impl DeploymentEvent {
    pub fn new(
        team_id: impl Into<String>,
        stack_name: impl Into<String>,
        status: impl Into<String>,
        message: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            team_id: team_id.into(),
            stack_name: stack_name.into(),
            status: status.into(),
            message: message.into(),
            timestamp,
            outputs: BTreeMap::new(),
        }
    }

    pub fn with_output(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.outputs.insert(key.into(), value.into());
        self
    }

    /// Whether clients should stop waiting for further updates.
    pub fn is_terminal(&self) -> bool {
        is_terminal_status(&self.status)
    }
}

/// `CREATE_COMPLETE` and `FAILED` end a deployment flow.
pub fn is_terminal_status(status: &str) -> bool {
    status == STATUS_CREATE_COMPLETE || status == STATUS_FAILED
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serializes_camel_case() {
        let ts = DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let event = DeploymentEvent::new("T1", "S1", STATUS_CREATE_COMPLETE, "done", ts)
            .with_output("roleArn", "arn:aws:iam::1:role/r");

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["teamId"], "T1");
        assert_eq!(json["stackName"], "S1");
        assert_eq!(json["status"], "CREATE_COMPLETE");
        assert_eq!(json["timestamp"], "2024-05-01T12:00:00Z");
        assert_eq!(json["outputs"]["roleArn"], "arn:aws:iam::1:role/r");
        assert!(event.is_terminal());
    }

    #[test]
    fn only_sentinels_are_terminal() {
        assert!(is_terminal_status("FAILED"));
        assert!(is_terminal_status("CREATE_COMPLETE"));
        assert!(!is_terminal_status("CREATE_IN_PROGRESS"));
        assert!(!is_terminal_status(STATUS_UNAVAILABLE));
    }
}
