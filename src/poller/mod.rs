//! On-demand and scheduled stack status lookups.
//!
//! The poller is the fallback path for learning about a deployment when
//! the phone-home resource never ran. It reads from the provider and
//! publishes to the relay hub. It never writes to the trust registry.

#[cfg(feature = "aws")]
pub mod cloudformation;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::task::AbortHandle;

use crate::config::PollerConfig;
use crate::error::{ProviderError, RegistryError};
use crate::registry::{TrustRegistry, TrustStatus};
use crate::relay::{DeploymentEvent, RelayHub, STATUS_FAILED, STATUS_UNAVAILABLE};

pub const DEFAULT_STATUS_MESSAGE: &str = "Deployment update retrieved successfully.";

/// Role to assume when reading a team's stack from its own account.
#[derive(Clone)]
pub struct TeamRole {
    pub role_arn: String,
    pub external_id: String,
}

impl std::fmt::Debug for TeamRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TeamRole")
            .field("role_arn", &self.role_arn)
            .field("external_id", &"[REDACTED]")
            .finish()
    }
}

/// Provider view of one stack.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackSnapshot {
    pub stack_name: String,
    pub status: String,
    pub status_reason: Option<String>,
    pub outputs: BTreeMap<String, String>,
}

/// Source of stack status. `Ok(None)` means the stack does not exist.
#[async_trait]
pub trait StackStatusSource: Send + Sync {
    async fn describe_stack(
        &self,
        stack_name: &str,
        role: Option<&TeamRole>,
    ) -> Result<Option<StackSnapshot>, ProviderError>;
}

/// Used when no provider client is compiled in. Every lookup is unavailable.
pub struct UnconfiguredSource;

#[async_trait]
impl StackStatusSource for UnconfiguredSource {
    async fn describe_stack(
        &self,
        _stack_name: &str,
        _role: Option<&TeamRole>,
    ) -> Result<Option<StackSnapshot>, ProviderError> {
        Err(ProviderError::Unavailable {
            provider: "cloudformation".to_string(),
            reason: "no provider client in this build".to_string(),
        })
    }
}

/// Result of one lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// The stack exists; the event was published.
    Found(DeploymentEvent),
    /// No such stack, or no team owns this stack name. Nothing was published.
    NotFound { stack_name: String },
    /// The provider could not be queried; a `STATUS_UNAVAILABLE` event was published.
    Unavailable(DeploymentEvent),
}

impl PollOutcome {
    pub fn event(&self) -> Option<&DeploymentEvent> {
        match self {
            Self::Found(event) | Self::Unavailable(event) => Some(event),
            Self::NotFound { .. } => None,
        }
    }
}

/// Collapse the provider's failure and rollback states into the `FAILED` sentinel.
pub fn normalize_status(raw: &str) -> &str {
    if raw.ends_with("_FAILED") || raw == "ROLLBACK_IN_PROGRESS" || raw == "ROLLBACK_COMPLETE" {
        STATUS_FAILED
    } else {
        raw
    }
}

/// Map a snapshot into the relay's event shape.
pub fn event_from_snapshot(
    team_id: &str,
    snapshot: StackSnapshot,
    timestamp: DateTime<Utc>,
) -> DeploymentEvent {
    let status = normalize_status(&snapshot.status);
    let message = snapshot
        .status_reason
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_STATUS_MESSAGE.to_string());

    let mut event = DeploymentEvent::new(team_id, snapshot.stack_name, status, message, timestamp);
    if status != snapshot.status {
        event = event.with_output("providerStatus", snapshot.status.clone());
    }
    for (key, value) in snapshot.outputs {
        event.outputs.insert(key, value.into());
    }
    event
}

/// Looks up stacks and publishes what it finds.
pub struct StatusPoller {
    source: Arc<dyn StackStatusSource>,
    registry: Arc<TrustRegistry>,
    hub: Arc<RelayHub>,
    config: PollerConfig,
    use_team_role: bool,
    watches: Mutex<HashMap<String, (u64, AbortHandle)>>,
    next_watch: AtomicU64,
}

impl StatusPoller {
    pub fn new(
        source: Arc<dyn StackStatusSource>,
        registry: Arc<TrustRegistry>,
        hub: Arc<RelayHub>,
        config: PollerConfig,
        use_team_role: bool,
    ) -> Self {
        Self {
            source,
            registry,
            hub,
            config,
            use_team_role,
            watches: Mutex::new(HashMap::new()),
            next_watch: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &PollerConfig {
        &self.config
    }

    /// Look up a stack by name, resolving its team from the launch that created it.
    pub async fn fetch_and_publish(&self, stack_name: &str) -> Result<PollOutcome, RegistryError> {
        match self.registry.find_by_stack_name(stack_name).await? {
            Some(record) => self.fetch_and_publish_for(&record.team_id, stack_name).await,
            None => {
                tracing::debug!(stack_name, "No team launched this stack");
                Ok(PollOutcome::NotFound {
                    stack_name: stack_name.to_string(),
                })
            }
        }
    }

    /// Look up a stack on behalf of `team_id` and publish to that team's topic.
    pub async fn fetch_and_publish_for(
        &self,
        team_id: &str,
        stack_name: &str,
    ) -> Result<PollOutcome, RegistryError> {
        let role = self.team_role(team_id).await?;
        // Stamped before the provider call so a bind landing meanwhile sorts after it.
        let timestamp = self.hub.stamp();

        match self.source.describe_stack(stack_name, role.as_ref()).await {
            Ok(Some(snapshot)) => {
                let event = event_from_snapshot(team_id, snapshot, timestamp);
                tracing::debug!(team_id, stack_name, status = %event.status, "Fetched stack status");
                self.hub.publish(event.clone());
                Ok(PollOutcome::Found(event))
            }
            Ok(None) => {
                tracing::debug!(team_id, stack_name, "Stack not found");
                Ok(PollOutcome::NotFound {
                    stack_name: stack_name.to_string(),
                })
            }
            Err(e) => {
                tracing::warn!(team_id, stack_name, error = %e, "Stack status unavailable");
                let payload = e.to_status_payload();
                let event = DeploymentEvent::new(
                    team_id,
                    stack_name,
                    STATUS_UNAVAILABLE,
                    payload.message.clone(),
                    timestamp,
                )
                .with_output("error", serde_json::to_value(&payload).unwrap_or_default());
                self.hub.publish(event.clone());
                Ok(PollOutcome::Unavailable(event))
            }
        }
    }

    async fn team_role(&self, team_id: &str) -> Result<Option<TeamRole>, RegistryError> {
        if !self.use_team_role {
            return Ok(None);
        }
        match self.registry.get(team_id).await {
            Ok(record) if record.status == TrustStatus::Bound => {
                Ok(record.role_arn.map(|role_arn| TeamRole {
                    role_arn,
                    external_id: record.external_id,
                }))
            }
            Ok(_) | Err(RegistryError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Poll `stack_name` in the background until it reaches a terminal status.
    ///
    /// Replaces any watch already running for the team.
    pub fn spawn_watch(self: &Arc<Self>, team_id: &str, stack_name: &str) {
        let id = self.next_watch.fetch_add(1, Ordering::Relaxed);
        let poller = Arc::clone(self);
        let team = team_id.to_string();
        let stack = stack_name.to_string();

        // Held across the spawn so a watch that ends at once cannot finish before it is registered.
        let mut watches = self.lock_watches();
        let handle = tokio::spawn(async move {
            poller.run_watch(&team, &stack).await;
            poller.finish_watch(&team, id);
        });
        let previous = watches.insert(team_id.to_string(), (id, handle.abort_handle()));
        drop(watches);

        if let Some((_, previous)) = previous {
            previous.abort();
            tracing::debug!(team_id, "Replaced running stack watch");
        }
        tracing::info!(team_id, stack_name, "Started stack watch");
    }

    async fn run_watch(&self, team_id: &str, stack_name: &str) {
        for attempt in 1..=self.config.watch_max_polls {
            tokio::time::sleep(self.config.watch_interval).await;
            match self.fetch_and_publish_for(team_id, stack_name).await {
                Ok(PollOutcome::Found(event)) if event.is_terminal() => {
                    tracing::info!(team_id, stack_name, status = %event.status, "Stack watch finished");
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(team_id, stack_name, attempt, error = %e, "Stack watch poll failed");
                }
            }
        }
        tracing::info!(team_id, stack_name, "Stack watch gave up");
    }

    fn finish_watch(&self, team_id: &str, id: u64) {
        let mut watches = self.lock_watches();
        if watches.get(team_id).is_some_and(|(current, _)| *current == id) {
            watches.remove(team_id);
        }
    }

    /// Abort every running watch.
    pub fn stop_all(&self) {
        let drained: Vec<_> = self.lock_watches().drain().collect();
        for (_, (_, handle)) in &drained {
            handle.abort();
        }
        if !drained.is_empty() {
            tracing::info!(count = drained.len(), "Stopped stack watches");
        }
    }

    pub fn active_watches(&self) -> usize {
        self.lock_watches().len()
    }

    fn lock_watches(&self) -> std::sync::MutexGuard<'_, HashMap<String, (u64, AbortHandle)>> {
        self.watches
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;
    use crate::config::RelayConfig;
    use crate::db::memory::MemoryTrustStore;
    use crate::relay::STATUS_CREATE_COMPLETE;

    type Reply = Result<Option<StackSnapshot>, ProviderError>;

    /// Replays canned replies in order, then repeats the last one.
    #[derive(Default)]
    struct ScriptedSource {
        replies: Mutex<VecDeque<Reply>>,
        roles: Mutex<Vec<Option<String>>>,
    }

    impl ScriptedSource {
        fn new(replies: Vec<Reply>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                roles: Mutex::default(),
            }
        }
    }

    fn clone_reply(reply: &Reply) -> Reply {
        match reply {
            Ok(snapshot) => Ok(snapshot.clone()),
            Err(ProviderError::Unavailable { provider, reason }) => Err(ProviderError::Unavailable {
                provider: provider.clone(),
                reason: reason.clone(),
            }),
            Err(ProviderError::AccessDenied { provider, reason }) => Err(ProviderError::AccessDenied {
                provider: provider.clone(),
                reason: reason.clone(),
            }),
            Err(ProviderError::InvalidResponse { provider, reason }) => {
                Err(ProviderError::InvalidResponse {
                    provider: provider.clone(),
                    reason: reason.clone(),
                })
            }
        }
    }

    #[async_trait]
    impl StackStatusSource for ScriptedSource {
        async fn describe_stack(
            &self,
            _stack_name: &str,
            role: Option<&TeamRole>,
        ) -> Result<Option<StackSnapshot>, ProviderError> {
            self.roles
                .lock()
                .unwrap()
                .push(role.map(|r| r.role_arn.clone()));
            let mut replies = self.replies.lock().unwrap();
            if replies.len() > 1 {
                replies.pop_front().unwrap()
            } else {
                clone_reply(replies.front().unwrap())
            }
        }
    }

    fn snapshot(status: &str) -> StackSnapshot {
        StackSnapshot {
            stack_name: "S1".to_string(),
            status: status.to_string(),
            status_reason: None,
            outputs: BTreeMap::new(),
        }
    }

    struct Fixture {
        registry: Arc<TrustRegistry>,
        hub: Arc<RelayHub>,
        source: Arc<ScriptedSource>,
        poller: Arc<StatusPoller>,
    }

    fn fixture(replies: Vec<Reply>, use_team_role: bool) -> Fixture {
        let registry = Arc::new(TrustRegistry::new(Arc::new(MemoryTrustStore::new()), None));
        let hub = Arc::new(RelayHub::new(RelayConfig::default()));
        let source = Arc::new(ScriptedSource::new(replies));
        let config = PollerConfig {
            auto_watch: true,
            watch_interval: Duration::from_millis(10),
            watch_max_polls: 5,
        };
        let poller = Arc::new(StatusPoller::new(
            Arc::clone(&source) as Arc<dyn StackStatusSource>,
            Arc::clone(&registry),
            Arc::clone(&hub),
            config,
            use_team_role,
        ));
        Fixture {
            registry,
            hub,
            source,
            poller,
        }
    }

    #[tokio::test]
    async fn found_stack_is_published_to_owning_team() {
        let mut snap = snapshot("CREATE_IN_PROGRESS");
        snap.outputs.insert("BucketName".to_string(), "b-1".to_string());
        let f = fixture(vec![Ok(Some(snap))], false);
        f.registry.issue_token_for_launch("T1", "S1").await.unwrap();
        let mut sub = f.hub.connect().unwrap();
        sub.subscribe("T1").unwrap();

        let outcome = f.poller.fetch_and_publish("S1").await.unwrap();
        let PollOutcome::Found(event) = outcome else {
            panic!("Expected Found, got {outcome:?}");
        };
        assert_eq!(event.team_id, "T1");
        assert_eq!(event.message, DEFAULT_STATUS_MESSAGE);
        assert_eq!(event.outputs["BucketName"], "b-1");

        let received = timeout(Duration::from_secs(1), sub.recv()).await.unwrap().unwrap();
        assert_eq!(*received, event);
    }

    #[tokio::test]
    async fn missing_stack_is_not_an_outage() {
        let f = fixture(vec![Ok(None)], false);
        let mut sub = f.hub.connect().unwrap();
        sub.subscribe("T1").unwrap();

        let outcome = f.poller.fetch_and_publish_for("T1", "nope").await.unwrap();
        assert_eq!(
            outcome,
            PollOutcome::NotFound {
                stack_name: "nope".to_string()
            }
        );
        assert!(outcome.event().is_none());
        assert!(timeout(Duration::from_millis(50), sub.recv()).await.is_err());
    }

    #[tokio::test]
    async fn unknown_stack_name_resolves_to_not_found() {
        let f = fixture(vec![Ok(Some(snapshot("CREATE_COMPLETE")))], false);
        let outcome = f.poller.fetch_and_publish("never-launched").await.unwrap();
        assert!(matches!(outcome, PollOutcome::NotFound { .. }));
        assert!(f.source.roles.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn provider_outage_publishes_unavailable_event() {
        let f = fixture(
            vec![Err(ProviderError::Unavailable {
                provider: "cloudformation".to_string(),
                reason: "throttled".to_string(),
            })],
            false,
        );
        let mut sub = f.hub.connect().unwrap();
        sub.subscribe("T1").unwrap();

        let outcome = f.poller.fetch_and_publish_for("T1", "S1").await.unwrap();
        let PollOutcome::Unavailable(event) = outcome else {
            panic!("Expected Unavailable, got {outcome:?}");
        };
        assert_eq!(event.status, STATUS_UNAVAILABLE);
        assert_eq!(event.outputs["error"]["code"], "provider.unavailable");
        assert_eq!(event.outputs["error"]["retryable"], true);
        assert!(!event.is_terminal());

        let received = timeout(Duration::from_secs(1), sub.recv()).await.unwrap().unwrap();
        assert_eq!(received.status, STATUS_UNAVAILABLE);
    }

    #[tokio::test]
    async fn polling_never_touches_the_registry() {
        let f = fixture(vec![Ok(Some(snapshot("CREATE_FAILED")))], false);
        f.registry.issue_token_for_launch("T1", "S1").await.unwrap();

        let outcome = f.poller.fetch_and_publish("S1").await.unwrap();
        assert_eq!(outcome.event().unwrap().status, STATUS_FAILED);
        assert_eq!(f.registry.get("T1").await.unwrap().status, TrustStatus::Pending);
    }

    #[tokio::test]
    async fn team_role_is_used_only_once_bound() {
        let f = fixture(vec![Ok(Some(snapshot("CREATE_IN_PROGRESS")))], true);
        let token = f.registry.issue_token_for_launch("T1", "S1").await.unwrap();
        f.poller.fetch_and_publish("S1").await.unwrap();

        f.registry
            .bind("T1", &token, "arn:aws:iam::1:role/R")
            .await
            .unwrap();
        f.poller.fetch_and_publish("S1").await.unwrap();

        assert_eq!(
            *f.source.roles.lock().unwrap(),
            vec![None, Some("arn:aws:iam::1:role/R".to_string())]
        );
    }

    #[tokio::test]
    async fn poll_stamp_precedes_later_publishes() {
        let f = fixture(vec![Ok(Some(snapshot("CREATE_IN_PROGRESS")))], false);
        let outcome = f.poller.fetch_and_publish_for("T1", "S1").await.unwrap();
        let later = f.hub.stamp();
        assert!(outcome.event().unwrap().timestamp < later);
    }

    #[tokio::test]
    async fn watch_stops_at_terminal_status() {
        let f = fixture(
            vec![
                Ok(None),
                Ok(Some(snapshot("CREATE_IN_PROGRESS"))),
                Ok(Some(snapshot("CREATE_COMPLETE"))),
            ],
            false,
        );
        let mut sub = f.hub.connect().unwrap();
        sub.subscribe("T1").unwrap();

        f.poller.spawn_watch("T1", "S1");
        let first = timeout(Duration::from_secs(2), sub.recv()).await.unwrap().unwrap();
        assert_eq!(first.status, "CREATE_IN_PROGRESS");
        let second = timeout(Duration::from_secs(2), sub.recv()).await.unwrap().unwrap();
        assert_eq!(second.status, STATUS_CREATE_COMPLETE);

        for _ in 0..50 {
            if f.poller.active_watches() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(f.poller.active_watches(), 0);
        assert_eq!(f.source.roles.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn new_watch_replaces_previous_and_stop_all_aborts() {
        let f = fixture(vec![Ok(None)], false);
        f.poller.spawn_watch("T1", "S1");
        f.poller.spawn_watch("T1", "S2");
        f.poller.spawn_watch("T2", "S3");
        assert_eq!(f.poller.active_watches(), 2);

        f.poller.stop_all();
        assert_eq!(f.poller.active_watches(), 0);
    }

    #[test]
    fn rollback_states_normalize_to_failed() {
        assert_eq!(normalize_status("CREATE_FAILED"), STATUS_FAILED);
        assert_eq!(normalize_status("ROLLBACK_IN_PROGRESS"), STATUS_FAILED);
        assert_eq!(normalize_status("ROLLBACK_COMPLETE"), STATUS_FAILED);
        assert_eq!(normalize_status("CREATE_COMPLETE"), STATUS_CREATE_COMPLETE);
        assert_eq!(normalize_status("CREATE_IN_PROGRESS"), "CREATE_IN_PROGRESS");
    }

    #[test]
    fn normalized_event_keeps_provider_status_and_reason() {
        let mut snap = snapshot("ROLLBACK_COMPLETE");
        snap.status_reason = Some("The following resource(s) failed to create: [Role]".to_string());
        let event = event_from_snapshot("T1", snap, Utc::now());

        assert_eq!(event.status, STATUS_FAILED);
        assert_eq!(event.outputs["providerStatus"], "ROLLBACK_COMPLETE");
        assert!(event.message.contains("failed to create"));
        assert!(event.is_terminal());
    }
}
