//! Team-partitioned publish/subscribe hub.
//!
//! Each connection owns a bounded queue. Publishing never waits: a full
//! queue evicts its connection, a closed one is unregistered. The index is
//! behind a synchronous mutex that is never held across an `.await`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::relay::{DeploymentEvent, EventClock};

pub type ConnectionId = u64;

/// Outcome of a single [`RelayHub::publish`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    /// Connections dropped because their queue was full.
    pub evicted: usize,
}

/// Point-in-time hub counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct RelayStats {
    pub connections: usize,
    pub subscriptions: usize,
    pub teams: usize,
}

/// State shared between a connection's slot in the hub and its receiving half.
#[derive(Debug, Default)]
struct SlotShared {
    evicted: AtomicBool,
    /// Bumped on every subscription change; queued frames from an older
    /// generation are discarded on receipt.
    generation: AtomicU64,
}

#[derive(Debug)]
struct Delivery {
    generation: u64,
    event: Arc<DeploymentEvent>,
}

struct Slot {
    tx: mpsc::Sender<Delivery>,
    team: Option<String>,
    shared: Arc<SlotShared>,
}

#[derive(Default)]
struct HubIndex {
    connections: HashMap<ConnectionId, Slot>,
    topics: HashMap<String, HashSet<ConnectionId>>,
    last_events: HashMap<String, Arc<DeploymentEvent>>,
    closed: bool,
}

impl HubIndex {
    fn detach(&mut self, id: ConnectionId) {
        let Some(team) = self.connections.get_mut(&id).and_then(|slot| slot.team.take()) else {
            return;
        };
        if let Some(members) = self.topics.get_mut(&team) {
            members.remove(&id);
            if members.is_empty() {
                self.topics.remove(&team);
            }
        }
    }

    fn evict_oldest_replay(&mut self) {
        let oldest = self
            .last_events
            .iter()
            .min_by_key(|(_, event)| event.timestamp)
            .map(|(team, _)| team.clone());
        if let Some(team) = oldest {
            self.last_events.remove(&team);
        }
    }

    fn remove(&mut self, id: ConnectionId) -> Option<Slot> {
        self.detach(id);
        self.connections.remove(&id)
    }
}

/// Process-wide status relay. Create one at startup and share it by `Arc`.
pub struct RelayHub {
    index: Mutex<HubIndex>,
    next_id: AtomicU64,
    clock: EventClock,
    config: RelayConfig,
}

impl RelayHub {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            index: Mutex::new(HubIndex::default()),
            next_id: AtomicU64::new(1),
            clock: EventClock::new(),
            config,
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, HubIndex> {
        self.index.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Timestamp for a new event. Strictly increasing across the process.
    pub fn stamp(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Register a new connection with no subscription.
    pub fn connect(self: &Arc<Self>) -> Result<RelayConnection, RelayError> {
        let (tx, rx) = mpsc::channel(self.config.connection_buffer);
        let shared = Arc::new(SlotShared::default());

        let mut index = self.lock();
        if index.closed {
            return Err(RelayError::Closed);
        }
        if index.connections.len() >= self.config.max_connections {
            return Err(RelayError::AtCapacity {
                max: self.config.max_connections,
            });
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        index.connections.insert(
            id,
            Slot {
                tx,
                team: None,
                shared: Arc::clone(&shared),
            },
        );
        drop(index);

        tracing::debug!(connection_id = id, "Relay connection registered");
        Ok(RelayConnection {
            id,
            rx,
            shared,
            hub: Arc::clone(self),
        })
    }

    /// Point `id` at `team_id`, leaving any previous team first.
    ///
    /// Returns whether a cached event was queued for replay.
    pub fn subscribe(&self, id: ConnectionId, team_id: &str) -> Result<bool, RelayError> {
        let replay_enabled = self.config.replay_last_event;
        let mut index = self.lock();
        let Some(current) = index.connections.get(&id).map(|slot| slot.team.as_deref()) else {
            return Err(RelayError::UnknownConnection(id));
        };
        if current == Some(team_id) {
            return Ok(false);
        }

        index.detach(id);
        index
            .topics
            .entry(team_id.to_string())
            .or_default()
            .insert(id);
        let replay = if replay_enabled {
            index.last_events.get(team_id).cloned()
        } else {
            None
        };

        let Some(slot) = index.connections.get_mut(&id) else {
            return Err(RelayError::UnknownConnection(id));
        };
        slot.team = Some(team_id.to_string());
        let generation = slot.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;

        let replayed = match replay {
            Some(event) => slot.tx.try_send(Delivery { generation, event }).is_ok(),
            None => false,
        };
        drop(index);

        tracing::debug!(connection_id = id, team_id, replayed, "Relay subscription set");
        Ok(replayed)
    }

    /// Drop the connection's subscription but keep it registered.
    pub fn unsubscribe(&self, id: ConnectionId) -> bool {
        let mut index = self.lock();
        let Some(slot) = index.connections.get(&id) else {
            return false;
        };
        let was_subscribed = slot.team.is_some();
        slot.shared.generation.fetch_add(1, Ordering::AcqRel);
        index.detach(id);
        was_subscribed
    }

    /// Unregister a connection. Safe to call more than once and concurrently with publish.
    pub fn remove(&self, id: ConnectionId) {
        if self.lock().remove(id).is_some() {
            tracing::debug!(connection_id = id, "Relay connection removed");
        }
    }

    /// Deliver `event` to every connection subscribed to its team.
    pub fn publish(&self, event: DeploymentEvent) -> PublishReport {
        let event = Arc::new(event);
        let team_id = event.team_id.as_str();

        let targets: Vec<(ConnectionId, u64, mpsc::Sender<Delivery>, Arc<SlotShared>)> = {
            let mut index = self.lock();
            if index.closed {
                return PublishReport::default();
            }
            if self.config.replay_last_event {
                let newer = index
                    .last_events
                    .get(team_id)
                    .is_none_or(|cached| cached.timestamp <= event.timestamp);
                if newer {
                    index
                        .last_events
                        .insert(team_id.to_string(), Arc::clone(&event));
                    if index.last_events.len() > self.config.replay_capacity {
                        index.evict_oldest_replay();
                    }
                }
            }
            let Some(members) = index.topics.get(team_id) else {
                return PublishReport::default();
            };
            members
                .iter()
                .filter_map(|id| {
                    index.connections.get(id).map(|slot| {
                        (
                            *id,
                            slot.shared.generation.load(Ordering::Acquire),
                            slot.tx.clone(),
                            Arc::clone(&slot.shared),
                        )
                    })
                })
                .collect()
        };

        let mut report = PublishReport::default();
        let mut evict = Vec::new();
        let mut gone = Vec::new();
        for (id, generation, tx, shared) in targets {
            match tx.try_send(Delivery {
                generation,
                event: Arc::clone(&event),
            }) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    shared.evicted.store(true, Ordering::Release);
                    evict.push(id);
                }
                Err(TrySendError::Closed(_)) => gone.push(id),
            }
        }

        if !evict.is_empty() || !gone.is_empty() {
            let mut index = self.lock();
            for id in &evict {
                index.remove(*id);
                tracing::warn!(connection_id = id, team_id, "Evicted slow relay connection");
            }
            for id in gone {
                index.remove(id);
            }
            report.evicted = evict.len();
        }

        tracing::debug!(
            team_id,
            status = %event.status,
            delivered = report.delivered,
            evicted = report.evicted,
            "Published deployment event"
        );
        report
    }

    /// Close every connection and refuse new ones. Queued frames still drain.
    pub fn shutdown(&self) {
        let mut index = self.lock();
        index.closed = true;
        let count = index.connections.len();
        index.connections.clear();
        index.topics.clear();
        index.last_events.clear();
        drop(index);
        tracing::info!(connections = count, "Relay hub shut down");
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn stats(&self) -> RelayStats {
        let index = self.lock();
        RelayStats {
            connections: index.connections.len(),
            subscriptions: index.topics.values().map(HashSet::len).sum(),
            teams: index.topics.len(),
        }
    }

    /// Number of connections currently subscribed to `team_id`.
    pub fn subscriber_count(&self, team_id: &str) -> usize {
        self.lock().topics.get(team_id).map_or(0, HashSet::len)
    }
}

/// Receiving half of a relay connection. Dropping it unregisters the connection.
pub struct RelayConnection {
    id: ConnectionId,
    rx: mpsc::Receiver<Delivery>,
    shared: Arc<SlotShared>,
    hub: Arc<RelayHub>,
}

impl RelayConnection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Next event for the current subscription.
    ///
    /// Returns `None` once the connection was evicted or the hub shut down.
    pub async fn recv(&mut self) -> Option<Arc<DeploymentEvent>> {
        loop {
            if self.is_evicted() {
                return None;
            }
            let delivery = self.rx.recv().await?;
            if self.is_evicted() {
                return None;
            }
            if delivery.generation == self.shared.generation.load(Ordering::Acquire) {
                return Some(delivery.event);
            }
        }
    }

    pub fn is_evicted(&self) -> bool {
        self.shared.evicted.load(Ordering::Acquire)
    }

    pub fn subscribe(&self, team_id: &str) -> Result<bool, RelayError> {
        self.hub.subscribe(self.id, team_id)
    }

    pub fn unsubscribe(&self) -> bool {
        self.hub.unsubscribe(self.id)
    }
}

impl Drop for RelayConnection {
    fn drop(&mut self) {
        self.hub.remove(self.id);
    }
}
