use std::time::Duration;

use crate::config::helpers::{parse_bool_env, parse_env_or};
use crate::error::ConfigError;
use crate::settings::Settings;

/// Status relay hub limits.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Outbound frames queued per connection before it is evicted.
    pub connection_buffer: usize,
    pub max_connections: usize,
    /// Keep the latest event per team and deliver it on subscribe.
    pub replay_last_event: bool,
    /// Teams whose latest event is kept for replay. The oldest is dropped first.
    pub replay_capacity: usize,
    /// A socket write that takes longer closes the connection.
    pub send_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connection_buffer: 32,
            max_connections: 1000,
            replay_last_event: false,
            replay_capacity: 1024,
            send_timeout: Duration::from_millis(5000),
        }
    }
}

impl RelayConfig {
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let relay = &settings.relay;

        let connection_buffer =
            parse_env_or("RELAY_CONNECTION_BUFFER", relay.connection_buffer)?
                .unwrap_or(defaults.connection_buffer);
        if connection_buffer == 0 {
            return Err(ConfigError::InvalidValue {
                key: "RELAY_CONNECTION_BUFFER".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        let send_timeout_ms: u64 =
            parse_env_or("RELAY_SEND_TIMEOUT_MS", relay.send_timeout_ms)?
                .unwrap_or(defaults.send_timeout.as_millis() as u64);
        if send_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "RELAY_SEND_TIMEOUT_MS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            connection_buffer,
            max_connections: parse_env_or("RELAY_MAX_CONNECTIONS", relay.max_connections)?
                .unwrap_or(defaults.max_connections),
            replay_last_event: parse_bool_env(
                "RELAY_REPLAY_LAST_EVENT",
                relay.replay_last_event.unwrap_or(defaults.replay_last_event),
            )?,
            replay_capacity: parse_env_or("RELAY_REPLAY_CAPACITY", relay.replay_capacity)?
                .unwrap_or(defaults.replay_capacity),
            send_timeout: Duration::from_millis(send_timeout_ms),
        })
    }
}

/// Background stack watches started after a launch.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub auto_watch: bool,
    pub watch_interval: Duration,
    pub watch_max_polls: u32,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            auto_watch: true,
            watch_interval: Duration::from_secs(15),
            watch_max_polls: 80,
        }
    }
}

impl PollerConfig {
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let poller = &settings.poller;

        let interval_secs: u64 =
            parse_env_or("POLLER_WATCH_INTERVAL_SECS", poller.watch_interval_secs)?
                .unwrap_or(defaults.watch_interval.as_secs());
        if interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "POLLER_WATCH_INTERVAL_SECS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            auto_watch: parse_bool_env(
                "POLLER_AUTO_WATCH",
                poller.auto_watch.unwrap_or(defaults.auto_watch),
            )?,
            watch_interval: Duration::from_secs(interval_secs),
            watch_max_polls: parse_env_or("POLLER_WATCH_MAX_POLLS", poller.watch_max_polls)?
                .unwrap_or(defaults.watch_max_polls),
        })
    }
}
