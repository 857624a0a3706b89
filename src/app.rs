//! Service assembly and lifecycle.
//!
//! One [`App`] owns the single relay hub and every component that publishes
//! to it. Startup opens the trust store, wires the components together and
//! starts the gateway; shutdown closes the hub, stops background watches and
//! stops the gateway.

use std::net::SocketAddr;
use std::sync::Arc;

use rand::RngCore;

use crate::callback::{CallbackHandler, CompletionNotifier, HttpCompletionNotifier};
use crate::channels::web::server::{GatewayState, start_server};
use crate::config::{Config, ProviderConfig};
use crate::db::{TrustStore, connect_from_config};
use crate::error::{ChannelError, Error};
use crate::launch::LaunchUrlBuilder;
use crate::poller::{StackStatusSource, StatusPoller};
use crate::registry::TrustRegistry;
use crate::relay::RelayHub;

pub struct App {
    pub config: Config,
    pub registry: Arc<TrustRegistry>,
    pub hub: Arc<RelayHub>,
    pub launcher: Arc<LaunchUrlBuilder>,
    pub poller: Arc<StatusPoller>,
    pub callbacks: Arc<CallbackHandler>,
}

impl App {
    /// Open the configured store and provider clients, then assemble.
    pub async fn build(config: Config) -> Result<Self, Error> {
        let store = connect_from_config(&config.database).await?;
        let source = status_source(&config.provider).await;
        let notifier: Arc<dyn CompletionNotifier> =
            Arc::new(HttpCompletionNotifier::new(&config.callback)?);
        Ok(Self::from_parts(config, store, source, notifier))
    }

    /// Assemble from already-built collaborators.
    pub fn from_parts(
        config: Config,
        store: Arc<dyn TrustStore>,
        source: Arc<dyn StackStatusSource>,
        notifier: Arc<dyn CompletionNotifier>,
    ) -> Self {
        let registry = Arc::new(TrustRegistry::new(store, config.trust.token_ttl));
        let hub = Arc::new(RelayHub::new(config.relay.clone()));
        let launcher = Arc::new(LaunchUrlBuilder::new(
            Arc::clone(&registry),
            &config.provider,
        ));
        let poller = Arc::new(StatusPoller::new(
            source,
            Arc::clone(&registry),
            Arc::clone(&hub),
            config.poller.clone(),
            config.provider.use_team_role,
        ));
        let callbacks = Arc::new(CallbackHandler::new(
            Arc::clone(&registry),
            Arc::clone(&hub),
            notifier,
        ));

        Self {
            config,
            registry,
            hub,
            launcher,
            poller,
            callbacks,
        }
    }

    pub fn gateway_state(&self) -> Arc<GatewayState> {
        Arc::new(GatewayState {
            registry: Arc::clone(&self.registry),
            launcher: Arc::clone(&self.launcher),
            callbacks: Arc::clone(&self.callbacks),
            poller: Arc::clone(&self.poller),
            hub: Arc::clone(&self.hub),
            allowed_origins: self.config.gateway.allowed_origins.clone(),
            shutdown_tx: tokio::sync::RwLock::new(None),
        })
    }

    /// Start the gateway on the configured address.
    pub async fn serve(&self, auth_token: String) -> Result<(SocketAddr, Arc<GatewayState>), Error> {
        let addr: SocketAddr = format!("{}:{}", self.config.gateway.host, self.config.gateway.port)
            .parse()
            .map_err(|e| ChannelError::StartupFailed {
                name: "gateway".to_string(),
                reason: format!(
                    "invalid listen address {}:{}: {e}",
                    self.config.gateway.host, self.config.gateway.port
                ),
            })?;
        let state = self.gateway_state();
        let bound = start_server(addr, Arc::clone(&state), auth_token).await?;
        Ok((bound, state))
    }

    /// Close every relay connection, stop watches, then stop the gateway.
    pub async fn shutdown(&self, state: &GatewayState) {
        self.hub.shutdown();
        self.poller.stop_all();
        state.shutdown().await;
        tracing::info!("stackrelay stopped");
    }
}

/// Gateway bearer token: the configured one, or a fresh random one.
pub fn resolve_auth_token(configured: Option<&str>) -> (String, bool) {
    match configured.filter(|t| !t.is_empty()) {
        Some(token) => (token.to_string(), false),
        None => {
            let mut bytes = [0u8; 32];
            rand::rngs::OsRng.fill_bytes(&mut bytes);
            let token = bytes.iter().map(|b| format!("{b:02x}")).collect();
            (token, true)
        }
    }
}

#[cfg(feature = "aws")]
async fn status_source(provider: &ProviderConfig) -> Arc<dyn StackStatusSource> {
    Arc::new(crate::poller::cloudformation::CloudFormationSource::from_env(provider).await)
}

#[cfg(not(feature = "aws"))]
async fn status_source(_provider: &ProviderConfig) -> Arc<dyn StackStatusSource> {
    tracing::warn!("Built without the aws feature; stack status lookups are unavailable");
    Arc::new(crate::poller::UnconfiguredSource)
}
