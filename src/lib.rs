//! Cross-account trust bootstrap and deployment-status relay.
//!
//! A team launches a provisioning stack in its own cloud account through a
//! console deep link carrying a one-time correlation token. When the stack's
//! custom resource calls back with that token and a role ARN, the trust
//! record for the team is bound and subscribers on the relay WebSocket see
//! the deployment update. Stack status can also be polled on demand or
//! watched in the background until it settles.

pub mod app;
pub mod bootstrap;
pub mod callback;
pub mod channels;
pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod launch;
pub mod poller;
pub mod registry;
pub mod relay;
pub mod settings;

pub use app::App;
pub use config::Config;
pub use error::{Error, Result};
