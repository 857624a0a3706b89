//! Web gateway: the portal's HTTP API, the phone-home callback endpoint and
//! the deployment-status relay socket.
//!
//! ```text
//! Browser ── Bearer ──► /api/teams/{id}/launch ──► LaunchUrlBuilder ──► TrustRegistry
//!         ◄── WS ─────  /api/relay/ws ◄────────── RelayHub ◄──┬── CallbackHandler ◄── /api/callback/trust ◄── stack
//!                                                             └── StatusPoller ◄──── /api/.../refresh
//! ```

pub mod auth;
pub mod server;
pub mod types;
pub mod ws;
