//! Relay WebSocket connections.
//!
//! Each socket owns one [`RelayConnection`]. The loop forwards hub events to
//! the client and applies the client's subscribe/unsubscribe frames. When
//! the socket ends, dropping the connection unregisters it from the hub.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{Sink, SinkExt, Stream, StreamExt};

use crate::channels::web::server::GatewayState;
use crate::channels::web::types::{WsClientMessage, WsServerMessage};
use crate::error::ChannelError;
use crate::launch::is_valid_team_id;
use crate::relay::RelayConnection;

/// Whether a browser `Origin` may open the relay socket.
///
/// With no configured origins only loopback hosts are allowed. Hosts are
/// compared exactly so `http://localhost.evil.com` does not pass.
pub fn origin_allowed(origin: &str, allowed_origins: &[String]) -> bool {
    if !allowed_origins.is_empty() {
        let origin = origin.trim_end_matches('/');
        return allowed_origins
            .iter()
            .any(|allowed| allowed.trim_end_matches('/').eq_ignore_ascii_case(origin));
    }

    let Ok(parsed) = url::Url::parse(origin) else {
        return false;
    };
    if !matches!(parsed.scheme(), "http" | "https") {
        return false;
    }
    matches!(
        parsed.host_str(),
        Some("localhost" | "127.0.0.1" | "[::1]")
    )
}

pub async fn handle_ws_connection(socket: WebSocket, state: Arc<GatewayState>) {
    let (mut sink, mut stream) = socket.split();
    let send_timeout = state.hub.config().send_timeout;

    match state.hub.connect() {
        Ok(mut connection) => {
            let connection_id = connection.id();
            tracing::debug!(connection_id, "Relay WebSocket connected");
            run_relay(&mut sink, &mut stream, &mut connection, send_timeout).await;
            tracing::debug!(connection_id, "Relay WebSocket disconnected");
        }
        Err(e) => {
            tracing::warn!(error = %e, "Relay connection refused");
            let frame = WsServerMessage::Error {
                message: e.to_string(),
            };
            let _ = send(&mut sink, &frame, send_timeout).await;
        }
    }

    if tokio::time::timeout(send_timeout, sink.close()).await.is_err() {
        tracing::debug!("Relay WebSocket close timed out");
    }
}

/// Pump hub events out and client frames in until either side ends.
async fn run_relay<Si, St>(
    sink: &mut Si,
    stream: &mut St,
    connection: &mut RelayConnection,
    send_timeout: Duration,
) where
    Si: Sink<Message, Error = axum::Error> + Unpin,
    St: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let connection_id = connection.id();
    loop {
        let frame = tokio::select! {
            event = connection.recv() => match event {
                Some(event) => WsServerMessage::DeploymentUpdate((*event).clone()),
                None => {
                    if connection.is_evicted() {
                        tracing::debug!(connection_id, "Relay connection evicted");
                        let notice = WsServerMessage::Error {
                            message: "Connection fell behind; reconnect and refresh".to_string(),
                        };
                        let _ = send(sink, &notice, send_timeout).await;
                    }
                    return;
                }
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => handle_client_message(connection, text.as_str()),
                Some(Ok(Message::Close(_))) | None => return,
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    tracing::debug!(connection_id, error = %e, "Relay WebSocket error");
                    return;
                }
            },
        };

        if connection.is_evicted() {
            tracing::debug!(connection_id, "Relay connection evicted");
            return;
        }
        if let Err(e) = send(sink, &frame, send_timeout).await {
            tracing::debug!(connection_id, error = %e, "Relay WebSocket write failed");
            return;
        }
    }
}

fn handle_client_message(connection: &RelayConnection, text: &str) -> WsServerMessage {
    let message = match WsClientMessage::parse(text) {
        Ok(message) => message,
        Err(e) => {
            return WsServerMessage::Error {
                message: e.to_string(),
            };
        }
    };

    match message {
        WsClientMessage::Subscribe { team_id } => {
            if !is_valid_team_id(&team_id) {
                return WsServerMessage::Error {
                    message: "Invalid teamId".to_string(),
                };
            }
            match connection.subscribe(&team_id) {
                Ok(replayed) => {
                    tracing::debug!(connection_id = connection.id(), team_id = %team_id, replayed, "Relay subscribed");
                    WsServerMessage::Subscribed { team_id }
                }
                Err(e) => WsServerMessage::Error {
                    message: e.to_string(),
                },
            }
        }
        WsClientMessage::Unsubscribe => {
            connection.unsubscribe();
            WsServerMessage::Unsubscribed
        }
        WsClientMessage::Ping => WsServerMessage::Pong,
    }
}

/// Write one frame, giving up after `limit`.
async fn send<S>(
    sink: &mut S,
    message: &WsServerMessage,
    limit: Duration,
) -> Result<(), ChannelError>
where
    S: Sink<Message, Error = axum::Error> + Unpin,
{
    let send_failed = |reason: String| ChannelError::SendFailed {
        name: "relay".to_string(),
        reason,
    };
    let text = serde_json::to_string(message).unwrap_or_else(|_| {
        r#"{"type":"error","message":"Failed to encode frame"}"#.to_string()
    });
    match tokio::time::timeout(limit, sink.send(Message::Text(text.into()))).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(send_failed(e.to_string())),
        Err(_) => Err(send_failed(format!("write timed out after {limit:?}"))),
    }
}
