//! Axum HTTP server for the web gateway.
//!
//! Serves the phone-home callback (public, authenticated by the correlation
//! token in the body), the portal API (bearer token) and the relay socket.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State, WebSocketUpgrade},
    http::{HeaderValue, StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use tokio::sync::oneshot;
use tower_http::cors::{AllowHeaders, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::callback::CallbackHandler;
use crate::channels::web::auth::{AuthState, auth_middleware};
use crate::channels::web::types::*;
use crate::channels::web::ws::{handle_ws_connection, origin_allowed};
use crate::error::{CallbackError, ChannelError, LaunchError, RegistryError};
use crate::launch::{LaunchUrlBuilder, is_valid_stack_name};
use crate::poller::{PollOutcome, StatusPoller};
use crate::registry::TrustRegistry;
use crate::relay::RelayHub;

/// Shared state for all gateway handlers.
pub struct GatewayState {
    pub registry: Arc<TrustRegistry>,
    pub launcher: Arc<LaunchUrlBuilder>,
    pub callbacks: Arc<CallbackHandler>,
    pub poller: Arc<StatusPoller>,
    /// The process-wide relay hub.
    pub hub: Arc<RelayHub>,
    /// Origins allowed to open the relay socket and make CORS requests.
    /// Empty means loopback only.
    pub allowed_origins: Vec<String>,
    /// Shutdown signal sender.
    pub shutdown_tx: tokio::sync::RwLock<Option<oneshot::Sender<()>>>,
}

impl GatewayState {
    /// Stop accepting requests. In-flight requests are allowed to finish.
    pub async fn shutdown(&self) {
        if let Some(tx) = self.shutdown_tx.write().await.take() {
            let _ = tx.send(());
        }
    }
}

/// Start the gateway HTTP server.
///
/// Returns the actual bound `SocketAddr` (useful when binding to port 0).
pub async fn start_server(
    addr: SocketAddr,
    state: Arc<GatewayState>,
    auth_token: String,
) -> Result<SocketAddr, ChannelError> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ChannelError::StartupFailed {
            name: "gateway".to_string(),
            reason: format!("Failed to bind to {}: {}", addr, e),
        })?;
    let bound_addr = listener
        .local_addr()
        .map_err(|e| ChannelError::StartupFailed {
            name: "gateway".to_string(),
            reason: format!("Failed to get local addr: {}", e),
        })?;

    let auth_state = AuthState { token: auth_token };

    // Public routes (no bearer auth)
    let public = Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/callback/trust", post(callback_handler));

    // Protected routes (always require auth)
    let protected = Router::new()
        .route("/api/teams/{team_id}/launch", post(launch_handler))
        .route("/api/teams/{team_id}/trust", get(trust_handler))
        .route(
            "/api/teams/{team_id}/deployment/refresh",
            get(team_refresh_handler).post(team_refresh_handler),
        )
        .route(
            "/api/deployment/refresh",
            get(refresh_handler).post(refresh_handler),
        )
        .route("/api/relay/ws", get(relay_ws_handler))
        .route("/api/relay/status", get(relay_status_handler))
        .route_layer(middleware::from_fn_with_state(
            auth_state.clone(),
            auth_middleware,
        ));

    let cors = cors_layer(bound_addr, &state.allowed_origins)?;

    let app = Router::new()
        .merge(public)
        .merge(protected)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(1024 * 1024)) // 1 MB max request body
        .with_state(state.clone());

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    *state.shutdown_tx.write().await = Some(shutdown_tx);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
                tracing::info!("Web gateway shutting down");
            })
            .await
        {
            tracing::error!("Web gateway server error: {}", e);
        }
    });

    tracing::info!(addr = %bound_addr, "Web gateway listening");
    Ok(bound_addr)
}

/// CORS: configured origins, or the loopback origins of the bound port.
fn cors_layer(addr: SocketAddr, allowed_origins: &[String]) -> Result<CorsLayer, ChannelError> {
    let origins: Vec<String> = if allowed_origins.is_empty() {
        vec![
            format!("http://{}:{}", addr.ip(), addr.port()),
            format!("http://localhost:{}", addr.port()),
        ]
    } else {
        allowed_origins
            .iter()
            .map(|o| o.trim_end_matches('/').to_string())
            .collect()
    };
    let origins = origins
        .iter()
        .map(|o| {
            o.parse::<HeaderValue>()
                .map_err(|e| ChannelError::StartupFailed {
                    name: "gateway".to_string(),
                    reason: format!("Invalid CORS origin '{o}': {e}"),
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
        .allow_headers(AllowHeaders::list([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
        ]))
        .allow_credentials(true))
}

// --- Health ---

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        service: "stackrelay",
    })
}

// --- Callback ---

async fn callback_handler(State(state): State<Arc<GatewayState>>, body: Bytes) -> Response {
    let body: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(body) => body,
        Err(e) => {
            tracing::debug!(error = %e, "Callback body is not valid JSON");
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse::new("Invalid JSON body")),
            )
                .into_response();
        }
    };

    match state.callbacks.ingest_value(&body).await {
        Ok(_) => Json(CallbackResponse { success: true }).into_response(),
        Err(e) => {
            let status = match &e {
                CallbackError::MissingFields(_) | CallbackError::Malformed(_) => {
                    StatusCode::BAD_REQUEST
                }
                CallbackError::Rejected(_) => StatusCode::FORBIDDEN,
                CallbackError::Registry(_) | CallbackError::Internal(_) => {
                    tracing::error!(error = %e, "Callback processing failed");
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            };
            (status, Json(ErrorResponse::new(e.public_message()))).into_response()
        }
    }
}

// --- Launch ---

async fn launch_handler(
    State(state): State<Arc<GatewayState>>,
    Path(team_id): Path<String>,
    body: Bytes,
) -> Result<Json<LaunchResponse>, (StatusCode, String)> {
    let request: LaunchRequest = if body.iter().all(u8::is_ascii_whitespace) {
        LaunchRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| (StatusCode::BAD_REQUEST, format!("Invalid JSON body: {e}")))?
    };

    let template_ref = match request.template_ref.filter(|t| !t.trim().is_empty()) {
        Some(template_ref) => template_ref,
        None => state
            .launcher
            .catalog()
            .default_name()
            .map(str::to_string)
            .ok_or_else(|| {
                (
                    StatusCode::BAD_REQUEST,
                    "No templates configured".to_string(),
                )
            })?,
    };

    let link = state
        .launcher
        .build_launch_url(&team_id, &template_ref)
        .await
        .map_err(|e| match e {
            LaunchError::Registry(e) => {
                tracing::error!(team_id = %team_id, error = %e, "Launch failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to issue launch link".to_string(),
                )
            }
            other => (StatusCode::BAD_REQUEST, other.to_string()),
        })?;

    if state.poller.config().auto_watch {
        state.poller.spawn_watch(&team_id, &link.stack_name);
    }

    Ok(Json(LaunchResponse {
        url: link.url,
        external_id: link.external_id,
        stack_name: link.stack_name,
        template_url: link.template_url,
    }))
}

// --- Trust ---

async fn trust_handler(
    State(state): State<Arc<GatewayState>>,
    Path(team_id): Path<String>,
) -> Result<Json<TrustView>, (StatusCode, String)> {
    match state.registry.get(&team_id).await {
        Ok(record) => Ok(Json(TrustView::from(record))),
        Err(RegistryError::NotFound { .. }) => Err((
            StatusCode::NOT_FOUND,
            "No trust record for team".to_string(),
        )),
        Err(e) => {
            tracing::error!(team_id = %team_id, error = %e, "Trust lookup failed");
            Err((StatusCode::INTERNAL_SERVER_ERROR, "Internal error".to_string()))
        }
    }
}

// --- Refresh ---

/// Stack name from the query string, else from a JSON body.
fn requested_stack_name(
    query: RefreshRequest,
    body: &Bytes,
) -> Result<Option<String>, (StatusCode, String)> {
    let from_body = if body.iter().all(u8::is_ascii_whitespace) {
        None
    } else {
        serde_json::from_slice::<RefreshRequest>(body)
            .map_err(|e| (StatusCode::BAD_REQUEST, format!("Invalid JSON body: {e}")))?
            .stack_name
    };
    let stack_name = query
        .stack_name
        .or(from_body)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    if let Some(name) = &stack_name
        && !is_valid_stack_name(name)
    {
        return Err((StatusCode::BAD_REQUEST, format!("Invalid stack name: {name}")));
    }
    Ok(stack_name)
}

fn refresh_response(outcome: Result<PollOutcome, RegistryError>) -> Response {
    match outcome {
        Ok(PollOutcome::Found(event)) => Json(event).into_response(),
        Ok(outcome) => {
            let status = match outcome {
                PollOutcome::NotFound { .. } => StatusCode::NOT_FOUND,
                _ => StatusCode::SERVICE_UNAVAILABLE,
            };
            match RefreshMiss::from_outcome(outcome) {
                Some(miss) => (status, Json(miss)).into_response(),
                None => status.into_response(),
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "Refresh failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new("Internal error")),
            )
                .into_response()
        }
    }
}

async fn team_refresh_handler(
    State(state): State<Arc<GatewayState>>,
    Path(team_id): Path<String>,
    Query(query): Query<RefreshRequest>,
    body: Bytes,
) -> Response {
    let stack_name = match requested_stack_name(query, &body) {
        Ok(name) => name,
        Err(rejection) => return rejection.into_response(),
    };

    // Without a name, refresh the stack from the team's last launch.
    let stack_name = match stack_name {
        Some(name) => name,
        None => match state.registry.get(&team_id).await {
            Ok(record) => match record.stack_name {
                Some(name) => name,
                None => {
                    return (StatusCode::BAD_REQUEST, "stackName is required").into_response();
                }
            },
            Err(RegistryError::NotFound { .. }) => {
                return (StatusCode::BAD_REQUEST, "stackName is required").into_response();
            }
            Err(e) => return refresh_response(Err(e)),
        },
    };

    refresh_response(
        state
            .poller
            .fetch_and_publish_for(&team_id, &stack_name)
            .await,
    )
}

async fn refresh_handler(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<RefreshRequest>,
    body: Bytes,
) -> Response {
    let stack_name = match requested_stack_name(query, &body) {
        Ok(Some(name)) => name,
        Ok(None) => return (StatusCode::BAD_REQUEST, "stackName is required").into_response(),
        Err(rejection) => return rejection.into_response(),
    };
    refresh_response(state.poller.fetch_and_publish(&stack_name).await)
}

// --- Relay ---

async fn relay_ws_handler(
    headers: axum::http::HeaderMap,
    ws: WebSocketUpgrade,
    State(state): State<Arc<GatewayState>>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    // Browsers always send Origin on WS upgrades; a missing one is a non-browser
    // client trying to skip the cross-site check.
    let origin = headers
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            (
                StatusCode::FORBIDDEN,
                "WebSocket Origin header required".to_string(),
            )
        })?;

    if !origin_allowed(origin, &state.allowed_origins) {
        return Err((
            StatusCode::FORBIDDEN,
            "WebSocket origin not allowed".to_string(),
        ));
    }
    if state.hub.is_closed() {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            "Relay is shutting down".to_string(),
        ));
    }
    Ok(ws.on_upgrade(move |socket| handle_ws_connection(socket, state)))
}

async fn relay_status_handler(State(state): State<Arc<GatewayState>>) -> Json<RelayStatusResponse> {
    Json(RelayStatusResponse::new(
        state.hub.stats(),
        state.hub.is_closed(),
        state.poller.active_watches(),
    ))
}
