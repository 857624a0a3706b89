//! Bearer token authentication for browser-facing routes.

use axum::{
    extract::{Request, State},
    http::{StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use subtle::ConstantTimeEq;

#[derive(Clone)]
pub struct AuthState {
    pub token: String,
}

impl AuthState {
    fn accepts(&self, candidate: &str) -> bool {
        !candidate.is_empty() && bool::from(candidate.as_bytes().ct_eq(self.token.as_bytes()))
    }
}

/// Accepts `Authorization: Bearer <token>`, or `?token=<token>` for WebSocket
/// upgrades where browsers cannot set headers.
pub async fn auth_middleware(
    State(auth): State<AuthState>,
    request: Request,
    next: Next,
) -> Response {
    let header_token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if header_token.is_some_and(|t| auth.accepts(t)) {
        return next.run(request).await;
    }

    let query_token = request.uri().query().and_then(|query| {
        query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(key, _)| *key == "token")
            .and_then(|(_, value)| urlencoding::decode(value).ok())
            .map(|value| value.into_owned())
    });
    if query_token.is_some_and(|t| auth.accepts(&t)) {
        return next.run(request).await;
    }

    (StatusCode::UNAUTHORIZED, "Invalid or missing auth token").into_response()
}

#[cfg(test)]
mod tests {
    use axum::{Router, body::Body, middleware, routing::get};
    use tower::ServiceExt;

    use super::*;

    fn app() -> Router {
        Router::new()
            .route("/secret", get(|| async { "ok" }))
            .route_layer(middleware::from_fn_with_state(
                AuthState {
                    token: "s3cret".to_string(),
                },
                auth_middleware,
            ))
    }

    async fn status_for(request: axum::http::Request<Body>) -> StatusCode {
        app().oneshot(request).await.unwrap().status()
    }

    #[tokio::test]
    async fn bearer_header_is_accepted() {
        let request = axum::http::Request::get("/secret")
            .header("authorization", "Bearer s3cret")
            .body(Body::empty())
            .unwrap();
        assert_eq!(status_for(request).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn query_token_is_accepted() {
        let request = axum::http::Request::get("/secret?x=1&token=s3cret")
            .body(Body::empty())
            .unwrap();
        assert_eq!(status_for(request).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn wrong_or_missing_token_is_rejected() {
        for uri in ["/secret", "/secret?token=nope", "/secret?token="] {
            let request = axum::http::Request::get(uri).body(Body::empty()).unwrap();
            assert_eq!(status_for(request).await, StatusCode::UNAUTHORIZED, "{uri}");
        }
        let request = axum::http::Request::get("/secret")
            .header("authorization", "Basic s3cret")
            .body(Body::empty())
            .unwrap();
        assert_eq!(status_for(request).await, StatusCode::UNAUTHORIZED);
    }
}
