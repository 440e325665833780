//! Management REST API.
//!
//! Served under `/_snooper/` on the proxy listener (unless disabled) and
//! optionally on a dedicated listener with Basic auth. Controls the flow
//! switch and the per-route block list, and hosts the module control
//! channel.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, Request, State};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use http::{header, StatusCode};
use serde_json::json;
use subtle::ConstantTimeEq;
use tracing::info;

use crate::control::serve_control_socket;
use crate::proxy::Snooper;

/// Parsed management credentials: user → password.
#[derive(Debug, Clone, Default)]
pub struct ApiAuth {
    users: HashMap<String, String>,
}

impl ApiAuth {
    /// Parse `user:pass[,user:pass]*`. Malformed entries are skipped;
    /// an empty result means auth stays disabled.
    pub fn parse(config: &str) -> Option<Self> {
        let mut users = HashMap::new();

        for entry in config.split(',') {
            if let Some((user, pass)) = entry.split_once(':') {
                users.insert(user.to_string(), pass.to_string());
            }
        }

        if users.is_empty() {
            None
        } else {
            Some(Self { users })
        }
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    /// Constant-time password check.
    fn verify(&self, user: &str, password: &str) -> bool {
        let Some(expected) = self.users.get(user) else {
            return false;
        };

        expected.as_bytes().ct_eq(password.as_bytes()).into()
    }
}

/// Build the management API router.
pub fn api_router(snooper: Arc<Snooper>) -> Router {
    Router::new()
        .route("/status", get(handle_status))
        .route("/start", post(handle_start))
        .route("/stop", post(handle_stop))
        .route("/block", get(handle_block))
        .route("/unblock", get(handle_unblock))
        .route("/control", get(handle_control))
        .with_state(snooper)
}

/// Wrap a router with Basic auth.
pub fn with_basic_auth(router: Router, auth: ApiAuth) -> Router {
    router.layer(middleware::from_fn_with_state(Arc::new(auth), basic_auth))
}

async fn basic_auth(
    State(auth): State<Arc<ApiAuth>>,
    request: Request,
    next: Next,
) -> Response {
    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
        .and_then(|encoded| base64::engine::general_purpose::STANDARD.decode(encoded).ok())
        .and_then(|decoded| String::from_utf8(decoded).ok())
        .and_then(|credentials| {
            credentials
                .split_once(':')
                .map(|(user, password)| auth.verify(user, password))
        })
        .unwrap_or(false);

    if !authorized {
        return unauthorized();
    }

    next.run(request).await
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [
            (header::WWW_AUTHENTICATE, "Basic realm=\"Snooper API\""),
            (header::CONTENT_TYPE, "application/json"),
        ],
        Json(json!({
            "status": "error",
            "message": "Unauthorized",
        })),
    )
        .into_response()
}

async fn handle_status(State(snooper): State<Arc<Snooper>>) -> Json<serde_json::Value> {
    let enabled = snooper.flow_enabled();

    Json(json!({
        "status": "success",
        "enabled": enabled,
        "message": if enabled { "Flow is enabled" } else { "Flow is disabled" },
    }))
}

async fn handle_start(State(snooper): State<Arc<Snooper>>) -> Json<serde_json::Value> {
    snooper.set_flow_enabled(true);
    info!("flow started, proxy requests enabled");

    Json(json!({
        "status": "success",
        "message": "Flow started",
        "enabled": true,
    }))
}

async fn handle_stop(State(snooper): State<Arc<Snooper>>) -> Json<serde_json::Value> {
    snooper.set_flow_enabled(false);
    info!("flow stopped, proxy requests disabled");

    Json(json!({
        "status": "success",
        "message": "Flow stopped",
        "enabled": false,
    }))
}

async fn handle_block(
    State(snooper): State<Arc<Snooper>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(route) = params.get("route").filter(|r| !r.is_empty()) else {
        return missing_route();
    };

    snooper.block_route(route.clone());
    info!(route = %route, "route blocked");

    Json(json!({
        "status": "success",
        "message": "Flow blocked",
    }))
    .into_response()
}

async fn handle_unblock(
    State(snooper): State<Arc<Snooper>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(route) = params.get("route").filter(|r| !r.is_empty()) else {
        return missing_route();
    };

    snooper.unblock_route(route);
    info!(route = %route, "route unblocked");

    Json(json!({
        "status": "success",
        "message": "Flow unblocked",
    }))
    .into_response()
}

fn missing_route() -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({
            "status": "error",
            "message": "missing route parameter",
        })),
    )
        .into_response()
}

async fn handle_control(
    State(snooper): State<Arc<Snooper>>,
    upgrade: WebSocketUpgrade,
) -> Response {
    let manager = snooper.modules();
    upgrade.on_upgrade(move |socket| serve_control_socket(socket, manager))
}
