//! Error types for the proxy path.

use axum::body::Body;
use axum::response::Response;
use http::{header, StatusCode};
use serde_json::json;
use thiserror::Error;

/// Errors surfaced by the proxy engine.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Proxy flow is administratively disabled (503).
    #[error("Proxy flow is currently disabled")]
    FlowDisabled,

    /// The request path matches a blocked route (503).
    #[error("Proxy route is currently blocked")]
    RouteBlocked,

    /// The target URL could not be composed (500).
    #[error("error parsing proxy url: {0}")]
    InvalidTarget(String),

    /// Upstream dial/TLS/request failure (500).
    #[error("proxy request error: {0}")]
    Upstream(String),

    /// The call context was cancelled before or during streaming (500).
    #[error("proxy context cancelled")]
    Cancelled,

    /// Response assembly failed (500).
    #[error("proxy response error: {0}")]
    Response(String),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::FlowDisabled | Self::RouteBlocked => StatusCode::SERVICE_UNAVAILABLE,
            Self::InvalidTarget(_) | Self::Upstream(_) | Self::Cancelled | Self::Response(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Render the error as the JSON body clients receive.
    pub fn into_response(self) -> Response<Body> {
        json_error_response(self.status(), &self.to_string())
    }
}

/// Build a `{"status":"error","message":…}` response.
pub fn json_error_response(status: StatusCode, message: &str) -> Response<Body> {
    let body = json!({
        "status": "error",
        "message": message,
    });

    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap_or_else(|_| {
            let mut response = Response::new(Body::from("internal error"));
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            response
        })
}
