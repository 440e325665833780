//! Listener assembly: proxy server, standalone API server, metrics server.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use http::{header, StatusCode};
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::api::{api_router, with_basic_auth, ApiAuth};
use crate::proxy::Snooper;

/// Path prefix for the management API on the proxy listener.
pub const API_PATH_PREFIX: &str = "/_snooper";

/// Build the proxy application: optional management API nested under
/// `/_snooper`, everything else proxied.
pub fn proxy_app(snooper: Arc<Snooper>, serve_api: bool) -> Router {
    let mut app = Router::new()
        .fallback(proxy_handler)
        .with_state(snooper.clone());

    if serve_api {
        app = app.nest(API_PATH_PREFIX, api_router(snooper));
    }

    app
}

/// Build the standalone management API application.
pub fn api_app(snooper: Arc<Snooper>, auth: Option<ApiAuth>) -> Router {
    let app = Router::new().nest(API_PATH_PREFIX, api_router(snooper));

    match auth {
        Some(auth) => {
            info!(users = auth.user_count(), "API authentication enabled");
            with_basic_auth(app, auth)
        }
        None => app,
    }
}

/// Build the metrics application.
pub fn metrics_app(registry: Arc<Registry>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(registry)
}

async fn proxy_handler(
    State(snooper): State<Arc<Snooper>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    snooper.handle(remote, request).await.into_response()
}

async fn metrics_handler(State(registry): State<Arc<Registry>>) -> Response {
    let mut buffer = String::new();

    if let Err(err) = prometheus_client::encoding::text::encode(&mut buffer, &registry) {
        error!(error = %err, "failed to encode metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {err}"),
        )
            .into_response();
    }

    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buffer,
    )
        .into_response()
}

/// Bind and run the main proxy listener until shutdown.
pub async fn run_proxy_server(
    snooper: Arc<Snooper>,
    bind: &str,
    port: u16,
    serve_api: bool,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let addr = format!("{bind}:{port}");
    let listener = TcpListener::bind(&addr).await?;

    info!(addr = %addr, "listening on");

    serve(listener, proxy_app(snooper, serve_api), shutdown).await
}

/// Bind and run the standalone management API listener until shutdown.
pub async fn run_api_server(
    snooper: Arc<Snooper>,
    bind: &str,
    port: u16,
    auth: Option<ApiAuth>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let addr = format!("{bind}:{port}");
    let listener = TcpListener::bind(&addr).await?;

    info!(addr = %addr, "API server listening on");

    serve(listener, api_app(snooper, auth), shutdown).await
}

/// Bind and run the metrics listener until shutdown.
pub async fn run_metrics_server(
    registry: Arc<Registry>,
    bind: &str,
    port: u16,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let addr = format!("{bind}:{port}");
    let listener = TcpListener::bind(&addr).await?;

    info!(addr = %addr, "metrics server listening on");

    serve(listener, metrics_app(registry), shutdown).await
}

async fn serve(
    listener: TcpListener,
    app: Router,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown.cancelled_owned())
    .await
}
