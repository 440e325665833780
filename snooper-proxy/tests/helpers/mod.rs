//! Shared test helpers: a configurable mock upstream and a proxy
//! spawner bound to ephemeral ports.
//!
//! Note: some helpers are provided for test expansion and may not be
//! used by every suite; they are marked `#[allow(dead_code)]`.

#![allow(dead_code)]

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use snooper_proxy::proxy::{Snooper, SnooperOptions};
use snooper_proxy::server;

/// Mock JSON-RPC upstream. Configure per-method responses (returned as
/// raw bytes so byte-fidelity can be asserted), an optional delay, and
/// an SSE endpoint at `/eth/v1/events`.
#[derive(Default)]
pub struct MockUpstream {
    responses: HashMap<String, String>,
    delay: Option<Duration>,
    sse_events: u32,
}

pub struct MockState {
    responses: HashMap<String, String>,
    delay: Option<Duration>,
    sse_events: u32,
    request_count: AtomicU32,
    last_headers: Mutex<Option<HeaderMap>>,
    last_body: Mutex<Option<Value>>,
}

pub struct MockHandle {
    pub addr: SocketAddr,
    state: Arc<MockState>,
    _server: JoinHandle<()>,
}

impl MockUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configure the exact response body for a JSON-RPC method.
    pub fn with_response(mut self, method: &str, body: impl Into<String>) -> Self {
        self.responses.insert(method.to_string(), body.into());
        self
    }

    /// Delay every response by `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of SSE events served by `/eth/v1/events` before the stream
    /// idles open.
    pub fn with_sse_events(mut self, count: u32) -> Self {
        self.sse_events = count;
        self
    }

    pub async fn start(self) -> MockHandle {
        let state = Arc::new(MockState {
            responses: self.responses,
            delay: self.delay,
            sse_events: self.sse_events,
            request_count: AtomicU32::new(0),
            last_headers: Mutex::new(None),
            last_body: Mutex::new(None),
        });

        let app = Router::new()
            .route("/eth/v1/events", get(handle_events))
            .fallback(handle_rpc)
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        MockHandle {
            addr,
            state,
            _server: server,
        }
    }
}

impl MockHandle {
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn request_count(&self) -> u32 {
        self.state.request_count.load(Ordering::SeqCst)
    }

    pub fn last_headers(&self) -> Option<HeaderMap> {
        self.state.last_headers.lock().unwrap().clone()
    }

    pub fn last_body(&self) -> Option<Value> {
        self.state.last_body.lock().unwrap().clone()
    }
}

async fn handle_rpc(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    state.request_count.fetch_add(1, Ordering::SeqCst);
    *state.last_headers.lock().unwrap() = Some(headers);

    let parsed: Option<Value> = serde_json::from_slice(&body).ok();
    *state.last_body.lock().unwrap() = parsed.clone();

    if let Some(delay) = state.delay {
        tokio::time::sleep(delay).await;
    }

    let method = parsed
        .as_ref()
        .and_then(|v| v.get("method"))
        .and_then(Value::as_str)
        .unwrap_or_default();

    let response = state.responses.get(method).cloned().unwrap_or_else(|| {
        json!({
            "jsonrpc": "2.0",
            "id": parsed.as_ref().and_then(|v| v.get("id")).cloned().unwrap_or(Value::Null),
            "error": {"code": -32601, "message": format!("Method not found: {method}")},
        })
        .to_string()
    });

    Response::builder()
        .status(200)
        .header("content-type", "application/json")
        .body(Body::from(response))
        .unwrap()
}

/// SSE endpoint: serves the configured number of events with short gaps,
/// then keeps the stream open for a long idle period. Incremental
/// delivery through the proxy is observable because the stream as a
/// whole never completes within test timeouts.
async fn handle_events(State(state): State<Arc<MockState>>) -> Response {
    let events = state.sse_events;

    let stream = futures_util::stream::iter(0..events)
        .then(|i| async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok::<_, Infallible>(Bytes::from(format!(
                "event: head\ndata: {{\"slot\":\"{i}\"}}\n\n"
            )))
        })
        .chain(futures_util::stream::once(async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Bytes::new())
        }));

    (
        [("content-type", "text/event-stream")],
        Body::from_stream(stream),
    )
        .into_response()
}

/// Start a proxy instance on an ephemeral port, with the management API
/// nested at `/_snooper`.
pub async fn spawn_proxy(
    target: &str,
    options: SnooperOptions,
) -> (Arc<Snooper>, SocketAddr, JoinHandle<()>) {
    let snooper = Snooper::new(target, options).unwrap();
    let app = server::proxy_app(snooper.clone(), true);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    (snooper, addr, server)
}

/// Poll `check` until it returns true or `timeout` elapses.
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;

    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    check()
}
