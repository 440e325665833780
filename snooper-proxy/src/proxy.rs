//! The streaming proxy engine.
//!
//! Forwards each inbound request to the configured target, tee-wiring
//! both bodies for asynchronous observation. Event-stream responses are
//! relayed line by line with per-event observation and deadline
//! extension; everything else streams through a tee body whose captured
//! bytes are observed after the client copy completes.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;

use axum::body::Body;
use bytes::{Bytes, BytesMut};
use futures_channel::mpsc;
use futures_util::SinkExt;
use http::{header, HeaderMap, HeaderValue, Request, Response, StatusCode, Uri};
use http_body::Frame;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Incoming;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::call::ProxyCallContext;
use crate::error::ProxyError;
use crate::logging::{RequestHead, ResponseHead};
use crate::manager::ModuleManager;
use crate::metrics::SnooperMetrics;
use crate::ordered::OrderedProcessor;
use crate::tee::{observer, TeeBody};

/// Default sliding call timeout.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Default path prefix classified as an event stream regardless of the
/// response content type.
pub const DEFAULT_SSE_PATH_PREFIX: &str = "/eth/v1/events";

/// Upper bound on tee buffer pre-allocation from Content-Length hints.
const MAX_SIZE_HINT: u64 = 64 * 1024 * 1024;

type UpstreamClient = Client<HttpsConnector<HttpConnector>, TeeBody<Body>>;

/// Construction options for [`Snooper`].
pub struct SnooperOptions {
    pub call_timeout: Duration,
    pub color: bool,
    pub sse_path_prefix: String,
    pub metrics: Option<Arc<SnooperMetrics>>,
}

impl Default for SnooperOptions {
    fn default() -> Self {
        Self {
            call_timeout: DEFAULT_CALL_TIMEOUT,
            color: true,
            sse_path_prefix: DEFAULT_SSE_PATH_PREFIX.to_string(),
            metrics: None,
        }
    }
}

/// Admission state: the enabled flag and the optional per-route block
/// set, guarded together.
struct FlowState {
    enabled: bool,
    blocked: HashSet<String>,
}

pub struct Snooper {
    target: Uri,
    pub(crate) call_timeout: Duration,
    client: UpstreamClient,
    flow: RwLock<FlowState>,
    call_counter: AtomicU64,
    pub(crate) ordered: OrderedProcessor,
    pub(crate) modules: Arc<ModuleManager>,
    pub(crate) metrics: Option<Arc<SnooperMetrics>>,
    pub(crate) color: bool,
    sse_path_prefix: String,
    shutdown: CancellationToken,
}

impl Snooper {
    pub fn new(target: &str, options: SnooperOptions) -> Result<Arc<Self>, ProxyError> {
        let target: Uri = target
            .parse()
            .map_err(|err| ProxyError::InvalidTarget(format!("{err}")))?;

        if target.scheme().is_none() || target.authority().is_none() {
            return Err(ProxyError::InvalidTarget(format!(
                "target must be an absolute URL, got {target}"
            )));
        }

        // rustls needs a process-wide crypto provider; install once.
        static RUSTLS_INIT: OnceLock<()> = OnceLock::new();
        RUSTLS_INIT.get_or_init(|| {
            if rustls::crypto::CryptoProvider::get_default().is_none() {
                let _ = rustls::crypto::ring::default_provider().install_default();
            }
        });
        if rustls::crypto::CryptoProvider::get_default().is_none() {
            return Err(ProxyError::Upstream(
                "failed to install rustls crypto provider".to_string(),
            ));
        }

        let mut http_connector = HttpConnector::new();
        http_connector.set_nodelay(true);
        http_connector.enforce_http(false);

        let https_connector = HttpsConnectorBuilder::new()
            .with_native_roots()
            .map_err(|err| ProxyError::Upstream(format!("failed to load TLS roots: {err}")))?
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(http_connector);

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .build(https_connector);

        Ok(Arc::new(Self {
            target,
            call_timeout: options.call_timeout,
            client,
            flow: RwLock::new(FlowState {
                enabled: true,
                blocked: HashSet::new(),
            }),
            call_counter: AtomicU64::new(0),
            ordered: OrderedProcessor::new(),
            modules: Arc::new(ModuleManager::new()),
            metrics: options.metrics,
            color: options.color,
            sse_path_prefix: options.sse_path_prefix,
            shutdown: CancellationToken::new(),
        }))
    }

    pub fn modules(&self) -> Arc<ModuleManager> {
        self.modules.clone()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Cancel in-flight calls and release ordered-log waiters.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.ordered.stop();
    }

    pub fn flow_enabled(&self) -> bool {
        self.flow.read().unwrap_or_else(|e| e.into_inner()).enabled
    }

    pub fn set_flow_enabled(&self, enabled: bool) {
        self.flow.write().unwrap_or_else(|e| e.into_inner()).enabled = enabled;
    }

    pub fn block_route(&self, route: String) {
        self.flow
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .blocked
            .insert(route);
    }

    pub fn unblock_route(&self, route: &str) {
        self.flow
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .blocked
            .remove(route);
    }

    pub(crate) fn target_authority(&self) -> String {
        self.target
            .authority()
            .map(|a| a.to_string())
            .unwrap_or_default()
    }

    pub(crate) fn target_scheme(&self) -> String {
        self.target
            .scheme_str()
            .unwrap_or_default()
            .to_string()
    }

    /// Entry point for proxied traffic.
    pub async fn handle(
        self: Arc<Self>,
        remote: SocketAddr,
        request: Request<Body>,
    ) -> Response<Body> {
        match self.process_call(remote, request).await {
            Ok(response) => response,
            Err(err @ (ProxyError::FlowDisabled | ProxyError::RouteBlocked)) => {
                info!(message = %err, "proxy call rejected");
                err.into_response()
            }
            Err(err @ ProxyError::Cancelled) => {
                warn!(error = %err, "call cancelled");
                err.into_response()
            }
            Err(err) => {
                error!(error = %err, "call failed");
                err.into_response()
            }
        }
    }

    async fn process_call(
        self: &Arc<Self>,
        remote: SocketAddr,
        request: Request<Body>,
    ) -> Result<Response<Body>, ProxyError> {
        self.admit(request.uri().path())?;

        let call_id = self.call_counter.fetch_add(1, Ordering::AcqRel) + 1;
        let call = ProxyCallContext::new(call_id, &self.shutdown, self.call_timeout);

        let result = self.forward(&call, remote, request).await;

        if result.is_err() {
            call.cancel();
        }

        result
    }

    fn admit(&self, path: &str) -> Result<(), ProxyError> {
        let flow = self.flow.read().unwrap_or_else(|e| e.into_inner());

        if !flow.enabled {
            return Err(ProxyError::FlowDisabled);
        }

        if flow.blocked.iter().any(|route| path.starts_with(route)) {
            return Err(ProxyError::RouteBlocked);
        }

        Ok(())
    }

    async fn forward(
        self: &Arc<Self>,
        call: &Arc<ProxyCallContext>,
        remote: SocketAddr,
        request: Request<Body>,
    ) -> Result<Response<Body>, ProxyError> {
        let (parts, inbound_body) = request.into_parts();

        let request_head = RequestHead {
            method: parts.method.clone(),
            uri: parts.uri.clone(),
            headers: parts.headers.clone(),
        };

        // Forward all inbound headers; the Host header is replaced by the
        // target's and the observed peer is appended to X-Forwarded-For.
        let mut headers = parts.headers.clone();
        headers.remove(header::HOST);

        let forwarded_for = match headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
            Some(existing) if !existing.is_empty() => format!("{existing}, {remote}"),
            _ => remote.to_string(),
        };
        if let Ok(value) = HeaderValue::try_from(forwarded_for) {
            headers.insert("x-forwarded-for", value);
        }

        let target_uri = self.compose_target_uri(&parts.uri)?;

        // Tee the request body; its observer logs, dispatches modules and
        // releases the response observer.
        let request_hint = size_hint(&parts.headers);
        let request_tee = {
            let snooper = self.clone();
            let call = call.clone();
            let head = request_head.clone();
            TeeBody::with_size_hint(
                inbound_body,
                request_hint,
                observer(move |bytes| snooper.log_request(call, head, bytes)),
            )
        };

        let mut upstream_request = Request::builder()
            .method(parts.method.clone())
            .uri(target_uri)
            .body(request_tee)
            .map_err(|err| ProxyError::Upstream(format!("failed to build request: {err}")))?;
        *upstream_request.headers_mut() = headers;

        call.mark_upstream_started();

        // No client-side timeout: the call context governs lifetime.
        let upstream_response = tokio::select! {
            result = self.client.request(upstream_request) => {
                result.map_err(|err| ProxyError::Upstream(err.to_string()))?
            }
            _ = call.token().cancelled() => return Err(ProxyError::Cancelled),
        };

        if call.is_cancelled() {
            return Err(ProxyError::Cancelled);
        }

        let content_type = upstream_response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        let is_event_stream = content_type.starts_with("text/event-stream")
            || parts.uri.path().starts_with(&self.sse_path_prefix);

        if is_event_stream && upstream_response.status() == StatusCode::OK {
            Ok(self.stream_events(call, request_head, upstream_response))
        } else {
            Ok(self.stream_buffered(call, request_head, upstream_response))
        }
    }

    /// Buffered-stream path: the upstream body flows to the client
    /// through a tee whose observer waits for the request entry, then
    /// decodes, dispatches and logs with the call duration.
    fn stream_buffered(
        self: &Arc<Self>,
        call: &Arc<ProxyCallContext>,
        request_head: RequestHead,
        upstream_response: Response<Incoming>,
    ) -> Response<Body> {
        let (parts, upstream_body) = upstream_response.into_parts();

        let response_head = ResponseHead {
            status: parts.status,
            headers: parts.headers.clone(),
        };

        let hint = size_hint(&parts.headers);
        let tee = {
            let snooper = self.clone();
            let call_obs = call.clone();
            TeeBody::with_size_hint(
                upstream_body,
                hint,
                observer(move |bytes| {
                    snooper.log_response(call_obs, request_head, response_head, bytes)
                }),
            )
            .with_cancellation(call.token().clone())
        };

        Response::from_parts(parts, Body::new(tee))
    }

    /// Event-stream path: relay one line at a time, accumulate events,
    /// observe each completed event and extend the call deadline.
    fn stream_events(
        self: &Arc<Self>,
        call: &Arc<ProxyCallContext>,
        request_head: RequestHead,
        upstream_response: Response<Incoming>,
    ) -> Response<Body> {
        call.extend(self.call_timeout);

        let (mut parts, upstream_body) = upstream_response.into_parts();

        // Disable intermediate proxy buffering; each line is flushed as
        // its own frame.
        parts
            .headers
            .insert("x-accel-buffering", HeaderValue::from_static("no"));

        let response_head = ResponseHead {
            status: parts.status,
            headers: parts.headers.clone(),
        };

        let (tx, rx) = mpsc::channel::<Result<Frame<Bytes>, ProxyError>>(16);

        tokio::spawn(relay_event_stream(
            self.clone(),
            call.clone(),
            request_head,
            response_head,
            upstream_body,
            tx,
        ));

        Response::from_parts(parts, Body::new(StreamBody::new(rx)))
    }

    fn compose_target_uri(&self, inbound: &Uri) -> Result<Uri, ProxyError> {
        let base = self.target.to_string();
        let base = base.trim_end_matches('/');

        let path = inbound.path();
        let query = inbound
            .query()
            .map(|q| format!("?{q}"))
            .unwrap_or_default();

        format!("{base}{path}{query}")
            .parse()
            .map_err(|err| ProxyError::InvalidTarget(format!("{err}")))
    }
}

/// Pre-allocation hint from a Content-Length header, bounded to keep a
/// hostile header from reserving unbounded memory.
fn size_hint(headers: &HeaderMap) -> usize {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(|len| len.min(MAX_SIZE_HINT) as usize)
        .unwrap_or(0)
}

/// Relay an event stream line by line.
///
/// Every complete line is forwarded to the client immediately; blank
/// lines terminate the current event, which is then observed inline (the
/// line is already on the wire at that point) and extends the deadline.
async fn relay_event_stream(
    snooper: Arc<Snooper>,
    call: Arc<ProxyCallContext>,
    request_head: RequestHead,
    response_head: ResponseHead,
    mut upstream_body: Incoming,
    mut tx: mpsc::Sender<Result<Frame<Bytes>, ProxyError>>,
) {
    let mut pending = BytesMut::new();
    let mut event_buf = BytesMut::new();

    loop {
        let frame = tokio::select! {
            frame = upstream_body.frame() => frame,
            _ = call.token().cancelled() => return,
        };

        let data = match frame {
            Some(Ok(frame)) => match frame.into_data() {
                Ok(data) => data,
                Err(_trailers) => continue,
            },
            Some(Err(err)) => {
                warn!(call_id = call.id(), error = %err, "event stream error");
                let _ = tx
                    .send(Err(ProxyError::Response(err.to_string())))
                    .await;
                return;
            }
            None => return,
        };

        pending.extend_from_slice(&data);

        while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
            let line = pending.split_to(pos + 1).freeze();

            // Forward the line before anything else; observation must
            // never delay the client.
            if tx.send(Ok(Frame::data(line.clone()))).await.is_err() {
                return;
            }

            let is_blank = line.iter().all(|&b| b == b'\n' || b == b'\r');

            if is_blank {
                if event_buf.len() > 2 {
                    let event = std::mem::take(&mut event_buf).freeze();
                    snooper
                        .clone()
                        .log_event(
                            call.clone(),
                            request_head.clone(),
                            response_head.clone(),
                            event,
                        )
                        .await;
                } else {
                    event_buf.clear();
                }

                if call.is_cancelled() {
                    return;
                }

                call.extend(snooper.call_timeout);
            } else {
                event_buf.extend_from_slice(&line);
            }
        }
    }
}
