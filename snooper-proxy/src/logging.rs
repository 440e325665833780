//! Observation pipeline: decode, render, order, dispatch, emit.
//!
//! Runs on tasks spawned by the tee bodies, never on the proxied byte
//! path. Each observation takes an ordering ticket when it starts,
//! decodes the captured payload (content-encoding expanded, JSON
//! pretty-printed with hex truncation, everything else hex-dumped),
//! waits for its turn, dispatches observer modules and emits the log
//! entry. Response observation additionally waits for its own call's
//! request entry so a call always logs request-then-response.

use std::io::Read;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use http::{HeaderMap, Method, StatusCode, Uri};
use serde_json::Value;
use tracing::{info, warn};

use snooper_core::jsonrpc;
use snooper_core::module::{scratch, ProxyCall, RequestRecord, ResponseRecord, INTERNAL_MODULE_ID};

use crate::call::ProxyCallContext;
use crate::metrics::{MetricsEntry, TrafficLabels};
use crate::proxy::Snooper;
use crate::truncate::truncate_hex_in_tree;

const COLOR_CYAN: &str = "\x1b[36m";
const COLOR_GREEN: &str = "\x1b[32m";
const COLOR_RED: &str = "\x1b[31m";
const COLOR_RESET: &str = "\x1b[0m";

/// Request metadata captured before the body is handed to the upstream.
#[derive(Clone)]
pub(crate) struct RequestHead {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
}

/// Response metadata captured before the body is streamed to the client.
#[derive(Clone)]
pub(crate) struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

/// How the body was rendered for the log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyKind {
    Empty,
    Json,
    Ssz,
    Unknown,
}

impl BodyKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Json => "json",
            Self::Ssz => "ssz",
            Self::Unknown => "unknown",
        }
    }
}

impl Snooper {
    /// Observe a captured request body: decode, dispatch, log, then
    /// signal the response observer.
    pub(crate) async fn log_request(
        self: Arc<Self>,
        call: Arc<ProxyCallContext>,
        head: RequestHead,
        raw: Bytes,
    ) {
        let guard = self.ordered.sequence_guard();

        let decoded = decode_content(&head.headers, raw);
        let content_type = header_str(&head.headers, http::header::CONTENT_TYPE);
        let (parsed, kind, rendered) = render_body(&content_type, &decoded);

        call.set_data(
            INTERNAL_MODULE_ID,
            scratch::REQUEST_SIZE,
            Value::from(decoded.len() as u64),
        );

        if let Some(method) = parsed.as_ref().and_then(jsonrpc::method) {
            call.set_data(
                INTERNAL_MODULE_ID,
                scratch::JRPC_METHOD,
                Value::from(method),
            );
        }

        // wait() is false only when the processor stopped at shutdown;
        // the entry is skipped but the response observer is still
        // released below.
        if guard.wait().await {
            let record = RequestRecord {
                call: call.clone() as Arc<dyn ProxyCall>,
                method: head.method.clone(),
                uri: head.uri.clone(),
                headers: head.headers.clone(),
                body: parsed,
                body_bytes: decoded.clone(),
                content_type,
                timestamp: Utc::now(),
            };
            self.modules.process_request(&record);

            info!(
                call_id = call.id(),
                kind = kind.as_str(),
                length = decoded.len(),
                "REQUEST #{}: {} {}\n{}",
                call.id(),
                head.method,
                head.uri,
                self.colorize(COLOR_CYAN, &rendered),
            );
        }

        drop(guard);

        // Release the response observer only after the request entry is
        // out; this is what keeps request-before-response per call.
        call.mark_request_logged();
    }

    /// Observe a captured response body. Waits for the request entry of
    /// the same call first.
    pub(crate) async fn log_response(
        self: Arc<Self>,
        call: Arc<ProxyCallContext>,
        request_head: RequestHead,
        head: ResponseHead,
        raw: Bytes,
    ) {
        call.request_logged().await;

        let guard = self.ordered.sequence_guard();

        let decoded = decode_content(&head.headers, raw);
        let content_type = header_str(&head.headers, http::header::CONTENT_TYPE);
        let (parsed, kind, rendered) = render_body(&content_type, &decoded);
        let duration = call.upstream_elapsed();

        if !guard.wait().await {
            return;
        }

        let record = ResponseRecord {
            call: call.clone() as Arc<dyn ProxyCall>,
            status: head.status,
            headers: head.headers.clone(),
            body: parsed,
            body_bytes: decoded.clone(),
            content_type,
            timestamp: Utc::now(),
            duration,
        };
        self.modules.process_response(&record);

        let color = if head.status.is_success() {
            COLOR_GREEN
        } else {
            COLOR_RED
        };

        info!(
            call_id = call.id(),
            status = head.status.as_u16(),
            kind = kind.as_str(),
            length = decoded.len(),
            "RESPONSE #{}: {} {}\n{}",
            call.id(),
            request_head.method,
            request_head.uri,
            self.colorize(color, &rendered),
        );

        self.collect_metrics(&call, &request_head, &record);
    }

    /// Observe one complete server-sent event.
    pub(crate) async fn log_event(
        self: Arc<Self>,
        call: Arc<ProxyCallContext>,
        request_head: RequestHead,
        head: ResponseHead,
        raw: Bytes,
    ) {
        let guard = self.ordered.sequence_guard();

        let (parsed, rendered) = render_event(&raw);

        if !guard.wait().await {
            return;
        }

        let record = ResponseRecord {
            call: call.clone() as Arc<dyn ProxyCall>,
            status: head.status,
            headers: head.headers.clone(),
            body: parsed,
            body_bytes: raw.clone(),
            content_type: "text/event-stream".to_string(),
            timestamp: Utc::now(),
            duration: call.upstream_elapsed(),
        };
        self.modules.process_response(&record);

        info!(
            call_id = call.id(),
            status = head.status.as_u16(),
            length = raw.len(),
            "RESPONSE-EVENT {} {}\n{}",
            request_head.method,
            request_head.uri.path(),
            self.colorize(COLOR_GREEN, &rendered),
        );
    }

    fn collect_metrics(
        &self,
        call: &ProxyCallContext,
        request_head: &RequestHead,
        record: &ResponseRecord,
    ) {
        let Some(metrics) = &self.metrics else {
            return;
        };

        let jrpc_method = call
            .get_data(INTERNAL_MODULE_ID, scratch::JRPC_METHOD)
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();

        let bytes_received = call
            .get_data(INTERNAL_MODULE_ID, scratch::REQUEST_SIZE)
            .and_then(|v| v.as_u64())
            .unwrap_or(0);

        let uri = request_head
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| request_head.uri.path().to_string());

        metrics.record(&MetricsEntry {
            labels: TrafficLabels {
                server: self.target_authority(),
                scheme: self.target_scheme(),
                method: request_head.method.to_string(),
                hostname: header_str(&request_head.headers, http::header::HOST),
                status: record.status.as_u16().to_string(),
                uri,
                jrpc_method,
            },
            bytes_received,
            bytes_sent: record.body_bytes.len() as u64,
            duration_seconds: record.duration.as_secs_f64(),
        });
    }

    fn colorize(&self, color: &str, text: &str) -> String {
        if text.is_empty() {
            return String::new();
        }

        if self.color {
            format!("{color}{text}{COLOR_RESET}\n")
        } else {
            format!("{text}\n")
        }
    }
}

fn header_str(headers: &HeaderMap, name: http::header::HeaderName) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

/// Transparently expand `Content-Encoding: gzip` / `br` for observation.
/// The wire bytes are untouched; decode failures fall back to the raw
/// payload.
fn decode_content(headers: &HeaderMap, raw: Bytes) -> Bytes {
    let encoding = headers
        .get(http::header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    match encoding {
        "gzip" => {
            let mut decoded = Vec::with_capacity(raw.len() * 2);
            let mut reader = flate2::read::MultiGzDecoder::new(raw.as_ref());
            match reader.read_to_end(&mut decoded) {
                Ok(_) => Bytes::from(decoded),
                Err(err) => {
                    warn!(error = %err, "failed unpacking gzip body");
                    raw
                }
            }
        }
        "br" => {
            let mut decoded = Vec::with_capacity(raw.len() * 2);
            let mut reader = brotli::Decompressor::new(raw.as_ref(), 4096);
            match reader.read_to_end(&mut decoded) {
                Ok(_) => Bytes::from(decoded),
                Err(err) => {
                    warn!(error = %err, "failed unpacking brotli body");
                    raw
                }
            }
        }
        _ => raw,
    }
}

/// Parse and render a body for logging.
///
/// Octet-stream payloads render as hex. Everything else is tried as
/// JSON: on success the parsed value is kept for module dispatch and the
/// rendered form is pretty-printed with oversized hex strings truncated.
/// Unparseable payloads render as hex.
fn render_body(content_type: &str, data: &Bytes) -> (Option<Value>, BodyKind, String) {
    if data.is_empty() {
        return (None, BodyKind::Empty, String::new());
    }

    if content_type.contains("application/octet-stream") {
        return (None, BodyKind::Ssz, hex::encode(data));
    }

    match serde_json::from_slice::<Value>(data) {
        Ok(parsed) => {
            let rendered = serde_json::to_string_pretty(&truncate_hex_in_tree(&parsed))
                .unwrap_or_default();
            (Some(parsed), BodyKind::Json, rendered)
        }
        Err(_) => (None, BodyKind::Unknown, hex::encode(data)),
    }
}

/// Parse one accumulated SSE event into a JSON object keyed by field
/// name, with the `data` field parsed as JSON when possible.
fn render_event(raw: &Bytes) -> (Option<Value>, String) {
    let text = String::from_utf8_lossy(raw);
    let mut event = serde_json::Map::new();

    for line in text.split('\n') {
        let line = line.trim_matches(['\r', '\n', ' ']);
        if line.is_empty() {
            continue;
        }

        let Some((key, value)) = line.split_once(':') else {
            continue;
        };

        if key.is_empty() {
            continue;
        }

        if key == "data" {
            match serde_json::from_str::<Value>(value.trim_start()) {
                Ok(parsed) => {
                    event.insert(key.to_string(), parsed);
                }
                Err(err) => {
                    warn!(error = %err, "failed parsing event data");
                }
            }
        } else {
            event.insert(key.to_string(), Value::from(value.trim_start()));
        }
    }

    if event.len() >= 2 {
        let value = Value::Object(event);
        let rendered = serde_json::to_string_pretty(&truncate_hex_in_tree(&value))
            .unwrap_or_default();
        (Some(value), rendered)
    } else {
        (None, text.into_owned())
    }
}
