//! WebSocket control channel for module registration and events.
//!
//! External tooling connects to `/_snooper/control` and registers
//! observer modules with JSON frames. Frames carry `reqid`/`rspid` for
//! request/response correlation; a frame with `binary: true` is followed
//! by one binary frame belonging to it. Modules registered by a
//! connection are unregistered when it closes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use snooper_core::filter::FilterConfig;
use snooper_core::module::{Module, ModuleId};

use crate::builtin::{RequestCounter, RequestSnooper, ResponseSnooper, ResponseTracer};
use crate::manager::ModuleManager;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("control connection closed")]
    Closed,
}

/// One JSON frame on the control channel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControlMessage {
    #[serde(default, skip_serializing_if = "is_zero", rename = "reqid")]
    pub request_id: u64,
    #[serde(default, skip_serializing_if = "is_zero", rename = "rspid")]
    pub response_id: u64,
    #[serde(default, skip_serializing_if = "is_zero", rename = "modid")]
    pub module_id: u64,
    #[serde(default)]
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub time: i64,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub binary: bool,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

impl ControlMessage {
    pub fn event(module_id: ModuleId, method: &str, data: Value) -> Self {
        Self {
            module_id,
            method: method.to_string(),
            data: Some(data),
            time: now_nanos(),
            ..Default::default()
        }
    }
}

fn now_nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(0)
}

#[derive(Debug, Deserialize)]
struct RegisterModuleRequest {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    config: serde_json::Map<String, Value>,
}

#[derive(Debug, Serialize)]
struct RegisterModuleResponse {
    success: bool,
    #[serde(skip_serializing_if = "is_zero")]
    module_id: u64,
    #[serde(skip_serializing_if = "String::is_empty")]
    message: String,
}

/// A received frame with its optional binary payload.
pub struct ControlResponse {
    pub message: ControlMessage,
    pub binary: Option<Bytes>,
}

pub(crate) struct OutgoingFrame {
    pub(crate) message: ControlMessage,
    pub(crate) binary: Option<Bytes>,
}

/// Shared handle to a control connection; modules hold one to emit
/// events without blocking on socket writes.
pub struct ControlConnection {
    outgoing: mpsc::UnboundedSender<OutgoingFrame>,
    pending: DashMap<u64, oneshot::Sender<ControlResponse>>,
    request_counter: AtomicU64,
    done: CancellationToken,
}

impl ControlConnection {
    pub(crate) fn new(outgoing: mpsc::UnboundedSender<OutgoingFrame>) -> Arc<Self> {
        Arc::new(Self {
            outgoing,
            pending: DashMap::new(),
            request_counter: AtomicU64::new(0),
            done: CancellationToken::new(),
        })
    }

    pub fn next_request_id(&self) -> u64 {
        self.request_counter.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Queue a frame for sending. Non-blocking.
    pub fn send_message(&self, message: ControlMessage) -> Result<(), ControlError> {
        self.outgoing
            .send(OutgoingFrame {
                message,
                binary: None,
            })
            .map_err(|_| ControlError::Closed)
    }

    /// Queue a frame followed by a binary frame.
    pub fn send_message_with_binary(
        &self,
        mut message: ControlMessage,
        data: Bytes,
    ) -> Result<(), ControlError> {
        message.binary = true;

        self.outgoing
            .send(OutgoingFrame {
                message,
                binary: Some(data),
            })
            .map_err(|_| ControlError::Closed)
    }

    /// Wait for the peer's response to `request_id`.
    pub async fn wait_for_response(&self, request_id: u64) -> Result<ControlResponse, ControlError> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id, tx);

        let result = tokio::select! {
            response = rx => response.map_err(|_| ControlError::Closed),
            _ = self.done.cancelled() => Err(ControlError::Closed),
        };

        self.pending.remove(&request_id);

        result
    }

    fn resolve(&self, response_id: u64, response: ControlResponse) {
        if let Some((_, waiter)) = self.pending.remove(&response_id) {
            // Waiter may have timed out already; a dropped receiver is fine.
            let _ = waiter.send(response);
        }
    }

    pub fn close(&self) {
        self.done.cancel();
    }
}

/// Drive one control-channel connection to completion.
pub async fn serve_control_socket(socket: WebSocket, manager: Arc<ModuleManager>) {
    let (ws_tx, ws_rx) = socket.split();
    let (out_tx, out_rx) = mpsc::unbounded_channel();

    let connection = ControlConnection::new(out_tx);
    let writer = tokio::spawn(write_loop(ws_tx, out_rx));

    info!("control channel connection established");

    let registered = read_loop(ws_rx, &connection, &manager).await;

    for module_id in registered {
        manager.unregister(module_id);
    }

    connection.close();
    writer.abort();

    info!("control channel connection closed");
}

async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut out_rx: mpsc::UnboundedReceiver<OutgoingFrame>,
) {
    while let Some(frame) = out_rx.recv().await {
        let json = match serde_json::to_string(&frame.message) {
            Ok(json) => json,
            Err(err) => {
                error!(error = %err, "failed to serialize control message");
                continue;
            }
        };

        if ws_tx.send(Message::Text(json.into())).await.is_err() {
            return;
        }

        if let Some(binary) = frame.binary {
            if ws_tx.send(Message::Binary(binary)).await.is_err() {
                return;
            }
        }
    }
}

/// Read frames until the peer disconnects. Returns the ids of modules
/// registered by this connection.
async fn read_loop(
    mut ws_rx: SplitStream<WebSocket>,
    connection: &Arc<ControlConnection>,
    manager: &Arc<ModuleManager>,
) -> Vec<ModuleId> {
    let mut registered = Vec::new();
    let mut awaiting_binary: Option<ControlMessage> = None;

    while let Some(message) = ws_rx.next().await {
        let message = match message {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, "control channel read error");
                break;
            }
        };

        match message {
            Message::Text(text) => {
                let frame: ControlMessage = match serde_json::from_str(text.as_str()) {
                    Ok(frame) => frame,
                    Err(err) => {
                        debug!(error = %err, "failed to parse control message");
                        break;
                    }
                };

                if frame.binary {
                    awaiting_binary = Some(frame);
                } else {
                    handle_frame(connection, manager, &mut registered, frame, None);
                }
            }
            Message::Binary(data) => match awaiting_binary.take() {
                Some(frame) => {
                    handle_frame(connection, manager, &mut registered, frame, Some(data));
                }
                None => warn!("received unexpected binary control frame"),
            },
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    registered
}

fn handle_frame(
    connection: &Arc<ControlConnection>,
    manager: &Arc<ModuleManager>,
    registered: &mut Vec<ModuleId>,
    frame: ControlMessage,
    binary: Option<Bytes>,
) {
    if frame.response_id != 0 {
        connection.resolve(
            frame.response_id,
            ControlResponse {
                message: frame,
                binary,
            },
        );
        return;
    }

    match frame.method.as_str() {
        "register_module" => handle_register(connection, manager, registered, frame),
        "unregister_module" => handle_unregister(connection, manager, registered, frame),
        other => {
            send_error(connection, &frame, &format!("Unknown method: {other}"));
        }
    }
}

fn handle_register(
    connection: &Arc<ControlConnection>,
    manager: &Arc<ModuleManager>,
    registered: &mut Vec<ModuleId>,
    frame: ControlMessage,
) {
    let request: RegisterModuleRequest = match frame
        .data
        .clone()
        .ok_or_else(|| "missing data".to_string())
        .and_then(|data| serde_json::from_value(data).map_err(|err| err.to_string()))
    {
        Ok(request) => request,
        Err(err) => {
            send_error(connection, &frame, &format!("Invalid registration request: {err}"));
            return;
        }
    };

    let module_id = manager.next_module_id();

    let mut module: Box<dyn Module> = match request.kind.as_str() {
        "request_snooper" => Box::new(RequestSnooper::new(module_id, connection.clone())),
        "response_snooper" => Box::new(ResponseSnooper::new(module_id, connection.clone())),
        "request_counter" => Box::new(RequestCounter::new(module_id, connection.clone())),
        "response_tracer" => Box::new(ResponseTracer::new(module_id, connection.clone())),
        other => {
            send_error(connection, &frame, &format!("Unknown module type: {other}"));
            return;
        }
    };

    let filters = match FilterConfig::from_module_config(&request.config) {
        Ok(filters) => filters,
        Err(err) => {
            send_error(connection, &frame, &format!("Failed to compile filter: {err}"));
            return;
        }
    };

    if let Err(err) = module.configure(&request.config) {
        send_error(connection, &frame, &format!("Failed to create module: {err}"));
        return;
    }

    manager.register(module.into(), Some(filters));
    registered.push(module_id);

    info!(
        module_id,
        module_type = %request.kind,
        module_name = %request.name,
        "module registered via control channel"
    );

    send_response(
        connection,
        &frame,
        RegisterModuleResponse {
            success: true,
            module_id,
            message: format!("Module {} registered successfully", request.kind),
        },
    );
}

fn handle_unregister(
    connection: &Arc<ControlConnection>,
    manager: &Arc<ModuleManager>,
    registered: &mut Vec<ModuleId>,
    frame: ControlMessage,
) {
    let module_id: ModuleId = match frame
        .data
        .clone()
        .and_then(|data| serde_json::from_value(data).ok())
    {
        Some(module_id) => module_id,
        None => {
            send_error(connection, &frame, "Invalid module ID");
            return;
        }
    };

    manager.unregister(module_id);
    registered.retain(|id| *id != module_id);

    send_response(
        connection,
        &frame,
        serde_json::json!({
            "success": true,
            "message": "Module unregistered successfully",
        }),
    );
}

fn send_response<T: Serialize>(
    connection: &Arc<ControlConnection>,
    original: &ControlMessage,
    data: T,
) {
    let data = match serde_json::to_value(data) {
        Ok(data) => data,
        Err(err) => {
            error!(error = %err, "failed to serialize control response");
            return;
        }
    };

    let response = ControlMessage {
        response_id: original.request_id,
        method: original.method.clone(),
        data: Some(data),
        time: now_nanos(),
        ..Default::default()
    };

    if let Err(err) = connection.send_message(response) {
        warn!(error = %err, "failed to send control response");
    }
}

fn send_error(connection: &Arc<ControlConnection>, original: &ControlMessage, message: &str) {
    let response = ControlMessage {
        response_id: original.request_id,
        method: original.method.clone(),
        error: Some(message.to_string()),
        time: now_nanos(),
        ..Default::default()
    };

    if let Err(err) = connection.send_message(response) {
        warn!(error = %err, "failed to send control error response");
    }
}
