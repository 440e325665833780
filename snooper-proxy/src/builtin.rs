//! Built-in observer modules.
//!
//! The snooper/counter/tracer modules emit structured events over the
//! control channel that registered them. The events module bridges
//! observed traffic into the engine-API event pipeline.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::{json, Map, Value};
use serde_json_path::JsonPath;

use snooper_core::events::handler::{EventHandler, RequestEvent, ResponseEvent};
use snooper_core::events::router::Router;
use snooper_core::jsonrpc;
use snooper_core::module::{
    scratch, Module, ModuleError, ModuleId, RequestRecord, ResponseRecord, INTERNAL_MODULE_ID,
};

use crate::control::{ControlConnection, ControlMessage};

/// Mirrors every observed request body to the control channel.
pub struct RequestSnooper {
    id: ModuleId,
    connection: Arc<ControlConnection>,
}

impl RequestSnooper {
    pub fn new(id: ModuleId, connection: Arc<ControlConnection>) -> Self {
        Self { id, connection }
    }
}

impl Module for RequestSnooper {
    fn id(&self) -> ModuleId {
        self.id
    }

    fn on_request(&self, record: &RequestRecord) -> Result<(), ModuleError> {
        let event = json!({
            "module_id": self.id,
            "hook_type": "request",
            "request_id": record.call.call_id(),
            "data": record.body.clone().unwrap_or(Value::Null),
            "content_type": record.content_type,
        });

        self.connection
            .send_message(ControlMessage::event(self.id, "hook_event", event))
            .map_err(|err| ModuleError::new(self.id, format!("failed to send hook event: {err}")))
    }

    fn on_response(&self, _record: &ResponseRecord) -> Result<(), ModuleError> {
        Ok(())
    }

    fn configure(&mut self, _config: &Map<String, Value>) -> Result<(), ModuleError> {
        Ok(())
    }

    fn close(&self) {}
}

/// Mirrors every observed response body to the control channel.
pub struct ResponseSnooper {
    id: ModuleId,
    connection: Arc<ControlConnection>,
}

impl ResponseSnooper {
    pub fn new(id: ModuleId, connection: Arc<ControlConnection>) -> Self {
        Self { id, connection }
    }
}

impl Module for ResponseSnooper {
    fn id(&self) -> ModuleId {
        self.id
    }

    fn on_request(&self, _record: &RequestRecord) -> Result<(), ModuleError> {
        Ok(())
    }

    fn on_response(&self, record: &ResponseRecord) -> Result<(), ModuleError> {
        let event = json!({
            "module_id": self.id,
            "hook_type": "response",
            "request_id": record.call.call_id(),
            "data": record.body.clone().unwrap_or(Value::Null),
            "content_type": record.content_type,
        });

        self.connection
            .send_message(ControlMessage::event(self.id, "hook_event", event))
            .map_err(|err| ModuleError::new(self.id, format!("failed to send hook event: {err}")))
    }

    fn configure(&mut self, _config: &Map<String, Value>) -> Result<(), ModuleError> {
        Ok(())
    }

    fn close(&self) {}
}

/// Counts matching requests and reports the running total.
pub struct RequestCounter {
    id: ModuleId,
    connection: Arc<ControlConnection>,
    count: AtomicI64,
}

impl RequestCounter {
    pub fn new(id: ModuleId, connection: Arc<ControlConnection>) -> Self {
        Self {
            id,
            connection,
            count: AtomicI64::new(0),
        }
    }

    pub fn count(&self) -> i64 {
        self.count.load(Ordering::SeqCst)
    }
}

impl Module for RequestCounter {
    fn id(&self) -> ModuleId {
        self.id
    }

    fn on_request(&self, record: &RequestRecord) -> Result<(), ModuleError> {
        let count = self.count.fetch_add(1, Ordering::SeqCst) + 1;

        let event = json!({
            "module_id": self.id,
            "count": count,
            "request_type": record.method.as_str(),
        });

        self.connection
            .send_message(ControlMessage::event(self.id, "counter_event", event))
            .map_err(|err| {
                ModuleError::new(self.id, format!("failed to send counter event: {err}"))
            })
    }

    fn on_response(&self, _record: &ResponseRecord) -> Result<(), ModuleError> {
        Ok(())
    }

    fn configure(&mut self, _config: &Map<String, Value>) -> Result<(), ModuleError> {
        Ok(())
    }

    fn close(&self) {}
}

/// Correlates request/response pairs and reports timing plus optionally
/// extracted fields from both bodies.
pub struct ResponseTracer {
    id: ModuleId,
    connection: Arc<ControlConnection>,
    request_query: Option<JsonPath>,
    response_query: Option<JsonPath>,
}

impl ResponseTracer {
    pub fn new(id: ModuleId, connection: Arc<ControlConnection>) -> Self {
        Self {
            id,
            connection,
            request_query: None,
            response_query: None,
        }
    }

    /// Run a query against a parsed body, collapsing the result list:
    /// none → null-ish None, one → the node, many → an array.
    fn extract(query: &JsonPath, body: Option<&Value>, raw: &[u8]) -> Option<Value> {
        let reparsed;
        let value = match body {
            Some(value) => value,
            None => {
                reparsed = serde_json::from_slice::<Value>(raw).ok()?;
                &reparsed
            }
        };

        let mut results: Vec<Value> = query.query(value).all().into_iter().cloned().collect();

        match results.len() {
            0 => None,
            1 => results.pop(),
            _ => Some(Value::Array(results)),
        }
    }
}

impl Module for ResponseTracer {
    fn id(&self) -> ModuleId {
        self.id
    }

    fn on_request(&self, record: &RequestRecord) -> Result<(), ModuleError> {
        record
            .call
            .set_data(self.id, scratch::WANTS_RESPONSE, json!(true));

        if let Some(query) = &self.request_query {
            if record.content_type.contains("json") {
                if let Some(extracted) =
                    Self::extract(query, record.body.as_ref(), &record.body_bytes)
                {
                    record
                        .call
                        .set_data(self.id, "request_extracted_data", extracted);
                }
            }
        }

        Ok(())
    }

    fn on_response(&self, record: &ResponseRecord) -> Result<(), ModuleError> {
        let request_size = record
            .call
            .get_data(INTERNAL_MODULE_ID, scratch::REQUEST_SIZE)
            .and_then(|v| v.as_u64())
            .unwrap_or(0);

        let response_data = match (&self.response_query, record.content_type.contains("json")) {
            (Some(query), true) => {
                Self::extract(query, record.body.as_ref(), &record.body_bytes)
            }
            _ => None,
        };

        let request_data = record.call.get_data(self.id, "request_extracted_data");

        let event = json!({
            "module_id": self.id,
            "request_id": record.call.call_id(),
            "duration_ms": record.duration.as_millis() as u64,
            "request_size": request_size,
            "response_size": record.body_bytes.len(),
            "status_code": record.status.as_u16(),
            "request_data": request_data,
            "response_data": response_data,
        });

        self.connection
            .send_message(ControlMessage::event(self.id, "tracer_event", event))
            .map_err(|err| {
                ModuleError::new(self.id, format!("failed to send tracer event: {err}"))
            })
    }

    fn configure(&mut self, config: &Map<String, Value>) -> Result<(), ModuleError> {
        if let Some(query) = config.get("request_select").and_then(Value::as_str) {
            if !query.is_empty() {
                self.request_query = Some(JsonPath::parse(query).map_err(|err| {
                    ModuleError::new(self.id, format!("failed to parse request_select query: {err}"))
                })?);
            }
        }

        if let Some(query) = config.get("response_select").and_then(Value::as_str) {
            if !query.is_empty() {
                self.response_query = Some(JsonPath::parse(query).map_err(|err| {
                    ModuleError::new(
                        self.id,
                        format!("failed to parse response_select query: {err}"),
                    )
                })?);
            }
        }

        Ok(())
    }

    fn close(&self) {}
}

/// Bridges observed JSON-RPC pairs into the event pipeline: routes the
/// request to a matching handler and replays the correlated response.
pub struct EventsModule {
    id: ModuleId,
    router: Arc<Router>,
    matched: DashMap<u64, Arc<dyn EventHandler>>,
}

impl EventsModule {
    pub fn new(id: ModuleId, router: Arc<Router>) -> Self {
        Self {
            id,
            router,
            matched: DashMap::with_capacity(100),
        }
    }
}

impl Module for EventsModule {
    fn id(&self) -> ModuleId {
        self.id
    }

    fn on_request(&self, record: &RequestRecord) -> Result<(), ModuleError> {
        let Some(body) = record.body.as_ref() else {
            return Ok(());
        };

        let Some(method) = jsonrpc::method(body) else {
            return Ok(());
        };

        let event = RequestEvent {
            call_id: record.call.call_id(),
            timestamp: record.timestamp,
            method: method.to_string(),
            params: jsonrpc::params(body).cloned().unwrap_or_default(),
            body_bytes: record.body_bytes.clone(),
        };

        if let Some(handler) = self.router.route_request(&event) {
            self.matched.insert(event.call_id, handler);
        }

        Ok(())
    }

    fn on_response(&self, record: &ResponseRecord) -> Result<(), ModuleError> {
        let Some((_, handler)) = self.matched.remove(&record.call.call_id()) else {
            return Ok(());
        };

        let (result, error) = match record.body.as_ref() {
            Some(body) => (
                jsonrpc::result(body).cloned().filter(|v| !v.is_null()),
                jsonrpc::rpc_error(body),
            ),
            None => (None, None),
        };

        let event = ResponseEvent {
            call_id: record.call.call_id(),
            timestamp: record.timestamp,
            duration: record.duration,
            result,
            error,
            body_bytes: record.body_bytes.clone(),
        };

        handler.on_response(&event);

        Ok(())
    }

    fn configure(&mut self, _config: &Map<String, Value>) -> Result<(), ModuleError> {
        Ok(())
    }

    fn close(&self) {}
}
