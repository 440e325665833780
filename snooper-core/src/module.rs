//! Observer module model.
//!
//! Modules are passive observers of proxied traffic. The proxy hands each
//! module a [`RequestRecord`] when a request body has been captured and a
//! [`ResponseRecord`] when the matching response body has been captured.
//! Modules never see or influence the wire bytes; the records carry the
//! *decoded* payload (gzip/brotli already expanded) alongside the parsed
//! JSON value when one exists.
//!
//! Module entry points are synchronous and must not block: built-in
//! modules hand their output to channels and return.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::{HeaderMap, Method, StatusCode, Uri};
use serde_json::Value;
use thiserror::Error;

/// Stable module identifier, unique for the process lifetime.
pub type ModuleId = u64;

/// Module id 0 is reserved for proxy-internal scratchpad entries
/// (`request_size`, `jrpc_method`).
pub const INTERNAL_MODULE_ID: ModuleId = 0;

/// Error returned by module entry points.
///
/// Dispatch logs these at warn level; they never fail the proxied call.
#[derive(Debug, Error)]
#[error("module {module_id}: {reason}")]
pub struct ModuleError {
    pub module_id: ModuleId,
    pub reason: String,
}

impl ModuleError {
    pub fn new(module_id: ModuleId, reason: impl Into<String>) -> Self {
        Self {
            module_id,
            reason: reason.into(),
        }
    }
}

/// Per-call state shared between the proxy and its observers.
///
/// Implemented by the proxy's call context; modules use it to correlate
/// request and response phases of the same call and to stash per-module
/// values in the call scratchpad.
pub trait ProxyCall: Send + Sync {
    /// Monotonic call id, unique for the process lifetime.
    fn call_id(&self) -> u64;

    /// Store a value in the call scratchpad under `(module_id, key)`.
    fn set_data(&self, module_id: ModuleId, key: &str, value: Value);

    /// Fetch a value from the call scratchpad.
    fn get_data(&self, module_id: ModuleId, key: &str) -> Option<Value>;
}

/// Captured request handed to module dispatch.
pub struct RequestRecord {
    pub call: Arc<dyn ProxyCall>,
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    /// Parsed JSON body, when the payload parsed as JSON.
    pub body: Option<Value>,
    /// Decoded payload bytes (content-encoding expanded).
    pub body_bytes: Bytes,
    pub content_type: String,
    pub timestamp: DateTime<Utc>,
}

/// Captured response handed to module dispatch.
pub struct ResponseRecord {
    pub call: Arc<dyn ProxyCall>,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Option<Value>,
    pub body_bytes: Bytes,
    pub content_type: String,
    pub timestamp: DateTime<Utc>,
    /// Time from upstream request issuance to response body EOF.
    pub duration: Duration,
}

impl ResponseRecord {
    /// Parsed body if present, for observers that only care about JSON.
    pub fn json(&self) -> Option<&Value> {
        self.body.as_ref()
    }
}

/// An observer module.
///
/// `on_response` for a call runs only after `on_request` for the same call
/// has completed; the dispatcher guarantees the ordering.
pub trait Module: Send + Sync {
    fn id(&self) -> ModuleId;

    fn on_request(&self, record: &RequestRecord) -> Result<(), ModuleError>;

    fn on_response(&self, record: &ResponseRecord) -> Result<(), ModuleError>;

    /// Apply registration-time configuration. Called once, before the
    /// module enters the registry.
    fn configure(&mut self, config: &serde_json::Map<String, Value>) -> Result<(), ModuleError>;

    /// Release module resources; called at unregistration.
    fn close(&self);
}

/// Scratchpad keys used by the dispatch protocol.
pub mod scratch {
    /// Set when a module's request filter rejected the call; the response
    /// phase skips the module without re-evaluating.
    pub const SKIP_RESPONSE: &str = "skip_response";

    /// Set by a module's `on_request` to force response-phase delivery
    /// regardless of the response filter.
    pub const WANTS_RESPONSE: &str = "wants_response";

    /// Decoded request body size, recorded by the proxy under module id 0.
    pub const REQUEST_SIZE: &str = "request_size";

    /// JSON-RPC method of the request, recorded by the proxy under
    /// module id 0 for metrics labeling.
    pub const JRPC_METHOD: &str = "jrpc_method";
}
