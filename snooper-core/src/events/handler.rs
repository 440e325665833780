//! Event handler interface and the observation records it consumes.

use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::jsonrpc::RpcError;

/// Initial capacity for pending-call maps.
pub const PENDING_CAPACITY: usize = 100;

/// Data from an intercepted JSON-RPC request.
pub struct RequestEvent {
    /// Unique identifier correlating this request with its response.
    pub call_id: u64,
    pub timestamp: DateTime<Utc>,
    /// JSON-RPC method name, e.g. `engine_getBlobsV1`.
    pub method: String,
    pub params: Vec<Value>,
    /// Raw request body bytes.
    pub body_bytes: Bytes,
}

/// Data from an intercepted JSON-RPC response.
pub struct ResponseEvent {
    pub call_id: u64,
    pub timestamp: DateTime<Utc>,
    /// Time taken for the call to complete.
    pub duration: Duration,
    /// The JSON-RPC `result` field; `None` on error responses.
    pub result: Option<Value>,
    pub error: Option<RpcError>,
    pub body_bytes: Bytes,
}

/// A handler for a family of JSON-RPC methods.
///
/// `on_request` captures whatever the response-side correlation needs and
/// returns whether the response should be routed back to this handler.
pub trait EventHandler: Send + Sync {
    /// Handler name for logging.
    fn name(&self) -> &'static str;

    /// Whether this handler covers the given JSON-RPC method.
    fn matches(&self, method: &str) -> bool;

    /// Process a request; returns true when the matching response should
    /// also be delivered to this handler.
    fn on_request(&self, event: &RequestEvent) -> bool;

    /// Process a response, correlating it with the pending request.
    fn on_response(&self, event: &ResponseEvent);
}

/// Extract the version suffix from a prefixed method name.
///
/// `engine_newPayloadV3` with prefix `engine_newPayload` yields `V3`;
/// an exact prefix match yields the empty string.
pub fn method_version(method: &str, prefix: &str) -> String {
    method
        .strip_prefix(prefix)
        .filter(|v| !v.is_empty())
        .unwrap_or_default()
        .to_string()
}

/// Clamp a call duration to non-negative whole milliseconds.
pub fn duration_ms(duration: Duration) -> u64 {
    duration.as_millis().min(u128::from(u64::MAX)) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_suffix_extraction() {
        assert_eq!(method_version("engine_newPayloadV3", "engine_newPayload"), "V3");
        assert_eq!(method_version("engine_getBlobsV1", "engine_getBlobs"), "V1");
        assert_eq!(method_version("engine_newPayload", "engine_newPayload"), "");
        assert_eq!(method_version("eth_blockNumber", "engine_newPayload"), "");
    }
}
