//! `engine_getBlobs*` event handler.
//!
//! Captures the requested versioned hashes, correlates the blob bundle
//! response by call id and classifies the outcome by comparing the
//! non-null entry count to the requested count.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::events::handler::{
    duration_ms, method_version, EventHandler, RequestEvent, ResponseEvent, PENDING_CAPACITY,
};
use crate::events::publisher::EventPublisher;
use crate::events::types::{
    DecoratedEvent, EventData, EventInfo, EventMeta, GetBlobsData,
    EVENT_CONSENSUS_ENGINE_API_GET_BLOBS,
};

const METHOD_PREFIX: &str = "engine_getBlobs";

/// Request data awaiting response correlation.
#[derive(Debug, Clone)]
struct PendingGetBlobs {
    requested_at: DateTime<Utc>,
    versioned_hashes: Vec<String>,
    method_version: String,
}

pub struct EngineGetBlobsHandler {
    publisher: Arc<dyn EventPublisher>,
    pending: DashMap<u64, PendingGetBlobs>,
}

impl EngineGetBlobsHandler {
    pub fn new(publisher: Arc<dyn EventPublisher>) -> Self {
        Self {
            publisher,
            pending: DashMap::with_capacity(PENDING_CAPACITY),
        }
    }
}

impl EventHandler for EngineGetBlobsHandler {
    fn name(&self) -> &'static str {
        "engine_getBlobs"
    }

    fn matches(&self, method: &str) -> bool {
        method.starts_with(METHOD_PREFIX)
    }

    fn on_request(&self, event: &RequestEvent) -> bool {
        let hashes = extract_versioned_hashes(&event.params);
        let version = method_version(&event.method, METHOD_PREFIX);

        debug!(
            call_id = event.call_id,
            requested_count = hashes.len(),
            method_version = %version,
            "captured engine_getBlobs request"
        );

        self.pending.insert(
            event.call_id,
            PendingGetBlobs {
                requested_at: event.timestamp,
                versioned_hashes: hashes,
                method_version: version,
            },
        );

        true
    }

    fn on_response(&self, event: &ResponseEvent) {
        let Some((_, pending)) = self.pending.remove(&event.call_id) else {
            warn!(call_id = event.call_id, "no pending request found for response");
            return;
        };

        let (returned_count, status, error_message) = classify_response(event);

        let data = GetBlobsData {
            requested_at: pending.requested_at,
            duration_ms: duration_ms(event.duration),
            method_version: pending.method_version,
            requested_count: pending.versioned_hashes.len() as u32,
            versioned_hashes: pending.versioned_hashes,
            returned_count,
            status,
            error_message,
        };

        let Some(client) = self.publisher.client_meta() else {
            debug!(call_id = event.call_id, "dropping event: client metadata unavailable");
            return;
        };

        let decorated = DecoratedEvent {
            event: EventInfo::new(EVENT_CONSENSUS_ENGINE_API_GET_BLOBS, event.timestamp),
            meta: EventMeta { client },
            data: EventData::GetBlobs(data),
        };

        if let Err(err) = self.publisher.publish(decorated) {
            error!(error = %err, "failed to publish engine_getBlobs event");
            return;
        }

        debug!(
            call_id = event.call_id,
            duration_ms = duration_ms(event.duration),
            returned_count,
            "published engine_getBlobs event"
        );
    }
}

/// params[0] is the array of versioned hash strings.
fn extract_versioned_hashes(params: &[Value]) -> Vec<String> {
    let Some(list) = params.first().and_then(Value::as_array) else {
        return Vec::new();
    };

    list.iter()
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect()
}

/// Classify the response: `ERROR` on RPC error, `UNSUPPORTED` when the
/// result is null or not an array, otherwise `EMPTY` / `PARTIAL` /
/// `SUCCESS` by non-null entry count.
fn classify_response(event: &ResponseEvent) -> (u32, String, String) {
    if let Some(err) = &event.error {
        return (0, "ERROR".to_string(), err.message.clone());
    }

    let Some(list) = event.result.as_ref().and_then(Value::as_array) else {
        return (0, "UNSUPPORTED".to_string(), String::new());
    };

    let non_null = list.iter().filter(|blob| !blob.is_null()).count() as u32;
    let total = list.len() as u32;

    let status = if non_null == 0 {
        "EMPTY"
    } else if non_null < total {
        "PARTIAL"
    } else {
        "SUCCESS"
    };

    (non_null, status.to_string(), String::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::publisher::tests_support::CapturePublisher;
    use crate::jsonrpc::RpcError;
    use bytes::Bytes;
    use serde_json::json;
    use std::time::Duration;

    fn request_event(hashes: Value) -> RequestEvent {
        RequestEvent {
            call_id: 9,
            timestamp: Utc::now(),
            method: "engine_getBlobsV1".to_string(),
            params: vec![hashes],
            body_bytes: Bytes::new(),
        }
    }

    fn response_event(result: Option<Value>, error: Option<RpcError>) -> ResponseEvent {
        ResponseEvent {
            call_id: 9,
            timestamp: Utc::now(),
            duration: Duration::from_millis(3),
            result,
            error,
            body_bytes: Bytes::new(),
        }
    }

    fn run(handler_result: Option<Value>, error: Option<RpcError>) -> GetBlobsData {
        let capture = Arc::new(CapturePublisher::default());
        let handler = EngineGetBlobsHandler::new(capture.clone());

        handler.on_request(&request_event(json!(["0xh1", "0xh2", "0xh3"])));
        handler.on_response(&response_event(handler_result, error));

        match capture.events().pop().expect("event published").data {
            EventData::GetBlobs(data) => data,
            other => panic!("unexpected event data: {other:?}"),
        }
    }

    #[test]
    fn full_bundle_is_success() {
        let data = run(Some(json!([{"blob": "a"}, {"blob": "b"}, {"blob": "c"}])), None);
        assert_eq!(data.status, "SUCCESS");
        assert_eq!(data.requested_count, 3);
        assert_eq!(data.returned_count, 3);
        assert_eq!(data.versioned_hashes, vec!["0xh1", "0xh2", "0xh3"]);
    }

    #[test]
    fn missing_entries_are_partial() {
        let data = run(Some(json!([{"blob": "a"}, null, {"blob": "c"}])), None);
        assert_eq!(data.status, "PARTIAL");
        assert_eq!(data.returned_count, 2);
    }

    #[test]
    fn all_null_is_empty() {
        let data = run(Some(json!([null, null, null])), None);
        assert_eq!(data.status, "EMPTY");
        assert_eq!(data.returned_count, 0);
    }

    #[test]
    fn null_result_is_unsupported() {
        let data = run(Some(Value::Null), None);
        assert_eq!(data.status, "UNSUPPORTED");

        let data = run(Some(json!({"not": "an array"})), None);
        assert_eq!(data.status, "UNSUPPORTED");
    }

    #[test]
    fn rpc_error_carries_message() {
        let data = run(
            None,
            Some(RpcError {
                code: -32000,
                message: "boom".into(),
            }),
        );
        assert_eq!(data.status, "ERROR");
        assert_eq!(data.error_message, "boom");
        assert_eq!(data.returned_count, 0);
    }
}
