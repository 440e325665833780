//! `engine_newPayload*` event handler.
//!
//! Captures execution payload details from the request, correlates the
//! payload status response by call id and publishes a decorated event.

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
    DecoratedEvent, EventData, EventInfo, EventMeta, NewPayloadData,
    EVENT_EXECUTION_ENGINE_NEW_PAYLOAD,
};
use crate::jsonrpc::hex_to_u64;

const METHOD_PREFIX: &str = "engine_newPayload";

const STATUS_UNKNOWN: &str = "UNKNOWN";
const STATUS_ERROR: &str = "ERROR";

/// Request data awaiting response correlation.
#[derive(Debug, Clone)]
struct PendingNewPayload {
    requested_at: DateTime<Utc>,
    method_version: String,

    block_number: u64,
    block_hash: String,
    parent_hash: String,
    gas_used: u64,
    gas_limit: u64,
    tx_count: u32,
    blob_count: u32,
}

pub struct EngineNewPayloadHandler {
    publisher: Arc<dyn EventPublisher>,
    pending: DashMap<u64, PendingNewPayload>,
}

impl EngineNewPayloadHandler {
    pub fn new(publisher: Arc<dyn EventPublisher>) -> Self {
        Self {
            publisher,
            pending: DashMap::with_capacity(PENDING_CAPACITY),
        }
    }

    fn extract_payload(event: &RequestEvent) -> PendingNewPayload {
        let mut pending = PendingNewPayload {
            requested_at: event.timestamp,
            method_version: method_version(&event.method, METHOD_PREFIX),
            block_number: 0,
            block_hash: String::new(),
            parent_hash: String::new(),
            gas_used: 0,
            gas_limit: 0,
            tx_count: 0,
            blob_count: 0,
        };

        // params[0] is the execution payload object.
        let Some(payload) = event.params.first().and_then(Value::as_object) else {
            return pending;
        };

        let str_field = |key: &str| {
            payload
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };

        pending.block_number = payload
            .get("blockNumber")
            .and_then(Value::as_str)
            .map(hex_to_u64)
            .unwrap_or(0);
        pending.block_hash = str_field("blockHash");
        pending.parent_hash = str_field("parentHash");
        pending.gas_used = payload
            .get("gasUsed")
            .and_then(Value::as_str)
            .map(hex_to_u64)
            .unwrap_or(0);
        pending.gas_limit = payload
            .get("gasLimit")
            .and_then(Value::as_str)
            .map(hex_to_u64)
            .unwrap_or(0);
        pending.tx_count = payload
            .get("transactions")
            .and_then(Value::as_array)
            .map(|txs| txs.len() as u32)
            .unwrap_or(0);

        // V3+ carries the expected blob versioned hashes in params[1].
        pending.blob_count = event
            .params
            .get(1)
            .and_then(Value::as_array)
            .map(|hashes| hashes.len() as u32)
            .unwrap_or(0);

        pending
    }
}

impl EventHandler for EngineNewPayloadHandler {
    fn name(&self) -> &'static str {
        "engine_newPayload"
    }

    fn matches(&self, method: &str) -> bool {
        method.starts_with(METHOD_PREFIX)
    }

    fn on_request(&self, event: &RequestEvent) -> bool {
        let pending = Self::extract_payload(event);

        debug!(
            call_id = event.call_id,
            block_number = pending.block_number,
            block_hash = %pending.block_hash,
            tx_count = pending.tx_count,
            blob_count = pending.blob_count,
            method_version = %pending.method_version,
            "captured engine_newPayload request"
        );

        self.pending.insert(event.call_id, pending);

        true
    }

    fn on_response(&self, event: &ResponseEvent) {
        let Some((_, pending)) = self.pending.remove(&event.call_id) else {
            warn!(call_id = event.call_id, "no pending request found for response");
            return;
        };

        let (status, latest_valid_hash, validation_error) = extract_response_data(event);

        let data = NewPayloadData {
            requested_at: pending.requested_at,
            duration_ms: duration_ms(event.duration),
            method_version: pending.method_version,
            block_number: pending.block_number,
            block_hash: pending.block_hash.clone(),
            parent_hash: pending.parent_hash,
            gas_used: pending.gas_used,
            gas_limit: pending.gas_limit,
            tx_count: pending.tx_count,
            blob_count: pending.blob_count,
            status,
            latest_valid_hash,
            validation_error,
        };

        let Some(client) = self.publisher.client_meta() else {
            debug!(call_id = event.call_id, "dropping event: client metadata unavailable");
            return;
        };

        let decorated = DecoratedEvent {
            event: EventInfo::new(EVENT_EXECUTION_ENGINE_NEW_PAYLOAD, event.timestamp),
            meta: EventMeta { client },
            data: EventData::NewPayload(data),
        };

        if let Err(err) = self.publisher.publish(decorated) {
            error!(error = %err, "failed to publish engine_newPayload event");
            return;
        }

        debug!(
            call_id = event.call_id,
            duration_ms = duration_ms(event.duration),
            block_number = pending.block_number,
            block_hash = %pending.block_hash,
            "published engine_newPayload event"
        );
    }
}

/// Extract status, latest valid hash and validation error from the
/// response. Error responses map to `ERROR` with the error message;
/// unparseable results fall back to `UNKNOWN`.
fn extract_response_data(event: &ResponseEvent) -> (String, String, String) {
    if let Some(err) = &event.error {
        return (STATUS_ERROR.to_string(), String::new(), err.message.clone());
    }

    let Some(result) = event.result.as_ref().and_then(Value::as_object) else {
        return (STATUS_UNKNOWN.to_string(), String::new(), String::new());
    };

    let status = result
        .get("status")
        .and_then(Value::as_str)
        .unwrap_or(STATUS_UNKNOWN)
        .to_string();
    let latest_valid_hash = result
        .get("latestValidHash")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let validation_error = result
        .get("validationError")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    (status, latest_valid_hash, validation_error)
}
