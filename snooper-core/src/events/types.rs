//! Decorated event shapes shipped to sinks.
//!
//! These mirror the collector's wire schema: an event envelope (name,
//! timestamp, random id), client metadata and a typed payload.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::metadata::ExecutionMetadata;

/// Event name for `engine_newPayload*` observations.
pub const EVENT_EXECUTION_ENGINE_NEW_PAYLOAD: &str = "EXECUTION_ENGINE_NEW_PAYLOAD";

/// Event name for `engine_getBlobs*` observations.
pub const EVENT_CONSENSUS_ENGINE_API_GET_BLOBS: &str = "CONSENSUS_ENGINE_API_GET_BLOBS";

/// A fully decorated event, ready for sink fan-out.
#[derive(Debug, Clone, Serialize)]
pub struct DecoratedEvent {
    pub event: EventInfo,
    pub meta: EventMeta,
    pub data: EventData,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventInfo {
    pub name: &'static str,
    pub date_time: DateTime<Utc>,
    /// Random id, unique per event.
    pub id: String,
}

impl EventInfo {
    pub fn new(name: &'static str, date_time: DateTime<Utc>) -> Self {
        Self {
            name,
            date_time,
            id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EventMeta {
    pub client: ClientMeta,
}

/// Client metadata attached to every published event.
#[derive(Debug, Clone, Serialize)]
pub struct ClientMeta {
    /// Instance name from config.
    pub name: String,
    /// Build version of this process.
    pub version: String,
    /// Always `"rpc-snooper"`.
    pub implementation: String,
    pub module_name: String,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ethereum: Option<EthereumMeta>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EthereumMeta {
    pub execution: ExecutionMetadata,
}

/// Typed event payload. Serialized untagged: the event name in the
/// envelope identifies the variant.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum EventData {
    NewPayload(NewPayloadData),
    GetBlobs(GetBlobsData),
}

/// Payload for `engine_newPayload*` events.
#[derive(Debug, Clone, Serialize)]
pub struct NewPayloadData {
    pub requested_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub method_version: String,

    pub block_number: u64,
    pub block_hash: String,
    pub parent_hash: String,
    pub gas_used: u64,
    pub gas_limit: u64,
    pub tx_count: u32,
    pub blob_count: u32,

    pub status: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub latest_valid_hash: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub validation_error: String,
}

/// Payload for `engine_getBlobs*` events.
#[derive(Debug, Clone, Serialize)]
pub struct GetBlobsData {
    pub requested_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub method_version: String,

    pub requested_count: u32,
    pub versioned_hashes: Vec<String>,
    pub returned_count: u32,
    pub status: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error_message: String,
}
