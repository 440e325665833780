//! `engine_getClientVersion*` observer.
//!
//! Publishes nothing. Its purpose is to feed client identity from the
//! observed traffic into the execution-metadata cache, which then flows
//! into every other event's client metadata. This covers deployments
//! where the proxy has no JWT secret of its own but the consensus client
//! asks the question anyway.

use serde_json::Value;
use tracing::debug;

use crate::events::handler::{EventHandler, RequestEvent, ResponseEvent};
use crate::metadata::ClientVersionV1;

/// Callback used to push observed versions into the metadata cache.
pub type MetadataUpdateFn = dyn Fn(Vec<ClientVersionV1>) + Send + Sync;

pub struct EngineClientVersionHandler {
    update: Box<MetadataUpdateFn>,
}

impl EngineClientVersionHandler {
    pub fn new(update: impl Fn(Vec<ClientVersionV1>) + Send + Sync + 'static) -> Self {
        Self {
            update: Box::new(update),
        }
    }
}

impl EventHandler for EngineClientVersionHandler {
    fn name(&self) -> &'static str {
        "engine_getClientVersion"
    }

    fn matches(&self, method: &str) -> bool {
        method.starts_with("engine_getClientVersion")
    }

    fn on_request(&self, _event: &RequestEvent) -> bool {
        // Nothing to capture; the response carries everything.
        true
    }

    fn on_response(&self, event: &ResponseEvent) {
        if let Some(err) = &event.error {
            debug!(
                error_code = err.code,
                error_message = %err.message,
                "engine_getClientVersion returned error"
            );
            return;
        }

        let versions = match parse_versions(event.result.as_ref()) {
            Some(v) if !v.is_empty() => v,
            _ => {
                debug!("engine_getClientVersion returned no parseable versions");
                return;
            }
        };

        debug!(
            client_count = versions.len(),
            implementation = %versions[0].name,
            version = %versions[0].version,
            "updated execution metadata from observed engine_getClientVersion response"
        );

        (self.update)(versions);
    }
}

fn parse_versions(result: Option<&Value>) -> Option<Vec<ClientVersionV1>> {
    serde_json::from_value(result?.clone()).ok()
}
