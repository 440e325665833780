//! Method-name routing of observations to event handlers.

use std::sync::Arc;

use tracing::debug;

use super::handler::{EventHandler, RequestEvent};

/// Routes JSON-RPC methods to their event handlers. Handlers are
/// registered at startup; the list is immutable afterwards.
pub struct Router {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl Router {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    pub fn register(&mut self, handler: Arc<dyn EventHandler>) {
        debug!(handler = handler.name(), "registered event handler");
        self.handlers.push(handler);
    }

    /// Route a request to the first matching handler.
    ///
    /// Returns the handler when it wants the matching response delivered;
    /// `None` when no handler matched or the handler declined the
    /// response phase.
    pub fn route_request(&self, event: &RequestEvent) -> Option<Arc<dyn EventHandler>> {
        for handler in &self.handlers {
            if handler.matches(&event.method) {
                if handler.on_request(event) {
                    return Some(handler.clone());
                }

                return None;
            }
        }

        None
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}
