//! Observer module registry and phase dispatch.
//!
//! Modules register with an optional filter config; dispatch snapshots
//! the registry (so module execution never runs under the lock),
//! evaluates filters and invokes the phase entry points. Filter results
//! from the request phase are cached in the call scratchpad so the
//! response phase does not re-evaluate, and a module may force response
//! delivery by setting `wants_response` during `on_request`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde_json::json;
use tracing::{info, warn};

use snooper_core::filter::FilterConfig;
use snooper_core::module::{scratch, Module, ModuleId, RequestRecord, ResponseRecord};

struct Registry {
    modules: HashMap<ModuleId, Arc<dyn Module>>,
    filters: HashMap<ModuleId, FilterConfig>,
}

pub struct ModuleManager {
    registry: RwLock<Registry>,
    module_counter: AtomicU64,
    enabled: AtomicBool,
}

impl ModuleManager {
    pub fn new() -> Self {
        Self {
            registry: RwLock::new(Registry {
                modules: HashMap::new(),
                filters: HashMap::new(),
            }),
            module_counter: AtomicU64::new(0),
            enabled: AtomicBool::new(true),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// Allocate a fresh module id.
    pub fn next_module_id(&self) -> ModuleId {
        self.module_counter.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Register a module with its compiled filter config.
    pub fn register(&self, module: Arc<dyn Module>, filters: Option<FilterConfig>) {
        let id = module.id();
        let mut registry = self.registry.write().unwrap_or_else(|e| e.into_inner());

        registry.modules.insert(id, module);
        if let Some(filters) = filters {
            registry.filters.insert(id, filters);
        }

        info!(module_id = id, "module registered");
    }

    /// Close and drop a module.
    pub fn unregister(&self, module_id: ModuleId) {
        let removed = {
            let mut registry = self.registry.write().unwrap_or_else(|e| e.into_inner());
            registry.filters.remove(&module_id);
            registry.modules.remove(&module_id)
        };

        if let Some(module) = removed {
            module.close();
            info!(module_id, "module unregistered");
        }
    }

    pub fn module_count(&self) -> usize {
        self.registry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .modules
            .len()
    }

    fn snapshot(&self) -> Vec<Arc<dyn Module>> {
        self.registry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .modules
            .values()
            .cloned()
            .collect()
    }

    /// Dispatch the request phase to all matching modules.
    pub fn process_request(&self, record: &RequestRecord) {
        if !self.is_enabled() {
            return;
        }

        for module in self.snapshot() {
            if !self.should_process_request(module.id(), record) {
                continue;
            }

            if let Err(err) = module.on_request(record) {
                warn!(module_id = module.id(), error = %err, "module request processing failed");
            }
        }
    }

    /// Dispatch the response phase to all matching modules.
    pub fn process_response(&self, record: &ResponseRecord) {
        if !self.is_enabled() {
            return;
        }

        for module in self.snapshot() {
            if !self.should_process_response(module.id(), record) {
                continue;
            }

            if let Err(err) = module.on_response(record) {
                warn!(module_id = module.id(), error = %err, "module response processing failed");
            }
        }
    }

    fn should_process_request(&self, module_id: ModuleId, record: &RequestRecord) -> bool {
        let registry = self.registry.read().unwrap_or_else(|e| e.into_inner());

        let Some(filter) = registry
            .filters
            .get(&module_id)
            .and_then(|config| config.request_filter.as_ref())
        else {
            return true;
        };

        let matched = filter.matches_request(record);
        drop(registry);

        if !matched {
            // Remember the decision so the response phase skips this
            // module without re-evaluating.
            record
                .call
                .set_data(module_id, scratch::SKIP_RESPONSE, json!(true));
        }

        matched
    }

    fn should_process_response(&self, module_id: ModuleId, record: &ResponseRecord) -> bool {
        if record.call.get_data(module_id, scratch::WANTS_RESPONSE) == Some(json!(true)) {
            return true;
        }

        if record.call.get_data(module_id, scratch::SKIP_RESPONSE) == Some(json!(true)) {
            return false;
        }

        let registry = self.registry.read().unwrap_or_else(|e| e.into_inner());

        let Some(filter) = registry
            .filters
            .get(&module_id)
            .and_then(|config| config.response_filter.as_ref())
        else {
            return true;
        };

        filter.matches_response(record)
    }
}

impl Default for ModuleManager {
    fn default() -> Self {
        Self::new()
    }
}
