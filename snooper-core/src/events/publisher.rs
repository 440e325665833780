//! Event publisher: fans decorated events out to configured sinks.
//!
//! Publishing is a non-blocking handoff into per-sink bounded queues;
//! events are dropped (never blocked on) when a queue is full or when
//! execution metadata is not yet available.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::events::config::EventsConfig;
use crate::events::sink::{BatchOptions, Sink, SinkError};
use crate::events::types::{ClientMeta, DecoratedEvent, EthereumMeta};
use crate::metadata::ExecutionMetadataProvider;
use crate::{build_version, IMPLEMENTATION, MODULE_NAME};

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("sink {name}: {source}")]
    Sink {
        name: String,
        #[source]
        source: SinkError,
    },
    #[error("publisher is not started")]
    NotStarted,
}

/// The capability handed to event handlers: publish an event, read the
/// client metadata it should carry.
pub trait EventPublisher: Send + Sync {
    /// Hand an event to every sink. Never blocks on network.
    fn publish(&self, event: DecoratedEvent) -> Result<(), PublishError>;

    /// Base client metadata for events; `None` when publishing is
    /// disabled or metadata is unavailable.
    fn client_meta(&self) -> Option<ClientMeta>;
}

/// Publisher that multiplexes events across all configured sinks.
pub struct MultiSinkPublisher {
    config: EventsConfig,
    sinks: RwLock<Vec<Sink>>,
    metadata: RwLock<Option<Arc<dyn ExecutionMetadataProvider>>>,
}

impl MultiSinkPublisher {
    pub fn new(config: EventsConfig) -> Self {
        Self {
            config,
            sinks: RwLock::new(Vec::new()),
            metadata: RwLock::new(None),
        }
    }

    /// Wire the execution-metadata provider so client metadata includes
    /// the upstream client identity.
    pub fn set_metadata_provider(&self, provider: Arc<dyn ExecutionMetadataProvider>) {
        *self.metadata.write().unwrap_or_else(|e| e.into_inner()) = Some(provider);
    }

    /// Construct and start every configured sink.
    pub async fn start(&self) -> Result<(), PublishError> {
        let options = BatchOptions::from_config(&self.config);
        let mut started = Vec::with_capacity(self.config.outputs.len());

        for (index, output) in self.config.outputs.iter().enumerate() {
            let name = format!("{}-{}", output.kind, index);
            let sink = Sink::start(name.clone(), output, &self.config, options.clone())
                .map_err(|source| PublishError::Sink { name, source })?;

            info!(kind = %output.kind, address = %output.address, "started event sink");
            started.push(sink);
        }

        *self.sinks.write().unwrap_or_else(|e| e.into_inner()) = started;

        Ok(())
    }

    /// Stop every sink, bounded by `timeout`. Reports the last error but
    /// stops all sinks regardless.
    pub async fn stop(&self, timeout: Duration) -> Result<(), PublishError> {
        let sinks = std::mem::take(&mut *self.sinks.write().unwrap_or_else(|e| e.into_inner()));

        let mut last_err = None;

        for sink in sinks {
            let name = sink.name().to_string();
            if let Err(source) = sink.stop(timeout).await {
                warn!(sink = %name, error = %source, "failed to stop sink");
                last_err = Some(PublishError::Sink { name, source });
            }
        }

        match last_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn execution_meta(&self) -> Option<EthereumMeta> {
        let provider = self
            .metadata
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()?;

        provider.get().map(|execution| EthereumMeta { execution })
    }
}

impl EventPublisher for MultiSinkPublisher {
    fn publish(&self, event: DecoratedEvent) -> Result<(), PublishError> {
        // Hold events back until the upstream identity is known; a
        // deliberate silent drop, logged at debug.
        if self.execution_meta().is_none() {
            debug!("dropping event: execution metadata not yet available");
            return Ok(());
        }

        let sinks = self.sinks.read().unwrap_or_else(|e| e.into_inner());

        let mut last_err = None;

        for sink in sinks.iter() {
            if let Err(source) = sink.handle(event.clone()) {
                error!(sink = sink.name(), error = %source, "failed to publish event");
                last_err = Some(PublishError::Sink {
                    name: sink.name().to_string(),
                    source,
                });
            }
        }

        match last_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn client_meta(&self) -> Option<ClientMeta> {
        Some(ClientMeta {
            name: self.config.name.clone(),
            version: build_version().to_string(),
            implementation: IMPLEMENTATION.to_string(),
            module_name: MODULE_NAME.to_string(),
            labels: self.config.labels.clone(),
            ethereum: self.execution_meta(),
        })
    }
}

/// No-op publisher used when event publishing is disabled.
pub struct NoopPublisher;

impl EventPublisher for NoopPublisher {
    fn publish(&self, _event: DecoratedEvent) -> Result<(), PublishError> {
        Ok(())
    }

    fn client_meta(&self) -> Option<ClientMeta> {
        None
    }
}

/// Test support: a publisher that captures events in memory.
pub mod tests_support {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct CapturePublisher {
        events: Mutex<Vec<DecoratedEvent>>,
    }

    impl CapturePublisher {
        pub fn events(&self) -> Vec<DecoratedEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    impl EventPublisher for CapturePublisher {
        fn publish(&self, event: DecoratedEvent) -> Result<(), PublishError> {
            self.events.lock().unwrap().push(event);
            Ok(())
        }

        fn client_meta(&self) -> Option<ClientMeta> {
            Some(ClientMeta {
                name: "test".to_string(),
                version: "0.0.0".to_string(),
                implementation: crate::IMPLEMENTATION.to_string(),
                module_name: crate::MODULE_NAME.to_string(),
                labels: HashMap::new(),
                ethereum: None,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::config::OutputConfig;
    use crate::events::types::{EventData, EventInfo, EventMeta, NewPayloadData};
    use crate::metadata::ExecutionMetadata;
    use chrono::Utc;
    use std::collections::HashMap;

    struct FixedMetadata;

    impl ExecutionMetadataProvider for FixedMetadata {
        fn get(&self) -> Option<ExecutionMetadata> {
            Some(ExecutionMetadata {
                implementation: "Geth".into(),
                version: "v1.14.0".into(),
                version_major: "1".into(),
                version_minor: "14".into(),
                version_patch: "0".into(),
            })
        }
    }

    fn sample_event() -> DecoratedEvent {
        DecoratedEvent {
            event: EventInfo::new(crate::events::types::EVENT_EXECUTION_ENGINE_NEW_PAYLOAD, Utc::now()),
            meta: EventMeta {
                client: ClientMeta {
                    name: "t".into(),
                    version: "0".into(),
                    implementation: IMPLEMENTATION.into(),
                    module_name: MODULE_NAME.into(),
                    labels: HashMap::new(),
                    ethereum: None,
                },
            },
            data: EventData::NewPayload(NewPayloadData {
                requested_at: Utc::now(),
                duration_ms: 1,
                method_version: "V3".into(),
                block_number: 1,
                block_hash: "0xaa".into(),
                parent_hash: "0xbb".into(),
                gas_used: 0,
                gas_limit: 0,
                tx_count: 0,
                blob_count: 0,
                status: "VALID".into(),
                latest_valid_hash: String::new(),
                validation_error: String::new(),
            }),
        }
    }

    #[tokio::test]
    async fn drops_events_without_metadata() {
        let publisher = MultiSinkPublisher::new(EventsConfig {
            enabled: true,
            name: "t".into(),
            outputs: vec![OutputConfig {
                kind: "stdout".into(),
                address: String::new(),
            }],
            ..Default::default()
        });
        publisher.start().await.unwrap();

        // No metadata provider wired: publish succeeds but drops.
        publisher.publish(sample_event()).unwrap();

        publisher.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn client_meta_carries_execution_identity() {
        let publisher = MultiSinkPublisher::new(EventsConfig {
            enabled: true,
            name: "snooper-1".into(),
            ..Default::default()
        });
        publisher.set_metadata_provider(Arc::new(FixedMetadata));

        let meta = publisher.client_meta().unwrap();
        assert_eq!(meta.name, "snooper-1");
        assert_eq!(meta.implementation, IMPLEMENTATION);
        assert_eq!(meta.module_name, MODULE_NAME);
        let eth = meta.ethereum.unwrap();
        assert_eq!(eth.execution.implementation, "Geth");
        assert_eq!(eth.execution.version_minor, "14");
    }

    #[test]
    fn noop_publisher_returns_nothing() {
        let publisher = NoopPublisher;
        assert!(publisher.publish(sample_event()).is_ok());
        assert!(publisher.client_meta().is_none());
    }
}
