//! Engine-API event pipeline.
//!
//! Observed JSON-RPC request/response pairs are matched by method name,
//! correlated by call id, decorated with client metadata and fanned out to
//! configured sinks. The pipeline is strictly off the proxy path: handlers
//! run inside observation tasks and publishing is a non-blocking handoff
//! to per-sink queues.

pub mod client_version;
pub mod config;
pub mod get_blobs;
pub mod handler;
pub mod new_payload;
pub mod publisher;
pub mod router;
pub mod sink;
pub mod types;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::metadata::ExecutionMetadataFetcher;
use config::EventsConfig;
use publisher::{EventPublisher, MultiSinkPublisher, NoopPublisher, PublishError};
use router::Router;

#[derive(Debug, Error)]
pub enum EventsError {
    #[error("invalid events config: {0}")]
    Config(#[from] config::ConfigError),
    #[error("publisher: {0}")]
    Publish(#[from] PublishError),
}

/// The event pipeline service: router, publisher and metadata fetcher,
/// wired together. When disabled it is inert: no router, a no-op
/// publisher, no background tasks.
pub struct EventsService {
    inner: Option<Inner>,
}

struct Inner {
    publisher: Arc<MultiSinkPublisher>,
    router: Arc<Router>,
    fetcher: Arc<ExecutionMetadataFetcher>,
    shutdown: CancellationToken,
}

impl EventsService {
    /// Build the service from config. A disabled config yields an inert
    /// service; an enabled config is validated first.
    pub fn new(config: EventsConfig, target: &str) -> Result<Self, EventsError> {
        if !config.enabled {
            return Ok(Self { inner: None });
        }

        config.validate()?;

        let fetcher = Arc::new(ExecutionMetadataFetcher::new(
            target.to_string(),
            config.jwt_secret.as_deref(),
        ));

        let publisher = Arc::new(MultiSinkPublisher::new(config));
        publisher.set_metadata_provider(fetcher.clone());

        let mut router = Router::new();
        router.register(Arc::new(get_blobs::EngineGetBlobsHandler::new(
            publisher.clone(),
        )));
        router.register(Arc::new(new_payload::EngineNewPayloadHandler::new(
            publisher.clone(),
        )));
        {
            let fetcher = fetcher.clone();
            router.register(Arc::new(client_version::EngineClientVersionHandler::new(
                move |versions| fetcher.update(versions),
            )));
        }

        info!(handler_count = router.handler_count(), "registered event handlers");

        Ok(Self {
            inner: Some(Inner {
                publisher,
                router: Arc::new(router),
                fetcher,
                shutdown: CancellationToken::new(),
            }),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Router for wiring into the module pipeline; `None` when disabled.
    pub fn router(&self) -> Option<Arc<Router>> {
        self.inner.as_ref().map(|i| i.router.clone())
    }

    /// The publisher, or a no-op stand-in when disabled.
    pub fn publisher(&self) -> Arc<dyn EventPublisher> {
        match &self.inner {
            Some(inner) => inner.publisher.clone(),
            None => Arc::new(NoopPublisher),
        }
    }

    /// Start sinks and kick off the metadata fetch in the background.
    ///
    /// The metadata fetch retries with backoff and must not delay proxy
    /// startup, so it runs detached.
    pub async fn start(&self) -> Result<(), EventsError> {
        let Some(inner) = &self.inner else {
            return Ok(());
        };

        inner.publisher.start().await?;

        let fetcher = inner.fetcher.clone();
        let shutdown = inner.shutdown.clone();
        tokio::spawn(async move {
            info!("starting background execution metadata fetch");
            if let Err(err) = fetcher.run(shutdown).await {
                warn!(error = %err, "execution metadata fetch failed (upstream may not support engine_getClientVersionV1)");
            }
        });

        info!("events service started");
        Ok(())
    }

    /// Stop the fetcher and drain sinks, bounded by `timeout`.
    pub async fn stop(&self, timeout: Duration) -> Result<(), EventsError> {
        let Some(inner) = &self.inner else {
            return Ok(());
        };

        inner.shutdown.cancel();
        inner.publisher.stop(timeout).await?;

        info!("events service stopped");
        Ok(())
    }
}
