//! Event sinks: bounded queue, batcher and export workers per sink.
//!
//! Shipping is asynchronous: `handle` is a non-blocking enqueue and the
//! queue drops events when full. A dispatcher task assembles batches
//! (bounded by size and a batch timeout) and a pool of workers exports
//! them, each export bounded by its own timeout.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::events::config::{
    EventsConfig, OutputConfig, OUTPUT_TYPE_HTTP, OUTPUT_TYPE_KAFKA, OUTPUT_TYPE_STDOUT,
    OUTPUT_TYPE_XATU,
};
use crate::events::types::DecoratedEvent;

const DEFAULT_MAX_QUEUE_SIZE: usize = 51_200;
const DEFAULT_MAX_EXPORT_BATCH_SIZE: usize = 512;
const DEFAULT_BATCH_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_EXPORT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_WORKERS: usize = 5;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("queue full, event dropped")]
    QueueFull,
    #[error("sink is stopped")]
    Stopped,
    #[error("unsupported output type {0:?}")]
    UnsupportedType(String),
    #[error("failed to build export client: {0}")]
    ClientBuild(String),
    #[error("export failed: {0}")]
    Export(String),
    #[error("export timed out")]
    ExportTimeout,
    #[error("sink shutdown timed out")]
    ShutdownTimeout,
}

/// Batching parameters, with defaults applied for zero values.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub max_queue_size: usize,
    pub max_export_batch_size: usize,
    pub workers: usize,
    pub batch_timeout: Duration,
    pub export_timeout: Duration,
}

impl BatchOptions {
    pub fn from_config(config: &EventsConfig) -> Self {
        Self {
            max_queue_size: non_zero(config.max_queue_size, DEFAULT_MAX_QUEUE_SIZE),
            max_export_batch_size: non_zero(
                config.max_export_batch_size,
                DEFAULT_MAX_EXPORT_BATCH_SIZE,
            ),
            workers: non_zero(config.workers, DEFAULT_WORKERS),
            batch_timeout: config.batch_timeout.unwrap_or(DEFAULT_BATCH_TIMEOUT),
            export_timeout: config.export_timeout.unwrap_or(DEFAULT_EXPORT_TIMEOUT),
        }
    }
}

fn non_zero(value: usize, default: usize) -> usize {
    if value > 0 {
        value
    } else {
        default
    }
}

/// A single named sink with its queue and worker pool.
pub struct Sink {
    name: String,
    tx: mpsc::Sender<DecoratedEvent>,
    abort: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    dropped: Arc<AtomicU64>,
}

impl Sink {
    /// Construct the exporter for the output type, spawn the dispatcher
    /// and worker tasks, and return the running sink.
    pub fn start(
        name: String,
        output: &OutputConfig,
        config: &EventsConfig,
        options: BatchOptions,
    ) -> Result<Self, SinkError> {
        let exporter = Arc::new(Exporter::build(output, config)?);

        let (tx, rx) = mpsc::channel::<DecoratedEvent>(options.max_queue_size);
        let (batch_tx, batch_rx) = mpsc::channel::<Vec<DecoratedEvent>>(options.workers * 2);
        let batch_rx = Arc::new(tokio::sync::Mutex::new(batch_rx));

        let abort = CancellationToken::new();
        let mut tasks = Vec::with_capacity(options.workers + 1);

        tasks.push(tokio::spawn(dispatch_loop(
            name.clone(),
            rx,
            batch_tx,
            options.clone(),
            abort.clone(),
        )));

        for worker in 0..options.workers {
            tasks.push(tokio::spawn(export_loop(
                name.clone(),
                worker,
                batch_rx.clone(),
                exporter.clone(),
                options.export_timeout,
                abort.clone(),
            )));
        }

        Ok(Self {
            name,
            tx,
            abort,
            tasks: Mutex::new(tasks),
            dropped: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of events dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Enqueue an event without blocking. Queue-full drops the event.
    pub fn handle(&self, event: DecoratedEvent) -> Result<(), SinkError> {
        match self.tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Err(SinkError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SinkError::Stopped),
        }
    }

    /// Drain the queue and stop workers, bounded by `timeout`. On timeout
    /// the remaining tasks are aborted.
    pub async fn stop(self, timeout: Duration) -> Result<(), SinkError> {
        let Self {
            name,
            tx,
            abort,
            tasks,
            ..
        } = self;

        // Closing the queue lets the pipeline drain and exit naturally.
        drop(tx);

        let joins = tasks.into_inner().unwrap_or_else(|e| e.into_inner());

        match tokio::time::timeout(timeout, futures_util::future::join_all(joins)).await {
            Ok(_) => Ok(()),
            Err(_) => {
                warn!(sink = %name, "sink drain exceeded deadline, aborting workers");
                abort.cancel();
                Err(SinkError::ShutdownTimeout)
            }
        }
    }
}

/// Assemble batches from the event queue: full batches ship immediately,
/// partial batches ship when the batch timeout fires.
async fn dispatch_loop(
    name: String,
    mut rx: mpsc::Receiver<DecoratedEvent>,
    batch_tx: mpsc::Sender<Vec<DecoratedEvent>>,
    options: BatchOptions,
    abort: CancellationToken,
) {
    let mut batch: Vec<DecoratedEvent> = Vec::with_capacity(options.max_export_batch_size);
    let mut ticker = tokio::time::interval(options.batch_timeout);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(event) => {
                    batch.push(event);
                    if batch.len() >= options.max_export_batch_size {
                        let full = std::mem::replace(
                            &mut batch,
                            Vec::with_capacity(options.max_export_batch_size),
                        );
                        if batch_tx.send(full).await.is_err() {
                            return;
                        }
                    }
                }
                None => break,
            },
            _ = ticker.tick() => {
                if !batch.is_empty() {
                    let partial = std::mem::take(&mut batch);
                    if batch_tx.send(partial).await.is_err() {
                        return;
                    }
                }
            }
            _ = abort.cancelled() => return,
        }
    }

    // Queue closed: flush whatever is left.
    if !batch.is_empty() && batch_tx.send(batch).await.is_err() {
        debug!(sink = %name, "batch channel closed during final flush");
    }
}

/// Worker loop: pull batches and export them, each bounded by the export
/// timeout.
async fn export_loop(
    name: String,
    worker: usize,
    batch_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Vec<DecoratedEvent>>>>,
    exporter: Arc<Exporter>,
    export_timeout: Duration,
    abort: CancellationToken,
) {
    loop {
        let batch = tokio::select! {
            batch = async { batch_rx.lock().await.recv().await } => match batch {
                Some(batch) => batch,
                None => return,
            },
            _ = abort.cancelled() => return,
        };

        let size = batch.len();
        let result = tokio::select! {
            result = tokio::time::timeout(export_timeout, exporter.export(batch)) => result,
            _ = abort.cancelled() => return,
        };

        match result {
            Ok(Ok(())) => debug!(sink = %name, worker, size, "exported event batch"),
            Ok(Err(err)) => warn!(sink = %name, worker, size, error = %err, "event batch export failed"),
            Err(_) => warn!(sink = %name, worker, size, "event batch export timed out"),
        }
    }
}

/// Where a batch actually goes.
enum Exporter {
    /// One JSON line per event to stdout.
    Stdout,
    /// JSON array POSTed to an HTTP endpoint.
    Http {
        client: reqwest::Client,
        endpoint: String,
    },
    /// Collector output: same batch shape shipped to the collector
    /// address over HTTP/2 with optional TLS and keep-alive.
    Xatu {
        client: reqwest::Client,
        endpoint: String,
    },
}

impl Exporter {
    fn build(output: &OutputConfig, config: &EventsConfig) -> Result<Self, SinkError> {
        match output.kind.as_str() {
            OUTPUT_TYPE_STDOUT => Ok(Self::Stdout),
            OUTPUT_TYPE_HTTP => Ok(Self::Http {
                client: build_client(config, false)?,
                endpoint: output.address.clone(),
            }),
            OUTPUT_TYPE_XATU => {
                let endpoint = if output.address.contains("://") {
                    output.address.clone()
                } else {
                    let scheme = if config.tls { "https" } else { "http" };
                    format!("{scheme}://{}", output.address)
                };

                Ok(Self::Xatu {
                    client: build_client(config, true)?,
                    endpoint,
                })
            }
            // The kafka output type is accepted by config parsing but has
            // no exporter in this build.
            OUTPUT_TYPE_KAFKA => Err(SinkError::UnsupportedType(OUTPUT_TYPE_KAFKA.to_string())),
            other => Err(SinkError::UnsupportedType(other.to_string())),
        }
    }

    async fn export(&self, batch: Vec<DecoratedEvent>) -> Result<(), SinkError> {
        match self {
            Self::Stdout => {
                for event in &batch {
                    match serde_json::to_string(event) {
                        Ok(line) => println!("{line}"),
                        Err(err) => warn!(error = %err, "failed to serialize event"),
                    }
                }
                Ok(())
            }
            Self::Http { client, endpoint } | Self::Xatu { client, endpoint } => {
                client
                    .post(endpoint)
                    .json(&batch)
                    .send()
                    .await
                    .map_err(|err| SinkError::Export(err.to_string()))?
                    .error_for_status()
                    .map_err(|err| SinkError::Export(err.to_string()))?;

                Ok(())
            }
        }
    }
}

fn build_client(config: &EventsConfig, keep_alive: bool) -> Result<reqwest::Client, SinkError> {
    let mut headers = HeaderMap::new();

    for (name, value) in &config.headers {
        let Ok(name) = HeaderName::try_from(name.as_str()) else {
            warn!(header = %name, "skipping invalid output header name");
            continue;
        };
        let Ok(value) = HeaderValue::try_from(value.as_str()) else {
            warn!(header = %name, "skipping invalid output header value");
            continue;
        };
        headers.insert(name, value);
    }

    let mut builder = reqwest::Client::builder().default_headers(headers);

    if keep_alive && config.keep_alive.enabled {
        builder = builder
            .http2_keep_alive_while_idle(true)
            .http2_keep_alive_interval(config.keep_alive.time)
            .http2_keep_alive_timeout(
                config
                    .keep_alive
                    .timeout
                    .unwrap_or(Duration::from_secs(30)),
            );
    }

    builder
        .build()
        .map_err(|err| SinkError::ClientBuild(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::types::{
        ClientMeta, DecoratedEvent, EventData, EventInfo, EventMeta, GetBlobsData,
        EVENT_CONSENSUS_ENGINE_API_GET_BLOBS,
    };
    use chrono::Utc;
    use std::collections::HashMap;

    fn sample_event() -> DecoratedEvent {
        DecoratedEvent {
            event: EventInfo::new(EVENT_CONSENSUS_ENGINE_API_GET_BLOBS, Utc::now()),
            meta: EventMeta {
                client: ClientMeta {
                    name: "t".into(),
                    version: "0".into(),
                    implementation: crate::IMPLEMENTATION.into(),
                    module_name: crate::MODULE_NAME.into(),
                    labels: HashMap::new(),
                    ethereum: None,
                },
            },
            data: EventData::GetBlobs(GetBlobsData {
                requested_at: Utc::now(),
                duration_ms: 1,
                method_version: "V1".into(),
                requested_count: 1,
                versioned_hashes: vec!["0xh".into()],
                returned_count: 1,
                status: "SUCCESS".into(),
                error_message: String::new(),
            }),
        }
    }

    #[test]
    fn defaults_applied_for_zero_values() {
        let options = BatchOptions::from_config(&EventsConfig::default());
        assert_eq!(options.max_queue_size, 51_200);
        assert_eq!(options.max_export_batch_size, 512);
        assert_eq!(options.workers, 5);
        assert_eq!(options.batch_timeout, Duration::from_secs(5));
        assert_eq!(options.export_timeout, Duration::from_secs(30));

        let options = BatchOptions::from_config(&EventsConfig {
            max_queue_size: 10,
            workers: 2,
            batch_timeout: Some(Duration::from_millis(100)),
            ..Default::default()
        });
        assert_eq!(options.max_queue_size, 10);
        assert_eq!(options.workers, 2);
        assert_eq!(options.batch_timeout, Duration::from_millis(100));
    }

    #[test]
    fn kafka_output_is_rejected_at_construction() {
        let result = Exporter::build(
            &OutputConfig {
                kind: "kafka".into(),
                address: "broker:9092/topic".into(),
            },
            &EventsConfig::default(),
        );

        assert!(matches!(result, Err(SinkError::UnsupportedType(_))));
    }

    #[tokio::test]
    async fn stdout_sink_drains_on_stop() {
        let config = EventsConfig::default();
        let sink = Sink::start(
            "stdout-0".into(),
            &OutputConfig {
                kind: "stdout".into(),
                address: String::new(),
            },
            &config,
            BatchOptions {
                max_queue_size: 16,
                max_export_batch_size: 4,
                workers: 1,
                batch_timeout: Duration::from_millis(50),
                export_timeout: Duration::from_secs(1),
            },
        )
        .unwrap();

        for _ in 0..6 {
            sink.handle(sample_event()).unwrap();
        }

        sink.stop(Duration::from_secs(2)).await.unwrap();
    }

    // Single-threaded runtime: the dispatcher task cannot run between the
    // try_send calls below, so the drop count is deterministic.
    #[tokio::test]
    async fn full_queue_drops_events() {
        let config = EventsConfig::default();
        let sink = Sink::start(
            "stdout-0".into(),
            &OutputConfig {
                kind: "stdout".into(),
                address: String::new(),
            },
            &config,
            BatchOptions {
                max_queue_size: 1,
                max_export_batch_size: 512,
                workers: 1,
                batch_timeout: Duration::from_secs(60),
                export_timeout: Duration::from_secs(60),
            },
        )
        .unwrap();

        let mut dropped = 0;
        for _ in 0..50 {
            if matches!(sink.handle(sample_event()), Err(SinkError::QueueFull)) {
                dropped += 1;
            }
        }

        assert_eq!(dropped, 49);
        assert_eq!(sink.dropped(), dropped);

        let _ = sink.stop(Duration::from_secs(2)).await;
    }
}
