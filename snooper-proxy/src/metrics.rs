//! Prometheus metrics for proxied traffic.
//!
//! Counters for request count and body sizes plus a duration histogram,
//! labeled by upstream server, scheme, HTTP method, hostname, status,
//! URI and the JSON-RPC method extracted from the request body. Served in
//! OpenMetrics text format by a dedicated listener.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

/// Labels shared by every traffic metric.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TrafficLabels {
    /// Upstream host:port.
    pub server: String,
    /// Upstream scheme.
    pub scheme: String,
    /// HTTP method of the proxied request.
    pub method: String,
    /// Inbound Host header.
    pub hostname: String,
    /// Response status code.
    pub status: String,
    /// Request path and query.
    pub uri: String,
    /// JSON-RPC method from the request body, empty when not JSON-RPC.
    pub jrpc_method: String,
}

/// One proxied call's worth of metric samples.
#[derive(Debug, Clone)]
pub struct MetricsEntry {
    pub labels: TrafficLabels,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub duration_seconds: f64,
}

pub struct SnooperMetrics {
    request_count: Family<TrafficLabels, Counter>,
    request_size_bytes: Family<TrafficLabels, Counter>,
    response_size_bytes: Family<TrafficLabels, Counter>,
    request_duration_seconds: Family<TrafficLabels, Histogram>,
}

impl SnooperMetrics {
    /// Create the metric families and register them.
    pub fn new(registry: &mut Registry) -> Self {
        let request_count = Family::<TrafficLabels, Counter>::default();
        let request_size_bytes = Family::<TrafficLabels, Counter>::default();
        let response_size_bytes = Family::<TrafficLabels, Counter>::default();
        let request_duration_seconds =
            Family::<TrafficLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.001, 2.0, 16))
            });

        registry.register("request_count", "request count", request_count.clone());
        registry.register(
            "request_size_bytes",
            "request size in bytes",
            request_size_bytes.clone(),
        );
        registry.register(
            "response_size_bytes",
            "response size in bytes",
            response_size_bytes.clone(),
        );
        registry.register(
            "request_duration_seconds",
            "request serving time in seconds",
            request_duration_seconds.clone(),
        );

        Self {
            request_count,
            request_size_bytes,
            response_size_bytes,
            request_duration_seconds,
        }
    }

    /// Record one completed call.
    pub fn record(&self, entry: &MetricsEntry) {
        self.request_count.get_or_create(&entry.labels).inc();
        self.request_size_bytes
            .get_or_create(&entry.labels)
            .inc_by(entry.bytes_received);
        self.response_size_bytes
            .get_or_create(&entry.labels)
            .inc_by(entry.bytes_sent);
        self.request_duration_seconds
            .get_or_create(&entry.labels)
            .observe(entry.duration_seconds);
    }
}
