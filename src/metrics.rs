use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

use crate::cache::CacheKind;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct BlobLabels {
    pub kind: KindLabel,
    pub method: Method,
    pub outcome: Outcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum KindLabel {
    Ac,
    Cas,
}

impl From<CacheKind> for KindLabel {
    fn from(kind: CacheKind) -> Self {
        match kind {
            CacheKind::Ac => KindLabel::Ac,
            CacheKind::Cas => KindLabel::Cas,
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Method {
    Get,
    Head,
    Put,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Outcome {
    Hit,
    Miss,
    Stored,
    Error,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RemoteLabels {
    pub op: RemoteOp,
    pub result: RemoteResult,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RemoteOpLabels {
    pub op: RemoteOp,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum RemoteOp {
    Restore,
    Save,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum RemoteResult {
    Found,
    NotFound,
    Saved,
    Conflict,
    Error,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Central container for every Prometheus metric exposed by the server.
pub struct Metrics {
    // -- protocol --
    pub blob_requests: Family<BlobLabels, Counter>,
    pub bytes_served: Counter,
    pub bytes_received: Counter,

    // -- remote store --
    pub remote_calls: Family<RemoteLabels, Counter>,
    pub remote_call_duration_seconds: Family<RemoteOpLabels, Histogram>,
    pub remote_retries: Family<RemoteOpLabels, Counter>,

    // -- coalescing --
    pub coalesced_waiters: Family<RemoteOpLabels, Counter>,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let blob_requests = Family::<BlobLabels, Counter>::default();
        registry.register(
            "bazel_cache_blob_requests",
            "Blob requests by kind, method and outcome",
            blob_requests.clone(),
        );

        let bytes_served = Counter::default();
        registry.register(
            "bazel_cache_bytes_served",
            "Blob bytes sent to clients",
            bytes_served.clone(),
        );

        let bytes_received = Counter::default();
        registry.register(
            "bazel_cache_bytes_received",
            "Blob bytes received from clients",
            bytes_received.clone(),
        );

        let remote_calls = Family::<RemoteLabels, Counter>::default();
        registry.register(
            "bazel_cache_remote_calls",
            "Completed remote store operations by result",
            remote_calls.clone(),
        );

        let remote_call_duration_seconds =
            Family::<RemoteOpLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.005, 2.0, 14))
            });
        registry.register(
            "bazel_cache_remote_call_duration_seconds",
            "Remote store operation latency including retries",
            remote_call_duration_seconds.clone(),
        );

        let remote_retries = Family::<RemoteOpLabels, Counter>::default();
        registry.register(
            "bazel_cache_remote_retries",
            "Remote store attempts beyond the first",
            remote_retries.clone(),
        );

        let coalesced_waiters = Family::<RemoteOpLabels, Counter>::default();
        registry.register(
            "bazel_cache_coalesced_waiters",
            "Callers that joined an operation already in flight",
            coalesced_waiters.clone(),
        );

        Self {
            blob_requests,
            bytes_served,
            bytes_received,
            remote_calls,
            remote_call_duration_seconds,
            remote_retries,
            coalesced_waiters,
        }
    }

    pub fn record_blob(&self, kind: CacheKind, method: Method, outcome: Outcome) {
        self.blob_requests
            .get_or_create(&BlobLabels {
                kind: kind.into(),
                method,
                outcome,
            })
            .inc();
    }

    pub fn record_remote(&self, op: RemoteOp, result: RemoteResult, seconds: f64) {
        self.remote_calls
            .get_or_create(&RemoteLabels {
                op: op.clone(),
                result,
            })
            .inc();
        self.remote_call_duration_seconds
            .get_or_create(&RemoteOpLabels { op })
            .observe(seconds);
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, shared by the backend and
/// the HTTP layer.
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Render the registry in the OpenMetrics text format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}
