//! Metrics and tracing setup for ringkv.
//!
//! Provides a global [`CoordinatorMetrics`] singleton backed by the
//! `prometheus` crate and the process-wide tracing subscriber.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

// ────────────────────────── Tracing ──────────────────────────

/// Initialize the tracing subscriber with env-filter.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

// ────────────────────────── Prometheus metrics ──────────────────────────

static METRICS: OnceLock<CoordinatorMetrics> = OnceLock::new();

/// Retrieve (or lazily create) the global metrics singleton.
pub fn metrics() -> &'static CoordinatorMetrics {
    METRICS.get_or_init(CoordinatorMetrics::new)
}

/// All Prometheus metrics for a ringkv coordinator.
pub struct CoordinatorMetrics {
    pub registry: Registry,

    // ── Logical requests ──
    pub requests: IntCounterVec,
    pub request_latency_secs: HistogramVec,

    // ── Quorum bookkeeping ──
    pub absorbed_replica_failures: IntCounterVec,
    pub quorum_failures: IntCounterVec,
    pub cancelled_tasks: IntCounter,

    // ── Range scans ──
    pub range_subfetch_failures: IntCounter,
}

// Manual Debug impl because prometheus types don't derive Debug.
impl std::fmt::Debug for CoordinatorMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinatorMetrics").finish_non_exhaustive()
    }
}

/// Default histogram buckets (seconds) for request latency.
const LATENCY_BUCKETS: &[f64] = &[0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0];

impl CoordinatorMetrics {
    fn new() -> Self {
        let registry = Registry::new();

        let requests = IntCounterVec::new(
            Opts::new("ringkv_requests_total", "Logical requests, by operation"),
            &["operation"],
        )
        .expect("requests counter vec");
        let request_latency_secs = HistogramVec::new(
            HistogramOpts::new(
                "ringkv_request_latency_seconds",
                "Logical request latency in seconds",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["operation"],
        )
        .expect("request_latency_secs histogram");

        let absorbed_replica_failures = IntCounterVec::new(
            Opts::new(
                "ringkv_absorbed_replica_failures_total",
                "Replica failures tolerated by quorum, by operation",
            ),
            &["operation"],
        )
        .expect("absorbed_replica_failures counter vec");
        let quorum_failures = IntCounterVec::new(
            Opts::new(
                "ringkv_quorum_failures_total",
                "Requests failed because quorum became unreachable, by operation",
            ),
            &["operation"],
        )
        .expect("quorum_failures counter vec");
        let cancelled_tasks = IntCounter::with_opts(Opts::new(
            "ringkv_cancelled_tasks_total",
            "Outstanding replica tasks cancelled after a verdict",
        ))
        .expect("cancelled_tasks counter");

        let range_subfetch_failures = IntCounter::with_opts(Opts::new(
            "ringkv_range_subfetch_failures_total",
            "Replica range cursors dropped from a sub-range merge",
        ))
        .expect("range_subfetch_failures counter");

        registry
            .register(Box::new(requests.clone()))
            .expect("register requests");
        registry
            .register(Box::new(request_latency_secs.clone()))
            .expect("register request_latency_secs");
        registry
            .register(Box::new(absorbed_replica_failures.clone()))
            .expect("register absorbed_replica_failures");
        registry
            .register(Box::new(quorum_failures.clone()))
            .expect("register quorum_failures");
        registry
            .register(Box::new(cancelled_tasks.clone()))
            .expect("register cancelled_tasks");
        registry
            .register(Box::new(range_subfetch_failures.clone()))
            .expect("register range_subfetch_failures");

        Self {
            registry,
            requests,
            request_latency_secs,
            absorbed_replica_failures,
            quorum_failures,
            cancelled_tasks,
            range_subfetch_failures,
        }
    }
}

/// Encode all registered metrics in Prometheus text exposition format.
pub fn encode_metrics() -> String {
    let m = metrics();
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    encoder
        .encode(&m.registry.gather(), &mut buf)
        .expect("prometheus text encoding");
    String::from_utf8(buf).expect("prometheus output is valid UTF-8")
}

/// Helper: count a logical request and start its latency timer.
pub fn start_request_timer(operation: &str) -> prometheus::HistogramTimer {
    let m = metrics();
    m.requests.with_label_values(&[operation]).inc();
    m.request_latency_secs
        .with_label_values(&[operation])
        .start_timer()
}

// ────────────────────────── Tests ──────────────────────────
