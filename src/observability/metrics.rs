//! Process-wide metrics registry
//!
//! All counters, gauges and histograms of the reliability layer live in one
//! explicitly constructed [`MetricsRegistry`]. It wraps a private
//! `prometheus::Registry` rather than the crate-global default one, so every
//! test can build a fresh registry and assert on exact values.
//!
//! Components receive the registry as an `Arc<MetricsRegistry>` and touch the
//! typed handles directly:
//!
//! ```rust,ignore
//! let metrics = Arc::new(MetricsRegistry::new()?);
//! metrics.watcher_files_processed.inc();
//! metrics.circuit_breaker_state.with_label_values(&["upload"]).set(1);
//! ```

use std::collections::BTreeMap;

use prometheus::proto::MetricType;
use prometheus::{
    Encoder, Gauge, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec, Opts, Registry, TextEncoder,
};

/// Default namespace prepended to every metric name
pub const DEFAULT_NAMESPACE: &str = "vault";

/// Buckets for operation latencies measured in milliseconds
const LATENCY_MS_BUCKETS: &[f64] = &[
    10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0,
];

/// Buckets for run durations measured in seconds
const DURATION_SECONDS_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0];

/// Registry of every metric emitted by the reliability layer
pub struct MetricsRegistry {
    registry: Registry,
    namespace: String,

    // ------------------------------------------------------------------
    // Database
    // ------------------------------------------------------------------
    /// Database probe failures (timeouts and errors)
    pub db_connection_errors: IntCounter,
    /// Database probe round-trip time
    pub db_query_duration: Histogram,

    // ------------------------------------------------------------------
    // Object store
    // ------------------------------------------------------------------
    /// Object store calls by operation and outcome (success, error, rejected)
    pub object_store_operations: IntCounterVec,
    /// Object store call latency by operation
    pub object_store_latency: HistogramVec,
    /// Object store operations that failed on the store side (connection or store errors)
    pub object_store_connection_errors: IntCounter,

    // ------------------------------------------------------------------
    // Circuit breakers
    // ------------------------------------------------------------------
    /// Breaker state per key: 0 = closed, 1 = open, 2 = half-open
    pub circuit_breaker_state: IntGaugeVec,
    /// Calls through a breaker by outcome (success, failure, rejected)
    pub circuit_breaker_calls: IntCounterVec,
    /// State transitions per breaker and target state
    pub circuit_breaker_transitions: IntCounterVec,

    // ------------------------------------------------------------------
    // Watcher and ingestion
    // ------------------------------------------------------------------
    /// Files ingested successfully
    pub watcher_files_processed: IntCounter,
    /// Files whose ingestion failed
    pub watcher_files_failed: IntCounter,
    /// Admissions currently held in the concurrency gate
    pub watcher_files_in_progress: IntGauge,
    /// Callers waiting for an admission slot
    pub watcher_queue_depth: IntGauge,
    /// Admission attempts abandoned after the gate timeout
    pub watcher_admission_timeouts: IntCounter,
    /// Admitted work that exceeded the processing timeout
    pub watcher_processing_timeouts: IntCounter,
    /// Events discarded because a newer event for the same key arrived
    pub watcher_events_debounced: IntCounter,
    /// Observer restarts performed by the supervisor
    pub watcher_thread_restarts: IntCounter,

    // ------------------------------------------------------------------
    // API / authentication
    // ------------------------------------------------------------------
    /// Authentication attempts with a missing or invalid credential
    pub api_auth_failures: IntCounter,
    /// Keys that transitioned into the blocked state
    pub api_rate_limit_blocks: IntCounter,
    /// Requests rejected because their key was blocked
    pub api_rate_limit_hits: IntCounter,
    /// (identity, resource) pairs currently tracked by the rate limiter
    pub api_rate_limit_tracked_pairs: IntGauge,

    // ------------------------------------------------------------------
    // Consistency
    // ------------------------------------------------------------------
    /// Files on disk without a database record (last run)
    pub consistency_pending_files: IntGauge,
    /// Sampled objects without a database record (last run)
    pub consistency_orphaned_objects: IntGauge,
    /// Database records whose object is absent (last run)
    pub consistency_missing_objects: IntGauge,
    /// Reconciliation runs performed
    pub consistency_checks: IntCounter,
    /// Divergences found across all runs
    pub consistency_errors_found: IntCounter,
    /// Reconciliation run duration
    pub consistency_run_duration: Histogram,

    // ------------------------------------------------------------------
    // Health and supervision
    // ------------------------------------------------------------------
    /// Aggregated health checks that reported a critical failure
    pub health_check_failures: IntCounter,
    /// Unix timestamp of the last aggregated health check
    pub last_health_check_timestamp: Gauge,
    /// Background task runs that failed, by task
    pub background_task_failures: IntCounterVec,
}

impl MetricsRegistry {
    /// Create a registry using the default `vault` namespace
    pub fn new() -> prometheus::Result<Self> {
        Self::with_namespace(DEFAULT_NAMESPACE)
    }

    /// Create a registry whose metric names are prefixed with `namespace`
    pub fn with_namespace(namespace: &str) -> prometheus::Result<Self> {
        let registry = Registry::new();
        let ns = namespace.to_string();

        let counter = |name: &str, help: &str| -> prometheus::Result<IntCounter> {
            let c = IntCounter::with_opts(Opts::new(name, help).namespace(ns.clone()))?;
            registry.register(Box::new(c.clone()))?;
            Ok(c)
        };
        let counter_vec =
            |name: &str, help: &str, labels: &[&str]| -> prometheus::Result<IntCounterVec> {
                let c = IntCounterVec::new(Opts::new(name, help).namespace(ns.clone()), labels)?;
                registry.register(Box::new(c.clone()))?;
                Ok(c)
            };
        let gauge = |name: &str, help: &str| -> prometheus::Result<IntGauge> {
            let g = IntGauge::with_opts(Opts::new(name, help).namespace(ns.clone()))?;
            registry.register(Box::new(g.clone()))?;
            Ok(g)
        };
        let histogram =
            |name: &str, help: &str, buckets: &[f64]| -> prometheus::Result<Histogram> {
                let h = Histogram::with_opts(
                    HistogramOpts::new(name, help)
                        .namespace(ns.clone())
                        .buckets(buckets.to_vec()),
                )?;
                registry.register(Box::new(h.clone()))?;
                Ok(h)
            };

        let object_store_latency = HistogramVec::new(
            HistogramOpts::new(
                "object_store_operation_latency_ms",
                "Object store operation latency in milliseconds",
            )
            .namespace(ns.clone())
            .buckets(LATENCY_MS_BUCKETS.to_vec()),
            &["operation"],
        )?;
        registry.register(Box::new(object_store_latency.clone()))?;

        let circuit_breaker_state = IntGaugeVec::new(
            Opts::new(
                "circuit_breaker_state",
                "Circuit breaker state (0=closed, 1=open, 2=half_open)",
            )
            .namespace(ns.clone()),
            &["breaker"],
        )?;
        registry.register(Box::new(circuit_breaker_state.clone()))?;

        let last_health_check_timestamp = Gauge::with_opts(
            Opts::new(
                "last_health_check_timestamp",
                "Unix timestamp of the last health check",
            )
            .namespace(ns.clone()),
        )?;
        registry.register(Box::new(last_health_check_timestamp.clone()))?;

        Ok(Self {
            db_connection_errors: counter(
                "db_connection_errors_total",
                "Total database connection errors",
            )?,
            db_query_duration: histogram(
                "db_query_duration_seconds",
                "Database probe query duration in seconds",
                DURATION_SECONDS_BUCKETS,
            )?,
            object_store_operations: counter_vec(
                "object_store_operations_total",
                "Total object store operations by outcome",
                &["operation", "outcome"],
            )?,
            object_store_latency,
            object_store_connection_errors: counter(
                "object_store_connection_errors_total",
                "Total object store connection errors",
            )?,
            circuit_breaker_state,
            circuit_breaker_calls: counter_vec(
                "circuit_breaker_calls_total",
                "Total calls through circuit breakers by outcome",
                &["breaker", "outcome"],
            )?,
            circuit_breaker_transitions: counter_vec(
                "circuit_breaker_transitions_total",
                "Total circuit breaker state transitions",
                &["breaker", "to"],
            )?,
            watcher_files_processed: counter(
                "watcher_files_processed_total",
                "Total files processed by watcher",
            )?,
            watcher_files_failed: counter(
                "watcher_files_failed_total",
                "Total files that failed processing",
            )?,
            watcher_files_in_progress: gauge(
                "watcher_files_in_progress",
                "Number of files currently being processed",
            )?,
            watcher_queue_depth: gauge(
                "watcher_semaphore_queue_depth",
                "Number of files waiting for an admission slot",
            )?,
            watcher_admission_timeouts: counter(
                "watcher_admission_timeouts_total",
                "Total admission attempts abandoned after timeout",
            )?,
            watcher_processing_timeouts: counter(
                "watcher_processing_timeouts_total",
                "Total file processing timeouts",
            )?,
            watcher_events_debounced: counter(
                "watcher_events_debounced_total",
                "Total file events coalesced by the debouncer",
            )?,
            watcher_thread_restarts: counter(
                "watcher_thread_restarts_total",
                "Total watcher thread restarts",
            )?,
            api_auth_failures: counter(
                "api_auth_failures_total",
                "Total API authentication failures",
            )?,
            api_rate_limit_blocks: counter(
                "api_rate_limit_blocks_total",
                "Total identities blocked by the rate limiter",
            )?,
            api_rate_limit_hits: counter(
                "api_rate_limit_hits_total",
                "Total rate limit rejections",
            )?,
            api_rate_limit_tracked_pairs: gauge(
                "api_rate_limit_tracked_pairs",
                "Identity and resource pairs tracked by the rate limiter",
            )?,
            consistency_pending_files: gauge(
                "consistency_pending_files",
                "Number of files pending sync",
            )?,
            consistency_orphaned_objects: gauge(
                "consistency_orphaned_objects",
                "Number of orphaned object store entries",
            )?,
            consistency_missing_objects: gauge(
                "consistency_missing_objects",
                "Number of objects in the database but missing from the object store",
            )?,
            consistency_checks: counter(
                "consistency_checks_total",
                "Total consistency checks performed",
            )?,
            consistency_errors_found: counter(
                "consistency_errors_found_total",
                "Total consistency errors found",
            )?,
            consistency_run_duration: histogram(
                "consistency_run_duration_seconds",
                "Consistency reconciliation duration in seconds",
                DURATION_SECONDS_BUCKETS,
            )?,
            health_check_failures: counter(
                "health_check_failures_total",
                "Total health checks with critical failures",
            )?,
            last_health_check_timestamp,
            background_task_failures: counter_vec(
                "background_task_failures_total",
                "Total failed background task runs",
                &["task"],
            )?,
            registry,
            namespace: ns,
        })
    }

    /// Namespace prepended to every metric name
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Gather all metric families currently registered
    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// Encode all metrics in Prometheus text exposition format
    pub fn encode_text(&self) -> prometheus::Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    /// Flatten all metrics into a name → value map
    ///
    /// Labelled series are keyed as `name{label="value",...}`; histograms
    /// contribute `_count` and `_sum` entries.
    pub fn snapshot(&self) -> BTreeMap<String, f64> {
        let mut values = BTreeMap::new();

        for family in self.gather() {
            let name = family.get_name();
            for metric in family.get_metric() {
                let labels: Vec<String> = metric
                    .get_label()
                    .iter()
                    .map(|l| format!("{}=\"{}\"", l.get_name(), l.get_value()))
                    .collect();
                let suffix = if labels.is_empty() {
                    String::new()
                } else {
                    format!("{{{}}}", labels.join(","))
                };

                match family.get_field_type() {
                    MetricType::COUNTER => {
                        values.insert(format!("{name}{suffix}"), metric.get_counter().get_value());
                    }
                    MetricType::GAUGE => {
                        values.insert(format!("{name}{suffix}"), metric.get_gauge().get_value());
                    }
                    MetricType::HISTOGRAM => {
                        let h = metric.get_histogram();
                        values.insert(format!("{name}_count{suffix}"), h.get_sample_count() as f64);
                        values.insert(format!("{name}_sum{suffix}"), h.get_sample_sum());
                    }
                    _ => {}
                }
            }
        }

        values
    }
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registries_are_isolated() {
        let a = MetricsRegistry::new().unwrap();
        let b = MetricsRegistry::new().unwrap();

        a.watcher_files_processed.inc_by(3);

        assert_eq!(a.watcher_files_processed.get(), 3);
        assert_eq!(b.watcher_files_processed.get(), 0);
    }

    #[test]
    fn test_encode_text() {
        let metrics = MetricsRegistry::new().unwrap();
        metrics.api_auth_failures.inc();
        metrics
            .circuit_breaker_state
            .with_label_values(&["upload"])
            .set(1);

        let text = metrics.encode_text().unwrap();
        assert!(text.contains("# TYPE vault_api_auth_failures_total counter"));
        assert!(text.contains("vault_api_auth_failures_total 1"));
        assert!(text.contains("vault_circuit_breaker_state{breaker=\"upload\"} 1"));
    }

    #[test]
    fn test_snapshot_flattens_histograms() {
        let metrics = MetricsRegistry::new().unwrap();
        metrics.consistency_run_duration.observe(0.5);
        metrics.consistency_run_duration.observe(1.5);
        metrics.consistency_pending_files.set(7);

        let snapshot = metrics.snapshot();
        assert_eq!(
            snapshot.get("vault_consistency_run_duration_seconds_count"),
            Some(&2.0)
        );
        assert_eq!(
            snapshot.get("vault_consistency_run_duration_seconds_sum"),
            Some(&2.0)
        );
        assert_eq!(snapshot.get("vault_consistency_pending_files"), Some(&7.0));
    }

    #[test]
    fn test_custom_namespace() {
        let metrics = MetricsRegistry::with_namespace("custom").unwrap();
        metrics.consistency_checks.inc();

        let text = metrics.encode_text().unwrap();
        assert!(text.contains("custom_consistency_checks_total 1"));
        assert!(!text.contains("vault_consistency_checks_total"));
    }
}
