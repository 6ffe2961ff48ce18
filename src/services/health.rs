//! Health Check Aggregator
//!
//! Runs a fixed set of component probes concurrently and rolls them into one
//! system status:
//! - **database** and **filesystem** are critical: either one Down makes the
//!   whole system Down
//! - **object_store**, **watcher** and **consistency** are non-critical: Down,
//!   Degraded or Unknown only degrade the system
//!
//! Every probe is time-bounded. A probe that times out or panics is recorded
//! as a component result, never propagated to the caller.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::observability::MetricsRegistry;
use crate::storage::{Database, Filesystem, GuardedObjectStore, ObjectStore};
use crate::watcher::Watcher;

use super::reconciler::{ConsistencyReconciler, ConsistencyReport};

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the health aggregator
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Timeout for each individual probe
    pub probe_timeout: Duration,

    /// Pending files above which consistency is Degraded
    pub backlog_threshold: usize,

    /// Watcher silence after which it is reported Degraded
    pub watcher_stale_after: Duration,

    /// Bound for a fresh reconciliation run
    pub consistency_timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(5),
            backlog_threshold: 10,
            watcher_stale_after: Duration::from_secs(600),
            consistency_timeout: Duration::from_secs(60),
        }
    }
}

// ============================================================================
// Health Status
// ============================================================================

/// Status of a component or of the whole system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    /// Working normally
    Up,
    /// Not working
    Down,
    /// Working with reduced capability
    Degraded,
    /// Could not be determined
    Unknown,
}

impl ComponentStatus {
    /// Lowercase name used on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentStatus::Up => "up",
            ComponentStatus::Down => "down",
            ComponentStatus::Degraded => "degraded",
            ComponentStatus::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ComponentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one probe invocation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComponentHealth {
    /// Component name
    pub name: String,

    /// Component status
    pub status: ComponentStatus,

    /// How long the probe took
    pub latency_ms: f64,

    /// Human readable summary
    pub message: String,

    /// Structured details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ComponentHealth {
    /// Create a result with the given status
    pub fn new(name: impl Into<String>, status: ComponentStatus, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status,
            latency_ms: 0.0,
            message: message.into(),
            details: None,
        }
    }

    /// Create an Up result
    pub fn up(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(name, ComponentStatus::Up, message)
    }

    /// Create a Down result
    pub fn down(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(name, ComponentStatus::Down, message)
    }

    /// Create a Degraded result
    pub fn degraded(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(name, ComponentStatus::Degraded, message)
    }

    /// Create an Unknown result
    pub fn unknown(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(name, ComponentStatus::Unknown, message)
    }

    /// Attach structured details
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Aggregated system health
#[derive(Debug, Clone, Serialize)]
pub struct SystemHealth {
    /// Overall status
    pub status: ComponentStatus,

    /// When the check ran
    pub timestamp: DateTime<Utc>,

    /// Per-component results
    pub components: BTreeMap<String, ComponentHealth>,

    /// Critical components that are Down
    pub critical_failures: Vec<String>,
}

impl SystemHealth {
    /// Whether every component is Up
    pub fn all_up(&self) -> bool {
        self.components
            .values()
            .all(|c| c.status == ComponentStatus::Up)
    }
}

// ============================================================================
// Probes
// ============================================================================

/// A single component check
#[async_trait::async_trait]
pub trait HealthProbe: Send + Sync {
    /// Component name
    fn name(&self) -> &'static str;

    /// Whether a Down result makes the whole system Down
    fn critical(&self) -> bool;

    /// Time bound for this probe, if different from the aggregator default
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Run the check
    async fn probe(&self) -> ComponentHealth;
}

/// Database connectivity
pub struct DatabaseProbe {
    db: Arc<dyn Database>,
    timeout: Duration,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl DatabaseProbe {
    /// Probe `db` with a ping bounded by `timeout`
    pub fn new(db: Arc<dyn Database>, timeout: Duration) -> Self {
        Self {
            db,
            timeout,
            metrics: None,
        }
    }

    /// Record ping latency and connection errors
    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

#[async_trait::async_trait]
impl HealthProbe for DatabaseProbe {
    fn name(&self) -> &'static str {
        "database"
    }

    fn critical(&self) -> bool {
        true
    }

    async fn probe(&self) -> ComponentHealth {
        let started = Instant::now();
        let result = self.db.ping(self.timeout).await;

        if let Some(metrics) = &self.metrics {
            metrics
                .db_query_duration
                .observe(started.elapsed().as_secs_f64());
            if result.is_err() {
                metrics.db_connection_errors.inc();
            }
        }

        match result {
            Ok(()) => ComponentHealth::up(self.name(), "Database connection healthy"),
            Err(e) => ComponentHealth::down(self.name(), format!("Database unreachable: {}", e)),
        }
    }
}

/// Object store bucket availability, with breaker states in the details
pub struct ObjectStoreProbe {
    store: Arc<GuardedObjectStore>,
}

impl ObjectStoreProbe {
    /// Probe through the guarded store
    pub fn new(store: Arc<GuardedObjectStore>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl HealthProbe for ObjectStoreProbe {
    fn name(&self) -> &'static str {
        "object_store"
    }

    fn critical(&self) -> bool {
        false
    }

    async fn probe(&self) -> ComponentHealth {
        let result = self.store.bucket_exists().await;
        let details = serde_json::json!({ "circuit_breakers": self.store.breaker_statuses() });

        let health = match result {
            Ok(true) => ComponentHealth::up(self.name(), "Object store connection healthy"),
            Ok(false) => ComponentHealth::down(self.name(), "Bucket does not exist"),
            Err(e) if e.is_rejection() => {
                ComponentHealth::degraded(self.name(), format!("Object store calls suspended: {}", e))
            }
            Err(e) => ComponentHealth::down(self.name(), format!("Object store unreachable: {}", e)),
        };
        health.with_details(details)
    }
}

/// Write, read back and delete a probe file under the watch root
pub struct FilesystemProbe {
    fs: Arc<dyn Filesystem>,
}

impl FilesystemProbe {
    /// Probe `fs`
    pub fn new(fs: Arc<dyn Filesystem>) -> Self {
        Self { fs }
    }

    async fn roundtrip(&self, payload: &[u8]) -> crate::Result<bool> {
        self.fs.write_probe(payload).await?;
        let read = self.fs.read_probe().await;
        self.fs.delete_probe().await?;
        Ok(read? == payload)
    }
}

#[async_trait::async_trait]
impl HealthProbe for FilesystemProbe {
    fn name(&self) -> &'static str {
        "filesystem"
    }

    fn critical(&self) -> bool {
        true
    }

    async fn probe(&self) -> ComponentHealth {
        let payload = format!("health-{}", Utc::now().timestamp_millis());
        let details = serde_json::json!({ "root": self.fs.root().display().to_string() });

        let health = match self.roundtrip(payload.as_bytes()).await {
            Ok(true) => ComponentHealth::up(self.name(), "Filesystem read/write healthy"),
            Ok(false) => ComponentHealth::down(self.name(), "Probe file content mismatch"),
            Err(e) => ComponentHealth::down(self.name(), format!("Filesystem error: {}", e)),
        };
        health.with_details(details)
    }
}

/// Watcher liveness and event freshness
pub struct WatcherProbe {
    watcher: Arc<dyn Watcher>,
    stale_after: Duration,
}

impl WatcherProbe {
    /// Probe `watcher`, reporting Degraded after `stale_after` without events
    pub fn new(watcher: Arc<dyn Watcher>, stale_after: Duration) -> Self {
        Self {
            watcher,
            stale_after,
        }
    }
}

#[async_trait::async_trait]
impl HealthProbe for WatcherProbe {
    fn name(&self) -> &'static str {
        "watcher"
    }

    fn critical(&self) -> bool {
        false
    }

    async fn probe(&self) -> ComponentHealth {
        let age = self.watcher.last_event_age();
        let details = serde_json::json!({
            "running": self.watcher.is_running(),
            "observer_alive": self.watcher.observer_alive(),
            "seconds_since_last_event": age.map(|a| a.as_secs_f64()),
        });

        let health = if !self.watcher.is_running() {
            ComponentHealth::down(self.name(), "Watcher not running")
        } else if !self.watcher.observer_alive() {
            ComponentHealth::down(self.name(), "Observer thread not alive")
        } else {
            match age {
                Some(age) if age > self.stale_after => ComponentHealth::degraded(
                    self.name(),
                    format!("No file events for {}s", age.as_secs()),
                ),
                _ => ComponentHealth::up(self.name(), "Watcher running"),
            }
        };
        health.with_details(details)
    }
}

/// Consistency status from a fresh or cached reconciliation report
pub struct ConsistencyProbe {
    reconciler: Arc<ConsistencyReconciler>,
    backlog_threshold: usize,
    run_timeout: Duration,
    fresh: bool,
}

impl ConsistencyProbe {
    /// Probe that runs a new reconciliation bounded by `run_timeout`
    pub fn fresh(reconciler: Arc<ConsistencyReconciler>, backlog_threshold: usize, run_timeout: Duration) -> Self {
        Self {
            reconciler,
            backlog_threshold,
            run_timeout,
            fresh: true,
        }
    }

    /// Probe that reads the last published report
    pub fn cached(reconciler: Arc<ConsistencyReconciler>, backlog_threshold: usize) -> Self {
        Self {
            reconciler,
            backlog_threshold,
            run_timeout: Duration::ZERO,
            fresh: false,
        }
    }

    fn report_health(&self, report: &ConsistencyReport) -> ComponentHealth {
        let (status, message) = report.assess(self.backlog_threshold);
        ComponentHealth::new(self.name(), status, message).with_details(serde_json::json!({
            "generation": report.generation,
            "checked_at": report.timestamp,
            "cached": !self.fresh,
            "collections_checked": report.findings.collections_checked,
            "pending_files": report.pending_count(),
            "missing_from_object_store": report.findings.missing.as_ref().map(Vec::len),
            "orphaned_objects": report.findings.orphaned.as_ref().map(Vec::len),
            "verification_failures": report.findings.verification_failures.len(),
        }))
    }
}

#[async_trait::async_trait]
impl HealthProbe for ConsistencyProbe {
    fn name(&self) -> &'static str {
        "consistency"
    }

    fn critical(&self) -> bool {
        false
    }

    fn timeout(&self) -> Option<Duration> {
        // reconcile_within enforces the run bound itself
        self.fresh
            .then(|| self.run_timeout + Duration::from_secs(1))
    }

    async fn probe(&self) -> ComponentHealth {
        if !self.fresh {
            return match self.reconciler.last_report() {
                Some(report) => self.report_health(&report),
                None => ComponentHealth::unknown(self.name(), "No consistency check has completed yet"),
            };
        }

        match self.reconciler.reconcile_within(self.run_timeout).await {
            Ok(report) => self.report_health(&report),
            Err(e) => ComponentHealth::unknown(self.name(), format!("Consistency check failed: {}", e)),
        }
    }
}

// ============================================================================
// Aggregator
// ============================================================================

/// Runs probes and combines their results
pub struct HealthCheckAggregator {
    config: HealthConfig,
    probes: Vec<Arc<dyn HealthProbe>>,
    reconciler: Option<Arc<ConsistencyReconciler>>,
    metrics: Arc<MetricsRegistry>,
}

impl HealthCheckAggregator {
    /// Create an aggregator with no probes
    pub fn new(config: HealthConfig, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            config,
            probes: Vec::new(),
            reconciler: None,
            metrics,
        }
    }

    /// Register a probe
    pub fn with_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probes.push(probe);
        self
    }

    /// Source of the consistency component
    pub fn with_reconciler(mut self, reconciler: Arc<ConsistencyReconciler>) -> Self {
        self.reconciler = Some(reconciler);
        self
    }

    /// Aggregator configuration
    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Constant-time liveness signal
    pub fn liveness(&self) -> ComponentStatus {
        ComponentStatus::Up
    }

    /// Run every probe
    ///
    /// With `include_consistency` a fresh reconciliation runs; otherwise the
    /// consistency component reflects the last published report.
    pub async fn check(&self, include_consistency: bool) -> SystemHealth {
        let mut probes = self.probes.clone();
        if let Some(reconciler) = &self.reconciler {
            let probe: Arc<dyn HealthProbe> = if include_consistency {
                Arc::new(ConsistencyProbe::fresh(
                    reconciler.clone(),
                    self.config.backlog_threshold,
                    self.config.consistency_timeout,
                ))
            } else {
                Arc::new(ConsistencyProbe::cached(reconciler.clone(), self.config.backlog_threshold))
            };
            probes.push(probe);
        }

        let health = self.run(probes).await;

        self.metrics
            .last_health_check_timestamp
            .set(health.timestamp.timestamp() as f64);
        if !health.critical_failures.is_empty() {
            self.metrics.health_check_failures.inc();
            tracing::error!(failures = ?health.critical_failures, "Critical components down");
        } else if health.status != ComponentStatus::Up {
            tracing::warn!(status = %health.status, "System health degraded");
        }

        health
    }

    /// Run only the critical probes
    ///
    /// Ready means every critical component is Up.
    pub async fn readiness(&self) -> SystemHealth {
        let critical = self
            .probes
            .iter()
            .filter(|p| p.critical())
            .cloned()
            .collect();
        self.run(critical).await
    }

    async fn run(&self, probes: Vec<Arc<dyn HealthProbe>>) -> SystemHealth {
        let mut tasks = JoinSet::new();
        let mut critical = BTreeMap::new();
        let mut names = HashMap::new();

        for probe in probes {
            critical.insert(probe.name(), probe.critical());
            let name = probe.name();
            let timeout = probe.timeout().unwrap_or(self.config.probe_timeout);
            let handle = tasks.spawn(Self::run_probe(probe, timeout));
            names.insert(handle.id(), name);
        }

        let mut components = BTreeMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(health) => {
                    components.insert(health.name.clone(), health);
                }
                Err(join_err) => {
                    let name = names.get(&join_err.id()).copied().unwrap_or("unknown");
                    tracing::error!(probe = name, error = %join_err, "Health probe panicked");
                    components.insert(
                        name.to_string(),
                        ComponentHealth::down(name, "Health check panicked"),
                    );
                }
            }
        }

        aggregate(components, &critical)
    }

    async fn run_probe(probe: Arc<dyn HealthProbe>, timeout: Duration) -> ComponentHealth {
        let started = Instant::now();
        let mut health = match tokio::time::timeout(timeout, probe.probe()).await {
            Ok(health) => health,
            Err(_) => {
                let message = format!("Health check timed out after {}s", timeout.as_secs_f64());
                tracing::warn!(probe = probe.name(), timeout_secs = timeout.as_secs_f64(), "Health probe timed out");
                if probe.critical() {
                    ComponentHealth::down(probe.name(), message)
                } else {
                    ComponentHealth::unknown(probe.name(), message)
                }
            }
        };
        health.latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        health
    }
}

impl std::fmt::Debug for HealthCheckAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthCheckAggregator")
            .field("config", &self.config)
            .field(
                "probes",
                &self.probes.iter().map(|p| p.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Combine component results into a system status
///
/// Down if a critical component is Down; Degraded if a non-critical
/// component is anything but Up; Up otherwise.
fn aggregate(
    components: BTreeMap<String, ComponentHealth>,
    critical: &BTreeMap<&'static str, bool>,
) -> SystemHealth {
    let is_critical = |name: &str| critical.get(name).copied().unwrap_or(false);

    let critical_failures: Vec<String> = components
        .values()
        .filter(|c| is_critical(&c.name) && c.status != ComponentStatus::Up)
        .map(|c| c.name.clone())
        .collect();

    let degraded = components
        .values()
        .any(|c| !is_critical(&c.name) && c.status != ComponentStatus::Up);

    let status = if !critical_failures.is_empty() {
        ComponentStatus::Down
    } else if degraded {
        ComponentStatus::Degraded
    } else {
        ComponentStatus::Up
    };

    SystemHealth {
        status,
        timestamp: Utc::now(),
        components,
        critical_failures,
    }
}

// ============================================================================
// Tests
// ============================================================================
