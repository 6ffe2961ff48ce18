//! Component wiring
//!
//! [`VaultGuard`] builds every component from a [`VaultGuardConfig`] and a
//! database / object store pair, and owns their lifecycle.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::auth::AuthGuard;
use crate::config::VaultGuardConfig;
use crate::error::Result;
use crate::ingest::{InFlight, IngestConfig, IngestPipeline, WatchEvent};
use crate::observability::{MetricsRegistry, PrometheusConfig, PrometheusExporter};
use crate::resilience::{ConcurrencyGate, RateLimiter};
use crate::server::{build_router, AppState};
use crate::services::{
    BackgroundSupervisor, ConsistencyReconciler, DatabaseProbe, FilesystemProbe, HealthCheckAggregator, HealthConfig,
    ObjectStoreProbe, ReconcilerConfig, SupervisorConfig, WatcherProbe,
};
use crate::storage::{Database, GuardedObjectStore, LocalFilesystem, ObjectStore};
use crate::watcher::PollingWatcher;

/// Every component of the reliability layer, wired together
pub struct VaultGuard {
    pub config: VaultGuardConfig,
    pub metrics: Arc<MetricsRegistry>,
    pub fs: Arc<LocalFilesystem>,
    pub db: Arc<dyn Database>,
    pub store: Arc<GuardedObjectStore>,
    pub gate: Arc<ConcurrencyGate>,
    pub pipeline: Arc<IngestPipeline>,
    pub watcher: Arc<PollingWatcher>,
    pub reconciler: Arc<ConsistencyReconciler>,
    pub health: Arc<HealthCheckAggregator>,
    pub auth: Arc<AuthGuard>,
    pub supervisor: BackgroundSupervisor,
    exporter: Arc<PrometheusExporter>,
    events: Mutex<Option<mpsc::UnboundedReceiver<WatchEvent>>>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl VaultGuard {
    /// Build every component; nothing is started yet
    pub async fn build(config: VaultGuardConfig, db: Arc<dyn Database>, store: Arc<dyn ObjectStore>) -> Result<Self> {
        config.validate()?;
        let metrics = Arc::new(MetricsRegistry::new()?);

        let fs = Arc::new(LocalFilesystem::new(&config.server.watch_root).await?);
        let store = Arc::new(GuardedObjectStore::new(store, config.breaker.to_config(), metrics.clone()));
        let gate = Arc::new(ConcurrencyGate::new(config.gate.capacity, metrics.clone()));
        let in_flight = InFlight::new();

        let pipeline = IngestPipeline::new(
            IngestConfig::from(&config.gate),
            fs.clone(),
            db.clone(),
            store.clone(),
            gate.clone(),
            in_flight.clone(),
            metrics.clone(),
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let watcher = Arc::new(PollingWatcher::new(
            &config.server.watch_root,
            config.watcher.poll_interval(),
            tx,
            metrics.clone(),
        ));

        let reconciler = Arc::new(ConsistencyReconciler::new(
            ReconcilerConfig {
                sample_size: config.reconciler.sample_size,
                backlog_threshold: config.health.backlog_threshold,
            },
            fs.clone(),
            db.clone(),
            store.clone(),
            in_flight,
            metrics.clone(),
        ));

        let health_config = HealthConfig {
            probe_timeout: config.health.probe_timeout(),
            backlog_threshold: config.health.backlog_threshold,
            watcher_stale_after: config.supervisor.watcher_stale_after(),
            consistency_timeout: config.reconciler.run_timeout(),
        };
        let health = Arc::new(
            HealthCheckAggregator::new(health_config.clone(), metrics.clone())
                .with_probe(Arc::new(
                    DatabaseProbe::new(db.clone(), health_config.probe_timeout).with_metrics(metrics.clone()),
                ))
                .with_probe(Arc::new(ObjectStoreProbe::new(store.clone())))
                .with_probe(Arc::new(FilesystemProbe::new(fs.clone())))
                .with_probe(Arc::new(WatcherProbe::new(
                    watcher.clone(),
                    health_config.watcher_stale_after,
                )))
                .with_reconciler(reconciler.clone()),
        );

        let limiter = Arc::new(RateLimiter::new(config.rate_limit.to_config(), metrics.clone()));
        let auth = Arc::new(AuthGuard::new(db.clone(), limiter.clone(), metrics.clone()));

        let supervisor = BackgroundSupervisor::new(
            SupervisorConfig::from_section(&config.supervisor, config.reconciler.run_timeout()),
            watcher.clone(),
            reconciler.clone(),
            limiter,
            metrics.clone(),
        );

        let exporter = Arc::new(PrometheusExporter::new(PrometheusConfig::default(), metrics.clone()));

        Ok(Self {
            config,
            metrics,
            fs,
            db,
            store,
            gate,
            pipeline,
            watcher,
            reconciler,
            health,
            auth,
            supervisor,
            exporter,
            events: Mutex::new(Some(rx)),
            event_loop: Mutex::new(None),
        })
    }

    /// Shared state for the HTTP handlers
    pub fn state(&self) -> Arc<AppState> {
        Arc::new(AppState {
            health: self.health.clone(),
            auth: self.auth.clone(),
            db: self.db.clone(),
            store: self.store.clone(),
            exporter: self.exporter.clone(),
            trusted_proxies: self.config.server.trusted_proxies.clone(),
        })
    }

    /// HTTP router over this instance
    pub fn router(&self) -> axum::Router {
        build_router(self.state())
    }

    /// Start the watcher, the event loop and the background services
    pub fn start(&self) -> Result<()> {
        if let Some(events) = self.events.lock().take() {
            *self.event_loop.lock() = Some(self.pipeline.spawn_event_loop(events));
        }
        self.watcher.start()?;
        self.supervisor.start()?;
        tracing::info!(
            root = ?self.config.server.watch_root,
            bucket = %self.config.server.bucket,
            "Vault guard started"
        );
        Ok(())
    }

    /// Stop everything started by [`start`](Self::start)
    pub async fn shutdown(&self) -> Result<()> {
        let result = self.supervisor.shutdown().await;
        self.watcher.stop();
        self.pipeline.shutdown();
        if let Some(handle) = self.event_loop.lock().take() {
            handle.abort();
        }
        tracing::info!("Vault guard stopped");
        result.map_err(Into::into)
    }
}
