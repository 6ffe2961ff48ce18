//! Background Supervisor
//!
//! Three periodic services run under the [`ServiceManager`]:
//! - [`WatcherMonitor`] restarts a dead watcher observer and warns when the
//!   watcher has been silent for too long
//! - [`ConsistencyService`] runs the reconciler after an initial delay and
//!   then on a fixed interval
//! - [`RateLimitPruner`] drops idle rate limiter entries so the per-identity
//!   map does not grow with every client ever seen
//!
//! A failing run is logged and counted in `background_task_failures` and the
//! loop keeps going. Silence alone never triggers a restart: an idle folder
//! is not a fault.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::config::SupervisorSection;
use crate::observability::MetricsRegistry;
use crate::resilience::RateLimiter;
use crate::watcher::Watcher;

use super::framework::{RestartPolicy, Service, ServiceConfig, ServiceError, ServiceManager, ServiceStatus};
use super::reconciler::ConsistencyReconciler;

// ============================================================================
// Configuration
// ============================================================================

/// Supervisor timing
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// How often the watcher is inspected
    pub watcher_check_interval: Duration,

    /// Silence after which a warning is logged
    pub watcher_stale_after: Duration,

    /// Interval between reconciliation runs
    pub consistency_interval: Duration,

    /// Delay before the first reconciliation run
    pub consistency_initial_delay: Duration,

    /// Bound for one reconciliation run
    pub consistency_run_timeout: Duration,

    /// Interval between sweeps of idle rate limiter entries
    pub rate_limit_prune_interval: Duration,

    /// Delay before a service loop that exited is restarted
    pub restart_backoff: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            watcher_check_interval: Duration::from_secs(30),
            watcher_stale_after: Duration::from_secs(600),
            consistency_interval: Duration::from_secs(300),
            consistency_initial_delay: Duration::from_secs(60),
            consistency_run_timeout: Duration::from_secs(60),
            rate_limit_prune_interval: Duration::from_secs(60),
            restart_backoff: Duration::from_secs(5),
        }
    }
}

impl SupervisorConfig {
    /// Build from the config file section and the reconciler run bound
    pub fn from_section(section: &SupervisorSection, run_timeout: Duration) -> Self {
        Self {
            watcher_check_interval: section.watcher_check_interval(),
            watcher_stale_after: section.watcher_stale_after(),
            consistency_interval: section.consistency_interval(),
            consistency_initial_delay: section.consistency_initial_delay(),
            consistency_run_timeout: run_timeout,
            rate_limit_prune_interval: section.rate_limit_prune_interval(),
            ..Default::default()
        }
    }
}

// ============================================================================
// Watcher Monitor
// ============================================================================

/// Restarts the watcher observer when it dies
pub struct WatcherMonitor {
    watcher: Arc<dyn Watcher>,
    check_interval: Duration,
    stale_after: Duration,
    backoff: Duration,
    status: RwLock<ServiceStatus>,
    metrics: Arc<MetricsRegistry>,
}

impl WatcherMonitor {
    /// Create a monitor for `watcher`
    pub fn new(watcher: Arc<dyn Watcher>, config: &SupervisorConfig, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            watcher,
            check_interval: config.watcher_check_interval,
            stale_after: config.watcher_stale_after,
            backoff: config.restart_backoff,
            status: RwLock::new(ServiceStatus::Stopped),
            metrics,
        }
    }

    /// Inspect the watcher once
    pub fn inspect(&self) {
        if !self.watcher.is_running() {
            // Stopped on purpose
            return;
        }

        if !self.watcher.observer_alive() {
            tracing::error!("Watcher observer died, restarting");
            if let Err(e) = self.watcher.restart() {
                tracing::error!(error = %e, "Failed to restart watcher observer");
                self.metrics
                    .background_task_failures
                    .with_label_values(&[self.name()])
                    .inc();
            }
            return;
        }

        if let Some(age) = self.watcher.last_event_age() {
            if age > self.stale_after {
                tracing::warn!(
                    seconds_since_last_event = age.as_secs(),
                    "Watcher has seen no file events"
                );
            }
        }
    }
}

#[async_trait::async_trait]
impl Service for WatcherMonitor {
    async fn start(&self, mut shutdown: broadcast::Receiver<()>) -> Result<(), ServiceError> {
        *self.status.write() = ServiceStatus::Running;
        tracing::info!(interval_secs = self.check_interval.as_secs(), "Watcher monitor started");

        let mut ticker = interval_at(Instant::now() + self.check_interval, self.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                result = shutdown.recv() => match result {
                    Ok(()) | Err(RecvError::Closed) => break,
                    Err(RecvError::Lagged(n)) => {
                        tracing::debug!(skipped = n, "Watcher monitor lagged on shutdown channel");
                    }
                },
                _ = ticker.tick() => self.inspect(),
            }
        }

        *self.status.write() = ServiceStatus::Stopped;
        tracing::info!("Watcher monitor stopped");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "watcher_monitor"
    }

    fn status(&self) -> ServiceStatus {
        self.status.read().clone()
    }

    fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy::Always {
            backoff: self.backoff,
        }
    }
}

// ============================================================================
// Consistency Service
// ============================================================================

/// Periodic reconciliation
pub struct ConsistencyService {
    reconciler: Arc<ConsistencyReconciler>,
    interval: Duration,
    initial_delay: Duration,
    run_timeout: Duration,
    backoff: Duration,
    status: RwLock<ServiceStatus>,
    metrics: Arc<MetricsRegistry>,
}

impl ConsistencyService {
    /// Create the service
    pub fn new(reconciler: Arc<ConsistencyReconciler>, config: &SupervisorConfig, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            reconciler,
            interval: config.consistency_interval,
            initial_delay: config.consistency_initial_delay,
            run_timeout: config.consistency_run_timeout,
            backoff: config.restart_backoff,
            status: RwLock::new(ServiceStatus::Stopped),
            metrics,
        }
    }

    /// Run one reconciliation, absorbing any failure
    pub async fn run_once(&self) {
        if let Err(e) = self.reconciler.reconcile_within(self.run_timeout).await {
            tracing::error!(error = %e, "Background consistency check failed");
            self.metrics
                .background_task_failures
                .with_label_values(&[self.name()])
                .inc();
        }
    }
}

#[async_trait::async_trait]
impl Service for ConsistencyService {
    async fn start(&self, mut shutdown: broadcast::Receiver<()>) -> Result<(), ServiceError> {
        *self.status.write() = ServiceStatus::Running;
        tracing::info!(
            initial_delay_secs = self.initial_delay.as_secs(),
            interval_secs = self.interval.as_secs(),
            "Consistency service started"
        );

        let mut ticker = interval_at(Instant::now() + self.initial_delay, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                result = shutdown.recv() => match result {
                    Ok(()) | Err(RecvError::Closed) => break,
                    Err(RecvError::Lagged(n)) => {
                        tracing::debug!(skipped = n, "Consistency service lagged on shutdown channel");
                    }
                },
                _ = ticker.tick() => self.run_once().await,
            }
        }

        *self.status.write() = ServiceStatus::Stopped;
        tracing::info!("Consistency service stopped");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "consistency"
    }

    fn status(&self) -> ServiceStatus {
        self.status.read().clone()
    }

    fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy::Always {
            backoff: self.backoff,
        }
    }
}

// ============================================================================
// Rate Limit Pruner
// ============================================================================

/// Periodically drops rate limiter pairs with no failures and no block
pub struct RateLimitPruner {
    limiter: Arc<RateLimiter>,
    interval: Duration,
    backoff: Duration,
    status: RwLock<ServiceStatus>,
}

impl RateLimitPruner {
    /// Create the service
    pub fn new(limiter: Arc<RateLimiter>, config: &SupervisorConfig) -> Self {
        Self {
            limiter,
            interval: config.rate_limit_prune_interval,
            backoff: config.restart_backoff,
            status: RwLock::new(ServiceStatus::Stopped),
        }
    }

    /// Sweep once, returning how many pairs were dropped
    pub fn prune_once(&self) -> usize {
        let pruned = self.limiter.prune_idle();
        if pruned > 0 {
            tracing::debug!(pruned, remaining = self.limiter.tracked_keys(), "Pruned idle rate limit entries");
        }
        pruned
    }
}

#[async_trait::async_trait]
impl Service for RateLimitPruner {
    async fn start(&self, mut shutdown: broadcast::Receiver<()>) -> Result<(), ServiceError> {
        *self.status.write() = ServiceStatus::Running;

        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                result = shutdown.recv() => match result {
                    Ok(()) | Err(RecvError::Closed) => break,
                    Err(RecvError::Lagged(_)) => {}
                },
                _ = ticker.tick() => {
                    self.prune_once();
                }
            }
        }

        *self.status.write() = ServiceStatus::Stopped;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "rate_limit_pruner"
    }

    fn status(&self) -> ServiceStatus {
        self.status.read().clone()
    }

    fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy::Always {
            backoff: self.backoff,
        }
    }
}

// ============================================================================
// Supervisor
// ============================================================================

/// Owns the periodic background services
pub struct BackgroundSupervisor {
    manager: ServiceManager,
}

impl BackgroundSupervisor {
    /// Register the watcher monitor, the consistency service and the pruner
    pub fn new(
        config: SupervisorConfig,
        watcher: Arc<dyn Watcher>,
        reconciler: Arc<ConsistencyReconciler>,
        limiter: Arc<RateLimiter>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        let mut manager = ServiceManager::new(ServiceConfig::default()).with_metrics(metrics.clone());
        manager.register(Arc::new(WatcherMonitor::new(watcher, &config, metrics.clone())));
        manager.register(Arc::new(ConsistencyService::new(reconciler, &config, metrics)));
        manager.register(Arc::new(RateLimitPruner::new(limiter, &config)));
        Self { manager }
    }

    /// Spawn every service
    pub fn start(&self) -> Result<(), ServiceError> {
        self.manager.start_all()?;
        tracing::info!(services = ?self.manager.service_names(), "Background supervisor started");
        Ok(())
    }

    /// Status of each service
    pub fn statuses(&self) -> Vec<(&'static str, ServiceStatus)> {
        self.manager.statuses()
    }

    /// Stop every service
    pub async fn shutdown(&self) -> Result<(), ServiceError> {
        self.manager.shutdown().await
    }
}
