//! Background service framework
//!
//! A [`Service`] is a long-running loop that stops when the shared broadcast
//! shutdown channel fires. The [`ServiceManager`] spawns each registered
//! service under a supervision task that catches both returned errors and
//! panics at the loop boundary and applies the service's [`RestartPolicy`].
//! A failed run is logged and counted; it never unwinds into the scheduler.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::observability::MetricsRegistry;

// ============================================================================
// Service contract
// ============================================================================

/// Errors raised by background services
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ServiceError {
    /// A run of the service loop failed
    #[error("Service '{service}' failed: {reason}")]
    Failed {
        /// Service name
        service: String,
        /// Failure description
        reason: String,
    },

    /// The service loop panicked
    #[error("Service '{0}' panicked")]
    Panicked(String),

    /// The service did not stop within the shutdown timeout
    #[error("Service '{0}' did not stop in time")]
    ShutdownTimeout(String),

    /// The manager was already started
    #[error("Service manager already started")]
    AlreadyStarted,
}

impl ServiceError {
    /// Build a [`ServiceError::Failed`]
    pub fn failed(service: impl Into<String>, reason: impl ToString) -> Self {
        ServiceError::Failed {
            service: service.into(),
            reason: reason.to_string(),
        }
    }
}

/// Lifecycle state of a service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceStatus {
    /// Not running
    Stopped,
    /// Loop is running
    Running,
    /// Last run failed, waiting to be restarted
    Failed(String),
}

impl ServiceStatus {
    /// Running services are healthy
    pub fn is_healthy(&self) -> bool {
        matches!(self, ServiceStatus::Running)
    }
}

/// What the manager does when a service run ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    /// Never restart
    Never,
    /// Restart after a failure, at most `max_retries` times in a row
    OnFailure {
        /// Maximum consecutive restarts
        max_retries: u32,
        /// Delay before each restart
        backoff: Duration,
    },
    /// Restart whenever the loop ends before shutdown
    Always {
        /// Delay before each restart
        backoff: Duration,
    },
}

/// A long-running background loop
#[async_trait::async_trait]
pub trait Service: Send + Sync {
    /// Run until `shutdown` fires or the loop fails
    async fn start(&self, shutdown: broadcast::Receiver<()>) -> Result<(), ServiceError>;

    /// Stable service name used in logs and metrics
    fn name(&self) -> &'static str;

    /// Current lifecycle state
    fn status(&self) -> ServiceStatus;

    /// Names of services this one expects to be running
    fn dependencies(&self) -> Vec<&'static str> {
        Vec::new()
    }

    /// Restart behaviour applied by the manager
    fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy::Never
    }
}

// ============================================================================
// Service manager
// ============================================================================

/// Service manager configuration
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// How long `shutdown` waits for each service to stop
    pub shutdown_timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

/// Spawns and supervises registered services
pub struct ServiceManager {
    config: ServiceConfig,
    services: Vec<Arc<dyn Service>>,
    shutdown_tx: broadcast::Sender<()>,
    stopping: Arc<AtomicBool>,
    handles: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
    restarts: Arc<RwLock<HashMap<&'static str, u32>>>,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl ServiceManager {
    /// Create an empty manager
    pub fn new(config: ServiceConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(4);
        Self {
            config,
            services: Vec::new(),
            shutdown_tx,
            stopping: Arc::new(AtomicBool::new(false)),
            handles: Mutex::new(Vec::new()),
            restarts: Arc::new(RwLock::new(HashMap::new())),
            metrics: None,
        }
    }

    /// Count failed runs in `background_task_failures`
    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Register a service to be started by [`start_all`](Self::start_all)
    pub fn register(&mut self, service: Arc<dyn Service>) {
        self.services.push(service);
    }

    /// Registered service names
    pub fn service_names(&self) -> Vec<&'static str> {
        self.services.iter().map(|s| s.name()).collect()
    }

    /// Current status of each registered service
    pub fn statuses(&self) -> Vec<(&'static str, ServiceStatus)> {
        self.services.iter().map(|s| (s.name(), s.status())).collect()
    }

    /// Number of times the named service has been restarted
    pub fn restart_count(&self, name: &str) -> u32 {
        self.restarts.read().get(name).copied().unwrap_or(0)
    }

    /// Spawn every registered service under supervision
    pub fn start_all(&self) -> Result<(), ServiceError> {
        let mut handles = self.handles.lock();
        if !handles.is_empty() {
            return Err(ServiceError::AlreadyStarted);
        }

        for service in &self.services {
            for dep in service.dependencies() {
                if !self.services.iter().any(|s| s.name() == dep) {
                    tracing::warn!(
                        service = service.name(),
                        dependency = dep,
                        "Service dependency is not registered"
                    );
                }
            }

            let supervisor = Supervision {
                service: service.clone(),
                shutdown_tx: self.shutdown_tx.clone(),
                stopping: self.stopping.clone(),
                restarts: self.restarts.clone(),
                metrics: self.metrics.clone(),
            };
            handles.push((service.name(), tokio::spawn(supervisor.run())));
            tracing::debug!(service = service.name(), "Service spawned");
        }

        Ok(())
    }

    /// Signal shutdown and wait for every service to stop
    pub async fn shutdown(&self) -> Result<(), ServiceError> {
        self.stopping.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());

        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock());
        let mut first_error = None;
        for (name, handle) in handles {
            match tokio::time::timeout(self.config.shutdown_timeout, handle).await {
                Ok(_) => tracing::debug!(service = name, "Service stopped"),
                Err(_) => {
                    tracing::warn!(service = name, "Service did not stop in time");
                    first_error.get_or_insert(ServiceError::ShutdownTimeout(name.to_string()));
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Supervision loop for one service
struct Supervision {
    service: Arc<dyn Service>,
    shutdown_tx: broadcast::Sender<()>,
    stopping: Arc<AtomicBool>,
    restarts: Arc<RwLock<HashMap<&'static str, u32>>>,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl Supervision {
    async fn run(self) {
        let name = self.service.name();
        let mut consecutive_failures = 0u32;

        loop {
            // Subscribe before checking the flag so a concurrent shutdown is never missed.
            let rx = self.shutdown_tx.subscribe();
            if self.stopping.load(Ordering::SeqCst) {
                break;
            }

            let service = self.service.clone();
            let outcome = match tokio::spawn(async move { service.start(rx).await }).await {
                Ok(result) => result,
                Err(join_err) if join_err.is_panic() => Err(ServiceError::Panicked(name.to_string())),
                Err(join_err) => Err(ServiceError::failed(name, join_err)),
            };

            if self.stopping.load(Ordering::SeqCst) {
                break;
            }

            let backoff = match (&outcome, self.service.restart_policy()) {
                (Ok(()), RestartPolicy::Always { backoff }) => {
                    consecutive_failures = 0;
                    backoff
                }
                (Ok(()), _) => break,
                (Err(e), policy) => {
                    consecutive_failures += 1;
                    tracing::error!(service = name, error = %e, "Background service failed");
                    if let Some(metrics) = &self.metrics {
                        metrics
                            .background_task_failures
                            .with_label_values(&[name])
                            .inc();
                    }
                    match policy {
                        RestartPolicy::Never => break,
                        RestartPolicy::OnFailure {
                            max_retries,
                            backoff,
                        } => {
                            if consecutive_failures > max_retries {
                                tracing::error!(
                                    service = name,
                                    attempts = consecutive_failures,
                                    "Service exceeded restart budget, giving up"
                                );
                                break;
                            }
                            backoff
                        }
                        RestartPolicy::Always { backoff } => backoff,
                    }
                }
            };

            *self.restarts.write().entry(name).or_insert(0) += 1;
            tracing::info!(
                service = name,
                backoff_ms = backoff.as_millis() as u64,
                "Restarting background service"
            );

            let mut rx = self.shutdown_tx.subscribe();
            if self.stopping.load(Ordering::SeqCst) {
                break;
            }
            tokio::select! {
                _ = rx.recv() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    /// Fails `failures` times (or panics), then idles until shutdown
    struct FlakyService {
        runs: AtomicU32,
        failures: u32,
        panic: bool,
        policy: RestartPolicy,
        status: RwLock<ServiceStatus>,
    }

    impl FlakyService {
        fn new(failures: u32, panic: bool, policy: RestartPolicy) -> Arc<Self> {
            Arc::new(Self {
                runs: AtomicU32::new(0),
                failures,
                panic,
                policy,
                status: RwLock::new(ServiceStatus::Stopped),
            })
        }
    }

    #[async_trait::async_trait]
    impl Service for FlakyService {
        async fn start(&self, mut shutdown: broadcast::Receiver<()>) -> Result<(), ServiceError> {
            let run = self.runs.fetch_add(1, Ordering::SeqCst);
            if run < self.failures {
                if self.panic {
                    panic!("boom");
                }
                *self.status.write() = ServiceStatus::Failed("boom".into());
                return Err(ServiceError::failed("flaky", "boom"));
            }
            *self.status.write() = ServiceStatus::Running;
            let _ = shutdown.recv().await;
            *self.status.write() = ServiceStatus::Stopped;
            Ok(())
        }

        fn name(&self) -> &'static str {
            "flaky"
        }

        fn status(&self) -> ServiceStatus {
            self.status.read().clone()
        }

        fn restart_policy(&self) -> RestartPolicy {
            self.policy
        }
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[test]
    fn test_service_status() {
        assert!(ServiceStatus::Running.is_healthy());
        assert!(!ServiceStatus::Stopped.is_healthy());
        assert!(!ServiceStatus::Failed("x".into()).is_healthy());
    }

    #[tokio::test]
    async fn test_restart_on_failure() {
        let service = FlakyService::new(
            2,
            false,
            RestartPolicy::OnFailure {
                max_retries: 5,
                backoff: Duration::from_millis(1),
            },
        );
        let metrics = Arc::new(MetricsRegistry::new().unwrap());
        let mut manager = ServiceManager::new(ServiceConfig::default()).with_metrics(metrics.clone());
        manager.register(service.clone());
        manager.start_all().unwrap();

        settle().await;
        assert_eq!(service.runs.load(Ordering::SeqCst), 3);
        assert_eq!(manager.restart_count("flaky"), 2);
        assert!(service.status().is_healthy());
        assert_eq!(
            metrics
                .background_task_failures
                .with_label_values(&["flaky"])
                .get(),
            2
        );

        manager.shutdown().await.unwrap();
        assert_eq!(service.status(), ServiceStatus::Stopped);
    }

    #[tokio::test]
    async fn test_panic_is_caught_and_restarted() {
        let service = FlakyService::new(
            1,
            true,
            RestartPolicy::Always {
                backoff: Duration::from_millis(1),
            },
        );
        let mut manager = ServiceManager::new(ServiceConfig::default());
        manager.register(service.clone());
        manager.start_all().unwrap();

        settle().await;
        assert_eq!(service.runs.load(Ordering::SeqCst), 2);
        assert!(service.status().is_healthy());

        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_retry_budget_exhausted() {
        let service = FlakyService::new(
            10,
            false,
            RestartPolicy::OnFailure {
                max_retries: 2,
                backoff: Duration::from_millis(1),
            },
        );
        let mut manager = ServiceManager::new(ServiceConfig::default());
        manager.register(service.clone());
        manager.start_all().unwrap();

        settle().await;
        assert_eq!(service.runs.load(Ordering::SeqCst), 3);
        assert_eq!(manager.restart_count("flaky"), 2);
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_never_policy_does_not_restart() {
        let service = FlakyService::new(1, false, RestartPolicy::Never);
        let mut manager = ServiceManager::new(ServiceConfig::default());
        manager.register(service.clone());
        manager.start_all().unwrap();
        assert!(matches!(manager.start_all(), Err(ServiceError::AlreadyStarted)));

        settle().await;
        assert_eq!(service.runs.load(Ordering::SeqCst), 1);
        assert_eq!(manager.restart_count("flaky"), 0);
        manager.shutdown().await.unwrap();
    }
}
