//! Background Services Module
//!
//! Health aggregation, consistency reconciliation and the supervised
//! background loops that keep them running.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐      ┌────────────────────────┐
//! │ BackgroundSupervisor │─────▶│ ConsistencyReconciler  │
//! │  (ServiceManager)    │      └───────────┬────────────┘
//! └──────────┬───────────┘                  │ last report
//!            │ restart                      ▼
//!            ▼                   ┌────────────────────────┐
//! ┌──────────────────────┐      │ HealthCheckAggregator  │
//! │       Watcher        │◀─────│  (probes per component)│
//! └──────────────────────┘      └────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use vault_guard::services::{BackgroundSupervisor, SupervisorConfig};
//!
//! let supervisor = BackgroundSupervisor::new(config, watcher, reconciler, limiter, metrics);
//! supervisor.start()?;
//!
//! // Graceful shutdown
//! supervisor.shutdown().await?;
//! ```

pub mod framework;
pub mod health;
pub mod reconciler;
pub mod supervisor;

pub use framework::{RestartPolicy, Service, ServiceConfig, ServiceError, ServiceManager, ServiceStatus};
pub use health::{
    ComponentHealth, ComponentStatus, ConsistencyProbe, DatabaseProbe, FilesystemProbe, HealthCheckAggregator,
    HealthConfig, HealthProbe, ObjectStoreProbe, SystemHealth, WatcherProbe,
};
pub use reconciler::{ConsistencyFindings, ConsistencyReconciler, ConsistencyReport, ReconcilerConfig};
pub use supervisor::{BackgroundSupervisor, ConsistencyService, SupervisorConfig, WatcherMonitor};
