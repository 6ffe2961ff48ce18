//! Configuration
//!
//! [`VaultGuardConfig`] is read from a TOML file. Every field has a default,
//! so a partial file (or none at all) is valid:
//!
//! ```toml
//! [server]
//! listen_addr = "0.0.0.0:8000"
//! watch_root = "/data/collections"
//!
//! [breaker]
//! failure_threshold = 3
//!
//! [supervisor]
//! consistency_interval_secs = 600
//!
//! [object_store]
//! backend = "directory"
//! directory = "/data/objects"
//! ```
//!
//! Lookup order: the file named by `VAULT_GUARD_CONFIG`, then
//! `./vault-guard.toml`, then built-in defaults.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::resilience::{CircuitBreakerConfig, RateLimitConfig};

/// Environment variable naming the configuration file
pub const CONFIG_ENV_VAR: &str = "VAULT_GUARD_CONFIG";

/// Configuration file read from the working directory when the variable is unset
pub const DEFAULT_CONFIG_FILE: &str = "vault-guard.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultGuardConfig {
    /// HTTP listener and storage locations
    pub server: ServerSection,
    /// Object store backend
    pub object_store: ObjectStoreSection,
    /// Object store circuit breakers
    pub breaker: BreakerSection,
    /// Authentication rate limiting
    pub rate_limit: RateLimitSection,
    /// Ingestion admission control
    pub gate: GateSection,
    /// Health aggregation
    pub health: HealthSection,
    /// Consistency reconciliation
    pub reconciler: ReconcilerSection,
    /// Background schedules
    pub supervisor: SupervisorSection,
    /// Filesystem observer
    pub watcher: WatcherSection,
}

/// `[server]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Socket address to bind
    pub listen_addr: String,
    /// Directory holding one sub-directory per collection
    pub watch_root: PathBuf,
    /// Object store bucket
    pub bucket: String,
    /// Peers whose `X-Forwarded-For` header is trusted
    pub trusted_proxies: Vec<IpAddr>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8000".to_string(),
            watch_root: PathBuf::from("./data/collections"),
            bucket: "vault".to_string(),
            trusted_proxies: Vec::new(),
        }
    }
}

/// Where object bytes are kept
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectStoreBackend {
    /// Bucket directory on local disk
    #[default]
    Directory,
    /// In-process map, lost on exit
    Memory,
}

/// `[object_store]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectStoreSection {
    /// Backend kind
    pub backend: ObjectStoreBackend,
    /// Parent of the bucket directory for the `directory` backend
    pub directory: PathBuf,
}

impl Default for ObjectStoreSection {
    fn default() -> Self {
        Self {
            backend: ObjectStoreBackend::Directory,
            directory: PathBuf::from("./data/objects"),
        }
    }
}

/// `[breaker]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSection {
    /// Consecutive failures that open a breaker
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close it again
    pub success_threshold: u32,
    /// Seconds a breaker stays open before probing
    pub timeout_secs: u64,
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout_secs: 30,
        }
    }
}

impl BreakerSection {
    /// Breaker configuration shared by every object store operation family
    pub fn to_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig::new(
            self.failure_threshold,
            self.success_threshold,
            Duration::from_secs(self.timeout_secs),
        )
    }
}

/// `[rate_limit]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSection {
    /// Failures inside the window that trigger a block
    pub max_failures: u32,
    /// Trailing window in seconds
    pub window_secs: u64,
    /// Block length in seconds
    pub block_secs: u64,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            max_failures: 5,
            window_secs: 60,
            block_secs: 300,
        }
    }
}

impl RateLimitSection {
    /// Rate limiter configuration
    pub fn to_config(&self) -> RateLimitConfig {
        RateLimitConfig::new(
            self.max_failures,
            Duration::from_secs(self.window_secs),
            Duration::from_secs(self.block_secs),
        )
    }
}

/// `[gate]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateSection {
    /// Concurrent ingestion slots
    pub capacity: usize,
    /// Seconds an event may wait for a slot
    pub admission_timeout_secs: u64,
    /// Seconds an admitted event may spend processing
    pub processing_timeout_secs: u64,
    /// Debounce window for repeated events on one path
    pub debounce_ms: u64,
}

impl Default for GateSection {
    fn default() -> Self {
        Self {
            capacity: 10,
            admission_timeout_secs: 30,
            processing_timeout_secs: 300,
            debounce_ms: 1000,
        }
    }
}

impl GateSection {
    /// Admission wait bound
    pub fn admission_timeout(&self) -> Duration {
        Duration::from_secs(self.admission_timeout_secs)
    }

    /// Processing bound
    pub fn processing_timeout(&self) -> Duration {
        Duration::from_secs(self.processing_timeout_secs)
    }

    /// Debounce window
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

/// `[health]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSection {
    /// Per-probe timeout in seconds
    pub probe_timeout_secs: u64,
    /// Pending files above which consistency reports Degraded
    pub backlog_threshold: usize,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            probe_timeout_secs: 5,
            backlog_threshold: 10,
        }
    }
}

impl HealthSection {
    /// Per-probe timeout
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

/// `[reconciler]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerSection {
    /// Objects and records sampled per collection
    pub sample_size: usize,
    /// Seconds a fresh reconciliation may take when requested over HTTP
    pub run_timeout_secs: u64,
}

impl Default for ReconcilerSection {
    fn default() -> Self {
        Self {
            sample_size: 5,
            run_timeout_secs: 60,
        }
    }
}

impl ReconcilerSection {
    /// Bound on an on-demand reconciliation
    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }
}

/// `[supervisor]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSection {
    /// Seconds between watcher liveness checks
    pub watcher_check_interval_secs: u64,
    /// Seconds without events before the watcher is reported stale
    pub watcher_stale_secs: u64,
    /// Seconds between consistency runs
    pub consistency_interval_secs: u64,
    /// Seconds to wait after startup before the first consistency run
    pub consistency_initial_delay_secs: u64,
    /// Seconds between sweeps of idle rate limiter entries
    pub rate_limit_prune_interval_secs: u64,
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            watcher_check_interval_secs: 30,
            watcher_stale_secs: 600,
            consistency_interval_secs: 300,
            consistency_initial_delay_secs: 60,
            rate_limit_prune_interval_secs: 60,
        }
    }
}

impl SupervisorSection {
    /// Watcher liveness interval
    pub fn watcher_check_interval(&self) -> Duration {
        Duration::from_secs(self.watcher_check_interval_secs)
    }

    /// Watcher staleness threshold
    pub fn watcher_stale_after(&self) -> Duration {
        Duration::from_secs(self.watcher_stale_secs)
    }

    /// Consistency interval
    pub fn consistency_interval(&self) -> Duration {
        Duration::from_secs(self.consistency_interval_secs)
    }

    /// Delay before the first consistency run
    pub fn consistency_initial_delay(&self) -> Duration {
        Duration::from_secs(self.consistency_initial_delay_secs)
    }

    /// Rate limiter sweep interval
    pub fn rate_limit_prune_interval(&self) -> Duration {
        Duration::from_secs(self.rate_limit_prune_interval_secs)
    }
}

/// `[watcher]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherSection {
    /// Milliseconds between directory polls
    pub poll_interval_ms: u64,
}

impl Default for WatcherSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
        }
    }
}

impl WatcherSection {
    /// Poll interval
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl VaultGuardConfig {
    /// Parse a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Configuration(e.to_string()))
    }

    /// Read and parse a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    /// Load from `VAULT_GUARD_CONFIG`, then `./vault-guard.toml`, then defaults
    ///
    /// An unreadable or invalid file named by the environment variable is
    /// logged and skipped.
    pub fn load() -> Self {
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            match Self::from_file(&path) {
                Ok(config) => {
                    tracing::info!(path = %path, "Loaded configuration from file");
                    return config;
                }
                Err(e) => {
                    tracing::warn!(path = %path, error = %e, "Failed to load config file, using defaults");
                }
            }
        }

        if Path::new(DEFAULT_CONFIG_FILE).exists() {
            match Self::from_file(DEFAULT_CONFIG_FILE) {
                Ok(config) => {
                    tracing::info!("Loaded configuration from {}", DEFAULT_CONFIG_FILE);
                    return config;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to parse {}, using defaults", DEFAULT_CONFIG_FILE);
                }
            }
        }

        tracing::info!("Using default configuration");
        Self::default()
    }

    /// Reject values that would disable a safeguard
    pub fn validate(&self) -> Result<()> {
        let checks: [(&str, bool); 11] = [
            ("watcher.poll_interval_ms", self.watcher.poll_interval_ms > 0),
            ("breaker.failure_threshold", self.breaker.failure_threshold > 0),
            ("breaker.success_threshold", self.breaker.success_threshold > 0),
            ("rate_limit.max_failures", self.rate_limit.max_failures > 0),
            ("rate_limit.window_secs", self.rate_limit.window_secs > 0),
            ("gate.capacity", self.gate.capacity > 0),
            ("health.probe_timeout_secs", self.health.probe_timeout_secs > 0),
            ("reconciler.sample_size", self.reconciler.sample_size > 0),
            (
                "supervisor.watcher_check_interval_secs",
                self.supervisor.watcher_check_interval_secs > 0,
            ),
            (
                "supervisor.consistency_interval_secs",
                self.supervisor.consistency_interval_secs > 0,
            ),
            (
                "supervisor.rate_limit_prune_interval_secs",
                self.supervisor.rate_limit_prune_interval_secs > 0,
            ),
        ];

        for (field, ok) in checks {
            if !ok {
                return Err(Error::Configuration(format!("{} must be greater than zero", field)));
            }
        }

        if self.server.listen_addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(Error::Configuration(format!(
                "server.listen_addr '{}' is not a socket address",
                self.server.listen_addr
            )));
        }

        Ok(())
    }
}
