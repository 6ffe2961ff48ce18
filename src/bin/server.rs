//! Vault Guard HTTP Server
//!
//! Runs the folder watcher, the ingestion pipeline and the background
//! supervisor, and serves the health and collection endpoints.
//!
//! # Endpoints
//!
//! ## Health
//! - `GET /health/live` - Liveness probe
//! - `GET /health/ready` - Readiness probe (database and filesystem)
//! - `GET /health/status` - Full component status (`?consistency=true` runs a fresh check)
//! - `GET /health/metrics` - Prometheus metrics
//! - `GET /health/metrics/json` - Metrics as JSON
//!
//! ## Collections
//! - `GET /api/v1/collections/{collection}/objects`
//! - `GET /api/v1/collections/{collection}/hashes`
//! - `GET /api/v1/collections/{collection}/hashes/{name}`
//! - `GET /api/v1/collections/{collection}/objects/{name}`
//!
//! # Configuration
//!
//! The server reads configuration from:
//! 1. `VAULT_GUARD_CONFIG` environment variable (path to TOML file)
//! 2. `./vault-guard.toml` in current directory
//! 3. Default configuration
//!
//! # Example
//!
//! ```bash
//! VAULT_GUARD_CONFIG=/etc/vault-guard.toml ./vault-guard
//!
//! # Drop a file into a collection, then list it
//! mkdir -p data/collections/docs && echo hi > data/collections/docs/a.txt
//! curl -H "X-Collection-Key: $(cat data/collections/docs/.vault_key)" \
//!   http://localhost:8000/api/v1/collections/docs/objects
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::signal;
use tracing::{error, info, warn};

use vault_guard::app::VaultGuard;
use vault_guard::config::{ObjectStoreBackend, VaultGuardConfig};
use vault_guard::storage::{DirectoryObjectStore, MemoryDatabase, MemoryObjectStore, ObjectStore};

/// Graceful shutdown handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("vault_guard=info".parse()?),
        )
        .init();

    info!("Vault Guard starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = VaultGuardConfig::load();
    config.validate()?;
    info!("Watch root: {:?}", config.server.watch_root);
    info!("Listen address: {}", config.server.listen_addr);

    let store: Arc<dyn ObjectStore> = match config.object_store.backend {
        ObjectStoreBackend::Directory => {
            let store = DirectoryObjectStore::new(&config.object_store.directory, &config.server.bucket).await?;
            info!("Object store directory: {:?}", store.bucket_dir());
            Arc::new(store)
        }
        ObjectStoreBackend::Memory => {
            warn!("Using in-process object store; objects are lost on exit");
            Arc::new(MemoryObjectStore::new())
        }
    };

    warn!("Using in-process database; records and collection keys are rebuilt from the watch root on restart");
    let guard = VaultGuard::build(config.clone(), Arc::new(MemoryDatabase::new()), store).await?;
    guard.start()?;

    let app = guard.router();

    let addr: SocketAddr = config.server.listen_addr.parse()?;
    info!("Starting HTTP server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Start server with graceful shutdown
    let served = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await;

    if let Err(e) = guard.shutdown().await {
        error!(error = %e, "Background services did not stop cleanly");
    }
    served?;

    info!("Server shutdown complete");
    Ok(())
}
