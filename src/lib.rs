//! # Vault Guard
//!
//! Self-healing reliability layer for an object-storage vault. A folder
//! watcher ingests files into an object store and a database; this crate
//! keeps the three views consistent and the system available:
//!
//! - **Circuit breakers** around every object store operation family
//! - **Sliding-window rate limiting** of authentication failures
//! - **Admission control** with per-path debouncing for ingestion
//! - **Health aggregation** over database, object store, filesystem,
//!   watcher and data consistency
//! - **Consistency reconciliation** between filesystem, database and
//!   object store, run on demand and on a schedule
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use vault_guard::{app::VaultGuard, config::VaultGuardConfig};
//! use vault_guard::storage::{MemoryDatabase, MemoryObjectStore};
//!
//! let guard = VaultGuard::build(
//!     VaultGuardConfig::load(),
//!     Arc::new(MemoryDatabase::new()),
//!     Arc::new(MemoryObjectStore::new()),
//! )
//! .await?;
//! guard.start()?;
//!
//! let app = guard.router();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

#[allow(missing_docs)]
pub mod app;
pub mod auth;
pub mod config;
pub mod error;
pub mod ingest;
pub mod observability;
pub mod resilience;
#[allow(missing_docs)]
pub mod server;
pub mod services;
pub mod storage;
pub mod watcher;

pub use error::{Error, Result};
