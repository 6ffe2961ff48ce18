//! Collection key authentication
//!
//! Every attempt passes through the [`RateLimiter`] first. A blocked
//! (identity, collection) pair is rejected before the key is looked at, so
//! a brute-force client cannot keep probing keys during its block.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::observability::MetricsRegistry;
use crate::resilience::RateLimiter;
use crate::storage::Database;

/// Header carrying the per-collection API key
pub const COLLECTION_KEY_HEADER: &str = "x-collection-key";

/// Message returned for a missing or wrong key
pub const UNAUTHORIZED_MESSAGE: &str = "Invalid or missing X-Collection-Key header.";

/// Rate-limited API key verification
pub struct AuthGuard {
    db: Arc<dyn Database>,
    limiter: Arc<RateLimiter>,
    metrics: Arc<MetricsRegistry>,
}

impl AuthGuard {
    /// Create a guard verifying keys against `db`
    pub fn new(db: Arc<dyn Database>, limiter: Arc<RateLimiter>, metrics: Arc<MetricsRegistry>) -> Self {
        Self { db, limiter, metrics }
    }

    /// Rate limiter shared with the guard
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Authenticate `identity` for `collection`
    ///
    /// Returns [`Error::RateLimited`] while blocked, [`Error::Unauthorized`]
    /// for a missing or wrong key. A database failure is propagated and not
    /// counted against the client.
    pub async fn authenticate(&self, identity: &str, collection: &str, api_key: Option<&str>) -> Result<()> {
        self.limiter.check(identity, collection)?;

        let valid = match api_key.filter(|k| !k.is_empty()) {
            Some(key) => self.db.verify_api_key(collection, key).await?,
            None => false,
        };

        if valid {
            self.limiter.record_success(identity, collection);
            return Ok(());
        }

        self.metrics.api_auth_failures.inc();
        if let Some(block) = self.limiter.record_failure(identity, collection) {
            tracing::warn!(
                identity,
                collection,
                block_secs = block.as_secs(),
                "Client blocked after repeated authentication failures"
            );
        } else {
            tracing::debug!(identity, collection, "Authentication failed");
        }
        Err(Error::Unauthorized(UNAUTHORIZED_MESSAGE.to_string()))
    }
}
