//! HTTP surface
//!
//! # Endpoints
//!
//! ## Health
//! - `GET /health/live` - Process liveness
//! - `GET /health/ready` - Critical components only (200 / 503)
//! - `GET /health/status[?consistency=true]` - Every component (503 when Down)
//! - `GET /health/metrics` - Prometheus text exposition
//! - `GET /health/metrics/json` - Same metrics as JSON
//!
//! ## Collections (require `X-Collection-Key`)
//! - `GET /api/v1/collections/{collection}/objects` - Object names
//! - `GET /api/v1/collections/{collection}/hashes` - Names with SHA-256
//! - `GET /api/v1/collections/{collection}/hashes/{name}` - One object's hash
//! - `GET /api/v1/collections/{collection}/objects/{name}` - Object bytes
//!
//! Rate limiting is keyed on the TCP peer address. `X-Forwarded-For` is only
//! read when that peer is one of `server.trusted_proxies`.

pub mod handlers;

use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, FromRequestParts},
    http::{header, request::Parts, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};

use crate::auth::AuthGuard;
use crate::error::{Error, StorageError};
use crate::observability::PrometheusExporter;
use crate::services::HealthCheckAggregator;
use crate::storage::{Database, GuardedObjectStore};

// =============================================================================
// Application State
// =============================================================================

/// Shared state for every handler
pub struct AppState {
    pub health: Arc<HealthCheckAggregator>,
    pub auth: Arc<AuthGuard>,
    pub db: Arc<dyn Database>,
    pub store: Arc<GuardedObjectStore>,
    pub exporter: Arc<PrometheusExporter>,
    /// Peers allowed to name the client in `X-Forwarded-For`
    pub trusted_proxies: Vec<IpAddr>,
}

/// Build the router with all endpoints
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health and metrics
        .route("/health/live", get(handlers::liveness))
        .route("/health/ready", get(handlers::readiness))
        .route("/health/status", get(handlers::status))
        .route("/health/metrics", get(handlers::metrics))
        .route("/health/metrics/json", get(handlers::metrics_json))
        // API v1
        .route(
            "/api/v1/collections/{collection}/objects",
            get(handlers::list_objects),
        )
        .route(
            "/api/v1/collections/{collection}/objects/{name}",
            get(handlers::download_object),
        )
        .route(
            "/api/v1/collections/{collection}/hashes",
            get(handlers::list_hashes),
        )
        .route(
            "/api/v1/collections/{collection}/hashes/{name}",
            get(handlers::get_hash),
        )
        .with_state(state)
}

// =============================================================================
// Client identity
// =============================================================================

/// Identity used for rate limiting
///
/// See [`resolve_identity`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity(pub String);

/// Derive the rate limiting identity of a request
///
/// A peer outside `trusted` is the client. Behind a trusted proxy the
/// `X-Forwarded-For` chain is walked from the right and the first hop that
/// is not itself a trusted proxy wins; entries left of it were written by
/// the client and are ignored. Without a peer address the identity is
/// `"unknown"`.
pub fn resolve_identity(peer: Option<IpAddr>, forwarded: Option<&str>, trusted: &[IpAddr]) -> String {
    let Some(peer) = peer else {
        return "unknown".to_string();
    };
    if !trusted.contains(&peer) {
        return peer.to_string();
    }

    let hops: Vec<&str> = forwarded
        .map(|value| value.split(',').map(str::trim).filter(|hop| !hop.is_empty()).collect())
        .unwrap_or_default();
    let is_trusted = |hop: &str| hop.parse::<IpAddr>().is_ok_and(|ip| trusted.contains(&ip));

    hops.iter()
        .rev()
        .find(|hop| !is_trusted(hop))
        .or_else(|| hops.first())
        .map(|hop| hop.to_string())
        .unwrap_or_else(|| peer.to_string())
}

impl FromRequestParts<Arc<AppState>> for ClientIdentity {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<AppState>) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());
        let forwarded = parts
            .headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok());

        Ok(ClientIdentity(resolve_identity(peer, forwarded, &state.trusted_proxies)))
    }
}

// =============================================================================
// Error responses
// =============================================================================

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, retry_after) = match &self {
            Error::RateLimited { retry_after_secs } => (StatusCode::TOO_MANY_REQUESTS, Some(*retry_after_secs)),
            Error::Unauthorized(_) => (StatusCode::UNAUTHORIZED, None),
            Error::CircuitOpen { retry_after, .. } => (
                StatusCode::SERVICE_UNAVAILABLE,
                Some(crate::resilience::retry_after_secs(*retry_after)),
            ),
            Error::Timeout { .. } => (StatusCode::GATEWAY_TIMEOUT, None),
            Error::Storage(StorageError::NotFound(_)) => (StatusCode::NOT_FOUND, None),
            Error::Connection(_) | Error::Storage(_) => (StatusCode::SERVICE_UNAVAILABLE, None),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, None),
        };

        let detail = match &self {
            Error::RateLimited { retry_after_secs } => format!(
                "Too many failed authentication attempts. Try again in {} seconds.",
                retry_after_secs
            ),
            Error::Unauthorized(message) => message.clone(),
            Error::Storage(StorageError::NotFound(what)) => format!("{} not found", what),
            other => {
                tracing::error!(error = %other, "Request failed");
                other.to_string()
            }
        };

        let mut response = (status, Json(serde_json::json!({ "detail": detail }))).into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(addr: &str) -> IpAddr {
        addr.parse().unwrap()
    }

    #[test]
    fn test_untrusted_peer_is_the_client() {
        let trusted = [ip("10.0.0.1")];
        assert_eq!(
            resolve_identity(Some(ip("203.0.113.7")), Some("198.51.100.1"), &trusted),
            "203.0.113.7"
        );
        assert_eq!(resolve_identity(Some(ip("203.0.113.7")), None, &[]), "203.0.113.7");
        assert_eq!(resolve_identity(None, Some("198.51.100.1"), &trusted), "unknown");
    }

    #[test]
    fn test_trusted_proxy_chain() {
        let trusted = [ip("10.0.0.1"), ip("10.0.0.2")];
        let proxy = Some(ip("10.0.0.1"));

        assert_eq!(resolve_identity(proxy, Some("198.51.100.1"), &trusted), "198.51.100.1");
        // Client-supplied entries left of the last untrusted hop are ignored
        assert_eq!(
            resolve_identity(proxy, Some("1.2.3.4, 198.51.100.1, 10.0.0.2"), &trusted),
            "198.51.100.1"
        );
        assert_eq!(resolve_identity(proxy, Some("10.0.0.2"), &trusted), "10.0.0.2");
        assert_eq!(resolve_identity(proxy, Some(" , "), &trusted), "10.0.0.1");
        assert_eq!(resolve_identity(proxy, None, &trusted), "10.0.0.1");
    }

    #[test]
    fn test_not_found_maps_to_404() {
        let response = Error::Storage(StorageError::NotFound("object docs/a.txt".to_string())).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = Error::Storage(StorageError::ObjectStore("down".to_string())).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
