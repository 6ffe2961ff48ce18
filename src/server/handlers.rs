//! HTTP Handlers
//!
//! Health, metrics, collection listing and object download endpoints.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderName, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;

use super::{AppState, ClientIdentity};
use crate::auth::COLLECTION_KEY_HEADER;
use crate::error::{Error, Result, StorageError};
use crate::services::{ComponentHealth, ComponentStatus, SystemHealth};
use crate::storage::{ObjectReader, ObjectRecord, ObjectStore};

/// Response header carrying a downloaded object's SHA-256
pub const OBJECT_HASH_HEADER: HeaderName = HeaderName::from_static("x-object-hash-sha256");

/// Largest chunk read from the object store per body frame
const DOWNLOAD_CHUNK_BYTES: usize = 64 * 1024;

// =============================================================================
// Response Types
// =============================================================================

/// Liveness response
#[derive(Debug, Serialize)]
pub struct LivenessResponse {
    pub status: &'static str,
}

/// Readiness response
#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
    pub checks: BTreeMap<String, ComponentHealth>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub critical_failures: Vec<String>,
}

/// `/health/status` query parameters
#[derive(Debug, Default, Deserialize)]
pub struct StatusParams {
    /// Run a fresh reconciliation instead of using the cached report
    #[serde(default, alias = "include_consistency")]
    pub consistency: bool,
}

/// Object names in a collection
#[derive(Debug, Serialize, Deserialize)]
pub struct ObjectListResponse {
    pub collection: String,
    pub objects: Vec<String>,
}

/// Name and hash of one object
#[derive(Debug, Serialize, Deserialize)]
pub struct ObjectHash {
    pub name: String,
    pub hash_sha256: String,
}

/// Hashes of every object in a collection
#[derive(Debug, Serialize, Deserialize)]
pub struct HashListResponse {
    pub collection: String,
    pub items: Vec<ObjectHash>,
}

/// Hash of one object
#[derive(Debug, Serialize, Deserialize)]
pub struct SingleHashResponse {
    pub collection: String,
    pub name: String,
    pub hash_sha256: String,
}

// =============================================================================
// Health & Metrics Handlers
// =============================================================================

/// Constant-time liveness probe
pub async fn liveness() -> Json<LivenessResponse> {
    Json(LivenessResponse { status: "ok" })
}

/// Readiness probe over the critical components
pub async fn readiness(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health.readiness().await;
    let ready = health.status == ComponentStatus::Up;

    let body = ReadinessResponse {
        status: if ready { "ready" } else { "not_ready" },
        timestamp: health.timestamp,
        checks: health.components,
        critical_failures: health.critical_failures,
    };

    if ready {
        (StatusCode::OK, Json(body))
    } else {
        tracing::warn!(failures = ?body.critical_failures, "Readiness check failed");
        (StatusCode::SERVICE_UNAVAILABLE, Json(body))
    }
}

/// Full component status
pub async fn status(
    State(state): State<Arc<AppState>>,
    Query(params): Query<StatusParams>,
) -> (StatusCode, Json<SystemHealth>) {
    let health = state.health.check(params.consistency).await;
    let code = if health.status == ComponentStatus::Down {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (code, Json(health))
}

/// Prometheus metrics endpoint
pub async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let (body, content_type) = state.exporter.export_http();
    (StatusCode::OK, [(header::CONTENT_TYPE, content_type)], body)
}

/// JSON metrics endpoint
pub async fn metrics_json(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(state.exporter.export_json())
}

// =============================================================================
// Collection Handlers
// =============================================================================

/// Authenticate the request for `collection`
async fn authorize(state: &AppState, identity: &ClientIdentity, collection: &str, headers: &HeaderMap) -> Result<()> {
    let key = headers
        .get(COLLECTION_KEY_HEADER)
        .and_then(|v| v.to_str().ok());
    state.auth.authenticate(&identity.0, collection, key).await
}

/// List object names in a collection
pub async fn list_objects(
    State(state): State<Arc<AppState>>,
    identity: ClientIdentity,
    Path(collection): Path<String>,
    headers: HeaderMap,
) -> Result<Json<ObjectListResponse>> {
    authorize(&state, &identity, &collection, &headers).await?;

    let records = state.db.list_ready_objects(&collection).await?;
    Ok(Json(ObjectListResponse {
        collection,
        objects: records.into_iter().map(|r| r.name).collect(),
    }))
}

/// List object hashes in a collection
pub async fn list_hashes(
    State(state): State<Arc<AppState>>,
    identity: ClientIdentity,
    Path(collection): Path<String>,
    headers: HeaderMap,
) -> Result<Json<HashListResponse>> {
    authorize(&state, &identity, &collection, &headers).await?;

    let records = state.db.list_ready_objects(&collection).await?;
    Ok(Json(HashListResponse {
        collection,
        items: records
            .into_iter()
            .map(|r| ObjectHash {
                name: r.name,
                hash_sha256: r.sha256,
            })
            .collect(),
    }))
}

/// Ready record for `collection/name`, or `NotFound`
async fn ready_object(state: &AppState, collection: &str, name: &str) -> Result<ObjectRecord> {
    state
        .db
        .list_ready_objects(collection)
        .await?
        .into_iter()
        .find(|r| r.name == name)
        .ok_or_else(|| Error::Storage(StorageError::NotFound(format!("Object '{}'", name))))
}

/// Hash of a single object
pub async fn get_hash(
    State(state): State<Arc<AppState>>,
    identity: ClientIdentity,
    Path((collection, name)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<SingleHashResponse>> {
    authorize(&state, &identity, &collection, &headers).await?;

    let record = ready_object(&state, &collection, &name).await?;
    Ok(Json(SingleHashResponse {
        collection,
        name: record.name,
        hash_sha256: record.sha256,
    }))
}

/// Stream an object's bytes from the object store
///
/// The read goes through the `get` breaker, so an object store outage
/// answers 503 with `Retry-After` once the breaker opens.
pub async fn download_object(
    State(state): State<Arc<AppState>>,
    identity: ClientIdentity,
    Path((collection, name)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response> {
    authorize(&state, &identity, &collection, &headers).await?;

    let record = ready_object(&state, &collection, &name).await?;
    let reader = state.store.get(&record.object_key).await?;
    tracing::debug!(object_key = %record.object_key, size_bytes = record.size_bytes, "Streaming object");

    let headers = [
        (header::CONTENT_TYPE, "application/octet-stream".to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", record.name.replace('"', "\\\"")),
        ),
        (header::CONTENT_LENGTH, record.size_bytes.to_string()),
        (OBJECT_HASH_HEADER, record.sha256),
    ];
    Ok((headers, Body::from_stream(object_chunks(reader))).into_response())
}

/// Read `reader` to the end in bounded chunks
fn object_chunks(reader: ObjectReader) -> impl Stream<Item = std::io::Result<Bytes>> + Send + 'static {
    futures::stream::try_unfold(reader, |mut reader| async move {
        let mut chunk = BytesMut::with_capacity(DOWNLOAD_CHUNK_BYTES);
        let read = reader.read_buf(&mut chunk).await?;
        Ok::<_, std::io::Error>((read > 0).then(|| (chunk.freeze(), reader)))
    })
}
