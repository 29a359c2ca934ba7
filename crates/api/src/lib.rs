//! Read API over the version-log store.
//!
//! Strictly read-only: four GET endpoints backed by [`HistoryStore`], plus
//! the YAML rendering boundary in [`render`]. The pipeline's in-memory state
//! is never touched from here.

#![forbid(unsafe_code)]

pub mod render;

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use genlog_core::{generation, version_timestamp, ResourceIdentity};
use genlog_store::HistoryStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

#[derive(Clone)]
pub struct ApiState {
    store: Arc<dyn HistoryStore>,
}

/// Build the read-only router. Callers layer tracing/CORS on top.
pub fn router(store: Arc<dyn HistoryStore>) -> Router {
    Router::new()
        .route("/api/history", get(get_history).fallback(method_not_allowed))
        .route("/api/generation", get(get_generation).fallback(method_not_allowed))
        .route("/api/resources", get(get_resources).fallback(method_not_allowed))
        .route("/health", get(get_health).fallback(method_not_allowed))
        .with_state(ApiState { store })
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("Method not allowed")]
    MethodNotAllowed,
    #[error("{0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody { success: false, error: self.to_string() };
        (status, Json(body)).into_response()
    }
}

impl From<genlog_store::StoreError> for ApiError {
    fn from(e: genlog_store::StoreError) -> Self {
        warn!(error = %e, "store read failed while serving request");
        ApiError::Internal(format!("store read failed: {e}"))
    }
}

async fn method_not_allowed() -> ApiError {
    ApiError::MethodNotAllowed
}

#[derive(Debug, Default, Deserialize)]
struct IdentityQuery {
    kind: Option<String>,
    name: Option<String>,
    namespace: Option<String>,
    generation: Option<String>,
}

impl IdentityQuery {
    fn identity(&self) -> Result<ResourceIdentity, ApiError> {
        let missing = |p: &str| {
            ApiError::BadRequest(format!("Missing '{p}' query parameter"))
        };
        let kind = self.kind.as_deref().filter(|s| !s.is_empty()).ok_or_else(|| missing("kind"))?;
        let name = self.name.as_deref().filter(|s| !s.is_empty()).ok_or_else(|| missing("name"))?;
        let namespace = self.namespace.as_deref().ok_or_else(|| missing("namespace"))?;
        Ok(ResourceIdentity::new(kind, name, namespace))
    }
}

/// One row of `/api/history`.
#[derive(Debug, Serialize)]
struct HistoryEntry {
    generation: i64,
    timestamp: String,
}

async fn get_history(
    State(state): State<ApiState>,
    Query(params): Query<IdentityQuery>,
) -> Result<Json<Vec<HistoryEntry>>, ApiError> {
    let identity = params.identity()?;
    let log = state.store.list(&identity).await?;
    if log.is_empty() {
        return Err(ApiError::NotFound(format!("No history for resource '{identity}'")));
    }
    let entries = log
        .iter()
        .map(|doc| HistoryEntry { generation: generation(doc), timestamp: version_timestamp(doc) })
        .collect();
    Ok(Json(entries))
}

async fn get_generation(
    State(state): State<ApiState>,
    Query(params): Query<IdentityQuery>,
) -> Result<Response, ApiError> {
    let identity = params.identity()?;
    let wanted: i64 = params
        .generation
        .as_deref()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::BadRequest("Missing 'generation' query parameter".to_string()))?
        .parse()
        .map_err(|_| {
            ApiError::BadRequest("Invalid generation number. Must be an integer.".to_string())
        })?;

    let log = state.store.list(&identity).await?;
    let snapshot = log.iter().find(|doc| generation(doc) == wanted).ok_or_else(|| {
        ApiError::NotFound(format!("No snapshot of '{identity}' at generation {wanted}"))
    })?;

    let yaml = render::render_snapshot(snapshot)
        .map_err(|e| ApiError::Internal(format!("rendering snapshot: {e}")))?;
    Ok(([(header::CONTENT_TYPE, "application/yaml")], yaml).into_response())
}

/// One row of `/api/resources`.
#[derive(Debug, Serialize)]
struct ResourceRow {
    kind: String,
    name: String,
    namespace: String,
}

async fn get_resources(State(state): State<ApiState>) -> Result<Json<Vec<ResourceRow>>, ApiError> {
    let identities = state.store.identities().await?;
    let rows = identities
        .into_iter()
        .map(|id| ResourceRow { kind: id.kind, name: id.name, namespace: id.namespace })
        .collect();
    Ok(Json(rows))
}

#[derive(Debug, Serialize)]
struct HealthBody {
    success: bool,
    message: &'static str,
}

async fn get_health() -> Json<HealthBody> {
    Json(HealthBody { success: true, message: "Server is healthy" })
}
