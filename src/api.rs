//! HTTP query surface
//!
//! Read-only JSON endpoints over the live cache and, when persistence is
//! enabled, the history table:
//!
//! - `GET /api/values` - all cached samples
//! - `GET /api/value/{name}` - one cached sample
//! - `GET /api/status` - session and cache health
//! - `GET /api/history/{name}?hours=24&limit=1000` - recent stored rows
//!
//! The API never writes: field values, the mapping table and the history
//! rows are all owned by other parts of the service.

use crate::cache::{Sample, ValueCache};
use crate::config::HttpConfig;
use crate::error::GatewayError;
use crate::protocol::FieldClient;
use crate::registry::TagRegistry;
use crate::storage::{ColumnMapping, Storage};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Shared state for all routes
#[derive(Clone)]
pub struct ApiState {
    pub cache: Arc<ValueCache>,
    pub registry: Arc<TagRegistry>,
    pub field: Arc<dyn FieldClient>,
    pub storage: Option<Arc<dyn Storage>>,
    pub mapping: Arc<ColumnMapping>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = Json(ErrorResponse {
            error: self.to_string(),
        });
        (status, body).into_response()
    }
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    field_connected: bool,
    storage_connected: bool,
    monitored_tags: usize,
    cached_values: usize,
    server_time: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    #[serde(default = "default_hours")]
    hours: i64,
    #[serde(default = "default_limit")]
    limit: i64,
}

fn default_hours() -> i64 {
    24
}

fn default_limit() -> i64 {
    1000
}

#[derive(Debug, Serialize)]
struct HistoryPoint {
    value: f64,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct HistoryResponse {
    tag: String,
    unit: String,
    hours: i64,
    points: Vec<HistoryPoint>,
}

/// Build the router with all query routes and middleware
pub fn build_router(state: ApiState, http: &HttpConfig) -> Router {
    let mut router = Router::new()
        .route("/api/values", get(get_values))
        .route("/api/value/{name}", get(get_value))
        .route("/api/status", get(get_status))
        .route("/api/history/{name}", get(get_history))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    if http.cors_enabled {
        router = router.layer(CorsLayer::permissive());
    }
    router
}

async fn get_values(State(state): State<ApiState>) -> Json<HashMap<String, Sample>> {
    Json(state.cache.snapshot())
}

async fn get_value(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Result<Json<Sample>, GatewayError> {
    state
        .cache
        .get(&name)
        .map(Json)
        .ok_or(GatewayError::NotFound {
            resource: format!("Value not found: {}", name),
        })
}

async fn get_status(State(state): State<ApiState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        field_connected: state.field.is_connected(),
        storage_connected: state
            .storage
            .as_ref()
            .map(|s| s.is_connected())
            .unwrap_or(false),
        monitored_tags: state.registry.len(),
        cached_values: state.cache.len(),
        server_time: Utc::now(),
    })
}

async fn get_history(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<HistoryResponse>, GatewayError> {
    let storage = state
        .storage
        .as_ref()
        .filter(|s| s.is_connected())
        .ok_or_else(|| GatewayError::Unavailable("Database not available".to_string()))?;

    // Unmapped names have no storage column, so there is nothing to query
    let Some(column) = state.mapping.column_for(&name) else {
        return Err(GatewayError::NotFound {
            resource: format!("No history found or tag does not exist: {}", name),
        });
    };

    let hours = params.hours.clamp(1, 24 * 365);
    let limit = params.limit.clamp(1, 100_000);
    let rows = storage.query_history(&column, hours, limit).await?;

    if rows.is_empty() {
        return Err(GatewayError::NotFound {
            resource: format!("No history found or tag does not exist: {}", name),
        });
    }

    let unit = state
        .cache
        .get(&name)
        .map(|s| s.unit)
        .or_else(|| state.registry.lookup(&name).map(|t| t.unit.clone()))
        .unwrap_or_default();

    Ok(Json(HistoryResponse {
        tag: name,
        unit,
        hours,
        points: rows
            .into_iter()
            .map(|r| HistoryPoint {
                value: r.value,
                timestamp: r.timestamp,
            })
            .collect(),
    }))
}
