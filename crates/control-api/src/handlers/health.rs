//! Health handlers.

use axum::extract::State;
use axum::Json;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;

use crate::state::AppState;

/// Health check response.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    /// Service status: healthy or degraded.
    pub status: String,
    /// Service version.
    pub version: String,
    /// Current timestamp.
    pub timestamp: DateTime<Utc>,
    /// Pool service base URL.
    pub pool_url: String,
    /// Most recent successful pool call, any account.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool_last_success_at: Option<DateTime<Utc>>,
    /// Source accounts with a running copy trader.
    pub active_sources: Vec<String>,
}

/// Liveness plus pool reachability.
#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses(
        (status = 200, description = "Router status", body = HealthResponse)
    )
)]
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let last_success = state.breakers.last_success_at();
    let status = match last_success {
        Some(at) if Utc::now() - at < Duration::seconds(60) => "healthy",
        _ => "degraded",
    };

    let mut active_sources: Vec<String> = state.traders.keys().cloned().collect();
    active_sources.sort();

    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now(),
        pool_url: state.pool_base_url.clone(),
        pool_last_success_at: last_success,
        active_sources,
    })
}
