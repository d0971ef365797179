//! Breaker state introspection.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;

use crate::state::AppState;

/// Failure-tracking state for one account.
#[derive(Debug, Serialize, ToSchema)]
pub struct BreakerStatus {
    pub account_id: String,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Whether the current streak has already alerted.
    pub alerted: bool,
    pub last_alert_at: Option<DateTime<Utc>>,
}

/// Per-account failure counts and alert-cooldown timers.
#[utoipa::path(
    get,
    path = "/breaker",
    tag = "breaker",
    responses(
        (status = 200, description = "Per-account breaker state", body = [BreakerStatus])
    )
)]
pub async fn get_breaker(State(state): State<Arc<AppState>>) -> Json<Vec<BreakerStatus>> {
    let statuses = state
        .breakers
        .snapshot()
        .into_iter()
        .map(|(account_id, s)| BreakerStatus {
            account_id,
            consecutive_failures: s.consecutive_failures,
            last_failure_at: s.last_failure_at,
            alerted: s.alerted,
            last_alert_at: s.last_alert_at,
        })
        .collect();
    Json(statuses)
}
