//! Per-source replication counters.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::State;
use axum::Json;

use copy_engine::trader::TraderStatsSnapshot;

use crate::state::AppState;

/// Per-source counters: opens, closes, skips, retries.
#[utoipa::path(
    get,
    path = "/stats",
    tag = "stats",
    responses(
        (status = 200, description = "Replication counters keyed by source account")
    )
)]
pub async fn get_stats(
    State(state): State<Arc<AppState>>,
) -> Json<BTreeMap<String, TraderStatsSnapshot>> {
    let stats = state
        .traders
        .iter()
        .map(|(source, handle)| (source.clone(), handle.stats()))
        .collect();
    Json(stats)
}
