//! Mapping introspection and operator overrides.
//!
//! Mutations never touch the store directly; they are routed through the
//! owning trader's event channel so the single-writer discipline holds.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use copy_engine::trader::TraderEvent;
use router_core::types::PositionMapping;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct MappingsQuery {
    pub source: Option<String>,
}

/// Acknowledgement for accepted operator commands.
#[derive(Debug, Serialize, ToSchema)]
pub struct CommandAccepted {
    pub status: String,
}

/// Active mappings for a source account.
#[utoipa::path(
    get,
    path = "/mappings",
    tag = "mappings",
    params(("source" = String, Query, description = "Source account id")),
    responses(
        (status = 200, description = "Active mappings"),
        (status = 400, description = "Missing source parameter")
    )
)]
pub async fn list_mappings(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MappingsQuery>,
) -> ApiResult<Json<Vec<PositionMapping>>> {
    let source = query
        .source
        .ok_or_else(|| ApiError::BadRequest("source query parameter is required".into()))?;
    let mappings = state.store.get_account_mappings(&source).await?;
    Ok(Json(mappings))
}

/// Force an exit-copy attempt for one mapping.
#[utoipa::path(
    post,
    path = "/mappings/{source_id}/{position_id}/resync",
    tag = "mappings",
    params(
        ("source_id" = String, Path, description = "Source account id"),
        ("position_id" = String, Path, description = "Source position id")
    ),
    responses(
        (status = 202, description = "Exit copy scheduled", body = CommandAccepted),
        (status = 404, description = "Unknown source account"),
        (status = 503, description = "Trader queue full")
    )
)]
pub async fn resync_mapping(
    State(state): State<Arc<AppState>>,
    Path((source_id, position_id)): Path<(String, String)>,
) -> ApiResult<(StatusCode, Json<CommandAccepted>)> {
    dispatch(
        &state,
        &source_id,
        TraderEvent::ForceExit {
            source_position_id: position_id,
        },
    )
    .map(|_| {
        (
            StatusCode::ACCEPTED,
            Json(CommandAccepted {
                status: "exit copy scheduled".to_string(),
            }),
        )
    })
}

/// Operator override: delete a mapping without closing anything.
#[utoipa::path(
    post,
    path = "/mappings/{source_id}/{position_id}",
    tag = "mappings",
    params(
        ("source_id" = String, Path, description = "Source account id"),
        ("position_id" = String, Path, description = "Source position id")
    ),
    responses(
        (status = 202, description = "Mapping delete scheduled", body = CommandAccepted),
        (status = 404, description = "Unknown source account"),
        (status = 503, description = "Trader queue full")
    )
)]
pub async fn delete_mapping(
    State(state): State<Arc<AppState>>,
    Path((source_id, position_id)): Path<(String, String)>,
) -> ApiResult<(StatusCode, Json<CommandAccepted>)> {
    dispatch(
        &state,
        &source_id,
        TraderEvent::DeleteMapping {
            source_position_id: position_id,
        },
    )
    .map(|_| {
        (
            StatusCode::ACCEPTED,
            Json(CommandAccepted {
                status: "mapping delete scheduled".to_string(),
            }),
        )
    })
}

/// Pool reconnection callback: refresh every source snapshot now.
#[utoipa::path(
    post,
    path = "/internal/pool-resync",
    tag = "internal",
    responses(
        (status = 202, description = "Resync fanned out to all traders", body = CommandAccepted)
    )
)]
pub async fn pool_resync(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<CommandAccepted>) {
    let mut delivered = 0usize;
    for handle in state.traders.values() {
        if handle.send(TraderEvent::Resync) {
            delivered += 1;
        }
    }
    tracing::info!(delivered, total = state.traders.len(), "pool resync fanned out");
    (
        StatusCode::ACCEPTED,
        Json(CommandAccepted {
            status: format!("resync delivered to {delivered} traders"),
        }),
    )
}

fn dispatch(state: &AppState, source_id: &str, event: TraderEvent) -> ApiResult<()> {
    let handle = state
        .traders
        .get(source_id)
        .ok_or_else(|| ApiError::NotFound(format!("no trader for source account {source_id}")))?;
    if !handle.send(event) {
        return Err(ApiError::ServiceUnavailable(
            "trader event queue is full".into(),
        ));
    }
    Ok(())
}
