//! Route definitions and OpenAPI documentation.

use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::handlers::{breaker, health, mappings, stats};
use crate::state::AppState;

/// OpenAPI documentation.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Copy Router Control API",
        version = "1.0.0",
        description = "Health, stats, mapping introspection, and operator overrides for the copy-trading router"
    ),
    paths(
        health::health_check,
        stats::get_stats,
        breaker::get_breaker,
        mappings::list_mappings,
        mappings::resync_mapping,
        mappings::delete_mapping,
        mappings::pool_resync,
    ),
    components(schemas(
        health::HealthResponse,
        breaker::BreakerStatus,
        mappings::CommandAccepted,
        crate::error::ErrorResponse,
    ))
)]
pub struct ApiDoc;

/// Build the control router. The surface is internal and read-mostly; it
/// sits behind operator-level network auth.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .route("/health", get(health::health_check))
        .route("/stats", get(stats::get_stats))
        .route("/breaker", get(breaker::get_breaker))
        .route("/mappings", get(mappings::list_mappings))
        .route(
            "/mappings/{source_id}/{position_id}/resync",
            post(mappings::resync_mapping),
        )
        .route(
            "/mappings/{source_id}/{position_id}",
            post(mappings::delete_mapping),
        )
        .route("/internal/pool-resync", post(mappings::pool_resync))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
