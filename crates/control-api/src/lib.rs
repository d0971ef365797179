//! Control API
//!
//! Small HTTP/JSON surface over the running router: health, stats, mapping
//! introspection, breaker state, and operator overrides. It does not place
//! trades.

pub mod error;
pub mod handlers;
pub mod routes;
pub mod state;

use std::future::Future;
use std::sync::Arc;

use tracing::info;

pub use error::{ApiError, ApiResult};
pub use state::AppState;

/// Bind and serve the control API until `shutdown` resolves.
pub async fn serve(
    port: u16,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "control API listening");
    axum::serve(listener, routes::build_router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
