//! Shared state for control API handlers.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use copy_engine::trader::TraderHandle;
use router_core::breaker::BreakerRegistry;
use router_core::store::MappingStore;

/// Read-mostly view over the running router, shared across handlers. The
/// control API never places trades; everything mutating goes through a
/// trader's event channel.
#[derive(Clone)]
pub struct AppState {
    /// Base URL of the pool service, reported by /health.
    pub pool_base_url: String,
    /// Per-account failure counters.
    pub breakers: Arc<BreakerRegistry>,
    /// Mapping introspection.
    pub store: Arc<MappingStore>,
    /// Trader handles keyed by source account id.
    pub traders: HashMap<String, TraderHandle>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        pool_base_url: impl Into<String>,
        breakers: Arc<BreakerRegistry>,
        store: Arc<MappingStore>,
        traders: HashMap<String, TraderHandle>,
    ) -> Self {
        Self {
            pool_base_url: pool_base_url.into(),
            breakers,
            store,
            traders,
            started_at: Utc::now(),
        }
    }
}
