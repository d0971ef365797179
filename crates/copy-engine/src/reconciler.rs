//! Orphan reconciler: the safety net under the copy trader.
//!
//! One task per route. It closes destination positions no mapping claims,
//! and re-drives closes whose mapping outlived its source position. It
//! never opens anything.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use router_core::error::PoolError;
use router_core::pool::PoolApi;
use router_core::routing::RoutingTable;
use router_core::store::MappingStore;
use router_core::telemetry::{Notifier, Severity};

use crate::trader::{TraderEvent, TraderHandle};

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Scan cadence.
    pub interval: Duration,
    /// Minimum age of an orphan candidate before the confirming scan may
    /// close it; tolerates races with in-flight opens.
    pub orphan_grace: chrono::Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            orphan_grace: chrono::Duration::seconds(30),
        }
    }
}

/// Reconciler for a single (source, destination) route.
pub struct OrphanReconciler {
    source_account_id: String,
    dest_account_id: String,
    routing: Arc<RwLock<RoutingTable>>,
    pool: Arc<dyn PoolApi>,
    store: Arc<MappingStore>,
    notifier: Arc<dyn Notifier>,
    trader: TraderHandle,
    config: ReconcilerConfig,
    /// Orphan candidates by destination position id, with first sighting.
    candidates: HashMap<String, DateTime<Utc>>,
}

impl OrphanReconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source_account_id: impl Into<String>,
        dest_account_id: impl Into<String>,
        routing: Arc<RwLock<RoutingTable>>,
        pool: Arc<dyn PoolApi>,
        store: Arc<MappingStore>,
        notifier: Arc<dyn Notifier>,
        trader: TraderHandle,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            source_account_id: source_account_id.into(),
            dest_account_id: dest_account_id.into(),
            routing,
            pool,
            store,
            notifier,
            trader,
            config,
            candidates: HashMap::new(),
        }
    }

    pub async fn run(mut self) {
        info!(
            source = %self.source_account_id,
            dest = %self.dest_account_id,
            "orphan reconciler started"
        );
        loop {
            tokio::time::sleep(self.config.interval).await;
            self.scan().await;
        }
    }

    /// One reconciliation cycle.
    pub async fn scan(&mut self) {
        let Some((source_region, dest_region)) = self.route_regions().await else {
            debug!(
                source = %self.source_account_id,
                dest = %self.dest_account_id,
                "route no longer configured, idle"
            );
            return;
        };

        // Live destination positions. A failed snapshot aborts the cycle:
        // nothing may be closed on missing data.
        let dest_positions = match self
            .pool
            .positions(&self.dest_account_id, &dest_region)
            .await
        {
            Ok(positions) => positions,
            Err(e) => {
                warn!(
                    dest = %self.dest_account_id,
                    error = %e,
                    "destination snapshot failed, skipping reconcile cycle"
                );
                return;
            }
        };

        let now = Utc::now();
        let hints = [self.source_account_id.clone()];
        for position in &dest_positions {
            let owned = match self
                .store
                .find_by_dest_position(&self.dest_account_id, &position.id, &hints)
                .await
            {
                Ok(owned) => owned,
                Err(e) => {
                    warn!(error = %e, "mapping store lookup failed, skipping cycle");
                    return;
                }
            };

            if owned.is_some() {
                self.candidates.remove(&position.id);
                continue;
            }

            match self.candidates.get(&position.id) {
                None => {
                    debug!(
                        dest = %self.dest_account_id,
                        position = %position.id,
                        symbol = %position.symbol,
                        "orphan candidate, awaiting confirmation"
                    );
                    self.candidates.insert(position.id.clone(), now);
                }
                Some(first_seen) if now - *first_seen >= self.config.orphan_grace => {
                    self.close_orphan(&dest_region, &position.id, &position.symbol)
                        .await;
                }
                Some(_) => {} // still within the grace window
            }
        }

        // Forget candidates the broker already closed on its own.
        let live: HashSet<&str> = dest_positions.iter().map(|p| p.id.as_str()).collect();
        self.candidates.retain(|id, _| live.contains(id.as_str()));

        self.redrive_stuck_closes(&source_region).await;
    }

    async fn close_orphan(&mut self, dest_region: &str, position_id: &str, symbol: &str) {
        info!(
            dest = %self.dest_account_id,
            position = %position_id,
            symbol = %symbol,
            "closing orphan destination position"
        );
        match self
            .pool
            .close_position(&self.dest_account_id, dest_region, position_id)
            .await
        {
            Ok(result) => {
                self.candidates.remove(position_id);
                self.notifier
                    .notify(
                        Severity::Warning,
                        "orphan position closed",
                        &format!(
                            "closed unmapped position {}#{} ({}), profit {}",
                            self.dest_account_id, position_id, symbol, result.profit
                        ),
                    )
                    .await;
            }
            Err(PoolError::UnknownPosition) => {
                self.candidates.remove(position_id);
            }
            Err(e) => {
                // Candidate kept; the next cycle tries again.
                warn!(
                    dest = %self.dest_account_id,
                    position = %position_id,
                    error = %e,
                    "orphan close failed"
                );
            }
        }
    }

    /// Hand mappings whose source position is gone back to the copy
    /// trader's close path.
    async fn redrive_stuck_closes(&mut self, source_region: &str) {
        let source_positions = match self
            .pool
            .positions(&self.source_account_id, source_region)
            .await
        {
            Ok(positions) => positions,
            Err(e) => {
                warn!(
                    source = %self.source_account_id,
                    error = %e,
                    "source snapshot failed, skipping stuck-close check"
                );
                return;
            }
        };
        let live: HashSet<&str> = source_positions.iter().map(|p| p.id.as_str()).collect();

        let mappings = match self.store.get_account_mappings(&self.source_account_id).await {
            Ok(mappings) => mappings,
            Err(e) => {
                warn!(error = %e, "mapping store scan failed");
                return;
            }
        };

        for mapping in mappings
            .iter()
            .filter(|m| m.dest_account_id == self.dest_account_id)
            .filter(|m| !live.contains(m.source_position_id.as_str()))
        {
            debug!(
                source = %self.source_account_id,
                position = %mapping.source_position_id,
                "re-driving stuck close"
            );
            self.trader.send(TraderEvent::ForceExit {
                source_position_id: mapping.source_position_id.clone(),
            });
        }
    }

    async fn route_regions(&self) -> Option<(String, String)> {
        let routing = self.routing.read().await;
        let source = routing
            .sources
            .iter()
            .find(|s| s.source_account_id == self.source_account_id)?;
        let dest = source.destination(&self.dest_account_id)?;
        Some((source.region.clone(), dest.region.clone()))
    }
}
