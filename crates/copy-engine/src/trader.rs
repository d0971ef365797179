//! Per-source-account copy trader.
//!
//! One single-writer task per source account: it observes source snapshots,
//! diffs them against its tracked lifecycle states, and drives open, close,
//! and modify replication onto every destination route. All mapping
//! mutations for a given source position happen on this loop, so no two
//! trade calls for the same source position are ever in flight at once.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use router_core::error::PoolError;
use router_core::pool::{ExecuteTradeRequest, PoolApi};
use router_core::routing::{Destination, RoutingTable, SizingRule, SourceRoute};
use router_core::store::MappingStore;
use router_core::telemetry::{Notifier, Severity};
use router_core::types::{CloseOutcome, Position, PositionMapping, RecentClose};

use crate::exit::{copy_exit, ExitOutcome};
use crate::retry::{retry, RetryPolicy};
use crate::sizing::{decide, Action, DecisionContext};

/// Tunables for one copy trader task.
#[derive(Debug, Clone)]
pub struct TraderConfig {
    /// Observation cadence. Ticks are skipped, never queued, while a
    /// previous tick is still being processed.
    pub poll_interval: Duration,
    pub open_retry: RetryPolicy,
    pub exit_retry: RetryPolicy,
    /// Bound on the control-event queue; a full queue drops events with an
    /// alert.
    pub event_queue_depth: usize,
    /// Minimum spacing of stuck-mapping alerts per mapping.
    pub stuck_alert_cooldown: chrono::Duration,
}

impl Default for TraderConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            open_retry: RetryPolicy::replication(),
            exit_retry: RetryPolicy::replication(),
            event_queue_depth: 64,
            stuck_alert_cooldown: chrono::Duration::minutes(5),
        }
    }
}

/// Lifecycle of one tracked source position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Seen in a snapshot; some destination attempts still pending.
    Opening,
    /// All destinations resolved (mapped or definitively skipped).
    Open,
    /// Disappeared from the snapshot; exit copy in flight.
    Closing,
    /// Exit copy exhausted its attempts; mapping kept for reconciliation.
    Stuck,
}

/// Control events accepted by the trader loop.
#[derive(Debug, Clone)]
pub enum TraderEvent {
    /// Fetch a snapshot now instead of waiting for the next tick.
    Resync,
    /// Drive the exit-copy protocol for one source position now.
    ForceExit { source_position_id: String },
    /// Operator override: drop mappings without touching the broker.
    DeleteMapping { source_position_id: String },
    /// Drain the in-flight event and stop.
    Shutdown,
}

/// Per-source replication counters.
#[derive(Debug, Default)]
pub struct TraderStats {
    pub opens: AtomicU64,
    pub closes: AtomicU64,
    pub skips: AtomicU64,
    pub retries: AtomicU64,
    pub modifies: AtomicU64,
    pub ticks: AtomicU64,
    pub skipped_ticks: AtomicU64,
}

/// Point-in-time view of the counters, for the control API.
#[derive(Debug, Clone, Serialize)]
pub struct TraderStatsSnapshot {
    pub opens: u64,
    pub closes: u64,
    pub skips: u64,
    pub retries: u64,
    pub modifies: u64,
    pub ticks: u64,
    pub skipped_ticks: u64,
    pub tracked_positions: u64,
    pub stuck_mappings: u64,
}

/// Cheap handle onto a running trader: counters, lifecycle introspection,
/// and the control-event channel.
#[derive(Clone)]
pub struct TraderHandle {
    source_account_id: String,
    tx: mpsc::Sender<TraderEvent>,
    stats: Arc<TraderStats>,
    states: Arc<DashMap<String, LifecycleState>>,
}

impl TraderHandle {
    pub fn source_account_id(&self) -> &str {
        &self.source_account_id
    }

    pub fn stats(&self) -> TraderStatsSnapshot {
        let stuck = self
            .states
            .iter()
            .filter(|e| *e.value() == LifecycleState::Stuck)
            .count() as u64;
        TraderStatsSnapshot {
            opens: self.stats.opens.load(Ordering::Relaxed),
            closes: self.stats.closes.load(Ordering::Relaxed),
            skips: self.stats.skips.load(Ordering::Relaxed),
            retries: self.stats.retries.load(Ordering::Relaxed),
            modifies: self.stats.modifies.load(Ordering::Relaxed),
            ticks: self.stats.ticks.load(Ordering::Relaxed),
            skipped_ticks: self.stats.skipped_ticks.load(Ordering::Relaxed),
            tracked_positions: self.states.len() as u64,
            stuck_mappings: stuck,
        }
    }

    pub fn states(&self) -> Vec<(String, LifecycleState)> {
        let mut states: Vec<_> = self
            .states
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }

    /// Enqueue a control event without blocking. Returns false when the
    /// queue is full or the trader has stopped; the caller decides whether
    /// that warrants an alert.
    pub fn send(&self, event: TraderEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    account = %self.source_account_id,
                    error = %e,
                    "trader event dropped"
                );
                false
            }
        }
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(TraderEvent::Shutdown).await;
    }
}

/// Outcome of an open attempt on one destination, remembered so a skip is
/// decided once per sighting while failures keep retrying across ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DestResolution {
    Mapped,
    Skipped,
}

pub struct CopyTrader {
    source_account_id: String,
    source_region: String,
    routing: Arc<RwLock<RoutingTable>>,
    pool: Arc<dyn PoolApi>,
    store: Arc<MappingStore>,
    notifier: Arc<dyn Notifier>,
    config: TraderConfig,
    stats: Arc<TraderStats>,
    states: Arc<DashMap<String, LifecycleState>>,
    /// Per source position, per destination account: how the open resolved.
    resolutions: HashMap<String, HashMap<String, DestResolution>>,
    /// Last successful snapshot, used for modify detection only.
    last_snapshot: HashMap<String, Position>,
    stuck_alerts: HashMap<String, DateTime<Utc>>,
    rx: mpsc::Receiver<TraderEvent>,
}

impl CopyTrader {
    pub fn new(
        source_account_id: impl Into<String>,
        source_region: impl Into<String>,
        routing: Arc<RwLock<RoutingTable>>,
        pool: Arc<dyn PoolApi>,
        store: Arc<MappingStore>,
        notifier: Arc<dyn Notifier>,
        config: TraderConfig,
    ) -> (Self, TraderHandle) {
        let source_account_id = source_account_id.into();
        let (tx, rx) = mpsc::channel(config.event_queue_depth.max(1));
        let stats = Arc::new(TraderStats::default());
        let states = Arc::new(DashMap::new());

        let handle = TraderHandle {
            source_account_id: source_account_id.clone(),
            tx,
            stats: Arc::clone(&stats),
            states: Arc::clone(&states),
        };

        let trader = Self {
            source_account_id,
            source_region: source_region.into(),
            routing,
            pool,
            store,
            notifier,
            config,
            stats,
            states,
            resolutions: HashMap::new(),
            last_snapshot: HashMap::new(),
            stuck_alerts: HashMap::new(),
            rx,
        };

        (trader, handle)
    }

    /// The single-writer loop. Runs until a `Shutdown` event or the channel
    /// closes.
    pub async fn run(mut self) {
        if let Err(e) = self.rehydrate().await {
            warn!(
                account = %self.source_account_id,
                error = %e,
                "mapping rehydration failed; continuing with empty state"
            );
        }

        // Phase offset so a fleet of traders does not tick in lockstep.
        tokio::time::sleep(startup_jitter(
            &self.source_account_id,
            self.config.poll_interval,
        ))
        .await;

        let mut tick = tokio::time::interval(self.config.poll_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(account = %self.source_account_id, "copy trader started");
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.observe().await;
                }
                event = self.rx.recv() => {
                    let keep_running = match event {
                        Some(event) => self.handle_event(event).await,
                        None => false,
                    };
                    if !keep_running {
                        break;
                    }
                }
            }
        }
        info!(account = %self.source_account_id, "copy trader stopped");
    }

    /// Handle one control event. Returns false on `Shutdown`.
    async fn handle_event(&mut self, event: TraderEvent) -> bool {
        match event {
            TraderEvent::Resync => {
                debug!(account = %self.source_account_id, "resync requested");
                self.observe().await;
            }
            TraderEvent::ForceExit { source_position_id } => {
                self.replicate_close(&source_position_id).await;
            }
            TraderEvent::DeleteMapping { source_position_id } => {
                self.drop_mappings(&source_position_id).await;
            }
            TraderEvent::Shutdown => return false,
        }
        true
    }

    /// Drain queued control events without blocking. Lets callers that
    /// drive the trader manually (tests, one-shot tools) process handle
    /// traffic between polls.
    pub async fn process_pending_events(&mut self) {
        while let Ok(event) = self.rx.try_recv() {
            if !self.handle_event(event).await {
                break;
            }
        }
    }

    /// Run a single observation tick without starting the loop (useful for
    /// testing and one-shot resyncs).
    pub async fn poll_once(&mut self) {
        self.observe().await;
    }

    /// Load persisted mappings after a restart. Every mapping is trusted as
    /// OPEN until a snapshot refutes it.
    pub async fn rehydrate(&mut self) -> anyhow::Result<()> {
        let mappings = self
            .store
            .get_account_mappings(&self.source_account_id)
            .await?;
        for mapping in &mappings {
            self.states
                .insert(mapping.source_position_id.clone(), LifecycleState::Open);
            self.resolutions
                .entry(mapping.source_position_id.clone())
                .or_default()
                .insert(mapping.dest_account_id.clone(), DestResolution::Mapped);
        }
        info!(
            account = %self.source_account_id,
            mappings = mappings.len(),
            "rehydrated position mappings"
        );
        Ok(())
    }

    /// One observation tick: snapshot, diff, replicate.
    async fn observe(&mut self) {
        self.stats.ticks.fetch_add(1, Ordering::Relaxed);

        let snapshot = match self
            .pool
            .positions(&self.source_account_id, &self.source_region)
            .await
        {
            Ok(positions) => positions,
            Err(e) => {
                // A failed snapshot says nothing about the account. Skip
                // the whole tick: no opens, no closes, no deletions.
                self.stats.skipped_ticks.fetch_add(1, Ordering::Relaxed);
                warn!(
                    account = %self.source_account_id,
                    error = %e,
                    "source snapshot failed, skipping tick"
                );
                return;
            }
        };

        let Some(route) = self.current_route().await else {
            debug!(account = %self.source_account_id, "no route configured, idle");
            return;
        };

        let current: HashMap<String, Position> = snapshot
            .into_iter()
            .map(|p| (p.id.clone(), p))
            .collect();

        // Appeared or partially replicated: drive opens.
        let mut open_candidates: Vec<&Position> = current
            .values()
            .filter(|p| {
                match self.states.get(&p.id).map(|s| *s.value()) {
                    None => true,
                    Some(LifecycleState::Opening) => true,
                    Some(_) => false,
                }
            })
            .collect();
        open_candidates.sort_by(|a, b| a.id.cmp(&b.id));
        let open_candidates: Vec<Position> = open_candidates.into_iter().cloned().collect();
        for position in &open_candidates {
            self.replicate_open(position, &route).await;
        }

        // Changed stops: mirror them.
        let modified: Vec<Position> = current
            .values()
            .filter(|p| {
                self.last_snapshot.get(&p.id).is_some_and(|prev| {
                    prev.stop_loss != p.stop_loss || prev.take_profit != p.take_profit
                })
            })
            .cloned()
            .collect();
        for position in &modified {
            self.replicate_modify(position).await;
        }

        // Disappeared: every tracked position the snapshot no longer shows.
        let mut gone: Vec<String> = self
            .states
            .iter()
            .filter(|e| {
                !current.contains_key(e.key())
                    && matches!(
                        e.value(),
                        LifecycleState::Open | LifecycleState::Opening | LifecycleState::Stuck
                    )
            })
            .map(|e| e.key().clone())
            .collect();
        gone.sort();
        for source_position_id in &gone {
            self.replicate_close(source_position_id).await;
        }

        self.last_snapshot = current;
    }

    async fn current_route(&self) -> Option<SourceRoute> {
        self.routing
            .read()
            .await
            .sources
            .iter()
            .find(|s| s.source_account_id == self.source_account_id)
            .cloned()
    }

    /// Open replication for one source position across all destinations.
    /// Destinations resolve independently: a skip is final for this
    /// sighting, a failure is retried on the next tick.
    async fn replicate_open(&mut self, position: &Position, route: &SourceRoute) {
        if !self.states.contains_key(&position.id) {
            // First sighting: a close may have raced the open observation.
            match self
                .store
                .was_recently_closed(&self.source_account_id, &position.id)
                .await
            {
                Ok(true) => {
                    debug!(
                        account = %self.source_account_id,
                        position = %position.id,
                        "recently closed, not re-opening"
                    );
                    self.stats.skips.fetch_add(1, Ordering::Relaxed);
                    self.states.insert(position.id.clone(), LifecycleState::Open);
                    return;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        account = %self.source_account_id,
                        position = %position.id,
                        error = %e,
                        "recent-close lookup failed, deferring open"
                    );
                    return;
                }
            }
            self.states
                .insert(position.id.clone(), LifecycleState::Opening);
        }

        let mut pending = false;
        for dest in &route.destinations {
            let resolved = self
                .resolutions
                .get(&position.id)
                .and_then(|r| r.get(&dest.dest_account_id))
                .copied();
            if resolved.is_some() {
                continue;
            }

            match self.open_on_destination(position, dest).await {
                Ok(resolution) => {
                    self.resolutions
                        .entry(position.id.clone())
                        .or_default()
                        .insert(dest.dest_account_id.clone(), resolution);
                }
                Err(e) => {
                    warn!(
                        account = %self.source_account_id,
                        position = %position.id,
                        dest = %dest.dest_account_id,
                        error = %e,
                        "open replication failed, will re-consider next tick"
                    );
                    pending = true;
                }
            }
        }

        let state = if pending {
            LifecycleState::Opening
        } else {
            LifecycleState::Open
        };
        self.states.insert(position.id.clone(), state);
    }

    /// Attempt one destination open: idempotency check, decision, execute
    /// with retries, record the mapping.
    async fn open_on_destination(
        &self,
        position: &Position,
        dest: &Destination,
    ) -> anyhow::Result<DestResolution> {
        if self
            .store
            .get_mapping(&self.source_account_id, &position.id, &dest.dest_account_id)
            .await?
            .is_some()
        {
            debug!(
                account = %self.source_account_id,
                position = %position.id,
                dest = %dest.dest_account_id,
                "already mapped, skipping open"
            );
            return Ok(DestResolution::Mapped);
        }

        let ctx = self.decision_context(position, dest).await?;
        let order = match decide(position, dest, &ctx) {
            Action::Skip(reason) => {
                info!(
                    account = %self.source_account_id,
                    position = %position.id,
                    dest = %dest.dest_account_id,
                    symbol = %position.symbol,
                    reason = %reason,
                    "not copying trade"
                );
                self.stats.skips.fetch_add(1, Ordering::Relaxed);
                return Ok(DestResolution::Skipped);
            }
            Action::Open(order) => order,
            Action::Close => return Ok(DestResolution::Skipped),
        };

        let request = ExecuteTradeRequest {
            account_id: dest.dest_account_id.clone(),
            region: dest.region.clone(),
            symbol: order.symbol.clone(),
            action: order.side,
            volume: order.volume,
            stop_loss: order.stop_loss,
            take_profit: order.take_profit,
            comment: Some(client_tag(
                &self.source_account_id,
                &position.id,
                &dest.dest_account_id,
            )),
        };

        let result = retry(&self.config.open_retry, PoolError::is_retryable, |attempt| {
            if attempt > 1 {
                self.stats.retries.fetch_add(1, Ordering::Relaxed);
            }
            self.pool.execute_trade(&request)
        })
        .await?;

        let mapping = PositionMapping {
            source_account_id: self.source_account_id.clone(),
            source_position_id: position.id.clone(),
            dest_account_id: dest.dest_account_id.clone(),
            dest_region: dest.region.clone(),
            dest_position_id: result.position_id.clone(),
            source_symbol: position.symbol.clone(),
            dest_symbol: order.symbol.clone(),
            source_volume: position.volume,
            dest_volume: order.volume,
            source_open_price: position.open_price,
            dest_open_price: result.open_price,
            open_time: position.time,
            mapped_at: Utc::now(),
        };
        if !self.store.create_mapping(&mapping).await? {
            // A mapping landed between our check and the execution: this
            // trade is a duplicate the reconciler will pick up as an orphan.
            warn!(
                account = %self.source_account_id,
                position = %position.id,
                dest = %dest.dest_account_id,
                duplicate_dest_position = %result.position_id,
                "mapping already existed after execution"
            );
            return Ok(DestResolution::Mapped);
        }

        self.stats.opens.fetch_add(1, Ordering::Relaxed);
        info!(
            account = %self.source_account_id,
            position = %position.id,
            dest = %dest.dest_account_id,
            dest_position = %result.position_id,
            symbol = %order.symbol,
            side = %order.side,
            volume = %order.volume,
            "copied open"
        );

        // Route-default stops are placed relative to the actual fill price.
        let (sl, tp) = order.pip_stops(result.open_price, dest.pip_size);
        if sl.is_some() || tp.is_some() {
            if let Err(e) = self
                .pool
                .modify_position(
                    &dest.dest_account_id,
                    &dest.region,
                    &result.position_id,
                    sl.or(order.stop_loss),
                    tp.or(order.take_profit),
                )
                .await
            {
                warn!(
                    dest = %dest.dest_account_id,
                    dest_position = %result.position_id,
                    error = %e,
                    "failed to place default stops"
                );
            }
        }

        Ok(DestResolution::Mapped)
    }

    async fn decision_context(
        &self,
        position: &Position,
        dest: &Destination,
    ) -> anyhow::Result<DecisionContext> {
        let dest_symbol = dest.mapped_symbol(&position.symbol);
        let dest_positions = self
            .pool
            .positions(&dest.dest_account_id, &dest.region)
            .await?;
        let open_on_symbol = dest_positions
            .iter()
            .filter(|p| p.symbol == dest_symbol)
            .count();

        let (source_equity, dest_equity) = if matches!(dest.sizing, SizingRule::EquityRatio) {
            let source = self
                .pool
                .account_info(&self.source_account_id, &self.source_region)
                .await?;
            let destination = self
                .pool
                .account_info(&dest.dest_account_id, &dest.region)
                .await?;
            (source.equity, destination.equity)
        } else {
            (Decimal::ONE, Decimal::ONE)
        };

        Ok(DecisionContext {
            open_on_symbol,
            source_equity,
            dest_equity,
        })
    }

    /// Close replication: drive every mapping of the source position to a
    /// definitive outcome. Unresolved mappings are kept and flagged stuck.
    async fn replicate_close(&mut self, source_position_id: &str) {
        let mappings = match self
            .store
            .get_position_mappings(&self.source_account_id, source_position_id)
            .await
        {
            Ok(mappings) => mappings,
            Err(e) => {
                warn!(
                    account = %self.source_account_id,
                    position = %source_position_id,
                    error = %e,
                    "mapping lookup failed, keeping state for next tick"
                );
                return;
            }
        };

        if mappings.is_empty() {
            // Never copied, or the close was already processed.
            self.states.remove(source_position_id);
            self.resolutions.remove(source_position_id);
            return;
        }

        self.states
            .insert(source_position_id.to_string(), LifecycleState::Closing);

        let mut unresolved = 0usize;
        let mut last_close = None;
        for mapping in &mappings {
            match copy_exit(self.pool.as_ref(), mapping, &self.config.exit_retry).await {
                ExitOutcome::Closed(result) => {
                    info!(
                        account = %self.source_account_id,
                        position = %source_position_id,
                        dest = %mapping.dest_account_id,
                        dest_position = %mapping.dest_position_id,
                        profit = %result.profit,
                        "copied close"
                    );
                    last_close = Some(result);
                    self.finish_mapping(mapping, &mut unresolved).await;
                }
                ExitOutcome::AlreadyClosed => {
                    info!(
                        account = %self.source_account_id,
                        position = %source_position_id,
                        dest = %mapping.dest_account_id,
                        dest_position = %mapping.dest_position_id,
                        "destination already closed"
                    );
                    self.finish_mapping(mapping, &mut unresolved).await;
                }
                ExitOutcome::Unresolved => {
                    unresolved += 1;
                    self.alert_stuck(mapping).await;
                }
            }
        }

        if unresolved == 0 {
            let close = RecentClose {
                source_account_id: self.source_account_id.clone(),
                source_position_id: source_position_id.to_string(),
                outcome: if last_close.is_some() {
                    CloseOutcome::Closed
                } else {
                    CloseOutcome::AlreadyClosed
                },
                profit: last_close.as_ref().map(|c| c.profit),
                order_id: last_close.map(|c| c.order_id),
                closed_at: Utc::now(),
            };
            if let Err(e) = self.store.record_close(&close).await {
                warn!(
                    account = %self.source_account_id,
                    position = %source_position_id,
                    error = %e,
                    "failed to record recent close"
                );
            }
            self.states.remove(source_position_id);
            self.resolutions.remove(source_position_id);
            self.stats.closes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.states
                .insert(source_position_id.to_string(), LifecycleState::Stuck);
        }
    }

    /// Delete one resolved mapping; a store failure leaves it for the
    /// reconciler and counts as unresolved.
    async fn finish_mapping(&self, mapping: &PositionMapping, unresolved: &mut usize) {
        if let Err(e) = self
            .store
            .delete_mapping(
                &mapping.source_account_id,
                &mapping.source_position_id,
                &mapping.dest_account_id,
            )
            .await
        {
            warn!(
                position = %mapping.source_position_id,
                dest = %mapping.dest_account_id,
                error = %e,
                "mapping delete failed"
            );
            *unresolved += 1;
        }
    }

    /// Best-effort stop mirroring. Failures are logged; the next
    /// modification or reconciliation retries implicitly.
    async fn replicate_modify(&mut self, position: &Position) {
        let mappings = match self
            .store
            .get_position_mappings(&self.source_account_id, &position.id)
            .await
        {
            Ok(mappings) => mappings,
            Err(e) => {
                warn!(
                    account = %self.source_account_id,
                    position = %position.id,
                    error = %e,
                    "mapping lookup failed for modify"
                );
                return;
            }
        };

        for mapping in &mappings {
            match self
                .pool
                .modify_position(
                    &mapping.dest_account_id,
                    &mapping.dest_region,
                    &mapping.dest_position_id,
                    position.stop_loss,
                    position.take_profit,
                )
                .await
            {
                Ok(()) => {
                    self.stats.modifies.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        position = %position.id,
                        dest_position = %mapping.dest_position_id,
                        "mirrored stop modification"
                    );
                }
                Err(e) => {
                    warn!(
                        position = %position.id,
                        dest_position = %mapping.dest_position_id,
                        error = %e,
                        "stop modification failed"
                    );
                }
            }
        }
    }

    /// Operator override: forget the mappings without touching the broker.
    async fn drop_mappings(&mut self, source_position_id: &str) {
        let mappings = match self
            .store
            .get_position_mappings(&self.source_account_id, source_position_id)
            .await
        {
            Ok(mappings) => mappings,
            Err(e) => {
                warn!(
                    position = %source_position_id,
                    error = %e,
                    "mapping lookup failed for manual delete"
                );
                return;
            }
        };

        for mapping in &mappings {
            if let Err(e) = self
                .store
                .delete_mapping(
                    &mapping.source_account_id,
                    &mapping.source_position_id,
                    &mapping.dest_account_id,
                )
                .await
            {
                warn!(
                    position = %source_position_id,
                    dest = %mapping.dest_account_id,
                    error = %e,
                    "manual mapping delete failed"
                );
            }
        }
        self.states.remove(source_position_id);
        self.resolutions.remove(source_position_id);
        info!(
            account = %self.source_account_id,
            position = %source_position_id,
            "mappings deleted by operator"
        );
    }

    async fn alert_stuck(&mut self, mapping: &PositionMapping) {
        let key = format!(
            "{}/{}",
            mapping.source_position_id, mapping.dest_account_id
        );
        let now = Utc::now();
        let due = self
            .stuck_alerts
            .get(&key)
            .map_or(true, |at| now - *at >= self.config.stuck_alert_cooldown);
        if !due {
            return;
        }
        self.stuck_alerts.insert(key, now);
        self.notifier
            .notify(
                Severity::Warning,
                "exit copy unresolved",
                &format!(
                    "could not confirm close of {}#{} (source {}#{}); mapping kept for reconciliation",
                    mapping.dest_account_id,
                    mapping.dest_position_id,
                    mapping.source_account_id,
                    mapping.source_position_id
                ),
            )
            .await;
    }
}

/// Deterministic client tag for an open, so a retried execution carries the
/// same identity and logs correlate across systems.
pub fn client_tag(
    source_account_id: &str,
    source_position_id: &str,
    dest_account_id: &str,
) -> String {
    let seed = format!("{source_account_id}:{source_position_id}:{dest_account_id}");
    let id = Uuid::new_v5(&Uuid::NAMESPACE_OID, seed.as_bytes());
    let hex = id.simple().to_string();
    format!("cp-{}", &hex[..12])
}

fn startup_jitter(account_id: &str, interval: Duration) -> Duration {
    let mut hasher = DefaultHasher::new();
    account_id.hash(&mut hasher);
    let span = interval.as_millis().max(1) as u64;
    Duration::from_millis(hasher.finish() % span)
}
