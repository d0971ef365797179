//! Process supervisor: owns every long-running task of the router.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{watch, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};

use control_api::AppState;
use copy_engine::reconciler::{OrphanReconciler, ReconcilerConfig};
use copy_engine::trader::{CopyTrader, TraderConfig, TraderHandle};
use router_core::config::RouterConfig;
use router_core::pool::{PoolApi, PoolClient};
use router_core::routing::RoutingTable;
use router_core::store::MappingStore;
use router_core::telemetry::{Notifier, Severity};

/// Call `account_info` for every account the routing table references;
/// startup fails loudly when any of them is unreachable.
pub async fn validate_accounts(pool: &PoolClient, table: &RoutingTable) -> anyhow::Result<()> {
    for (account_id, region) in table.referenced_accounts() {
        match pool.account_info(&account_id, &region).await {
            Ok(info) => {
                info!(
                    account = %account_id,
                    balance = %info.balance,
                    equity = %info.equity,
                    currency = %info.currency,
                    platform = %info.platform,
                    "account validated"
                );
            }
            Err(e) => {
                anyhow::bail!("account {account_id} ({region}) unreachable via pool: {e}");
            }
        }
    }
    Ok(())
}

/// The running router: one copy trader per source account, one reconciler
/// per route, the control API, and the signal loop.
pub struct RouterService {
    config: RouterConfig,
    routing: Arc<RwLock<RoutingTable>>,
    pool: Arc<PoolClient>,
    notifier: Arc<dyn Notifier>,
    traders: HashMap<String, TraderHandle>,
    trader_tasks: JoinSet<()>,
    reconciler_tasks: Vec<JoinHandle<()>>,
    control_task: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl RouterService {
    pub async fn start(
        config: RouterConfig,
        table: RoutingTable,
        pool: Arc<PoolClient>,
        store: Arc<MappingStore>,
        notifier: Arc<dyn Notifier>,
    ) -> anyhow::Result<Self> {
        pool.set_nicknames(table.nicknames());

        // Warm the mapping cache before anything starts observing.
        let sources: Vec<String> = table
            .sources
            .iter()
            .map(|s| s.source_account_id.clone())
            .collect();
        let rehydrated = store.rehydrate(&sources).await?;
        info!(mappings = rehydrated, "mapping cache rehydrated");

        let routing = Arc::new(RwLock::new(table));
        let pool_api: Arc<dyn PoolApi> = pool.clone();

        // One single-writer copy trader per source account. Each runs in
        // its own task so a panic in one cannot take down the others.
        let mut traders = HashMap::new();
        let mut trader_tasks = JoinSet::new();
        {
            let table = routing.read().await;
            for source in &table.sources {
                let trader_config = TraderConfig {
                    poll_interval: config.poll_interval,
                    ..TraderConfig::default()
                };
                let (trader, handle) = CopyTrader::new(
                    &source.source_account_id,
                    &source.region,
                    Arc::clone(&routing),
                    Arc::clone(&pool_api),
                    Arc::clone(&store),
                    Arc::clone(&notifier),
                    trader_config,
                );
                trader_tasks.spawn(trader.run());
                traders.insert(source.source_account_id.clone(), handle);
            }
        }

        // One orphan reconciler per route.
        let reconciler_config = ReconcilerConfig {
            interval: config.reconciler_interval,
            orphan_grace: chrono::Duration::from_std(config.orphan_grace)
                .unwrap_or_else(|_| chrono::Duration::seconds(30)),
        };
        let mut reconciler_tasks = Vec::new();
        {
            let table = routing.read().await;
            for source in &table.sources {
                let Some(handle) = traders.get(&source.source_account_id) else {
                    continue;
                };
                for dest in &source.destinations {
                    let reconciler = OrphanReconciler::new(
                        &source.source_account_id,
                        &dest.dest_account_id,
                        Arc::clone(&routing),
                        Arc::clone(&pool_api),
                        Arc::clone(&store),
                        Arc::clone(&notifier),
                        handle.clone(),
                        reconciler_config.clone(),
                    );
                    reconciler_tasks.push(tokio::spawn(reconciler.run()));
                }
            }
        }

        // Control API with its own shutdown signal.
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let app_state = Arc::new(AppState::new(
            pool.base_url(),
            pool.breakers(),
            Arc::clone(&store),
            traders.clone(),
        ));
        let control_port = config.control_api_port;
        let control_task = tokio::spawn(async move {
            let mut shutdown_rx = shutdown_rx;
            let shutdown = async move {
                let _ = shutdown_rx.wait_for(|stop| *stop).await;
            };
            if let Err(e) = control_api::serve(control_port, app_state, shutdown).await {
                error!(error = %e, "control API failed");
            }
        });

        // Ask the pool to ping us on broker resyncs so snapshots refresh
        // immediately instead of waiting out a tick.
        if let Some(base) = &config.callback_base_url {
            let callback = format!("{}/internal/pool-resync", base.trim_end_matches('/'));
            match pool.register_reconnection_callback(&callback).await {
                Ok(()) => info!(callback = %callback, "reconnection callback registered"),
                Err(e) => warn!(
                    error = %e,
                    "reconnection callback registration failed; relying on polling only"
                ),
            }
        }

        info!(
            sources = traders.len(),
            routes = routing.read().await.route_count(),
            "router service started"
        );

        Ok(Self {
            config,
            routing,
            pool,
            notifier,
            traders,
            trader_tasks,
            reconciler_tasks,
            control_task,
            shutdown_tx,
        })
    }

    /// Block on signals: SIGHUP reloads routing config, SIGINT/SIGTERM
    /// start a graceful shutdown. Trader task exits are surfaced as alerts.
    pub async fn run_until_shutdown(mut self) -> anyhow::Result<()> {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupt received");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("SIGTERM received");
                    break;
                }
                _ = sighup.recv() => {
                    self.reload_config().await;
                }
                Some(result) = self.trader_tasks.join_next(), if !self.trader_tasks.is_empty() => {
                    self.report_trader_exit(result).await;
                }
            }
        }

        self.shutdown().await
    }

    /// Swap the routing table if the new file validates; keep the old one
    /// otherwise. Filters, sizing, and symbol tables of existing routes
    /// take effect immediately; adding source accounts needs a restart.
    async fn reload_config(&self) {
        info!(file = %self.config.routing_file.display(), "routing config reload requested");
        match RoutingTable::load(&self.config.routing_file) {
            Ok(table) => {
                for source in &table.sources {
                    if !self.traders.contains_key(&source.source_account_id) {
                        warn!(
                            account = %source.source_account_id,
                            "new source account in reloaded config; restart required to trade it"
                        );
                    }
                }
                self.pool.set_nicknames(table.nicknames());
                *self.routing.write().await = table;
                info!("routing config reloaded");
            }
            Err(e) => {
                error!(error = %e, "routing config reload rejected, keeping previous config");
                self.notifier
                    .notify(
                        Severity::Warning,
                        "config reload rejected",
                        &format!("routing config reload failed: {e}"),
                    )
                    .await;
            }
        }
    }

    async fn report_trader_exit(&self, result: Result<(), tokio::task::JoinError>) {
        match result {
            Ok(()) => warn!("a copy trader stopped outside shutdown"),
            Err(e) if e.is_panic() => {
                error!(error = %e, "copy trader panicked");
                self.notifier
                    .notify(
                        Severity::Critical,
                        "copy trader crashed",
                        "a copy trader task panicked; its source account is no longer replicating until restart",
                    )
                    .await;
            }
            Err(e) => error!(error = %e, "copy trader task failed"),
        }
    }

    /// Stop new ticks, drain in-flight work within the configured deadline,
    /// then tear the rest down.
    async fn shutdown(mut self) -> anyhow::Result<()> {
        info!("shutting down");

        for handle in self.traders.values() {
            handle.shutdown().await;
        }

        let deadline = self.config.shutdown_deadline;
        let drained = tokio::time::timeout(deadline, async {
            while self.trader_tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                deadline_secs = deadline.as_secs(),
                "shutdown deadline exceeded, aborting remaining traders"
            );
            self.trader_tasks.abort_all();
        }

        for task in &self.reconciler_tasks {
            task.abort();
        }

        let _ = self.shutdown_tx.send(true);
        let _ = tokio::time::timeout(Duration::from_secs(5), self.control_task).await;

        // Final breaker state for the record; the mapping cache is
        // write-through, so nothing else needs flushing.
        for (account, state) in self.pool.breakers().snapshot() {
            info!(
                account = %account,
                consecutive_failures = state.consecutive_failures,
                alerted = state.alerted,
                "breaker state at shutdown"
            );
        }

        info!("shutdown complete");
        Ok(())
    }
}
