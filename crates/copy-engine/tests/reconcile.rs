//! Orphan reconciliation scenarios.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::RwLock;

use common::{position, single_route_table, MockPool, RecordingNotifier};
use copy_engine::reconciler::{OrphanReconciler, ReconcilerConfig};
use copy_engine::trader::{CopyTrader, TraderConfig, TraderHandle};
use router_core::error::PoolError;
use router_core::routing::RoutingTable;
use router_core::store::{MappingStore, MemoryKv};
use router_core::types::{PositionMapping, Side};

struct Fixture {
    pool: Arc<MockPool>,
    store: Arc<MappingStore>,
    routing: Arc<RwLock<RoutingTable>>,
    notifier: Arc<RecordingNotifier>,
}

impl Fixture {
    fn new() -> Self {
        Self {
            pool: MockPool::new(),
            store: Arc::new(MappingStore::new(
                Arc::new(MemoryKv::new()),
                Duration::from_secs(900),
            )),
            routing: Arc::new(RwLock::new(single_route_table())),
            notifier: Arc::new(RecordingNotifier::default()),
        }
    }

    fn trader(&self) -> (CopyTrader, TraderHandle) {
        CopyTrader::new(
            "S1",
            "london",
            Arc::clone(&self.routing),
            self.pool.clone(),
            Arc::clone(&self.store),
            self.notifier.clone(),
            TraderConfig {
                poll_interval: Duration::from_secs(2),
                ..TraderConfig::default()
            },
        )
    }

    fn reconciler(&self, trader: TraderHandle) -> OrphanReconciler {
        OrphanReconciler::new(
            "S1",
            "D1",
            Arc::clone(&self.routing),
            self.pool.clone(),
            Arc::clone(&self.store),
            self.notifier.clone(),
            trader,
            ReconcilerConfig {
                interval: Duration::from_secs(60),
                // Zero grace lets consecutive scans stand in for scans
                // separated by the real window.
                orphan_grace: chrono::Duration::zero(),
            },
        )
    }

    async fn insert_mapping(&self, source_position_id: &str, dest_position_id: &str) {
        self.store
            .create_mapping(&PositionMapping {
                source_account_id: "S1".to_string(),
                source_position_id: source_position_id.to_string(),
                dest_account_id: "D1".to_string(),
                dest_region: "london".to_string(),
                dest_position_id: dest_position_id.to_string(),
                source_symbol: "XAUUSD".to_string(),
                dest_symbol: "XAUUSDm".to_string(),
                source_volume: Decimal::new(10, 2),
                dest_volume: Decimal::new(20, 2),
                source_open_price: Decimal::new(3050, 0),
                dest_open_price: Decimal::new(3050, 0),
                open_time: Utc::now(),
                mapped_at: Utc::now(),
            })
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn orphan_is_closed_exactly_once_after_confirmation() {
    let fx = Fixture::new();
    fx.pool.set_positions("S1", Vec::new());
    fx.pool.set_positions(
        "D1",
        vec![position(
            "999",
            "XAUUSDm",
            Side::Buy,
            Decimal::new(20, 2),
            Decimal::new(3050, 0),
        )],
    );

    let (_trader, handle) = fx.trader();
    let mut reconciler = fx.reconciler(handle);

    // First scan only registers the candidate.
    reconciler.scan().await;
    assert_eq!(fx.pool.closed_count(), 0);

    // Second scan past the grace window closes it.
    reconciler.scan().await;
    assert_eq!(
        *fx.pool.closed.lock().unwrap(),
        vec![("D1".to_string(), "999".to_string())]
    );

    // The close removed the position; further scans do nothing.
    reconciler.scan().await;
    reconciler.scan().await;
    assert_eq!(fx.pool.closed_count(), 1);
}

#[tokio::test]
async fn mapped_position_is_never_an_orphan() {
    let fx = Fixture::new();
    fx.insert_mapping("111", "555").await;
    fx.pool.set_positions(
        "S1",
        vec![position(
            "111",
            "XAUUSD",
            Side::Buy,
            Decimal::new(10, 2),
            Decimal::new(3050, 0),
        )],
    );
    fx.pool.set_positions(
        "D1",
        vec![position(
            "555",
            "XAUUSDm",
            Side::Buy,
            Decimal::new(20, 2),
            Decimal::new(3050, 0),
        )],
    );

    let (_trader, handle) = fx.trader();
    let mut reconciler = fx.reconciler(handle);
    reconciler.scan().await;
    reconciler.scan().await;

    assert_eq!(fx.pool.closed_count(), 0);
    assert!(fx.store.get_mapping("S1", "111", "D1").await.unwrap().is_some());
}

#[tokio::test]
async fn candidate_forgotten_when_broker_closes_it_first() {
    let fx = Fixture::new();
    fx.pool.set_positions("S1", Vec::new());
    fx.pool.set_positions(
        "D1",
        vec![position(
            "999",
            "XAUUSDm",
            Side::Buy,
            Decimal::new(20, 2),
            Decimal::new(3050, 0),
        )],
    );

    let (_trader, handle) = fx.trader();
    let mut reconciler = fx.reconciler(handle);
    reconciler.scan().await;

    // Gone before the confirming scan.
    fx.pool.set_positions("D1", Vec::new());
    reconciler.scan().await;
    reconciler.scan().await;
    assert_eq!(fx.pool.closed_count(), 0);
}

#[tokio::test]
async fn failed_snapshot_aborts_the_cycle() {
    let fx = Fixture::new();
    fx.pool.set_positions("S1", Vec::new());
    fx.pool.set_positions(
        "D1",
        vec![position(
            "999",
            "XAUUSDm",
            Side::Buy,
            Decimal::new(20, 2),
            Decimal::new(3050, 0),
        )],
    );

    let (_trader, handle) = fx.trader();
    let mut reconciler = fx.reconciler(handle);
    reconciler.scan().await;

    // The confirming scan cannot see the account; nothing may be closed.
    fx.pool
        .push_positions_result("D1", Err(PoolError::transport("timeout")));
    reconciler.scan().await;
    assert_eq!(fx.pool.closed_count(), 0);

    // Next healthy scan closes it.
    reconciler.scan().await;
    assert_eq!(fx.pool.closed_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn stuck_close_is_redriven_through_the_trader() {
    let fx = Fixture::new();
    fx.insert_mapping("111", "555").await;
    fx.pool.set_positions("S1", Vec::new());
    fx.pool.set_positions(
        "D1",
        vec![position(
            "555",
            "XAUUSDm",
            Side::Buy,
            Decimal::new(20, 2),
            Decimal::new(3050, 0),
        )],
    );

    // The trader never observed this mapping (no rehydration, no polls):
    // only the reconciler's hand-back can drive the close.
    let (mut trader, handle) = fx.trader();
    let mut reconciler = fx.reconciler(handle);
    reconciler.scan().await;

    trader.process_pending_events().await;

    assert_eq!(
        *fx.pool.closed.lock().unwrap(),
        vec![("D1".to_string(), "555".to_string())]
    );
    assert!(fx.store.get_mapping("S1", "111", "D1").await.unwrap().is_none());
}
