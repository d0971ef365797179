//! Integration tests for component interactions.
//!
//! The pool-facing tests run the real HTTP client against a local mock pool
//! service, so classification, breaker accounting, and alert gating are
//! exercised end to end.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use rust_decimal::Decimal;

use router_core::breaker::BreakerRegistry;
use router_core::error::PoolError;
use router_core::pool::{ExecuteTradeRequest, PoolApi, PoolClient};
use router_core::telemetry::{Notifier, Severity};
use router_core::types::Side;

/// Notifier that counts deliveries.
#[derive(Default)]
struct RecordingNotifier {
    notifications: AtomicUsize,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, _severity: Severity, _subject: &str, _body: &str) {
        self.notifications.fetch_add(1, Ordering::SeqCst);
    }
}

/// Mock pool: `positions` fails while `failures_remaining` is positive;
/// trading endpoints always work.
#[derive(Default)]
struct MockPoolState {
    failures_remaining: AtomicUsize,
    trades_executed: AtomicUsize,
}

async fn mock_positions(
    State(state): State<Arc<MockPoolState>>,
    Path(_id): Path<String>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let remaining = state.failures_remaining.load(Ordering::SeqCst);
    if remaining > 0 {
        state.failures_remaining.fetch_sub(1, Ordering::SeqCst);
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }
    Ok(Json(serde_json::json!({ "positions": [] })))
}

async fn mock_execute(State(state): State<Arc<MockPoolState>>) -> Json<serde_json::Value> {
    state.trades_executed.fetch_add(1, Ordering::SeqCst);
    Json(serde_json::json!({
        "success": true,
        "result": { "positionId": "777", "openPrice": 3050.0 }
    }))
}

async fn mock_history(Path(_id): Path<String>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "trades": [{
            "id": "h-1",
            "symbol": "XAUUSD",
            "type": "POSITION_TYPE_BUY",
            "volume": 0.1,
            "profit": 12.5,
            "time": "2024-06-01T12:00:00Z"
        }]
    }))
}

async fn spawn_mock_pool(state: Arc<MockPoolState>) -> String {
    let router = Router::new()
        .route("/positions/{id}", get(mock_positions))
        .route("/trade/execute", post(mock_execute))
        .route("/history/{id}", get(mock_history))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

fn execute_request() -> ExecuteTradeRequest {
    ExecuteTradeRequest {
        account_id: "S1".to_string(),
        region: "london".to_string(),
        symbol: "XAUUSDm".to_string(),
        action: Side::Buy,
        volume: Decimal::new(20, 2),
        stop_loss: None,
        take_profit: None,
        comment: None,
    }
}

/// Let spawned alert tasks run.
async fn drain_alerts() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

/// Three consecutive failures alert once; continued failures stay quiet;
/// trading calls are attempted throughout; a success re-arms the alert.
#[tokio::test]
async fn breaker_alerts_once_and_never_blocks() {
    let state = Arc::new(MockPoolState::default());
    let base_url = spawn_mock_pool(Arc::clone(&state)).await;

    let breakers = Arc::new(BreakerRegistry::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let pool = PoolClient::new(
        &base_url,
        Duration::from_secs(5),
        Arc::clone(&breakers),
        notifier.clone(),
    )
    .unwrap();

    // Three consecutive snapshot failures: exactly one alert.
    state.failures_remaining.store(3, Ordering::SeqCst);
    for _ in 0..3 {
        let result = pool.positions("S1", "london").await;
        assert!(matches!(result, Err(PoolError::Transport { .. })));
    }
    drain_alerts().await;
    assert_eq!(notifier.notifications.load(Ordering::SeqCst), 1);

    // Four more failures in the same streak: no additional alerts.
    state.failures_remaining.store(4, Ordering::SeqCst);
    for _ in 0..4 {
        assert!(pool.positions("S1", "london").await.is_err());
    }
    drain_alerts().await;
    assert_eq!(notifier.notifications.load(Ordering::SeqCst), 1);

    // The breaker never blocks: trading is attempted and succeeds even
    // while the account's failure streak is active.
    let trade = pool.execute_trade(&execute_request()).await.unwrap();
    assert_eq!(trade.position_id, "777");
    assert_eq!(state.trades_executed.load(Ordering::SeqCst), 1);

    // The success reset the streak; a fresh streak alerts again.
    state.failures_remaining.store(3, Ordering::SeqCst);
    for _ in 0..3 {
        assert!(pool.positions("S1", "london").await.is_err());
    }
    drain_alerts().await;
    assert_eq!(notifier.notifications.load(Ordering::SeqCst), 2);
}

/// A healthy pool returning no positions is a success with an empty list,
/// not an error; counters reset.
#[tokio::test]
async fn empty_positions_is_success_not_failure() {
    let state = Arc::new(MockPoolState::default());
    let base_url = spawn_mock_pool(Arc::clone(&state)).await;

    let breakers = Arc::new(BreakerRegistry::default());
    let pool = PoolClient::new(
        &base_url,
        Duration::from_secs(5),
        Arc::clone(&breakers),
        Arc::new(RecordingNotifier::default()),
    )
    .unwrap();

    let positions = pool.positions("S1", "london").await.unwrap();
    assert!(positions.is_empty());
    assert!(breakers.last_success_at().is_some());

    // History passthrough decodes wire doubles into decimals.
    let history = pool.history("S1", 7, 100).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].volume, Decimal::new(1, 1));
    assert_eq!(history[0].side, Side::Buy);
}

/// Nothing listening at all is a connection-refused transport failure: it
/// surfaces as an error (never an empty list) and does not count toward
/// the failure streak.
#[tokio::test]
async fn connection_refused_is_transport_but_uncounted() {
    let breakers = Arc::new(BreakerRegistry::default());
    let notifier = Arc::new(RecordingNotifier::default());
    // Grab a free port, then close it so nothing is listening there.
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let pool = PoolClient::new(
        format!("http://127.0.0.1:{port}"),
        Duration::from_secs(2),
        Arc::clone(&breakers),
        notifier.clone(),
    )
    .unwrap();

    for _ in 0..5 {
        let result = pool.positions("S1", "london").await;
        match result {
            Err(e @ PoolError::Transport { .. }) => assert!(!e.counts_for_breaker()),
            other => panic!("expected transport failure, got {other:?}"),
        }
    }
    drain_alerts().await;

    assert_eq!(notifier.notifications.load(Ordering::SeqCst), 0);
    let streak = breakers
        .state("S1")
        .map(|s| s.consecutive_failures)
        .unwrap_or(0);
    assert_eq!(streak, 0);
}
