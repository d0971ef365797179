//! Shared test fixtures: a scriptable mock pool service and routing
//! helpers.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;

use router_core::error::PoolResult;
use router_core::pool::{ExecuteTradeRequest, PoolApi};
use router_core::routing::{Destination, RoutingTable, SizingRule, SourceRoute};
use router_core::telemetry::{Notifier, Severity};
use router_core::types::{
    AccountInfo, CloseResult, HistoricalTrade, Position, Side, TradeResult,
};

/// Scriptable in-memory pool. Scripted responses are consumed first; after
/// that, calls fall back to the mutable "live" account state, with
/// executions and closes applied to it like a broker would.
#[derive(Default)]
pub struct MockPool {
    scripted_positions: Mutex<HashMap<String, VecDeque<PoolResult<Vec<Position>>>>>,
    live_positions: Mutex<HashMap<String, Vec<Position>>>,
    accounts: Mutex<HashMap<String, AccountInfo>>,
    scripted_execute: Mutex<VecDeque<PoolResult<TradeResult>>>,
    scripted_close: Mutex<VecDeque<PoolResult<CloseResult>>>,
    pub executed: Mutex<Vec<ExecuteTradeRequest>>,
    pub closed: Mutex<Vec<(String, String)>>,
    pub modified: Mutex<Vec<(String, String, Option<Decimal>, Option<Decimal>)>>,
    next_id: AtomicU64,
}

impl MockPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(900),
            ..Self::default()
        })
    }

    pub fn set_positions(&self, account_id: &str, positions: Vec<Position>) {
        self.live_positions
            .lock()
            .unwrap()
            .insert(account_id.to_string(), positions);
    }

    /// Queue a one-shot `positions` response for an account, served before
    /// the live state.
    pub fn push_positions_result(&self, account_id: &str, result: PoolResult<Vec<Position>>) {
        self.scripted_positions
            .lock()
            .unwrap()
            .entry(account_id.to_string())
            .or_default()
            .push_back(result);
    }

    pub fn set_account(&self, account_id: &str, equity: Decimal) {
        self.accounts.lock().unwrap().insert(
            account_id.to_string(),
            AccountInfo {
                balance: equity,
                equity,
                margin: Decimal::ZERO,
                free_margin: equity,
                currency: "USD".to_string(),
                platform: "mt5".to_string(),
            },
        );
    }

    pub fn push_execute_result(&self, result: PoolResult<TradeResult>) {
        self.scripted_execute.lock().unwrap().push_back(result);
    }

    pub fn push_close_result(&self, result: PoolResult<CloseResult>) {
        self.scripted_close.lock().unwrap().push_back(result);
    }

    pub fn executed_count(&self) -> usize {
        self.executed.lock().unwrap().len()
    }

    pub fn closed_count(&self) -> usize {
        self.closed.lock().unwrap().len()
    }
}

#[async_trait]
impl PoolApi for MockPool {
    async fn account_info(&self, account_id: &str, _region: &str) -> PoolResult<AccountInfo> {
        Ok(self
            .accounts
            .lock()
            .unwrap()
            .get(account_id)
            .cloned()
            .unwrap_or_else(|| AccountInfo {
                balance: Decimal::new(10_000, 0),
                equity: Decimal::new(10_000, 0),
                margin: Decimal::ZERO,
                free_margin: Decimal::new(10_000, 0),
                currency: "USD".to_string(),
                platform: "mt5".to_string(),
            }))
    }

    async fn positions(&self, account_id: &str, _region: &str) -> PoolResult<Vec<Position>> {
        if let Some(queue) = self
            .scripted_positions
            .lock()
            .unwrap()
            .get_mut(account_id)
        {
            if let Some(result) = queue.pop_front() {
                return result;
            }
        }
        Ok(self
            .live_positions
            .lock()
            .unwrap()
            .get(account_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn execute_trade(&self, request: &ExecuteTradeRequest) -> PoolResult<TradeResult> {
        self.executed.lock().unwrap().push(request.clone());

        let result = match self.scripted_execute.lock().unwrap().pop_front() {
            Some(result) => result,
            None => Ok(TradeResult {
                position_id: self.next_id.fetch_add(1, Ordering::SeqCst).to_string(),
                open_price: Decimal::new(3050, 0),
            }),
        };

        if let Ok(trade) = &result {
            self.live_positions
                .lock()
                .unwrap()
                .entry(request.account_id.clone())
                .or_default()
                .push(Position {
                    id: trade.position_id.clone(),
                    symbol: request.symbol.clone(),
                    side: request.action,
                    volume: request.volume,
                    open_price: trade.open_price,
                    current_price: trade.open_price,
                    stop_loss: request.stop_loss,
                    take_profit: request.take_profit,
                    profit: Decimal::ZERO,
                    time: Utc::now(),
                });
        }
        result
    }

    async fn modify_position(
        &self,
        account_id: &str,
        _region: &str,
        position_id: &str,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) -> PoolResult<()> {
        self.modified.lock().unwrap().push((
            account_id.to_string(),
            position_id.to_string(),
            stop_loss,
            take_profit,
        ));
        Ok(())
    }

    async fn close_position(
        &self,
        account_id: &str,
        _region: &str,
        position_id: &str,
    ) -> PoolResult<CloseResult> {
        self.closed
            .lock()
            .unwrap()
            .push((account_id.to_string(), position_id.to_string()));

        let result = match self.scripted_close.lock().unwrap().pop_front() {
            Some(result) => result,
            None => Ok(CloseResult {
                profit: Decimal::new(125, 1),
                order_id: format!("ord-{position_id}"),
            }),
        };

        if result.is_ok() {
            if let Some(positions) = self.live_positions.lock().unwrap().get_mut(account_id) {
                positions.retain(|p| p.id != position_id);
            }
        }
        result
    }

    async fn history(
        &self,
        _account_id: &str,
        _days: u32,
        _limit: u32,
    ) -> PoolResult<Vec<HistoricalTrade>> {
        Ok(Vec::new())
    }
}

/// Notifier that only counts deliveries.
#[derive(Default)]
pub struct RecordingNotifier {
    pub notifications: AtomicUsize,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, _severity: Severity, _subject: &str, _body: &str) {
        self.notifications.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn position(id: &str, symbol: &str, side: Side, volume: Decimal, open_price: Decimal) -> Position {
    Position {
        id: id.to_string(),
        symbol: symbol.to_string(),
        side,
        volume,
        open_price,
        current_price: open_price,
        stop_loss: None,
        take_profit: None,
        profit: Decimal::ZERO,
        time: Utc::now(),
    }
}

/// One route S1 -> D1: multiplier 2, XAUUSD rewritten to XAUUSDm.
pub fn single_route_table() -> RoutingTable {
    RoutingTable {
        sources: vec![SourceRoute {
            source_account_id: "S1".to_string(),
            region: "london".to_string(),
            destinations: vec![destination("D1")],
        }],
    }
}

pub fn destination(dest_account_id: &str) -> Destination {
    Destination {
        dest_account_id: dest_account_id.to_string(),
        region: "london".to_string(),
        nickname: format!("{dest_account_id}-live"),
        allow_symbols: Vec::new(),
        block_symbols: Vec::new(),
        symbol_map: HashMap::from([("XAUUSD".to_string(), "XAUUSDm".to_string())]),
        sizing: SizingRule::Multiplier {
            factor: Decimal::new(2, 0),
        },
        default_sl_pips: None,
        default_tp_pips: None,
        pip_size: Decimal::new(1, 4),
        lot_step: Decimal::new(1, 2),
        min_lot: Decimal::new(1, 2),
        max_lot: Decimal::new(100, 0),
        max_concurrent_per_symbol: 10,
        sl_required_symbols: Vec::new(),
    }
}
