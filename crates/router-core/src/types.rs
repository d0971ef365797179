//! Core domain types shared across the router.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Direction of a position.
///
/// The pool reports `POSITION_TYPE_BUY`/`POSITION_TYPE_SELL` on snapshots and
/// expects `BUY`/`SELL` on trade execution; both spellings deserialize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    #[serde(rename = "BUY", alias = "POSITION_TYPE_BUY")]
    Buy,
    #[serde(rename = "SELL", alias = "POSITION_TYPE_SELL")]
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An open broker position as observed through the pool service.
///
/// Observed only; the broker owns it. Prices and volumes arrive as IEEE
/// doubles on the wire and are decoded into `Decimal` at the boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub symbol: String,
    #[serde(rename = "type")]
    pub side: Side,
    #[serde(with = "rust_decimal::serde::float")]
    pub volume: Decimal,
    #[serde(rename = "openPrice", with = "rust_decimal::serde::float")]
    pub open_price: Decimal,
    #[serde(rename = "currentPrice", with = "rust_decimal::serde::float", default)]
    pub current_price: Decimal,
    #[serde(
        rename = "stopLoss",
        with = "rust_decimal::serde::float_option",
        default
    )]
    pub stop_loss: Option<Decimal>,
    #[serde(
        rename = "takeProfit",
        with = "rust_decimal::serde::float_option",
        default
    )]
    pub take_profit: Option<Decimal>,
    #[serde(with = "rust_decimal::serde::float", default)]
    pub profit: Decimal,
    pub time: DateTime<Utc>,
}

/// Account snapshot returned by the pool service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountInfo {
    #[serde(with = "rust_decimal::serde::float")]
    pub balance: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub equity: Decimal,
    #[serde(with = "rust_decimal::serde::float", default)]
    pub margin: Decimal,
    #[serde(rename = "freeMargin", with = "rust_decimal::serde::float", default)]
    pub free_margin: Decimal,
    pub currency: String,
    pub platform: String,
}

/// Result of a successful trade execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeResult {
    #[serde(rename = "positionId")]
    pub position_id: String,
    #[serde(rename = "openPrice", with = "rust_decimal::serde::float")]
    pub open_price: Decimal,
}

/// Result of a successful position close.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseResult {
    #[serde(with = "rust_decimal::serde::float")]
    pub profit: Decimal,
    pub order_id: String,
}

/// A historical trade reported by the pool service. Best-effort data used
/// only for introspection, never for routing decisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoricalTrade {
    pub id: String,
    pub symbol: String,
    #[serde(rename = "type")]
    pub side: Side,
    #[serde(with = "rust_decimal::serde::float")]
    pub volume: Decimal,
    #[serde(with = "rust_decimal::serde::float", default)]
    pub profit: Decimal,
    pub time: DateTime<Utc>,
}

/// The durable record that a destination position exists because of a
/// specific source position. The only authoritative record that a
/// destination position is ours.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionMapping {
    pub source_account_id: String,
    pub source_position_id: String,
    pub dest_account_id: String,
    pub dest_region: String,
    pub dest_position_id: String,
    pub source_symbol: String,
    pub dest_symbol: String,
    pub source_volume: Decimal,
    pub dest_volume: Decimal,
    pub source_open_price: Decimal,
    pub dest_open_price: Decimal,
    pub open_time: DateTime<Utc>,
    pub mapped_at: DateTime<Utc>,
}

/// How a replicated close was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseOutcome {
    /// The destination position was closed by us.
    Closed,
    /// The destination position was already gone.
    AlreadyClosed,
}

/// Short-lived record of a replicated close, kept so that a late snapshot
/// cannot re-open a just-closed source position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecentClose {
    pub source_account_id: String,
    pub source_position_id: String,
    pub outcome: CloseOutcome,
    #[serde(default)]
    pub profit: Option<Decimal>,
    #[serde(default)]
    pub order_id: Option<String>,
    pub closed_at: DateTime<Utc>,
}
