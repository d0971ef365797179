//! Filter & sizing engine.
//!
//! `decide` is a pure function from a source trade, a destination route, and
//! live context to the action to take on that destination. All arithmetic is
//! fixed-point `Decimal`; volumes come out as multiples of the broker's lot
//! step.

use rust_decimal::Decimal;
use serde::Serialize;

use router_core::routing::{Destination, SizingRule};
use router_core::types::{Position, Side};

/// Live inputs to the decision beyond the trade and the route.
#[derive(Debug, Clone)]
pub struct DecisionContext {
    /// Destination positions already open on the (rewritten) symbol.
    pub open_on_symbol: usize,
    /// Equities, used only by the equity-ratio sizing rule.
    pub source_equity: Decimal,
    pub dest_equity: Decimal,
}

impl DecisionContext {
    /// Context for routes that do not size by equity.
    pub fn flat(open_on_symbol: usize) -> Self {
        Self {
            open_on_symbol,
            source_equity: Decimal::ONE,
            dest_equity: Decimal::ONE,
        }
    }
}

/// Why a source trade was not copied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    SymbolNotAllowed,
    SymbolBlocked,
    MaxConcurrentReached,
    VolumeBelowMinimum,
    NoStopLoss,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::SymbolNotAllowed => "symbol not allowed",
            SkipReason::SymbolBlocked => "symbol blocked",
            SkipReason::MaxConcurrentReached => "max concurrent reached",
            SkipReason::VolumeBelowMinimum => "volume below minimum",
            SkipReason::NoStopLoss => "no stop loss",
        }
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The replication order to place on the destination.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenOrder {
    /// Destination symbol after rewrite.
    pub symbol: String,
    pub side: Side,
    pub volume: Decimal,
    /// Absolute stops mirrored from the source.
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    /// Route-default stops in pips, applied to the destination open price
    /// once it is known.
    pub sl_pips: Option<Decimal>,
    pub tp_pips: Option<Decimal>,
}

impl OpenOrder {
    /// Absolute SL/TP derived from the route's pip defaults and the actual
    /// destination open price. None for levels that are mirrored or unset.
    pub fn pip_stops(
        &self,
        open_price: Decimal,
        pip_size: Decimal,
    ) -> (Option<Decimal>, Option<Decimal>) {
        let offset = |pips: Decimal| pips * pip_size;
        match self.side {
            Side::Buy => (
                self.sl_pips.map(|p| open_price - offset(p)),
                self.tp_pips.map(|p| open_price + offset(p)),
            ),
            Side::Sell => (
                self.sl_pips.map(|p| open_price + offset(p)),
                self.tp_pips.map(|p| open_price - offset(p)),
            ),
        }
    }
}

/// What to do with a source trade on one destination.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Skip(SkipReason),
    Open(OpenOrder),
    Close,
}

/// Decide whether and how to copy a source trade onto a destination.
/// Rules are evaluated in order; the first match wins.
pub fn decide(trade: &Position, dest: &Destination, ctx: &DecisionContext) -> Action {
    let dest_symbol = dest.mapped_symbol(&trade.symbol);

    if !dest.allow_symbols.is_empty() && !dest.allow_symbols.contains(&dest_symbol) {
        return Action::Skip(SkipReason::SymbolNotAllowed);
    }
    if dest.block_symbols.contains(&dest_symbol) {
        return Action::Skip(SkipReason::SymbolBlocked);
    }

    if ctx.open_on_symbol >= dest.max_concurrent_per_symbol {
        return Action::Skip(SkipReason::MaxConcurrentReached);
    }

    let volume = match &dest.sizing {
        SizingRule::Fixed { volume } => *volume,
        SizingRule::Multiplier { factor } => round_to_step(trade.volume * factor, dest.lot_step),
        SizingRule::EquityRatio => {
            if ctx.source_equity <= Decimal::ZERO {
                return Action::Skip(SkipReason::VolumeBelowMinimum);
            }
            floor_to_step(
                trade.volume * ctx.dest_equity / ctx.source_equity,
                dest.lot_step,
            )
        }
    };

    let volume = volume.min(dest.max_lot);
    if volume < dest.min_lot {
        return Action::Skip(SkipReason::VolumeBelowMinimum);
    }

    let sl_required = dest.sl_required_symbols.contains(&dest_symbol)
        || dest.sl_required_symbols.contains(&trade.symbol);
    if sl_required && trade.stop_loss.is_none() && dest.default_sl_pips.is_none() {
        return Action::Skip(SkipReason::NoStopLoss);
    }

    Action::Open(OpenOrder {
        symbol: dest_symbol,
        side: trade.side,
        volume,
        stop_loss: trade.stop_loss,
        take_profit: trade.take_profit,
        sl_pips: if trade.stop_loss.is_none() {
            dest.default_sl_pips
        } else {
            None
        },
        tp_pips: if trade.take_profit.is_none() {
            dest.default_tp_pips
        } else {
            None
        },
    })
}

fn round_to_step(volume: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return volume;
    }
    (volume / step).round() * step
}

fn floor_to_step(volume: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return volume;
    }
    (volume / step).floor() * step
}
