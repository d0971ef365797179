//! Copy Engine
//!
//! The trading control loop of the router: per-source copy trader state
//! machines, the filter/sizing engine, the exit-copy protocol, and the
//! orphan reconciler.

pub mod exit;
pub mod reconciler;
pub mod retry;
pub mod sizing;
pub mod trader;

pub use exit::{copy_exit, ExitOutcome};
pub use reconciler::{OrphanReconciler, ReconcilerConfig};
pub use retry::{retry, RetryPolicy};
pub use sizing::{decide, Action, DecisionContext, OpenOrder, SkipReason};
pub use trader::{CopyTrader, LifecycleState, TraderConfig, TraderEvent, TraderHandle};
