//! Copy Router: replicates positions from source brokerage accounts onto
//! destination accounts through an external pool service.
//!
//! This is the root crate for cross-crate integration tests. For actual
//! functionality, use the individual crates directly:
//!
//! - `router-core`: types, pool client, breaker, mapping store, telemetry
//! - `copy-engine`: filter/sizing, copy trader, exit copy, reconciler
//! - `control-api`: operator HTTP surface
//! - `routerd`: the daemon

pub use copy_engine as engine;
pub use router_core as core;
