//! Static routing configuration: which source accounts replicate where,
//! with what filters and sizing.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// The whole routing table. Loaded at startup, swapped atomically on reload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingTable {
    pub sources: Vec<SourceRoute>,
}

/// All routes fanned out from one source account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRoute {
    pub source_account_id: String,
    pub region: String,
    pub destinations: Vec<Destination>,
}

/// One destination edge of a route plus its filter/sizing config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Destination {
    pub dest_account_id: String,
    pub region: String,
    /// Human name used in alerts.
    pub nickname: String,
    /// Empty allowlist means all symbols pass.
    #[serde(default)]
    pub allow_symbols: Vec<String>,
    #[serde(default)]
    pub block_symbols: Vec<String>,
    /// Source symbol -> destination symbol (broker suffixes).
    #[serde(default)]
    pub symbol_map: HashMap<String, String>,
    pub sizing: SizingRule,
    /// None mirrors the source stop (which may itself be unset).
    #[serde(default)]
    pub default_sl_pips: Option<Decimal>,
    #[serde(default)]
    pub default_tp_pips: Option<Decimal>,
    #[serde(default = "defaults::pip_size")]
    pub pip_size: Decimal,
    #[serde(default = "defaults::lot_step")]
    pub lot_step: Decimal,
    #[serde(default = "defaults::min_lot")]
    pub min_lot: Decimal,
    #[serde(default = "defaults::max_lot")]
    pub max_lot: Decimal,
    #[serde(default = "defaults::max_concurrent")]
    pub max_concurrent_per_symbol: usize,
    /// Symbols that must never be opened without a stop loss.
    #[serde(default)]
    pub sl_required_symbols: Vec<String>,
}

mod defaults {
    use rust_decimal::Decimal;

    pub fn pip_size() -> Decimal {
        Decimal::new(1, 4) // 0.0001
    }

    pub fn lot_step() -> Decimal {
        Decimal::new(1, 2) // 0.01
    }

    pub fn min_lot() -> Decimal {
        Decimal::new(1, 2) // 0.01
    }

    pub fn max_lot() -> Decimal {
        Decimal::new(100, 0)
    }

    pub fn max_concurrent() -> usize {
        10
    }
}

/// How the destination volume is derived from the source volume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SizingRule {
    /// Always open the configured volume.
    Fixed { volume: Decimal },
    /// Destination volume = source volume x factor, rounded to lot step.
    Multiplier { factor: Decimal },
    /// Destination volume scales with the equity ratio between accounts.
    EquityRatio,
}

impl Destination {
    /// Destination symbol after the rewrite table.
    pub fn mapped_symbol(&self, source_symbol: &str) -> String {
        self.symbol_map
            .get(source_symbol)
            .cloned()
            .unwrap_or_else(|| source_symbol.to_string())
    }
}

impl SourceRoute {
    pub fn destination(&self, dest_account_id: &str) -> Option<&Destination> {
        self.destinations
            .iter()
            .find(|d| d.dest_account_id == dest_account_id)
    }
}

impl RoutingTable {
    /// Read and validate a routing file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let table: RoutingTable = serde_json::from_str(&raw)?;
        table.validate()?;
        Ok(table)
    }

    /// Structural validation. Account reachability is checked separately at
    /// startup against the pool service.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sources.is_empty() {
            return Err(ConfigError::Invalid("no source accounts configured".into()));
        }

        let mut seen_sources = HashSet::new();
        let mut seen_routes = HashSet::new();
        for source in &self.sources {
            if source.source_account_id.is_empty() {
                return Err(ConfigError::Invalid("empty source account id".into()));
            }
            if !seen_sources.insert(&source.source_account_id) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate source account {}",
                    source.source_account_id
                )));
            }
            if source.destinations.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "source {} has no destinations",
                    source.source_account_id
                )));
            }
            for dest in &source.destinations {
                if dest.dest_account_id.is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "source {} has a destination with an empty account id",
                        source.source_account_id
                    )));
                }
                if !seen_routes.insert((&source.source_account_id, &dest.dest_account_id)) {
                    return Err(ConfigError::Invalid(format!(
                        "duplicate route {} -> {}",
                        source.source_account_id, dest.dest_account_id
                    )));
                }
                if dest.lot_step <= Decimal::ZERO {
                    return Err(ConfigError::Invalid(format!(
                        "route {} -> {}: lot_step must be positive",
                        source.source_account_id, dest.dest_account_id
                    )));
                }
                if dest.min_lot > dest.max_lot {
                    return Err(ConfigError::Invalid(format!(
                        "route {} -> {}: min_lot exceeds max_lot",
                        source.source_account_id, dest.dest_account_id
                    )));
                }
                if let SizingRule::Multiplier { factor } = &dest.sizing {
                    if *factor <= Decimal::ZERO {
                        return Err(ConfigError::Invalid(format!(
                            "route {} -> {}: multiplier must be positive",
                            source.source_account_id, dest.dest_account_id
                        )));
                    }
                }
            }
        }

        Ok(())
    }

    /// Every account referenced by the table, with its region. Used by
    /// startup validation (`account_info` per account) and alert naming.
    pub fn referenced_accounts(&self) -> Vec<(String, String)> {
        let mut accounts = Vec::new();
        for source in &self.sources {
            accounts.push((source.source_account_id.clone(), source.region.clone()));
            for dest in &source.destinations {
                accounts.push((dest.dest_account_id.clone(), dest.region.clone()));
            }
        }
        accounts
    }

    /// Account id -> nickname, for alert messages. Sources fall back to
    /// their account id.
    pub fn nicknames(&self) -> HashMap<String, String> {
        let mut names = HashMap::new();
        for source in &self.sources {
            names.insert(
                source.source_account_id.clone(),
                source.source_account_id.clone(),
            );
            for dest in &source.destinations {
                names.insert(dest.dest_account_id.clone(), dest.nickname.clone());
            }
        }
        names
    }

    pub fn route_count(&self) -> usize {
        self.sources.iter().map(|s| s.destinations.len()).sum()
    }
}
