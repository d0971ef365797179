//! Per-account failure tracking and alert suppression.
//!
//! The breaker never blocks a request. Trading calls are always attempted;
//! the only thing a tripped breaker gates is alert spam.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::RwLock;

/// Thresholds for the per-account alert gate.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive counted failures before an alert fires.
    pub failure_threshold: u32,
    /// Minimum spacing between alerts for the same account while failures
    /// continue.
    pub alert_cooldown: Duration,
    /// A failure older than this resets the counter before counting the new
    /// one; transient pool restarts must not accumulate.
    pub failure_reset: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            alert_cooldown: Duration::minutes(5),
            failure_reset: Duration::seconds(30),
        }
    }
}

/// Observable state for one account.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BreakerState {
    pub consecutive_failures: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Whether the current failure streak has already been alerted.
    pub alerted: bool,
    pub last_alert_at: Option<DateTime<Utc>>,
}

/// Failure counters for all accounts, keyed by account id.
pub struct BreakerRegistry {
    config: BreakerConfig,
    accounts: DashMap<String, BreakerState>,
    /// Timestamp of the most recent successful pool call on any account.
    last_success_at: RwLock<Option<DateTime<Utc>>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            accounts: DashMap::new(),
            last_success_at: RwLock::new(None),
        }
    }

    /// Record a successful call: reset the counter and clear alert
    /// suppression so a fresh streak alerts again.
    pub fn record_success(&self, account_id: &str) {
        self.record_success_at(account_id, Utc::now());
    }

    pub fn record_success_at(&self, account_id: &str, now: DateTime<Utc>) {
        let mut state = self.accounts.entry(account_id.to_string()).or_default();
        state.consecutive_failures = 0;
        state.alerted = false;
        if let Ok(mut last) = self.last_success_at.write() {
            *last = Some(now);
        }
    }

    /// Record a counted failure. Returns true when an alert should be
    /// emitted for this account.
    pub fn record_failure(&self, account_id: &str) -> bool {
        self.record_failure_at(account_id, Utc::now())
    }

    pub fn record_failure_at(&self, account_id: &str, now: DateTime<Utc>) -> bool {
        let mut state = self.accounts.entry(account_id.to_string()).or_default();

        // Stale streak: a quiet period means the previous failures belonged
        // to a different incident.
        if let Some(last) = state.last_failure_at {
            if now - last > self.config.failure_reset {
                state.consecutive_failures = 0;
            }
        }

        state.consecutive_failures += 1;
        state.last_failure_at = Some(now);

        let suppressed = state.alerted
            && state
                .last_alert_at
                .is_some_and(|at| now - at < self.config.alert_cooldown);

        let should_alert = state.consecutive_failures >= self.config.failure_threshold && !suppressed;
        if should_alert {
            state.alerted = true;
            state.last_alert_at = Some(now);
        }
        should_alert
    }

    pub fn state(&self, account_id: &str) -> Option<BreakerState> {
        self.accounts.get(account_id).map(|s| s.clone())
    }

    /// Snapshot of all tracked accounts, for introspection.
    pub fn snapshot(&self) -> Vec<(String, BreakerState)> {
        let mut states: Vec<_> = self
            .accounts
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }

    pub fn last_success_at(&self) -> Option<DateTime<Utc>> {
        self.last_success_at.read().ok().and_then(|v| *v)
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> BreakerRegistry {
        BreakerRegistry::new(BreakerConfig::default())
    }

    #[test]
    fn test_alert_fires_at_threshold() {
        let breaker = registry();
        let t0 = Utc::now();

        assert!(!breaker.record_failure_at("acct", t0));
        assert!(!breaker.record_failure_at("acct", t0 + Duration::seconds(1)));
        assert!(breaker.record_failure_at("acct", t0 + Duration::seconds(2)));
    }

    #[test]
    fn test_cooldown_suppresses_repeat_alerts() {
        let breaker = registry();
        let t0 = Utc::now();

        for i in 0..3 {
            breaker.record_failure_at("acct", t0 + Duration::seconds(i));
        }

        // Four more failures within the next minute: no additional alerts.
        for i in 0..4 {
            assert!(!breaker.record_failure_at("acct", t0 + Duration::seconds(10 + i)));
        }

        // Past the cooldown the streak alerts again.
        assert!(breaker.record_failure_at("acct", t0 + Duration::minutes(6)));
    }

    #[test]
    fn test_success_resets_counter_and_suppression() {
        let breaker = registry();
        let t0 = Utc::now();

        for i in 0..3 {
            breaker.record_failure_at("acct", t0 + Duration::seconds(i));
        }

        breaker.record_success_at("acct", t0 + Duration::seconds(5));
        let state = breaker.state("acct").unwrap();
        assert_eq!(state.consecutive_failures, 0);
        assert!(!state.alerted);

        // A new streak alerts even though the previous alert was recent.
        assert!(!breaker.record_failure_at("acct", t0 + Duration::seconds(6)));
        assert!(!breaker.record_failure_at("acct", t0 + Duration::seconds(7)));
        assert!(breaker.record_failure_at("acct", t0 + Duration::seconds(8)));
    }

    #[test]
    fn test_stale_streak_resets_before_counting() {
        let breaker = registry();
        let t0 = Utc::now();

        breaker.record_failure_at("acct", t0);
        breaker.record_failure_at("acct", t0 + Duration::seconds(1));

        // More than 30s quiet: the old streak does not accumulate.
        assert!(!breaker.record_failure_at("acct", t0 + Duration::seconds(60)));
        let state = breaker.state("acct").unwrap();
        assert_eq!(state.consecutive_failures, 1);
    }

    #[test]
    fn test_accounts_tracked_independently() {
        let breaker = registry();
        let t0 = Utc::now();

        for i in 0..3 {
            breaker.record_failure_at("a", t0 + Duration::seconds(i));
        }
        assert!(!breaker.record_failure_at("b", t0 + Duration::seconds(3)));
        assert_eq!(breaker.state("b").unwrap().consecutive_failures, 1);
    }
}
