//! Router tuning knobs

use hoppmesh_protocol::message::{DEFAULT_TTL, EMERGENCY_TTL};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::decision::MAX_ALTERNATIVES;
use crate::ledger::DEFAULT_LEDGER_CAPACITY;

/// Timing, retry and capacity settings for a [`MeshNetwork`](crate::MeshNetwork)
///
/// Every field has a default, so a partial YAML/JSON section is enough.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Router loop period
    pub process_interval_ms: u64,
    /// Discovery refresh period
    pub discovery_interval_ms: u64,
    pub attempt_timeout_ms: u64,
    pub forward_timeout_ms: u64,
    pub store_timeout_ms: u64,
    pub poll_timeout_ms: u64,
    /// First backoff delay, doubled per retry
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Backoff retries before a message is stored instead
    pub max_retries: u32,
    pub ledger_capacity: usize,
    /// Nodes unseen for longer are evicted
    pub freshness_window_secs: u64,
    pub max_messages_per_tick: usize,
    pub max_alternatives: usize,
    /// How long finished message outcomes stay queryable
    pub outcome_retention_secs: u64,
    pub default_ttl: u8,
    pub emergency_ttl: u8,
}

impl Default for RouterConfig {
    fn default() -> Self {
        RouterConfig {
            process_interval_ms: 1000,
            discovery_interval_ms: 5000,
            attempt_timeout_ms: 5000,
            forward_timeout_ms: 10_000,
            store_timeout_ms: 2000,
            poll_timeout_ms: 3000,
            backoff_base_ms: 2000,
            backoff_max_ms: 60_000,
            max_retries: 5,
            ledger_capacity: DEFAULT_LEDGER_CAPACITY,
            freshness_window_secs: 300,
            max_messages_per_tick: 10,
            max_alternatives: MAX_ALTERNATIVES,
            outcome_retention_secs: 3600,
            default_ttl: DEFAULT_TTL,
            emergency_ttl: EMERGENCY_TTL,
        }
    }
}

impl RouterConfig {
    pub fn process_interval(&self) -> Duration {
        Duration::from_millis(self.process_interval_ms.max(1))
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_interval_ms.max(1))
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn forward_timeout(&self) -> Duration {
        Duration::from_millis(self.forward_timeout_ms)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn freshness_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.freshness_window_secs.min(u32::MAX as u64) as i64)
    }

    pub fn outcome_retention(&self) -> Duration {
        Duration::from_secs(self.outcome_retention_secs)
    }

    /// Delay before backoff retry number `retry` (1-based)
    ///
    /// `base × 2^(retry-1)`, capped at `backoff_max_ms`.
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(32);
        let delay = self.backoff_base_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.backoff_max_ms))
    }

    /// Starting TTL for a message of this urgency
    pub fn ttl_for(&self, emergency: bool) -> u8 {
        if emergency {
            self.emergency_ttl
        } else {
            self.default_ttl
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = RouterConfig::default();
        assert_eq!(config.backoff_delay(1), Duration::from_secs(2));
        assert_eq!(config.backoff_delay(2), Duration::from_secs(4));
        assert_eq!(config.backoff_delay(3), Duration::from_secs(8));
        assert_eq!(config.backoff_delay(10), Duration::from_secs(60));
        assert_eq!(config.backoff_delay(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_ttl_defaults() {
        let config = RouterConfig::default();
        assert_eq!(config.ttl_for(false), 10);
        assert_eq!(config.ttl_for(true), 20);
    }

    #[test]
    fn test_zero_intervals_clamped() {
        let config = RouterConfig {
            process_interval_ms: 0,
            ..Default::default()
        };
        assert_eq!(config.process_interval(), Duration::from_millis(1));
    }
}
