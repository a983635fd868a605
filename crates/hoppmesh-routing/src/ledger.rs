//! Performance ledger: per-path delivery history
//!
//! Every delivery attempt lands here, keyed by the joined path of the route
//! that was tried. The scorer reads the derived success rate and latency on
//! later decisions. Entries are kept in an LRU so the ledger cannot grow
//! without bound as new paths appear; the least recently recorded path is
//! evicted first.

use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::time::Duration;

/// Average latency assumed for a path before its first success
pub const DEFAULT_AVERAGE_LATENCY_MS: f64 = 1000.0;

/// Default number of paths the ledger remembers
pub const DEFAULT_LEDGER_CAPACITY: usize = 4096;

/// Delivery history for one path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathStats {
    pub attempts: u64,
    pub successes: u64,
    pub total_latency_ms: f64,
    pub success_rate: f64,
    pub average_latency_ms: f64,
}

impl Default for PathStats {
    fn default() -> Self {
        PathStats {
            attempts: 0,
            successes: 0,
            total_latency_ms: 0.0,
            success_rate: 0.0,
            average_latency_ms: DEFAULT_AVERAGE_LATENCY_MS,
        }
    }
}

impl PathStats {
    fn record(&mut self, success: bool, latency: Duration) {
        self.attempts += 1;
        if success {
            self.successes += 1;
            self.total_latency_ms += latency.as_secs_f64() * 1000.0;
        }

        self.success_rate = self.successes as f64 / self.attempts as f64;
        if self.successes > 0 {
            self.average_latency_ms = self.total_latency_ms / self.successes as f64;
        }
    }
}

/// LRU-bounded map from path key to [`PathStats`]
pub struct PerformanceLedger {
    entries: LruCache<String, PathStats>,
}

impl PerformanceLedger {
    /// Create a ledger holding at most `capacity` paths (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        PerformanceLedger {
            entries: LruCache::new(capacity),
        }
    }

    /// Record the outcome of one attempt over `path_key`
    ///
    /// `latency` only counts towards the average on success.
    pub fn record(&mut self, path_key: &str, success: bool, latency: Duration) -> &PathStats {
        let stats = self
            .entries
            .get_or_insert_mut(path_key.to_string(), PathStats::default);
        stats.record(success, latency);
        stats
    }

    /// Look up a path without touching its recency
    pub fn get(&self, path_key: &str) -> Option<&PathStats> {
        self.entries.peek(path_key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.cap().get()
    }

    /// All entries, least recently recorded first
    pub fn export(&self) -> Vec<(String, PathStats)> {
        self.entries
            .iter()
            .rev()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Load entries produced by [`export`](Self::export)
    ///
    /// Later entries count as more recent; the capacity still applies.
    pub fn import(&mut self, entries: impl IntoIterator<Item = (String, PathStats)>) {
        for (key, stats) in entries {
            self.entries.put(key, stats);
        }
    }
}

impl Default for PerformanceLedger {
    fn default() -> Self {
        Self::new(DEFAULT_LEDGER_CAPACITY)
    }
}
