#![forbid(unsafe_code)]
//! Per-LU statistics.
//!
//! Plain relaxed atomics: the hot prep path bumps counters without taking
//! any lock, and [`HpbStats::snapshot`] is a consistent-enough point-in-time
//! copy for logging and export.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters, one per observable event.
#[derive(Debug, Default)]
pub struct HpbStats {
    pub hits: AtomicU64,
    pub miss_disabled: AtomicU64,
    pub miss_region_inactive: AtomicU64,
    pub miss_subregion_not_clean: AtomicU64,
    pub miss_entry_dirty: AtomicU64,
    pub miss_multi_block: AtomicU64,
    pub writes_marked: AtomicU64,
    pub activations: AtomicU64,
    pub evictions: AtomicU64,
    pub maps_issued: AtomicU64,
    pub maps_retried: AtomicU64,
    pub maps_completed: AtomicU64,
    pub maps_discarded: AtomicU64,
    pub maps_deferred: AtomicU64,
    pub map_failures: AtomicU64,
    pub notices_received: AtomicU64,
    pub notices_dropped: AtomicU64,
    pub noise_discarded: AtomicU64,
    pub self_heals: AtomicU64,
    pub resets: AtomicU64,
}

impl HpbStats {
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            miss_disabled: self.miss_disabled.load(Ordering::Relaxed),
            miss_region_inactive: self.miss_region_inactive.load(Ordering::Relaxed),
            miss_subregion_not_clean: self.miss_subregion_not_clean.load(Ordering::Relaxed),
            miss_entry_dirty: self.miss_entry_dirty.load(Ordering::Relaxed),
            miss_multi_block: self.miss_multi_block.load(Ordering::Relaxed),
            writes_marked: self.writes_marked.load(Ordering::Relaxed),
            activations: self.activations.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            maps_issued: self.maps_issued.load(Ordering::Relaxed),
            maps_retried: self.maps_retried.load(Ordering::Relaxed),
            maps_completed: self.maps_completed.load(Ordering::Relaxed),
            maps_discarded: self.maps_discarded.load(Ordering::Relaxed),
            maps_deferred: self.maps_deferred.load(Ordering::Relaxed),
            map_failures: self.map_failures.load(Ordering::Relaxed),
            notices_received: self.notices_received.load(Ordering::Relaxed),
            notices_dropped: self.notices_dropped.load(Ordering::Relaxed),
            noise_discarded: self.noise_discarded.load(Ordering::Relaxed),
            self_heals: self.self_heals.load(Ordering::Relaxed),
            resets: self.resets.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`HpbStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub hits: u64,
    pub miss_disabled: u64,
    pub miss_region_inactive: u64,
    pub miss_subregion_not_clean: u64,
    pub miss_entry_dirty: u64,
    pub miss_multi_block: u64,
    pub writes_marked: u64,
    pub activations: u64,
    pub evictions: u64,
    pub maps_issued: u64,
    pub maps_retried: u64,
    pub maps_completed: u64,
    pub maps_discarded: u64,
    pub maps_deferred: u64,
    pub map_failures: u64,
    pub notices_received: u64,
    pub notices_dropped: u64,
    pub noise_discarded: u64,
    pub self_heals: u64,
    pub resets: u64,
}

impl StatsSnapshot {
    /// All read-path misses combined.
    #[must_use]
    pub fn total_misses(&self) -> u64 {
        self.miss_disabled
            + self.miss_region_inactive
            + self.miss_subregion_not_clean
            + self.miss_entry_dirty
            + self.miss_multi_block
    }
}
