#![forbid(unsafe_code)]
//! Region/subregion table and eviction policy.
//!
//! State machine per subregion: `UNUSED → DIRTY → ISSUED → CLEAN`, with
//! `CLEAN → DIRTY` and `ISSUED → DIRTY` when a write invalidates entries,
//! and `→ UNUSED` only through eviction. Regions move `INACTIVE ⇄ ACTIVE`
//! under a device-given budget; pinned regions are resident from attach to
//! teardown and never compete for the budget's LRU list.
//!
//! Budget accounting: `active_count` tracks ACTIVE regions only. The
//! activation budget is `max_active_regions − pinned_count`, so ACTIVE
//! plus PINNED can never exceed the device maximum, and the pool (sized
//! `max_active_regions × subregions_per_region`) can never run dry as long
//! as callers evict before activating past the budget.

use crate::pool::{MctxId, MctxPool};
use hpb_types::{Lba, LuGeometry, Ppn, RegionId, SubregionId};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use thiserror::Error;
use tracing::debug;

/// Region lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegionState {
    Inactive,
    Active,
    Pinned,
}

impl RegionState {
    /// Whether map buffers are bound and reads may consult the cache.
    #[must_use]
    pub fn is_resident(self) -> bool {
        matches!(self, Self::Active | Self::Pinned)
    }
}

/// Subregion lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubregionState {
    Unused,
    Dirty,
    Issued,
    Clean,
}

/// Victim-choice policy for the active-region list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EvictionPolicy {
    #[default]
    Lru,
    Lfu,
}

/// Outcome of a cached-address lookup on the read path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    Hit(Ppn),
    RegionInactive,
    SubregionNotClean,
    EntryDirty,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("region {region} out of bounds (limit {limit})")]
    RegionOutOfBounds { region: u16, limit: u16 },
    #[error("subregion {subregion} of region {region} out of bounds (limit {limit})")]
    SubregionOutOfBounds {
        region: u16,
        subregion: u16,
        limit: u16,
    },
    #[error("region {0} is not active")]
    RegionNotActive(u16),
    #[error("region {0} is already resident")]
    RegionAlreadyResident(u16),
    #[error("region {0} is pinned and cannot be evicted")]
    RegionPinned(u16),
    #[error("active-region budget is exhausted, evict first")]
    AtBudget,
    #[error("map-buffer pool unexpectedly empty")]
    PoolExhausted,
    #[error("subregion is no longer cached")]
    NotCached,
    #[error("map download length mismatch: expected {expected} bytes, got {got}")]
    BadMapLength { expected: usize, got: usize },
}

#[derive(Debug)]
struct Subregion {
    state: SubregionState,
    mctx: Option<MctxId>,
}

#[derive(Debug)]
struct Region {
    state: RegionState,
    hits: u32,
    subregions: Vec<Subregion>,
}

/// Per-LU region table, map-buffer pool, and active-region list.
///
/// No interior locking: the owning context serializes all access through
/// its cache mutex.
#[derive(Debug)]
pub struct RegionTable {
    geometry: LuGeometry,
    policy: EvictionPolicy,
    regions: Vec<Region>,
    /// ACTIVE regions, head = coldest. PINNED regions never appear here.
    lru: VecDeque<RegionId>,
    active_count: u16,
    pool: MctxPool,
}

impl RegionTable {
    #[must_use]
    pub fn new(geometry: LuGeometry, policy: EvictionPolicy) -> Self {
        let regions = (0..geometry.region_count())
            .map(|r| {
                let subregions = (0..geometry.subregions_in_region(RegionId(r)))
                    .map(|_| Subregion {
                        state: SubregionState::Unused,
                        mctx: None,
                    })
                    .collect();
                Region {
                    state: RegionState::Inactive,
                    hits: 0,
                    subregions,
                }
            })
            .collect();

        let pool_entries =
            usize::from(geometry.max_active_regions()) * usize::from(geometry.subregions_per_region());
        Self {
            geometry,
            policy,
            regions,
            lru: VecDeque::new(),
            active_count: 0,
            pool: MctxPool::new(pool_entries, geometry.entries_per_subregion()),
        }
    }

    #[must_use]
    pub fn geometry(&self) -> &LuGeometry {
        &self.geometry
    }

    #[must_use]
    pub fn active_count(&self) -> u16 {
        self.active_count
    }

    /// ACTIVE-region budget (device maximum minus the pinned reservation).
    #[must_use]
    pub fn active_budget(&self) -> u16 {
        self.geometry.max_active_regions() - self.geometry.pinned_count()
    }

    #[must_use]
    pub fn at_budget(&self) -> bool {
        self.active_count >= self.active_budget()
    }

    #[must_use]
    pub fn pool_free_count(&self) -> usize {
        self.pool.free_count()
    }

    pub fn validate_region(&self, region: RegionId) -> Result<(), CacheError> {
        if region.0 >= self.geometry.region_count() {
            return Err(CacheError::RegionOutOfBounds {
                region: region.0,
                limit: self.geometry.region_count(),
            });
        }
        Ok(())
    }

    pub fn validate_subregion(
        &self,
        region: RegionId,
        subregion: SubregionId,
    ) -> Result<(), CacheError> {
        self.validate_region(region)?;
        let limit = self.geometry.subregions_in_region(region);
        if subregion.0 >= limit {
            return Err(CacheError::SubregionOutOfBounds {
                region: region.0,
                subregion: subregion.0,
                limit,
            });
        }
        Ok(())
    }

    pub fn region_state(&self, region: RegionId) -> Result<RegionState, CacheError> {
        self.validate_region(region)?;
        Ok(self.regions[usize::from(region.0)].state)
    }

    pub fn subregion_state(
        &self,
        region: RegionId,
        subregion: SubregionId,
    ) -> Result<SubregionState, CacheError> {
        self.validate_subregion(region, subregion)?;
        Ok(self.regions[usize::from(region.0)].subregions[usize::from(subregion.0)].state)
    }

    // ── Activation / eviction ──────────────────────────────────────────────

    /// Bind a map buffer to every subregion and mark them all DIRTY.
    ///
    /// Nothing cached is trustworthy until proven by a completed download,
    /// so a freshly activated region serves no direct reads. Pinned regions
    /// activate outside the LRU list and outside the ACTIVE budget.
    pub fn activate_region(&mut self, region: RegionId) -> Result<(), CacheError> {
        self.validate_region(region)?;
        let pinned = self.geometry.is_pinned(region);
        let slot = &self.regions[usize::from(region.0)];
        if slot.state.is_resident() {
            return Err(CacheError::RegionAlreadyResident(region.0));
        }
        if !pinned && self.at_budget() {
            return Err(CacheError::AtBudget);
        }

        let sub_count = self.regions[usize::from(region.0)].subregions.len();
        for sr in 0..sub_count {
            let Some(id) = self.pool.take() else {
                // Unwind partial binding before reporting the breach.
                self.release_subregions(region);
                return Err(CacheError::PoolExhausted);
            };
            let slot = &mut self.regions[usize::from(region.0)].subregions[sr];
            slot.mctx = Some(id);
            slot.state = SubregionState::Dirty;
        }

        let slot = &mut self.regions[usize::from(region.0)];
        slot.hits = 0;
        if pinned {
            slot.state = RegionState::Pinned;
        } else {
            slot.state = RegionState::Active;
            self.active_count += 1;
            self.lru.push_back(region);
        }

        debug!(
            target: "hpb::cache",
            region = region.0,
            pinned,
            active = self.active_count,
            "region_activated"
        );
        Ok(())
    }

    /// Return every subregion's map buffer and reset the region to INACTIVE.
    pub fn evict_region(&mut self, region: RegionId) -> Result<(), CacheError> {
        self.validate_region(region)?;
        match self.regions[usize::from(region.0)].state {
            RegionState::Pinned => return Err(CacheError::RegionPinned(region.0)),
            RegionState::Inactive => return Err(CacheError::RegionNotActive(region.0)),
            RegionState::Active => {}
        }

        self.release_subregions(region);
        let slot = &mut self.regions[usize::from(region.0)];
        slot.state = RegionState::Inactive;
        slot.hits = 0;
        self.active_count -= 1;
        if let Some(pos) = self.lru.iter().position(|r| *r == region) {
            let _ = self.lru.remove(pos);
        }

        debug!(
            target: "hpb::cache",
            region = region.0,
            active = self.active_count,
            "region_evicted"
        );
        Ok(())
    }

    fn release_subregions(&mut self, region: RegionId) {
        let sub_count = self.regions[usize::from(region.0)].subregions.len();
        for sr in 0..sub_count {
            let slot = &mut self.regions[usize::from(region.0)].subregions[sr];
            slot.state = SubregionState::Unused;
            if let Some(id) = slot.mctx.take() {
                self.pool.give_back(id);
            }
        }
    }

    /// Record a cache-relevant touch on a resident region.
    ///
    /// Moves the region to the warm end of the active list; under LFU also
    /// bumps its saturating hit counter. Ignored for pinned or inactive
    /// regions.
    pub fn record_hit(&mut self, region: RegionId) {
        let Ok(state) = self.region_state(region) else {
            return;
        };
        if state != RegionState::Active {
            return;
        }
        if self.policy == EvictionPolicy::Lfu {
            let slot = &mut self.regions[usize::from(region.0)];
            slot.hits = slot.hits.saturating_add(1);
        }
        if let Some(pos) = self.lru.iter().position(|r| *r == region) {
            let _ = self.lru.remove(pos);
            self.lru.push_back(region);
        }
    }

    /// Pick the eviction victim among ACTIVE regions.
    ///
    /// LRU: the coldest list entry. LFU: minimum hit count, list order
    /// breaking ties. PINNED regions are never in the list.
    #[must_use]
    pub fn choose_victim(&self) -> Option<RegionId> {
        match self.policy {
            EvictionPolicy::Lru => self.lru.front().copied(),
            EvictionPolicy::Lfu => self
                .lru
                .iter()
                .copied()
                .min_by_key(|r| self.regions[usize::from(r.0)].hits),
        }
    }

    // ── Dirty tracking and lookup ──────────────────────────────────────────

    /// Invalidate `count` entries of `(region, subregion)` starting at
    /// `entry`.
    ///
    /// Returns `false` (nothing to mark) when the region is not resident.
    /// A CLEAN or ISSUED subregion reverts to DIRTY: any in-flight
    /// download's result is moot once a newer write has landed.
    pub fn mark_dirty(
        &mut self,
        region: RegionId,
        subregion: SubregionId,
        entry: u32,
        count: u32,
    ) -> bool {
        if self.validate_subregion(region, subregion).is_err() {
            return false;
        }
        if !self.regions[usize::from(region.0)].state.is_resident() {
            return false;
        }

        let slot = &mut self.regions[usize::from(region.0)].subregions[usize::from(subregion.0)];
        let Some(id) = slot.mctx else {
            return false;
        };
        self.pool.get_mut(id).dirty_mut().set_range(entry, count);
        if matches!(slot.state, SubregionState::Clean | SubregionState::Issued) {
            slot.state = SubregionState::Dirty;
        }
        true
    }

    /// Classify a one-block read against the cache.
    pub fn lookup(&self, lba: Lba) -> Lookup {
        let Some((region, subregion, entry)) = self.geometry.locate(lba) else {
            return Lookup::RegionInactive;
        };
        let slot = &self.regions[usize::from(region.0)];
        if !slot.state.is_resident() {
            return Lookup::RegionInactive;
        }
        let sub = &slot.subregions[usize::from(subregion.0)];
        if sub.state != SubregionState::Clean {
            return Lookup::SubregionNotClean;
        }
        let Some(id) = sub.mctx else {
            return Lookup::SubregionNotClean;
        };
        let mctx = self.pool.get(id);
        if mctx.dirty().is_set(entry) {
            return Lookup::EntryDirty;
        }
        match mctx.ppn(entry) {
            Some(ppn) => Lookup::Hit(ppn),
            None => Lookup::SubregionNotClean,
        }
    }

    // ── Download state transitions ─────────────────────────────────────────

    /// Transition a DIRTY subregion to ISSUED and clear its dirty bitmap.
    ///
    /// Fails with [`CacheError::NotCached`] when the subregion lost its map
    /// buffer to a concurrent eviction or is not DIRTY — the caller skips
    /// issuing a download for it.
    pub fn begin_download(
        &mut self,
        region: RegionId,
        subregion: SubregionId,
    ) -> Result<(), CacheError> {
        self.validate_subregion(region, subregion)?;
        if !self.regions[usize::from(region.0)].state.is_resident() {
            return Err(CacheError::NotCached);
        }
        let slot = &mut self.regions[usize::from(region.0)].subregions[usize::from(subregion.0)];
        if slot.state != SubregionState::Dirty {
            return Err(CacheError::NotCached);
        }
        let Some(id) = slot.mctx else {
            return Err(CacheError::NotCached);
        };
        self.pool.get_mut(id).dirty_mut().clear_all();
        slot.state = SubregionState::Issued;
        Ok(())
    }

    /// Apply a completed map download and transition ISSUED → CLEAN.
    ///
    /// `data` is the raw wire payload: big-endian u64 entries. Fails with
    /// [`CacheError::NotCached`] when the subregion was evicted or re-marked
    /// DIRTY while the download was in flight — the result is discarded.
    pub fn complete_download(
        &mut self,
        region: RegionId,
        subregion: SubregionId,
        data: &[u8],
    ) -> Result<(), CacheError> {
        self.validate_subregion(region, subregion)?;
        if !self.regions[usize::from(region.0)].state.is_resident() {
            return Err(CacheError::NotCached);
        }

        let expected = self.geometry.map_read_len(region, subregion) as usize;
        if data.len() != expected {
            return Err(CacheError::BadMapLength {
                expected,
                got: data.len(),
            });
        }

        let slot = &mut self.regions[usize::from(region.0)].subregions[usize::from(subregion.0)];
        if slot.state != SubregionState::Issued {
            return Err(CacheError::NotCached);
        }
        let Some(id) = slot.mctx else {
            return Err(CacheError::NotCached);
        };

        let entries: Vec<u64> = data
            .chunks_exact(8)
            .map(|c| u64::from_be_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
            .collect();
        self.pool.get_mut(id).load_entries(&entries);
        slot.state = SubregionState::Clean;
        Ok(())
    }

    /// Give up on an outstanding download: ISSUED reverts to DIRTY so a
    /// later notification can re-drive it. No-op in any other state.
    pub fn download_abandoned(&mut self, region: RegionId, subregion: SubregionId) {
        if self.validate_subregion(region, subregion).is_err() {
            return;
        }
        let slot = &mut self.regions[usize::from(region.0)].subregions[usize::from(subregion.0)];
        if slot.state == SubregionState::Issued {
            slot.state = SubregionState::Dirty;
        }
    }

    /// Release every resident region, pinned included.
    ///
    /// Used by the failure and teardown paths, where the whole cache stops
    /// being trustworthy at once. Every map buffer returns to the pool and
    /// every region ends INACTIVE.
    pub fn release_all(&mut self) {
        for r in 0..self.geometry.region_count() {
            let region = RegionId(r);
            if self.regions[usize::from(r)].state.is_resident() {
                self.release_subregions(region);
                let slot = &mut self.regions[usize::from(r)];
                slot.state = RegionState::Inactive;
                slot.hits = 0;
            }
        }
        self.lru.clear();
        self.active_count = 0;
    }

    /// Mark every bound subregion of a resident region DIRTY.
    ///
    /// Used on device reset for pinned regions, which keep their buffers
    /// but must re-download everything.
    pub fn mark_region_all_dirty(&mut self, region: RegionId) {
        if self.validate_region(region).is_err() {
            return;
        }
        if !self.regions[usize::from(region.0)].state.is_resident() {
            return;
        }
        for sub in &mut self.regions[usize::from(region.0)].subregions {
            if sub.mctx.is_some() {
                sub.state = SubregionState::Dirty;
            }
        }
    }
}
