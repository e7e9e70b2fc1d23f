#![forbid(unsafe_code)]
//! Per-LU HPB context.
//!
//! One [`HpbLu`] owns the region table for a logical unit plus the two
//! worker threads that keep it converged with the device's hints:
//!
//! - the **scheduler worker** is the single consumer of the notification
//!   queue (the tasklet of the original design): it validates device
//!   hints, drives activation/eviction, and fires map downloads;
//! - the **retry worker** is the only context allowed to sleep: it
//!   resubmits failed pinned-region downloads after a bounded delay.
//!
//! Locking: the cache mutex guards the region table, pool, and bitmaps and
//! is only ever held for short non-blocking sections — it is taken from
//! the prep path, the scheduler, and download completions. The
//! notification and retry queues each have their own mutex + condvar so
//! completion-context enqueues never contend with the cache lock.

use hpb_cache::{
    CacheError, EvictionPolicy, Lookup, RegionState, RegionTable, SubregionState,
};
use hpb_desc::{DeviceNotice, NoticeDecode, RegionUpdate, decode_notice};
use hpb_error::{HpbError, Result};
use hpb_types::{Lba, LuGeometry, LunId, RegionId, SubregionId};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

use crate::command::{IoCommand, IoKind};
use crate::stats::{HpbStats, StatsSnapshot};
use crate::traits::{MapDownloader, MapReadError, MapReadResult, MapRequest};

/// Lifecycle of one LU's HPB feature.
///
/// The attach-failed outcome ("not supported") has no resident state: it
/// is reported through [`HpbLu::attach`]'s error return, and the probe
/// layer simply never builds an engine for that LU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LuState {
    NeedsInit = 0,
    Present = 1,
    ResetPending = 2,
    Failed = 3,
    TornDown = 4,
}

impl LuState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Present,
            2 => Self::ResetPending,
            3 => Self::Failed,
            4 => Self::TornDown,
            _ => Self::NeedsInit,
        }
    }
}

/// Tunables consumed at attach time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HpbConfig {
    pub policy: EvictionPolicy,
    /// Resubmissions allowed for a failed pinned-region download.
    pub map_retry_limit: u8,
    /// Delay before each resubmission.
    pub map_retry_delay: Duration,
    /// Cap on concurrently outstanding map reads; defaults to the LU queue
    /// depth when `None`.
    pub inflight_cap: Option<usize>,
}

impl Default for HpbConfig {
    fn default() -> Self {
        Self {
            policy: EvictionPolicy::Lru,
            map_retry_limit: 3,
            map_retry_delay: Duration::from_millis(100),
            inflight_cap: None,
        }
    }
}

/// A queued device hint awaiting the scheduler.
#[derive(Debug, Clone, Copy)]
enum QueuedNotice {
    Update(RegionUpdate),
    Reset,
}

/// Boundary conversion: cache-internal errors into the unified error type.
fn cache_error(err: &CacheError) -> HpbError {
    match err {
        CacheError::RegionOutOfBounds { region, limit } => HpbError::OutOfBounds {
            what: "region",
            index: u32::from(*region),
            limit: u32::from(*limit),
        },
        CacheError::SubregionOutOfBounds {
            subregion, limit, ..
        } => HpbError::OutOfBounds {
            what: "subregion",
            index: u32::from(*subregion),
            limit: u32::from(*limit),
        },
        CacheError::PoolExhausted => HpbError::PoolExhausted("map-buffer"),
        CacheError::NotCached => HpbError::NotCached,
        other => HpbError::Internal(other.to_string()),
    }
}

#[derive(Debug)]
struct NoticeQueue {
    queue: VecDeque<QueuedNotice>,
    capacity: usize,
}

struct LuShared {
    lun: LunId,
    geometry: LuGeometry,
    state: AtomicU8,
    cache: Mutex<RegionTable>,
    notices: Mutex<NoticeQueue>,
    notice_cv: Condvar,
    retry: Mutex<VecDeque<MapRequest>>,
    retry_cv: Condvar,
    inflight: AtomicUsize,
    inflight_cap: usize,
    map_retry_limit: u8,
    map_retry_delay: Duration,
    stats: HpbStats,
    downloader: Arc<dyn MapDownloader>,
}

impl LuShared {
    fn lifecycle(&self) -> LuState {
        LuState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_lifecycle(&self, state: LuState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Transition lifecycle unless teardown already won the race.
    ///
    /// Workers call this for every state change they make; overwriting
    /// `TornDown` would strand `teardown()` waiting on a join forever.
    fn set_lifecycle_unless_torn_down(&self, state: LuState) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current == LuState::TornDown as u8 {
                return false;
            }
            match self.state.compare_exchange(
                current,
                state as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Queue a notice for the scheduler; `false` drops it (pool full).
    fn enqueue_notice(&self, notice: QueuedNotice) -> bool {
        let mut queue = self.notices.lock();
        if queue.queue.len() >= queue.capacity {
            return false;
        }
        queue.queue.push_back(notice);
        drop(queue);
        self.notice_cv.notify_one();
        true
    }

    // ── Prep path ──────────────────────────────────────────────────────────

    fn prep(&self, cmd: &mut IoCommand) {
        if self.lifecycle() != LuState::Present {
            if cmd.kind == IoKind::Read {
                self.stats.miss_disabled.fetch_add(1, Ordering::Relaxed);
            }
            return;
        }
        match cmd.kind {
            IoKind::Write | IoKind::Unmap => self.mark_write_dirty(cmd.lba, cmd.blocks),
            IoKind::Read => self.classify_read(cmd),
            IoKind::Other => {}
        }
    }

    /// Invalidate every cached entry a write or unmap touches.
    ///
    /// Pure side effect: the command proceeds as a normal write regardless,
    /// so this never blocks submission.
    fn mark_write_dirty(&self, lba: Lba, blocks: u32) {
        let mut next = lba.0;
        let mut remaining = u64::from(blocks);
        let mut marked = false;

        let mut cache = self.cache.lock();
        while remaining > 0 {
            let Some((region, subregion, entry)) = self.geometry.locate(Lba(next)) else {
                break;
            };
            let span = self.geometry.entries_in_subregion(region, subregion) - entry;
            #[expect(clippy::cast_possible_truncation)]
            let count = u64::from(span).min(remaining) as u32;
            if cache.mark_dirty(region, subregion, entry, count) {
                marked = true;
            }
            next += u64::from(count);
            remaining -= u64::from(count);
        }
        drop(cache);

        if marked {
            self.stats.writes_marked.fetch_add(1, Ordering::Relaxed);
            trace!(
                target: "hpb::prep",
                lun = self.lun.0,
                lba = lba.0,
                blocks,
                "write_marked_dirty"
            );
        }
    }

    /// Decide direct-physical versus normal read for a single command.
    ///
    /// The lock is held only long enough to classify and copy the cached
    /// address out; the rewrite happens after release.
    fn classify_read(&self, cmd: &mut IoCommand) {
        if cmd.blocks != 1 {
            self.stats.miss_multi_block.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let outcome = {
            let mut cache = self.cache.lock();
            let outcome = cache.lookup(cmd.lba);
            if matches!(outcome, Lookup::Hit(_)) {
                if let Some((region, _, _)) = self.geometry.locate(cmd.lba) {
                    cache.record_hit(region);
                }
            }
            outcome
        };

        match outcome {
            Lookup::Hit(ppn) => {
                cmd.rewrite_direct(ppn);
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                trace!(
                    target: "hpb::prep",
                    lun = self.lun.0,
                    lba = cmd.lba.0,
                    ppn = ppn.0,
                    "read_rewritten_direct"
                );
            }
            Lookup::RegionInactive => {
                self.stats.miss_region_inactive.fetch_add(1, Ordering::Relaxed);
            }
            Lookup::SubregionNotClean => {
                self.stats
                    .miss_subregion_not_clean
                    .fetch_add(1, Ordering::Relaxed);
            }
            Lookup::EntryDirty => {
                self.stats.miss_entry_dirty.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    // ── Response path ──────────────────────────────────────────────────────

    fn on_response(&self, upiu: &[u8]) {
        if !matches!(self.lifecycle(), LuState::Present | LuState::ResetPending) {
            return;
        }

        match decode_notice(upiu) {
            Err(err) => {
                // The device may legitimately send data this host version
                // does not understand; noise, not an error.
                self.stats.noise_discarded.fetch_add(1, Ordering::Relaxed);
                debug!(target: "hpb::rsp", lun = self.lun.0, %err, "notice_noise_discarded");
            }
            Ok(NoticeDecode::None) => {
                // Completion tick with no payload: wake the scheduler if
                // anything is pending.
                if !self.notices.lock().queue.is_empty() {
                    self.notice_cv.notify_one();
                }
            }
            Ok(NoticeDecode::Notice(DeviceNotice::DeviceReset { .. })) => {
                self.stats.notices_received.fetch_add(1, Ordering::Relaxed);
                warn!(target: "hpb::rsp", lun = self.lun.0, "device_reset_notice");
                if !self.enqueue_notice(QueuedNotice::Reset) {
                    self.stats.notices_dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
            Ok(NoticeDecode::Notice(DeviceNotice::RegionUpdate(update))) => {
                self.stats.notices_received.fetch_add(1, Ordering::Relaxed);
                debug!(
                    target: "hpb::rsp",
                    lun = self.lun.0,
                    active = update.active().len(),
                    inactive = update.inactive().len(),
                    "region_update_notice"
                );
                if !self.enqueue_notice(QueuedNotice::Update(update)) {
                    self.stats.notices_dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    // ── Scheduler worker ───────────────────────────────────────────────────

    fn scheduler_loop(self: &Arc<Self>) {
        loop {
            let notice = {
                let mut queue = self.notices.lock();
                loop {
                    if self.lifecycle() == LuState::TornDown {
                        return;
                    }
                    if let Some(notice) = queue.queue.pop_front() {
                        break notice;
                    }
                    self.notice_cv.wait(&mut queue);
                }
            };
            match notice {
                QueuedNotice::Update(update) => self.process_update(&update),
                QueuedNotice::Reset => self.handle_device_reset(),
            }
        }
    }

    fn process_update(self: &Arc<Self>, update: &RegionUpdate) {
        if self.lifecycle() != LuState::Present {
            return;
        }

        // Bounds validation comes first: an out-of-bounds index means host
        // and device disagree about geometry, and nothing in this notice
        // can be trusted.
        let bounds = {
            let cache = self.cache.lock();
            update
                .active()
                .iter()
                .try_for_each(|(r, sr)| cache.validate_subregion(*r, *sr))
                .and_then(|()| {
                    update
                        .inactive()
                        .iter()
                        .try_for_each(|r| cache.validate_region(*r))
                })
        };
        if let Err(err) = bounds {
            let err = cache_error(&err);
            error!(target: "hpb::sched", lun = self.lun.0, %err, "notice_out_of_bounds");
            self.mark_failed();
            return;
        }

        let mut to_issue: Vec<MapRequest> = Vec::with_capacity(
            update.active().len() * usize::from(self.geometry.subregions_per_region()),
        );
        {
            let mut cache = self.cache.lock();

            // Inactive entries apply first, so a region named in both lists
            // ends up activated rather than evicted.
            for region in update.inactive() {
                match cache.evict_region(*region) {
                    Ok(()) => {
                        self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(CacheError::RegionPinned(_)) => {
                        warn!(
                            target: "hpb::sched",
                            lun = self.lun.0,
                            region = region.0,
                            "ignored_evict_of_pinned_region"
                        );
                    }
                    Err(_) => {}
                }
            }

            for (region, _) in update.active() {
                let resident = cache
                    .region_state(*region)
                    .map(RegionState::is_resident)
                    .unwrap_or(false);
                if resident {
                    cache.record_hit(*region);
                    continue;
                }
                if cache.at_budget() {
                    let Some(victim) = cache.choose_victim() else {
                        debug!(
                            target: "hpb::sched",
                            lun = self.lun.0,
                            region = region.0,
                            "no_victim_activation_skipped"
                        );
                        continue;
                    };
                    if cache.evict_region(victim).is_ok() {
                        self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                    }
                }
                match cache.activate_region(*region) {
                    Ok(()) => {
                        self.stats.activations.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(err) => {
                        error!(
                            target: "hpb::sched",
                            lun = self.lun.0,
                            region = region.0,
                            %err,
                            "activation_failed"
                        );
                        continue;
                    }
                }
            }

            // Fire downloads for the named subregions that are still DIRTY.
            // Unnamed subregions of a fresh region wait for the device to
            // name them in a later notice.
            for (region, subregion) in update.active() {
                self.queue_download(&mut cache, *region, *subregion, &mut to_issue);
            }
        }

        for request in to_issue {
            self.submit_map(request);
        }
    }

    /// If `(region, subregion)` is DIRTY, move it to ISSUED and queue its
    /// map request, respecting the in-flight cap.
    ///
    /// Called with the cache lock held; `out` was sized by the caller so
    /// pushes never reallocate under the lock.
    fn queue_download(
        &self,
        cache: &mut RegionTable,
        region: RegionId,
        subregion: SubregionId,
        out: &mut Vec<MapRequest>,
    ) {
        if cache.subregion_state(region, subregion) != Ok(SubregionState::Dirty) {
            return;
        }
        if self.inflight.load(Ordering::Acquire) + out.len() >= self.inflight_cap {
            self.stats.maps_deferred.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if cache.begin_download(region, subregion).is_ok() {
            out.push(MapRequest {
                lun: self.lun,
                region,
                subregion,
                len: self.geometry.map_read_len(region, subregion),
                retries: 0,
            });
        }
    }

    /// Queue downloads for every DIRTY subregion of `region` — the pinned
    /// initial-load and reset paths, where the whole region re-downloads.
    fn collect_dirty_downloads(
        &self,
        cache: &mut RegionTable,
        region: RegionId,
        out: &mut Vec<MapRequest>,
    ) {
        for sr in 0..self.geometry.subregions_in_region(region) {
            self.queue_download(cache, region, SubregionId(sr), out);
        }
    }

    fn submit_map(self: &Arc<Self>, request: MapRequest) {
        self.inflight.fetch_add(1, Ordering::AcqRel);
        self.stats.maps_issued.fetch_add(1, Ordering::Relaxed);
        debug!(
            target: "hpb::sched",
            lun = self.lun.0,
            region = request.region.0,
            subregion = request.subregion.0,
            len = request.len,
            retries = request.retries,
            "map_read_submitted"
        );

        let shared = Arc::clone(self);
        self.downloader.submit_map_read(
            request,
            Box::new(move |result| shared.on_map_complete(&request, result)),
        );
    }

    // ── Download completion (transport context) ────────────────────────────

    fn on_map_complete(&self, request: &MapRequest, result: MapReadResult) {
        self.inflight.fetch_sub(1, Ordering::AcqRel);
        if self.lifecycle() == LuState::TornDown {
            return;
        }

        match result {
            Ok(bytes) => {
                let applied = self
                    .cache
                    .lock()
                    .complete_download(request.region, request.subregion, &bytes);
                match applied {
                    Ok(()) => {
                        self.stats.maps_completed.fetch_add(1, Ordering::Relaxed);
                        trace!(
                            target: "hpb::sched",
                            lun = self.lun.0,
                            region = request.region.0,
                            subregion = request.subregion.0,
                            "map_read_applied"
                        );
                    }
                    Err(err @ CacheError::BadMapLength { .. }) => {
                        self.stats.map_failures.fetch_add(1, Ordering::Relaxed);
                        self.cache
                            .lock()
                            .download_abandoned(request.region, request.subregion);
                        warn!(
                            target: "hpb::sched",
                            lun = self.lun.0,
                            region = request.region.0,
                            %err,
                            "map_read_bad_length"
                        );
                    }
                    Err(_) => {
                        // Lost the race with eviction or a newer write; the
                        // result is moot.
                        self.stats.maps_discarded.fetch_add(1, Ordering::Relaxed);
                        debug!(
                            target: "hpb::sched",
                            lun = self.lun.0,
                            region = request.region.0,
                            subregion = request.subregion.0,
                            "map_read_discarded"
                        );
                    }
                }
            }
            Err(MapReadError::RegionNotRecognized) => {
                self.stats.map_failures.fetch_add(1, Ordering::Relaxed);
                if self.geometry.is_pinned(request.region) {
                    self.requeue_pinned(request);
                } else {
                    // The device told us asynchronously it no longer knows
                    // this region; converge by replaying it as an inactive
                    // notice.
                    self.cache
                        .lock()
                        .download_abandoned(request.region, request.subregion);
                    self.stats.self_heals.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        target: "hpb::sched",
                        lun = self.lun.0,
                        region = request.region.0,
                        "region_not_recognized_self_healing"
                    );
                    let update = RegionUpdate::inactive_only(self.lun, request.region);
                    if !self.enqueue_notice(QueuedNotice::Update(update)) {
                        self.stats.notices_dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            Err(MapReadError::Device(detail)) => {
                // Stat only: the device is expected to resend guidance, and
                // the subregion can still be evicted under pressure.
                self.stats.map_failures.fetch_add(1, Ordering::Relaxed);
                debug!(
                    target: "hpb::sched",
                    lun = self.lun.0,
                    region = request.region.0,
                    subregion = request.subregion.0,
                    detail,
                    "map_read_failed"
                );
            }
        }
    }

    fn requeue_pinned(&self, request: &MapRequest) {
        if request.retries >= self.map_retry_limit {
            self.cache
                .lock()
                .download_abandoned(request.region, request.subregion);
            error!(
                target: "hpb::sched",
                lun = self.lun.0,
                region = request.region.0,
                subregion = request.subregion.0,
                retries = request.retries,
                "pinned_map_read_retries_exhausted"
            );
            return;
        }

        let retry = MapRequest {
            retries: request.retries + 1,
            ..*request
        };
        self.retry.lock().push_back(retry);
        self.retry_cv.notify_one();
        self.stats.maps_retried.fetch_add(1, Ordering::Relaxed);
    }

    // ── Retry worker ───────────────────────────────────────────────────────

    fn retry_loop(self: &Arc<Self>) {
        loop {
            let request = {
                let mut queue = self.retry.lock();
                loop {
                    if self.lifecycle() == LuState::TornDown {
                        return;
                    }
                    if let Some(request) = queue.pop_front() {
                        break request;
                    }
                    self.retry_cv.wait(&mut queue);
                }
            };

            // Bounded backoff; a teardown notification cuts it short. A
            // concurrent enqueue may also wake this early, which only
            // shortens the delay.
            {
                let mut queue = self.retry.lock();
                let _ = self.retry_cv.wait_for(&mut queue, self.map_retry_delay);
            }
            if self.lifecycle() == LuState::TornDown {
                return;
            }

            // The subregion may have been reset or evicted while we slept.
            let still_issued = {
                let cache = self.cache.lock();
                cache.subregion_state(request.region, request.subregion)
                    == Ok(SubregionState::Issued)
            };
            if !still_issued {
                self.stats.maps_discarded.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            self.submit_map(request);
        }
    }

    // ── Device reset and failure ───────────────────────────────────────────

    /// Device-initiated full invalidation: every cached table is provably
    /// stale. Active regions are dropped; pinned regions keep their
    /// buffers, go back to DIRTY, and re-download everything.
    fn handle_device_reset(self: &Arc<Self>) {
        if self.lifecycle() != LuState::Present {
            return;
        }
        if !self.set_lifecycle_unless_torn_down(LuState::ResetPending) {
            return;
        }
        self.stats.resets.fetch_add(1, Ordering::Relaxed);
        info!(target: "hpb::lifecycle", lun = self.lun.0, "device_reset_begin");

        self.retry.lock().clear();
        self.notices.lock().queue.clear();

        let mut to_issue: Vec<MapRequest> = Vec::with_capacity(
            usize::from(self.geometry.pinned_count())
                * usize::from(self.geometry.subregions_per_region()),
        );
        {
            let mut cache = self.cache.lock();
            for r in 0..self.geometry.region_count() {
                let region = RegionId(r);
                match cache.region_state(region) {
                    Ok(RegionState::Active) => {
                        if cache.evict_region(region).is_ok() {
                            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    Ok(RegionState::Pinned) => cache.mark_region_all_dirty(region),
                    _ => {}
                }
            }
            for region in self.geometry.pinned_regions() {
                self.collect_dirty_downloads(&mut cache, region, &mut to_issue);
            }
        }
        for request in to_issue {
            self.submit_map(request);
        }

        if self.set_lifecycle_unless_torn_down(LuState::Present) {
            info!(target: "hpb::lifecycle", lun = self.lun.0, "device_reset_complete");
        }
    }

    /// Host/device geometry desync: stop trusting HPB for the rest of the
    /// attachment. Ordinary I/O is unaffected; only the acceleration is
    /// forfeited.
    fn mark_failed(&self) {
        if !self.set_lifecycle_unless_torn_down(LuState::Failed) {
            return;
        }
        self.cache.lock().release_all();
        self.notices.lock().queue.clear();
        self.retry.lock().clear();
        error!(target: "hpb::lifecycle", lun = self.lun.0, "hpb_failed_feature_disabled");
    }
}

// ── Public handle ──────────────────────────────────────────────────────────

/// Per-LU HPB engine handle.
///
/// Construct with [`HpbLu::attach`]; feed every outgoing command through
/// [`prep`](Self::prep) and every completion's response UPIU through
/// [`on_response`](Self::on_response). Dropping the handle tears the
/// engine down.
pub struct HpbLu {
    shared: Arc<LuShared>,
    scheduler: Option<JoinHandle<()>>,
    retry_worker: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for HpbLu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HpbLu")
            .field("lun", &self.shared.lun)
            .field("state", &self.shared.lifecycle())
            .field("stats", &self.shared.stats.snapshot())
            .finish_non_exhaustive()
    }
}

impl HpbLu {
    /// Build the table and pools, spawn the workers, and activate the
    /// device-designated pinned regions.
    pub fn attach(
        lun: LunId,
        geometry: LuGeometry,
        downloader: Arc<dyn MapDownloader>,
        config: &HpbConfig,
    ) -> Result<Self> {
        let shared = Arc::new(LuShared {
            lun,
            geometry,
            state: AtomicU8::new(LuState::NeedsInit as u8),
            cache: Mutex::new(RegionTable::new(geometry, config.policy)),
            notices: Mutex::new(NoticeQueue {
                queue: VecDeque::with_capacity(usize::from(geometry.queue_depth())),
                capacity: usize::from(geometry.queue_depth()),
            }),
            notice_cv: Condvar::new(),
            retry: Mutex::new(VecDeque::new()),
            retry_cv: Condvar::new(),
            inflight: AtomicUsize::new(0),
            inflight_cap: config
                .inflight_cap
                .unwrap_or(usize::from(geometry.queue_depth())),
            map_retry_limit: config.map_retry_limit,
            map_retry_delay: config.map_retry_delay,
            stats: HpbStats::default(),
            downloader,
        });

        let scheduler = std::thread::Builder::new()
            .name(format!("hpb-sched-{}", lun.0))
            .spawn({
                let shared = Arc::clone(&shared);
                move || shared.scheduler_loop()
            })
            .map_err(|e| HpbError::Worker(e.to_string()))?;
        let mut lu = Self {
            shared,
            scheduler: Some(scheduler),
            retry_worker: None,
        };

        let retry_worker = std::thread::Builder::new()
            .name(format!("hpb-retry-{}", lun.0))
            .spawn({
                let shared = Arc::clone(&lu.shared);
                move || shared.retry_loop()
            });
        match retry_worker {
            Ok(handle) => lu.retry_worker = Some(handle),
            Err(e) => {
                lu.teardown();
                return Err(HpbError::Worker(e.to_string()));
            }
        }

        // Pinned regions are resident from attach onwards: bind buffers and
        // queue their initial downloads before the feature goes live.
        let mut to_issue: Vec<MapRequest> = Vec::with_capacity(
            usize::from(geometry.pinned_count()) * usize::from(geometry.subregions_per_region()),
        );
        {
            let mut cache = lu.shared.cache.lock();
            for region in geometry.pinned_regions() {
                if let Err(err) = cache.activate_region(region) {
                    drop(cache);
                    lu.teardown();
                    return Err(cache_error(&err));
                }
                lu.shared.stats.activations.fetch_add(1, Ordering::Relaxed);
            }
            for region in geometry.pinned_regions() {
                lu.shared
                    .collect_dirty_downloads(&mut cache, region, &mut to_issue);
            }
        }
        lu.shared.set_lifecycle(LuState::Present);
        for request in to_issue {
            lu.shared.submit_map(request);
        }

        info!(
            target: "hpb::lifecycle",
            lun = lun.0,
            regions = geometry.region_count(),
            max_active = geometry.max_active_regions(),
            pinned = geometry.pinned_count(),
            "hpb_attached"
        );
        Ok(lu)
    }

    #[must_use]
    pub fn lun(&self) -> LunId {
        self.shared.lun
    }

    #[must_use]
    pub fn geometry(&self) -> &LuGeometry {
        &self.shared.geometry
    }

    #[must_use]
    pub fn state(&self) -> LuState {
        self.shared.lifecycle()
    }

    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Inspect a region's lifecycle state (diagnostics).
    #[must_use]
    pub fn region_state(&self, region: RegionId) -> Option<RegionState> {
        self.shared.cache.lock().region_state(region).ok()
    }

    /// Inspect a subregion's lifecycle state (diagnostics).
    #[must_use]
    pub fn subregion_state(
        &self,
        region: RegionId,
        subregion: SubregionId,
    ) -> Option<SubregionState> {
        self.shared
            .cache
            .lock()
            .subregion_state(region, subregion)
            .ok()
    }

    /// Intercept one command before submission (hot path).
    pub fn prep(&self, cmd: &mut IoCommand) {
        self.shared.prep(cmd);
    }

    /// Feed one command completion's response UPIU through the engine.
    pub fn on_response(&self, upiu: &[u8]) {
        self.shared.on_response(upiu);
    }

    /// Cancel-and-wait teardown. Idempotent; also runs on drop.
    pub fn teardown(&mut self) {
        self.shared.set_lifecycle(LuState::TornDown);
        // Notify under each queue mutex: a worker between its lifecycle
        // check and its wait holds that mutex, so this cannot slip into
        // the gap and strand it.
        {
            let _queue = self.shared.notices.lock();
            self.shared.notice_cv.notify_all();
        }
        {
            let _queue = self.shared.retry.lock();
            self.shared.retry_cv.notify_all();
        }
        if let Some(handle) = self.scheduler.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.retry_worker.take() {
            let _ = handle.join();
        }
        self.shared.cache.lock().release_all();
        self.shared.notices.lock().queue.clear();
        self.shared.retry.lock().clear();
    }
}

impl Drop for HpbLu {
    fn drop(&mut self) {
        self.teardown();
    }
}
