//! Paging of optimizer state between a fast and a slow tier
//!
//! Every registered value lives behind a slot: a descriptor guarded by
//! its own mutex and condition variable. The registry itself is a sharded
//! `DashMap` and is never locked across a migration, so buffers on other
//! pages keep making progress while one page moves.
//!
//! Residency follows a small state machine:
//!
//! ```text
//!  ResidentFast --pressure--> Migrating(ToSlow) --stored--> ResidentSlow
//!  ResidentSlow --acquire---> Migrating(ToFast) --taken---> ResidentFast
//! ```
//!
//! A failed migration restores the previous residency. The fast copy stays
//! authoritative until the slow tier confirms a store, and a restore installs
//! the bytes taken from the slow tier under the descriptor lock, so there is
//! exactly one authoritative copy at any instant. A thread never holds two
//! descriptor locks at once.

pub mod policy;
pub mod tier;

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use dashmap::DashMap;
use parking_lot::{Condvar, MappedMutexGuard, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::PagingConfig;
use crate::{OptimError, Result};
use policy::{PressurePolicy, PressureSnapshot};
use tier::{HostTier, SlowTier, TierError};

/// Unique identifier of a registered page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageId(Uuid);

impl PageId {
    /// Creates a fresh random id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Direction of an in-flight migration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Fast tier to slow tier
    ToSlow,
    /// Slow tier to fast tier
    ToFast,
}

/// Where the authoritative copy of a page lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    /// In the fast tier, usable without migration
    ResidentFast,
    /// In the slow tier, must be restored before use
    ResidentSlow,
    /// Moving between tiers
    Migrating(Direction),
}

/// A value that can be moved to the slow tier as bytes
pub trait Pageable: Send + Sized + 'static {
    /// Fast-tier footprint in bytes
    fn size_bytes(&self) -> usize;

    /// Serializes the value for the slow tier
    fn to_page_bytes(&self) -> Result<Vec<u8>>;

    /// Rebuilds a value from bytes produced by [`Pageable::to_page_bytes`]
    fn from_page_bytes(bytes: &[u8]) -> Result<Self>;
}

impl Pageable for Vec<f32> {
    fn size_bytes(&self) -> usize {
        self.len() * std::mem::size_of::<f32>()
    }

    fn to_page_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = Vec::with_capacity(self.size_bytes());
        for &v in self {
            bytes.write_f32::<LittleEndian>(v)?;
        }
        Ok(bytes)
    }

    fn from_page_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() % 4 != 0 {
            return Err(OptimError::state_corruption(
                "PAGE_BYTES_MISALIGNED",
                format!("{} bytes is not a whole number of f32 values", bytes.len()),
                "restoring f32 page",
            ));
        }
        let mut values = vec![0.0f32; bytes.len() / 4];
        LittleEndian::read_f32_into(bytes, &mut values);
        Ok(values)
    }
}

/// Point-in-time copy of a page's descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageDescriptor {
    /// Page id
    pub id: PageId,
    /// Current residency
    pub residency: Residency,
    /// Fast-tier footprint in bytes
    pub size_bytes: usize,
    /// Outstanding [`PageGuard`]s
    pub pins: usize,
    /// Logical time of the last acquire or release
    pub last_use: u64,
}

/// Paging statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PagingStats {
    /// Registered pages
    pub pages: usize,
    /// Completed fast-to-slow migrations
    pub evictions: u64,
    /// Completed slow-to-fast migrations
    pub restores: u64,
    /// Transient transfer failures that were retried
    pub transfer_retries: u64,
    /// Transfers that failed for good
    pub failed_transfers: u64,
    /// Bytes resident in the fast tier
    pub fast_bytes: usize,
    /// Highest fast-tier usage observed
    pub peak_fast_bytes: usize,
    /// Fast-tier budget
    pub fast_capacity_bytes: usize,
    /// Bytes held by the slow tier
    pub slow_bytes: usize,
}

struct PageState<T> {
    residency: Residency,
    value: Option<T>,
    size_bytes: usize,
    pins: usize,
    last_use: u64,
    retired: bool,
}

struct PageSlot<T> {
    state: Mutex<PageState<T>>,
    changed: Condvar,
}

impl<T> PageSlot<T> {
    fn new(state: PageState<T>) -> Self {
        Self { state: Mutex::new(state), changed: Condvar::new() }
    }
}

/// How a relief pass ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReliefEnd {
    /// The policy stopped asking for migrations
    Satisfied,
    NoVictim,
    Failed,
}

#[derive(Debug, Clone, Copy)]
struct Relief {
    evicted: usize,
    end: ReliefEnd,
}

#[derive(Default)]
struct Counters {
    evictions: AtomicU64,
    restores: AtomicU64,
    transfer_retries: AtomicU64,
    failed_transfers: AtomicU64,
    peak_fast: AtomicUsize,
}

/// Registry of pageable values with a fast-tier budget
pub struct PagingManager<T: Pageable> {
    pages: DashMap<PageId, Arc<PageSlot<T>>>,
    tier: Arc<dyn SlowTier>,
    policy: Box<dyn PressurePolicy>,
    fast_capacity: usize,
    max_retries: u32,
    fast_used: AtomicUsize,
    clock: AtomicU64,
    counters: Counters,
}

impl<T: Pageable> fmt::Debug for PagingManager<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PagingManager")
            .field("pages", &self.pages.len())
            .field("fast_used", &self.fast_used.load(Ordering::Relaxed))
            .field("fast_capacity", &self.fast_capacity)
            .field("policy", &self.policy)
            .finish()
    }
}

impl<T: Pageable> PagingManager<T> {
    /// Creates a manager over an explicit slow tier and policy
    pub fn new(config: &PagingConfig, tier: Arc<dyn SlowTier>, policy: Box<dyn PressurePolicy>) -> Self {
        info!(
            "Initialized paging manager: fast budget {} bytes, slow capacity {} bytes, policy {:?}",
            config.fast_capacity_bytes,
            tier.capacity_bytes(),
            policy
        );
        Self {
            pages: DashMap::new(),
            tier,
            policy,
            fast_capacity: config.fast_capacity_bytes,
            max_retries: config.max_transfer_retries,
            fast_used: AtomicUsize::new(0),
            clock: AtomicU64::new(0),
            counters: Counters::default(),
        }
    }

    /// Creates a manager backed by a [`HostTier`] and the configured policy
    pub fn with_host_tier(config: &PagingConfig) -> Self {
        let tier: Arc<dyn SlowTier> = Arc::new(HostTier::new(config.slow_capacity_bytes));
        Self::new(config, tier, config.policy.build())
    }

    /// The slow tier backing this manager
    pub fn tier(&self) -> &Arc<dyn SlowTier> {
        &self.tier
    }

    /// Registers a value, placing it in the fast tier when room can be made
    /// and in the slow tier otherwise. A value larger than the whole fast-tier
    /// budget could never be acquired and is rejected with
    /// `ResidencyExhausted`.
    pub fn register(&self, value: T) -> Result<PageId> {
        let id = PageId::new();
        let size = value.size_bytes();
        if size > self.fast_capacity {
            return Err(OptimError::residency_exhausted(
                id,
                size,
                format!("page is larger than the {} byte fast-tier budget", self.fast_capacity),
            ));
        }
        let tick = self.tick();

        let state = if self.make_room(size) {
            PageState {
                residency: Residency::ResidentFast,
                value: Some(value),
                size_bytes: size,
                pins: 0,
                last_use: tick,
                retired: false,
            }
        } else {
            let bytes = value.to_page_bytes()?;
            self.transfer(id, "store", || self.tier.store(id, &bytes))
                .map_err(|e| self.exhausted(id, size, "registration", e))?;
            debug!("Registered page {} directly in the slow tier ({} bytes)", id, size);
            PageState {
                residency: Residency::ResidentSlow,
                value: None,
                size_bytes: size,
                pins: 0,
                last_use: tick,
                retired: false,
            }
        };

        self.pages.insert(id, Arc::new(PageSlot::new(state)));
        debug!("Registered page {} ({} bytes)", id, size);
        Ok(id)
    }

    /// Removes a page from both tiers. Fails with `PageBusy` while the page is
    /// pinned or migrating.
    pub fn unregister(&self, id: PageId) -> Result<()> {
        let slot = self.slot(id)?;
        let mut state = slot.state.lock();
        if state.retired {
            return Err(OptimError::unknown_page(id));
        }
        if state.pins > 0 {
            return Err(OptimError::page_busy(id, state.pins, "page is pinned"));
        }
        if let Residency::Migrating(direction) = state.residency {
            return Err(OptimError::page_busy(id, state.pins, format!("page is migrating {:?}", direction)));
        }

        match state.residency {
            Residency::ResidentFast => {
                self.fast_used.fetch_sub(state.size_bytes, Ordering::SeqCst);
            }
            Residency::ResidentSlow => {
                self.tier.remove(id);
            }
            Residency::Migrating(_) => {}
        }
        state.retired = true;
        state.value = None;
        drop(state);

        self.pages.remove(&id);
        slot.changed.notify_all();
        debug!("Unregistered page {}", id);
        Ok(())
    }

    /// Pins a page in the fast tier, restoring it first if needed.
    ///
    /// Blocks until any in-flight migration of the page finishes. At most one
    /// restore per page runs at a time; other callers wait for it.
    pub fn acquire(&self, id: PageId) -> Result<PageGuard<'_, T>> {
        let slot = self.slot(id)?;
        let mut state = slot.state.lock();

        loop {
            if state.retired {
                return Err(OptimError::unknown_page(id));
            }
            match state.residency {
                Residency::ResidentFast => {
                    state.pins += 1;
                    state.last_use = self.tick();
                    break;
                }
                Residency::Migrating(_) => {
                    slot.changed.wait(&mut state);
                }
                Residency::ResidentSlow => {
                    state.residency = Residency::Migrating(Direction::ToFast);
                    let size = state.size_bytes;
                    drop(state);

                    let restored = self.restore(id, size);

                    state = slot.state.lock();
                    match restored {
                        Ok(value) => {
                            state.value = Some(value);
                            state.residency = Residency::ResidentFast;
                            slot.changed.notify_all();
                        }
                        Err(e) => {
                            state.residency = Residency::ResidentSlow;
                            slot.changed.notify_all();
                            return Err(e);
                        }
                    }
                }
            }
        }
        drop(state);

        Ok(PageGuard { manager: self, slot, id })
    }

    /// Runs a relief pass as if `incoming` bytes were about to enter the fast
    /// tier, migrating pages while the policy asks for it. Returns the number
    /// of pages migrated.
    pub fn signal_pressure(&self, incoming: usize) -> usize {
        let evicted = self.relieve(incoming).evicted;
        debug!("Pressure signal for {} bytes migrated {} pages", incoming, evicted);
        evicted
    }

    /// Snapshot of a page's descriptor
    pub fn descriptor(&self, id: PageId) -> Result<PageDescriptor> {
        let slot = self.slot(id)?;
        let state = slot.state.lock();
        if state.retired {
            return Err(OptimError::unknown_page(id));
        }
        Ok(PageDescriptor {
            id,
            residency: state.residency,
            size_bytes: state.size_bytes,
            pins: state.pins,
            last_use: state.last_use,
        })
    }

    /// Current residency of a page
    pub fn residency(&self, id: PageId) -> Result<Residency> {
        self.descriptor(id).map(|d| d.residency)
    }

    /// Number of registered pages
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// Whether no pages are registered
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Get paging statistics
    pub fn stats(&self) -> PagingStats {
        PagingStats {
            pages: self.pages.len(),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            restores: self.counters.restores.load(Ordering::Relaxed),
            transfer_retries: self.counters.transfer_retries.load(Ordering::Relaxed),
            failed_transfers: self.counters.failed_transfers.load(Ordering::Relaxed),
            fast_bytes: self.fast_used.load(Ordering::SeqCst),
            peak_fast_bytes: self.counters.peak_fast.load(Ordering::Relaxed),
            fast_capacity_bytes: self.fast_capacity,
            slow_bytes: self.tier.used_bytes(),
        }
    }

    /// Unregisters every page and clears the slow tier. Must not race with
    /// `register`. Fails with `PageBusy` (leaving the tier intact) if a page
    /// is still pinned.
    pub fn drain(&self) -> Result<usize> {
        let ids: Vec<PageId> = self.pages.iter().map(|entry| *entry.key()).collect();
        let mut drained = 0;
        for id in ids {
            match self.unregister(id) {
                Ok(()) => drained += 1,
                Err(OptimError::UnknownPage { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        self.tier.clear();
        info!("Drained paging manager: {} pages released", drained);
        Ok(drained)
    }

    fn slot(&self, id: PageId) -> Result<Arc<PageSlot<T>>> {
        self.pages
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| OptimError::unknown_page(id))
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn snapshot(&self, incoming: usize, in_progress: bool) -> PressureSnapshot {
        PressureSnapshot {
            fast_used: self.fast_used.load(Ordering::SeqCst),
            fast_capacity: self.fast_capacity,
            incoming,
            slow_used: self.tier.used_bytes(),
            slow_capacity: self.tier.capacity_bytes(),
            in_progress,
        }
    }

    /// Relieves pressure, then reserves `incoming` fast-tier bytes.
    ///
    /// A concurrent reservation can take the room a pass just made, so passes
    /// repeat while they make progress. A pass that ran out of victims or
    /// failed an eviction ends the attempt, as do two idle passes in a row.
    fn make_room(&self, incoming: usize) -> bool {
        if incoming > self.fast_capacity {
            return false;
        }
        let mut idle_passes = 0;
        loop {
            let relief = self.relieve(incoming);
            if self.reserve(incoming) {
                return true;
            }
            if relief.end != ReliefEnd::Satisfied {
                return false;
            }
            if relief.evicted == 0 {
                idle_passes += 1;
                if idle_passes > 1 {
                    return false;
                }
            }
        }
    }

    fn reserve(&self, bytes: usize) -> bool {
        let capacity = self.fast_capacity;
        let reserved = self
            .fast_used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                used.checked_add(bytes).filter(|&total| total <= capacity)
            });
        match reserved {
            Ok(previous) => {
                self.counters.peak_fast.fetch_max(previous + bytes, Ordering::Relaxed);
                true
            }
            Err(_) => false,
        }
    }

    fn relieve(&self, incoming: usize) -> Relief {
        let mut evicted = 0;
        let mut skipped = HashSet::new();

        while self.policy.should_migrate(&self.snapshot(incoming, evicted > 0)) {
            let Some((id, slot)) = self.pick_victim(&skipped) else {
                debug!("No unpinned fast page left to migrate");
                return Relief { evicted, end: ReliefEnd::NoVictim };
            };
            match self.evict(id, &slot) {
                Ok(true) => evicted += 1,
                Ok(false) => {
                    skipped.insert(id);
                }
                Err(e) => {
                    warn!("Eviction of page {} failed: {}", id, e);
                    return Relief { evicted, end: ReliefEnd::Failed };
                }
            }
        }
        Relief { evicted, end: ReliefEnd::Satisfied }
    }

    /// Least recently used unpinned fast page. Busy slots are skipped rather
    /// than waited on.
    fn pick_victim(&self, skipped: &HashSet<PageId>) -> Option<(PageId, Arc<PageSlot<T>>)> {
        let mut best: Option<(u64, PageId, Arc<PageSlot<T>>)> = None;
        for entry in self.pages.iter() {
            let id = *entry.key();
            if skipped.contains(&id) {
                continue;
            }
            let Some(state) = entry.value().state.try_lock() else {
                continue;
            };
            let evictable = !state.retired && state.pins == 0 && state.residency == Residency::ResidentFast;
            if evictable && best.as_ref().map_or(true, |(last_use, _, _)| state.last_use < *last_use) {
                best = Some((state.last_use, id, Arc::clone(entry.value())));
            }
        }
        best.map(|(_, id, slot)| (id, slot))
    }

    /// Moves one page to the slow tier. Returns `Ok(false)` if the page stopped
    /// being evictable before its lock was taken.
    fn evict(&self, id: PageId, slot: &PageSlot<T>) -> Result<bool> {
        let (bytes, size) = {
            let Some(mut state) = slot.state.try_lock() else {
                return Ok(false);
            };
            if state.retired || state.pins > 0 || state.residency != Residency::ResidentFast {
                return Ok(false);
            }
            let Some(value) = state.value.as_ref() else {
                return Err(OptimError::state_corruption(
                    "PAGE_FAST_COPY_MISSING",
                    format!("page {} is resident in the fast tier without a value", id),
                    "eviction",
                ));
            };
            let bytes = value.to_page_bytes()?;
            state.residency = Residency::Migrating(Direction::ToSlow);
            (bytes, state.size_bytes)
        };

        let stored = self.transfer(id, "store", || self.tier.store(id, &bytes));

        let mut state = slot.state.lock();
        match stored {
            Ok(()) => {
                state.value = None;
                state.residency = Residency::ResidentSlow;
                self.fast_used.fetch_sub(size, Ordering::SeqCst);
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                slot.changed.notify_all();
                debug!("Migrated page {} to the slow tier ({} bytes)", id, size);
                Ok(true)
            }
            Err(e) => {
                state.residency = Residency::ResidentFast;
                slot.changed.notify_all();
                Err(self.exhausted(id, size, "eviction", e))
            }
        }
    }

    /// Brings a page's value back from the slow tier. The caller has marked
    /// the page `Migrating(ToFast)` and holds no descriptor lock.
    fn restore(&self, id: PageId, size: usize) -> Result<T> {
        if !self.make_room(size) {
            return Err(OptimError::residency_exhausted(
                id,
                size,
                "no fast-tier room could be made for a restore",
            ));
        }

        let bytes = match self.transfer(id, "take", || self.tier.take(id)) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.fast_used.fetch_sub(size, Ordering::SeqCst);
                return Err(self.exhausted(id, size, "restore", e));
            }
        };

        match T::from_page_bytes(&bytes) {
            Ok(value) => {
                self.counters.restores.fetch_add(1, Ordering::Relaxed);
                debug!("Restored page {} to the fast tier ({} bytes)", id, size);
                Ok(value)
            }
            Err(e) => {
                self.fast_used.fetch_sub(size, Ordering::SeqCst);
                // Put the bytes back so the slow copy stays authoritative
                if let Err(store_err) = self.tier.store(id, &bytes) {
                    warn!("Could not return page {} to the slow tier: {}", id, store_err);
                }
                Err(e)
            }
        }
    }

    /// Runs a tier operation, retrying transient failures
    fn transfer<R>(
        &self,
        id: PageId,
        operation: &str,
        mut f: impl FnMut() -> std::result::Result<R, TierError>,
    ) -> std::result::Result<R, TierError> {
        let mut attempt = 0;
        loop {
            match f() {
                Ok(result) => return Ok(result),
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    self.counters.transfer_retries.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "Transient {} failure for page {} (retry {}/{}): {}",
                        operation, id, attempt, self.max_retries, e
                    );
                }
                Err(e) => {
                    self.counters.failed_transfers.fetch_add(1, Ordering::Relaxed);
                    return Err(e);
                }
            }
        }
    }

    fn exhausted(&self, id: PageId, size: usize, operation: &str, err: TierError) -> OptimError {
        OptimError::residency_exhausted(id, size, format!("{} failed: {}", operation, err))
    }
}

/// Pins a page in the fast tier until dropped
pub struct PageGuard<'a, T: Pageable> {
    manager: &'a PagingManager<T>,
    slot: Arc<PageSlot<T>>,
    id: PageId,
}

impl<'a, T: Pageable> PageGuard<'a, T> {
    /// Id of the pinned page
    pub fn id(&self) -> PageId {
        self.id
    }

    /// Locks the page for exclusive access to its value.
    ///
    /// The lock is the per-buffer step barrier: nothing else can read or
    /// migrate the value until the returned guard is dropped.
    pub fn write(&self) -> Result<MappedMutexGuard<'_, T>> {
        let id = self.id;
        MutexGuard::try_map(self.slot.state.lock(), |state| state.value.as_mut()).map_err(|_| {
            OptimError::state_corruption(
                "PAGE_FAST_COPY_MISSING",
                format!("pinned page {} has no fast-tier value", id),
                "page write",
            )
        })
    }

    /// Unpins the page
    pub fn release(self) {}
}

impl<T: Pageable> fmt::Debug for PageGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageGuard").field("id", &self.id).finish()
    }
}

impl<'a, T: Pageable> Drop for PageGuard<'a, T> {
    fn drop(&mut self) {
        let mut state = self.slot.state.lock();
        state.pins = state.pins.saturating_sub(1);
        state.last_use = self.manager.tick();
        if state.pins == 0 {
            self.slot.changed.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use super::*;
    use crate::config::PolicyConfig;
    use crate::paging::policy::CapacityPolicy;

    fn manager(fast: usize, slow: usize) -> PagingManager<Vec<f32>> {
        let config = PagingConfig {
            fast_capacity_bytes: fast,
            slow_capacity_bytes: slow,
            max_transfer_retries: 3,
            policy: PolicyConfig::Capacity,
        };
        PagingManager::with_host_tier(&config)
    }

    #[test]
    fn test_register_and_acquire() {
        let pager = manager(1024, 1024);
        let id = pager.register(vec![1.0, 2.0]).unwrap();
        assert_eq!(pager.residency(id).unwrap(), Residency::ResidentFast);

        let guard = pager.acquire(id).unwrap();
        assert_eq!(pager.descriptor(id).unwrap().pins, 1);
        guard.write().unwrap()[0] = 5.0;
        drop(guard);

        assert_eq!(pager.descriptor(id).unwrap().pins, 0);
        assert_eq!(pager.stats().fast_bytes, 8);
    }

    #[test]
    fn test_lru_page_is_evicted_first() {
        let pager = manager(24, 1024);
        let a = pager.register(vec![1.0; 2]).unwrap();
        let b = pager.register(vec![2.0; 2]).unwrap();
        drop(pager.acquire(a).unwrap());

        let c = pager.register(vec![3.0; 4]).unwrap();
        assert_eq!(pager.residency(b).unwrap(), Residency::ResidentSlow);
        assert_eq!(pager.residency(a).unwrap(), Residency::ResidentFast);
        assert_eq!(pager.residency(c).unwrap(), Residency::ResidentFast);
        assert!(pager.tier().contains(b));
        assert!(!pager.tier().contains(a));
    }

    #[test]
    fn test_restore_round_trip() {
        let pager = manager(16, 1024);
        let a = pager.register(vec![0.1, 0.2]).unwrap();
        assert_eq!(pager.signal_pressure(16), 1);
        assert_eq!(pager.residency(a).unwrap(), Residency::ResidentSlow);
        assert_eq!(pager.stats().fast_bytes, 0);

        let guard = pager.acquire(a).unwrap();
        assert_eq!(*guard.write().unwrap(), vec![0.1, 0.2]);
        assert!(!pager.tier().contains(a));

        let stats = pager.stats();
        assert_eq!((stats.evictions, stats.restores), (1, 1));
    }

    #[test]
    fn test_pinned_pages_are_not_evicted() {
        let pager = manager(16, 1024);
        let a = pager.register(vec![1.0; 2]).unwrap();
        let guard = pager.acquire(a).unwrap();
        assert_eq!(pager.signal_pressure(16), 0);
        assert_eq!(pager.residency(a).unwrap(), Residency::ResidentFast);

        let err = pager.unregister(a).unwrap_err();
        assert_eq!(err.code(), "PAGING_PAGE_BUSY");
        drop(guard);
        pager.unregister(a).unwrap();
        assert_eq!(pager.unregister(a).unwrap_err().code(), "PAGING_UNKNOWN_PAGE");
    }

    #[test]
    fn test_overflow_goes_to_slow_tier_then_exhausts() {
        let pager = manager(8, 8);
        let a = pager.register(vec![1.0; 2]).unwrap();
        let _pin = pager.acquire(a).unwrap();

        let b = pager.register(vec![2.0; 2]).unwrap();
        assert_eq!(pager.residency(b).unwrap(), Residency::ResidentSlow);

        let err = pager.register(vec![3.0; 2]).unwrap_err();
        assert_eq!(err.code(), "PAGING_RESIDENCY_EXHAUSTED");

        // b cannot come back while a holds the whole fast budget
        let err = pager.acquire(b).unwrap_err();
        assert_eq!(err.code(), "PAGING_RESIDENCY_EXHAUSTED");
        assert_eq!(pager.residency(b).unwrap(), Residency::ResidentSlow);
        assert!(pager.tier().contains(b));
    }

    #[test]
    fn test_oversized_page_is_rejected_without_evicting() {
        let pager = manager(400, 4096);
        let a = pager.register(vec![1.0; 50]).unwrap();
        let b = pager.register(vec![2.0; 50]).unwrap();

        let err = pager.register(vec![3.0; 200]).unwrap_err();
        assert_eq!(err.code(), "PAGING_RESIDENCY_EXHAUSTED");
        assert_eq!(pager.len(), 2);
        assert_eq!(pager.residency(a).unwrap(), Residency::ResidentFast);
        assert_eq!(pager.residency(b).unwrap(), Residency::ResidentFast);

        let stats = pager.stats();
        assert_eq!(stats.evictions, 0);
        assert_eq!(stats.fast_bytes, 400);
        assert_eq!(stats.slow_bytes, 0);
    }

    /// Behaves like `CapacityPolicy`, except that once armed it reports no
    /// pressure for a single call, as if another thread had just made room
    #[derive(Debug)]
    struct StaleOncePolicy {
        armed: Arc<AtomicBool>,
    }

    impl PressurePolicy for StaleOncePolicy {
        fn should_migrate(&self, snapshot: &PressureSnapshot) -> bool {
            if self.armed.swap(false, Ordering::SeqCst) {
                return false;
            }
            CapacityPolicy.should_migrate(snapshot)
        }
    }

    #[test]
    fn test_room_is_made_again_when_a_reservation_is_lost() {
        let config = PagingConfig {
            fast_capacity_bytes: 16,
            slow_capacity_bytes: 1024,
            max_transfer_retries: 3,
            policy: PolicyConfig::Capacity,
        };
        let armed = Arc::new(AtomicBool::new(false));
        let tier: Arc<dyn SlowTier> = Arc::new(HostTier::new(1024));
        let pager: PagingManager<Vec<f32>> =
            PagingManager::new(&config, tier, Box::new(StaleOncePolicy { armed: Arc::clone(&armed) }));

        let first = pager.register(vec![1.0; 2]).unwrap();
        let second = pager.register(vec![2.0; 2]).unwrap();

        // The first relief pass sees no pressure and the reservation fails on
        // a full fast tier; the next pass evicts and the reservation succeeds
        armed.store(true, Ordering::SeqCst);
        let third = pager.register(vec![3.0; 2]).unwrap();

        assert_eq!(pager.residency(first).unwrap(), Residency::ResidentSlow);
        assert_eq!(pager.residency(second).unwrap(), Residency::ResidentFast);
        assert_eq!(pager.residency(third).unwrap(), Residency::ResidentFast);
        let stats = pager.stats();
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.fast_bytes, 16);
    }

    #[test]
    fn test_never_policy_gives_up_after_idle_passes() {
        let config = PagingConfig {
            fast_capacity_bytes: 8,
            slow_capacity_bytes: 1024,
            max_transfer_retries: 3,
            policy: PolicyConfig::Never,
        };
        let pager: PagingManager<Vec<f32>> = PagingManager::with_host_tier(&config);
        let a = pager.register(vec![1.0; 2]).unwrap();
        let b = pager.register(vec![2.0; 2]).unwrap();
        assert_eq!(pager.residency(a).unwrap(), Residency::ResidentFast);
        assert_eq!(pager.residency(b).unwrap(), Residency::ResidentSlow);
        assert_eq!(pager.stats().evictions, 0);
    }

    #[test]
    fn test_drain() {
        let pager = manager(8, 64);
        pager.register(vec![1.0; 2]).unwrap();
        pager.register(vec![1.0; 2]).unwrap();
        assert_eq!(pager.drain().unwrap(), 2);
        assert!(pager.is_empty());
        assert_eq!(pager.stats().slow_bytes, 0);
        assert_eq!(pager.stats().fast_bytes, 0);
    }

    #[test]
    fn test_vec_page_bytes() {
        let values = vec![1.5f32, -0.0, f32::MIN_POSITIVE];
        let bytes = values.to_page_bytes().unwrap();
        assert_eq!(bytes.len(), 12);
        let back = Vec::<f32>::from_page_bytes(&bytes).unwrap();
        assert_eq!(back[1].to_bits(), (-0.0f32).to_bits());
        assert_eq!(back, values);
        assert!(Vec::<f32>::from_page_bytes(&bytes[..5]).is_err());
    }
}
