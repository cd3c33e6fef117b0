// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Reuse of freed allocations.
//!
//! Creating unified memory means a trip into the kernel-mode driver, which maps pages for every
//! device. Applications however tend to free and recreate allocations of the same sizes over and
//! over again. Instead of destroying a freed allocation right away, the manager therefore parks
//! it in an [`AllocationCache`], and a later request of similar size takes it from there.
//!
//! # Algorithm
//!
//! The entries are kept sorted by size. A request for `size` bytes scans from the first entry
//! that is at least as big, and takes the first one that belongs to the same device, has the same
//! flags, is suitably aligned, and isn't referenced by the device anymore. Among entries of equal
//! size, the one that was saved first is taken first.
//!
//! The scan stops as soon as the request would use less than the [minimal utilization] of a
//! candidate. This bounds the wasted memory: a 4 KiB request never takes a 1 GiB entry, no matter
//! how long the entry has been waiting.
//!
//! # Budget
//!
//! Every entry reserves its size against a [`ReuseBudget`]: the budget of the owning device for
//! device allocations, or a budget shared by all host allocations. Once the budget is exhausted,
//! freed allocations are destroyed instead of cached.
//!
//! [minimal utilization]: ReuseCreateInfo::minimal_utilization

use crate::{
    backend::AllocationBackend,
    device::{DeviceId, ReuseBudget},
    is_aligned,
    record::{AllocationFlags, AllocationRecord},
    DeviceSize, NonExhaustive,
};
use parking_lot::Mutex;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};

/// Parameters to create a new [`AllocationCache`].
#[derive(Clone, Debug)]
pub struct ReuseCreateInfo {
    /// Whether freed allocations of this kind are cached at all.
    ///
    /// The default value is `true`.
    pub enabled: bool,

    /// Allocations larger than this are never cached.
    ///
    /// The default value is 256 MiB.
    pub max_cacheable_size: DeviceSize,

    /// The smallest fraction of a cached allocation that a request must use for the allocation
    /// to be reused for it. Must be in the range (0, 1].
    ///
    /// The default value is `0.5`.
    pub minimal_utilization: f64,

    pub _ne: NonExhaustive,
}

impl Default for ReuseCreateInfo {
    #[inline]
    fn default() -> Self {
        ReuseCreateInfo {
            enabled: true,
            max_cacheable_size: 256 * 1024 * 1024,
            minimal_utilization: 0.5,
            _ne: NonExhaustive(()),
        }
    }
}

/// What a cached allocation must match to be reused for a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReuseCriteria {
    /// The device that requests the allocation.
    pub device: Option<DeviceId>,

    /// The flags of the request.
    pub flags: AllocationFlags,

    /// The alignment of the request. Must be a power of two.
    pub alignment: DeviceSize,
}

/// One allocation waiting in the cache.
#[derive(Debug)]
struct CacheEntry {
    size: DeviceSize,
    address: DeviceSize,
    record: Arc<AllocationRecord>,
    budget: Arc<ReuseBudget>,
    save_time: Instant,
    // Set if the engines were waited for on insertion, which makes the in-use check redundant.
    completed: bool,
}

/// A size-sorted list of freed allocations that can be handed out again.
///
/// See [the module-level documentation] for details.
///
/// # Locking behavior
///
/// Every cache has its own lock, which is only held for the duration of a single operation. The
/// backend is asked whether a candidate is still in use while the lock is held, but waiting for
/// the device to finish (on a blocking free) happens before the lock is taken.
///
/// [the module-level documentation]: self
#[derive(Debug)]
pub struct AllocationCache {
    max_cacheable_size: DeviceSize,
    minimal_utilization: f64,
    entries: Mutex<Vec<CacheEntry>>,
}

impl AllocationCache {
    /// Creates a new, empty `AllocationCache`.
    ///
    /// # Panics
    ///
    /// - Panics if `create_info.minimal_utilization` is not in the range (0, 1].
    pub fn new(create_info: &ReuseCreateInfo) -> Self {
        let &ReuseCreateInfo {
            enabled: _,
            max_cacheable_size,
            minimal_utilization,
            _ne: _,
        } = create_info;

        assert!(
            minimal_utilization > 0.0 && minimal_utilization <= 1.0,
            "`create_info.minimal_utilization` must be in the range (0, 1]"
        );

        AllocationCache {
            max_cacheable_size,
            minimal_utilization,
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Saves `record` for reuse, reserving the size of its backing buffer against `budget`.
    ///
    /// The entry is keyed on the backing buffer rather than on the size last requested for the
    /// record, so a buffer that is reused for smaller requests keeps its full size in the cache.
    ///
    /// If `wait_for_completion` is set, the call blocks until no device engine references the
    /// allocation anymore.
    ///
    /// Returns `false` if the allocation can't be cached, in which case the caller must destroy
    /// it: because it is too large, internal, imported or pending destruction, or because the
    /// budget is exhausted. Returns `true` without doing anything if the allocation is already
    /// cached.
    pub fn insert(
        &self,
        record: &Arc<AllocationRecord>,
        budget: &Arc<ReuseBudget>,
        wait_for_completion: bool,
        backend: &dyn AllocationBackend,
    ) -> bool {
        let size = record.storage().default_buffer().size();

        if size > self.max_cacheable_size
            || record.is_internal()
            || record.is_imported()
            || record.is_pending_free()
        {
            return false;
        }

        if record.is_saved_for_reuse() {
            return true;
        }

        if wait_for_completion {
            for buffer in record.storage().buffers() {
                backend.wait_for_all_engines(buffer);
            }
        }

        let mut entries = self.entries.lock();

        // Checked again under the lock, another thread might have saved it in the meantime.
        if record.is_saved_for_reuse() {
            return true;
        }

        if !budget.try_reserve(size) {
            return false;
        }

        record.set_saved_for_reuse(true);

        let index = entries.partition_point(|entry| entry.size <= size);
        entries.insert(
            index,
            CacheEntry {
                size,
                address: record.address(),
                record: record.clone(),
                budget: budget.clone(),
                save_time: Instant::now(),
                completed: wait_for_completion,
            },
        );

        true
    }

    /// Takes an allocation of at least `size` bytes that matches `criteria` out of the cache.
    ///
    /// The size of the returned record is updated to `size`, its backing buffer stays as it is.
    /// Returns `None` if there is no
    /// suitable allocation, in which case the caller must allocate a new one.
    pub fn get(
        &self,
        size: DeviceSize,
        criteria: &ReuseCriteria,
        backend: &dyn AllocationBackend,
    ) -> Option<Arc<AllocationRecord>> {
        debug_assert!(criteria.alignment.is_power_of_two());

        if size == 0 || size > self.max_cacheable_size {
            return None;
        }

        let mut entries = self.entries.lock();
        let start = entries.partition_point(|entry| entry.size < size);

        for index in start..entries.len() {
            let entry = &entries[index];

            if (size as f64) < entry.size as f64 * self.minimal_utilization {
                // All following entries are at least as big.
                break;
            }

            let record = &entry.record;

            if record.device() != criteria.device
                || record.flags() != criteria.flags
                || !is_aligned(entry.address, criteria.alignment)
            {
                continue;
            }

            if !entry.completed
                && record
                    .storage()
                    .buffers()
                    .any(|buffer| backend.is_referenced_by_device(buffer))
            {
                continue;
            }

            let entry = entries.remove(index);
            entry.budget.release(entry.size);
            entry.record.set_saved_for_reuse(false);
            entry.record.set_size(size);

            return Some(entry.record);
        }

        None
    }

    /// Removes all entries from the cache and returns their records, which the caller must
    /// destroy.
    pub fn trim(&self) -> Vec<Arc<AllocationRecord>> {
        let entries = std::mem::take(&mut *self.entries.lock());

        entries.into_iter().map(Self::release).collect()
    }

    /// Removes entries that were saved at or before `cutoff` and returns their records, which the
    /// caller must destroy.
    ///
    /// If `trim_all` is `false`, only the oldest such entry is removed.
    pub fn trim_old(&self, cutoff: Instant, trim_all: bool) -> Vec<Arc<AllocationRecord>> {
        let mut entries = self.entries.lock();

        if trim_all {
            let mut trimmed = Vec::new();
            entries.retain(|entry| {
                if entry.save_time <= cutoff {
                    trimmed.push(entry.record.clone());
                    entry.budget.release(entry.size);
                    entry.record.set_saved_for_reuse(false);
                    false
                } else {
                    true
                }
            });

            trimmed
        } else {
            let oldest = entries
                .iter()
                .enumerate()
                .filter(|(_, entry)| entry.save_time <= cutoff)
                .min_by_key(|(_, entry)| entry.save_time)
                .map(|(index, _)| index);

            oldest
                .map(|index| Self::release(entries.remove(index)))
                .into_iter()
                .collect()
        }
    }

    /// Removes entries that have been held for longer than `max_hold_time`.
    ///
    /// See [`trim_old`](Self::trim_old).
    pub fn trim_held_longer_than(
        &self,
        max_hold_time: Duration,
        trim_all: bool,
    ) -> Vec<Arc<AllocationRecord>> {
        match Instant::now().checked_sub(max_hold_time) {
            Some(cutoff) => self.trim_old(cutoff, trim_all),
            None => Vec::new(),
        }
    }

    fn release(entry: CacheEntry) -> Arc<AllocationRecord> {
        entry.budget.release(entry.size);
        entry.record.set_saved_for_reuse(false);

        entry.record
    }

    /// Returns the number of cached allocations.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Returns the total size of the cached allocations.
    pub fn size_in_bytes(&self) -> DeviceSize {
        self.entries.lock().iter().map(|entry| entry.size).sum()
    }

    /// Returns whether the allocation at `address` is cached.
    pub fn contains(&self, address: DeviceSize) -> bool {
        self.entries
            .lock()
            .iter()
            .any(|entry| entry.address == address)
    }
}
