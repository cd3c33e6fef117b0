// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The authoritative index of all live allocations.

use crate::{
    backend::BackingBuffer,
    record::{AllocationId, AllocationRecord, RecordParts},
    DeviceSize,
};
use smallvec::SmallVec;
use std::{
    collections::BTreeMap,
    ops::Bound,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

/// Address-ordered index of all live [`AllocationRecord`]s.
///
/// Records are keyed by the address of their default buffer. Because the index is ordered by
/// address, a pointer into the middle of an allocation can be resolved by looking at its
/// predecessor.
///
/// The registry also hands out the [`AllocationId`]s. Ids are assigned at insertion, so the
/// order in which ids are handed out is the order in which records become visible. The
/// [`IndirectResidencyTracker`] relies on this to never miss an allocation.
///
/// The registry does no locking of its own; the manager keeps it behind a reader/writer lock.
///
/// [`IndirectResidencyTracker`]: crate::residency::IndirectResidencyTracker
#[derive(Debug, Default)]
pub struct AllocationRegistry {
    by_address: BTreeMap<DeviceSize, Arc<AllocationRecord>>,
    // For each allocation, the device-visible buffers that may need to be made resident.
    by_id: BTreeMap<AllocationId, SmallVec<[BackingBuffer; 1]>>,
    // Highest id handed out so far.
    counter: AtomicU64,
}

impl AllocationRegistry {
    /// Creates an empty registry.
    #[inline]
    pub fn new() -> Self {
        AllocationRegistry::default()
    }

    /// Assigns the next id to a new record and registers it.
    ///
    /// The caller must ensure that no record is registered at the record's address yet.
    pub(crate) fn insert(&mut self, parts: RecordParts) -> Arc<AllocationRecord> {
        let id = AllocationId::new(self.counter.load(Ordering::Relaxed) + 1);
        let record = Arc::new(AllocationRecord::from_parts(id, parts));

        self.by_id
            .insert(id, record.storage().gpu_buffers().iter().cloned().collect());
        let prev = self.by_address.insert(record.address(), record.clone());
        debug_assert!(prev.is_none());

        // Publishes the id only once the record is reachable through both maps.
        self.counter.store(id.get(), Ordering::Release);

        record
    }

    /// Removes the record registered at `address`, if any.
    pub(crate) fn remove(&mut self, address: DeviceSize) -> Option<Arc<AllocationRecord>> {
        let record = self.by_address.remove(&address)?;
        self.by_id.remove(&record.id());

        Some(record)
    }

    /// Returns the record whose allocation starts exactly at `address`.
    #[inline]
    pub fn get(&self, address: DeviceSize) -> Option<&Arc<AllocationRecord>> {
        self.by_address.get(&address)
    }

    /// Returns the record whose allocation contains `address`.
    pub fn find(&self, address: DeviceSize) -> Option<&Arc<AllocationRecord>> {
        if let Some(record) = self.by_address.get(&address) {
            return Some(record);
        }

        self.by_address
            .range(..address)
            .next_back()
            .map(|(_, record)| record)
            .filter(|record| record.contains(address))
    }

    /// Returns whether any registered allocation overlaps the inclusive range `start..=last`.
    pub fn overlaps(&self, start: DeviceSize, last: DeviceSize) -> bool {
        self.find(start).is_some() || self.by_address.range(start..=last).next().is_some()
    }

    /// Returns whether the record is the one registered at its address.
    pub(crate) fn is_registered(&self, record: &Arc<AllocationRecord>) -> bool {
        self.get(record.address())
            .is_some_and(|registered| Arc::ptr_eq(registered, record))
    }

    /// Returns the number of registered allocations.
    #[inline]
    pub fn len(&self) -> usize {
        self.by_address.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.by_address.is_empty()
    }

    /// Returns the highest id handed out so far, or `0` if no allocation was ever registered.
    #[inline]
    pub fn allocations_counter(&self) -> u64 {
        self.counter.load(Ordering::Acquire)
    }

    /// Returns the device-visible buffers of all live allocations whose id is greater than
    /// `after`, in id order.
    pub fn buffers_after(
        &self,
        after: u64,
    ) -> impl Iterator<Item = (AllocationId, &[BackingBuffer])> {
        self.by_id
            .range((Bound::Excluded(AllocationId::new(after)), Bound::Unbounded))
            .map(|(&id, buffers)| (id, buffers.as_slice()))
    }

    /// Returns an iterator over all registered records, in address order.
    pub fn iter(&self) -> impl ExactSizeIterator<Item = &Arc<AllocationRecord>> {
        self.by_address.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::Placement,
        device::DeviceId,
        record::{AllocationFlags, BackingStorage, MemoryKind},
    };
    use smallvec::smallvec;

    fn parts(address: DeviceSize, size: DeviceSize) -> RecordParts {
        RecordParts {
            storage: BackingStorage::new(
                smallvec![BackingBuffer::new(
                    address,
                    address,
                    size,
                    Placement::DeviceLocal,
                    Some(DeviceId::new(0)),
                )],
                None,
            ),
            size,
            alignment: 0,
            kind: MemoryKind::Device,
            device: Some(DeviceId::new(0)),
            flags: AllocationFlags::default(),
            imported: false,
        }
    }

    #[test]
    fn find_resolves_interior_pointers() {
        let mut registry = AllocationRegistry::new();
        let a = registry.insert(parts(0x10000, 0x1000));
        let b = registry.insert(parts(0x11000, 0x2000));

        for k in [0, 1, 0x800, 0xfff] {
            assert!(Arc::ptr_eq(registry.find(0x10000 + k).unwrap(), &a));
        }
        assert!(Arc::ptr_eq(registry.find(0x11000).unwrap(), &b));
        assert!(Arc::ptr_eq(registry.find(0x12fff).unwrap(), &b));
        assert!(registry.find(0x13000).is_none());
        assert!(registry.find(0xfffc).is_none());

        assert!(registry.get(0x10004).is_none());
        assert!(Arc::ptr_eq(registry.get(0x10000).unwrap(), &a));
    }

    #[test]
    fn find_skips_gaps_between_allocations() {
        let mut registry = AllocationRegistry::new();
        registry.insert(parts(0x10000, 0x1000));
        registry.insert(parts(0x20000, 0x1000));

        assert!(registry.find(0x11000).is_none());
        assert!(registry.find(0x1ffff).is_none());
        assert!(registry.find(0x20fff).is_some());
    }

    #[test]
    fn overlaps_detects_ranges_touching_any_allocation() {
        let mut registry = AllocationRegistry::new();
        registry.insert(parts(0x10000, 0x1000));
        registry.insert(parts(0x20000, 0x1000));

        // Starting inside, ending inside, and covering a whole allocation.
        assert!(registry.overlaps(0x10800, 0x18000));
        assert!(registry.overlaps(0xf000, 0x10000));
        assert!(registry.overlaps(0x11000, 0x21000));

        assert!(!registry.overlaps(0x11000, 0x1ffff));
        assert!(!registry.overlaps(0x21000, DeviceSize::MAX));
    }

    #[test]
    fn ids_are_monotonic_and_never_reused() {
        let mut registry = AllocationRegistry::new();
        assert_eq!(registry.allocations_counter(), 0);

        let a = registry.insert(parts(0x10000, 0x1000));
        let b = registry.insert(parts(0x20000, 0x1000));
        assert_eq!(a.id().get(), 1);
        assert_eq!(b.id().get(), 2);

        assert!(registry.remove(0x20000).is_some());
        assert!(registry.remove(0x20000).is_none());

        let c = registry.insert(parts(0x20000, 0x1000));
        assert_eq!(c.id().get(), 3);
        assert_eq!(registry.allocations_counter(), 3);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn buffers_after_only_returns_newer_ids() {
        let mut registry = AllocationRegistry::new();
        for i in 0..4 {
            registry.insert(parts(0x10000 * (i + 1), 0x1000));
        }
        registry.remove(0x30000);

        let ids: Vec<_> = registry.buffers_after(1).map(|(id, _)| id.get()).collect();
        assert_eq!(ids, [2, 4]);
        assert_eq!(registry.buffers_after(4).count(), 0);
    }

    #[test]
    fn is_registered_compares_identity() {
        let mut registry = AllocationRegistry::new();
        let a = registry.insert(parts(0x10000, 0x1000));
        registry.remove(0x10000);
        let b = registry.insert(parts(0x10000, 0x1000));

        assert!(!registry.is_registered(&a));
        assert!(registry.is_registered(&b));
    }
}
