// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use crate::{record::AllocationRecord, DeviceSize};
use parking_lot::Mutex;
use std::{collections::BTreeMap, sync::Arc};

/// Allocations whose destruction was requested while the device still referenced them.
///
/// There is no thread that watches the queue. Instead, every call into the free path of the
/// manager first takes out the allocations that became idle and destroys them.
///
/// An allocation is never in the queue and in a reuse cache at the same time: allocations are
/// marked [pending free] when they enter the queue, and caches refuse such allocations.
///
/// [pending free]: AllocationRecord::is_pending_free
#[derive(Debug, Default)]
pub struct DeferredFreeQueue {
    entries: Mutex<BTreeMap<DeviceSize, Arc<AllocationRecord>>>,
}

impl DeferredFreeQueue {
    #[inline]
    pub fn new() -> Self {
        DeferredFreeQueue::default()
    }

    /// Adds the allocation to the queue. Returns `false` if it was already queued.
    pub fn push(&self, record: Arc<AllocationRecord>) -> bool {
        if !record.mark_pending_free() {
            return false;
        }

        let prev = self.entries.lock().insert(record.address(), record);
        debug_assert!(prev.is_none());

        true
    }

    /// Removes and returns the allocations for which `is_idle` returns `true`.
    pub fn take_idle(
        &self,
        mut is_idle: impl FnMut(&AllocationRecord) -> bool,
    ) -> Vec<Arc<AllocationRecord>> {
        let mut entries = self.entries.lock();
        let mut idle = Vec::new();

        entries.retain(|_, record| {
            if is_idle(record) {
                idle.push(record.clone());
                false
            } else {
                true
            }
        });

        idle
    }

    /// Removes and returns all queued allocations.
    pub fn take_all(&self) -> Vec<Arc<AllocationRecord>> {
        std::mem::take(&mut *self.entries.lock())
            .into_values()
            .collect()
    }

    /// Returns whether the allocation at `address` is queued.
    pub fn contains(&self, address: DeviceSize) -> bool {
        self.entries.lock().contains_key(&address)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::{BackingBuffer, Placement},
        record::{AllocationFlags, BackingStorage, MemoryKind, RecordParts},
        registry::AllocationRegistry,
    };
    use smallvec::smallvec;

    fn record(registry: &mut AllocationRegistry, address: DeviceSize) -> Arc<AllocationRecord> {
        registry.insert(RecordParts {
            storage: BackingStorage::new(
                smallvec![BackingBuffer::new(
                    address,
                    address,
                    0x1000,
                    Placement::System,
                    None
                )],
                None,
            ),
            size: 0x1000,
            alignment: 0,
            kind: MemoryKind::Host,
            device: None,
            flags: AllocationFlags::default(),
            imported: false,
        })
    }

    #[test]
    fn push_is_idempotent() {
        let mut registry = AllocationRegistry::new();
        let queue = DeferredFreeQueue::new();
        let a = record(&mut registry, 0x10000);

        assert!(queue.push(a.clone()));
        assert!(!queue.push(a.clone()));
        assert!(a.is_pending_free());
        assert_eq!(queue.len(), 1);
        assert!(queue.contains(0x10000));
    }

    #[test]
    fn take_idle_keeps_busy_allocations() {
        let mut registry = AllocationRegistry::new();
        let queue = DeferredFreeQueue::new();
        let a = record(&mut registry, 0x10000);
        let b = record(&mut registry, 0x20000);
        queue.push(a.clone());
        queue.push(b.clone());

        let idle = queue.take_idle(|record| record.address() == 0x20000);
        assert_eq!(idle.len(), 1);
        assert!(Arc::ptr_eq(&idle[0], &b));
        assert!(queue.contains(0x10000));
        assert!(!queue.contains(0x20000));

        assert_eq!(queue.take_all().len(), 1);
        assert!(queue.is_empty());
    }
}
