// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The devices that unified allocations can be made for.
//!
//! The manager doesn't own devices. It only knows them as entries in a table, and allocation
//! records refer to their owning device through a [`DeviceId`], which is an index into that
//! table. Holding a `DeviceId` therefore never extends the lifetime of anything.

use crate::{DeviceSize, NonExhaustive};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

/// Non-owning handle to a device in the manager's device table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(u32);

impl DeviceId {
    /// Creates a `DeviceId` referring to the device at `index` in the device table.
    #[inline]
    pub const fn new(index: u32) -> Self {
        DeviceId(index)
    }

    /// Returns the index of the device in the device table.
    #[inline]
    pub const fn index(self) -> u32 {
        self.0
    }
}

/// Parameters describing one device of the manager's device table.
#[derive(Clone, Debug)]
pub struct DeviceInfo {
    /// Whether the device (together with the kernel-mode driver) can migrate pages of shared
    /// allocations transparently on fault.
    ///
    /// If this is `false`, shared allocations fall back to the dual-storage strategy.
    ///
    /// The default value is `false`.
    pub shared_migration: bool,

    /// The size of the device's local memory.
    ///
    /// The default value is `0`.
    pub local_memory_size: DeviceSize,

    /// The maximum total size of device allocations owned by this device that may be held in the
    /// reuse cache.
    ///
    /// If this is `None`, the budget is 2% of `local_memory_size`.
    ///
    /// The default value is `None`.
    pub reuse_budget: Option<DeviceSize>,

    pub _ne: NonExhaustive,
}

impl Default for DeviceInfo {
    #[inline]
    fn default() -> Self {
        DeviceInfo {
            shared_migration: false,
            local_memory_size: 0,
            reuse_budget: None,
            _ne: NonExhaustive(()),
        }
    }
}

impl DeviceInfo {
    pub(crate) fn effective_reuse_budget(&self) -> DeviceSize {
        self.reuse_budget.unwrap_or(self.local_memory_size / 50)
    }
}

/// Tracks how many bytes of a reuse budget are currently reserved by cache entries.
///
/// Reservations never exceed the limit, even when raced from multiple threads.
#[derive(Debug)]
pub struct ReuseBudget {
    limit: DeviceSize,
    used: AtomicU64,
}

impl ReuseBudget {
    /// Creates a new budget of `limit` bytes with nothing reserved.
    #[inline]
    pub const fn new(limit: DeviceSize) -> Self {
        ReuseBudget {
            limit,
            used: AtomicU64::new(0),
        }
    }

    /// Returns the total size of the budget.
    #[inline]
    pub fn limit(&self) -> DeviceSize {
        self.limit
    }

    /// Returns the number of bytes currently reserved.
    #[inline]
    pub fn used(&self) -> DeviceSize {
        self.used.load(Ordering::Relaxed)
    }

    /// Tries to reserve `size` bytes. Returns `false` if that would exceed the limit, in which
    /// case nothing is reserved.
    pub fn try_reserve(&self, size: DeviceSize) -> bool {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(size).filter(|&new| new <= self.limit)
            })
            .is_ok()
    }

    /// Releases `size` previously reserved bytes.
    pub fn release(&self, size: DeviceSize) {
        let prev = self.used.fetch_sub(size, Ordering::AcqRel);
        debug_assert!(prev >= size);
    }
}

#[derive(Debug)]
pub(crate) struct DeviceEntry {
    info: DeviceInfo,
    reuse_budget: Arc<ReuseBudget>,
}

impl DeviceEntry {
    pub(crate) fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub(crate) fn reuse_budget(&self) -> &Arc<ReuseBudget> {
        &self.reuse_budget
    }
}

/// The table that [`DeviceId`]s index into.
#[derive(Debug)]
pub(crate) struct DeviceTable {
    devices: Vec<DeviceEntry>,
}

impl DeviceTable {
    pub(crate) fn new(infos: Vec<DeviceInfo>) -> Self {
        let devices = infos
            .into_iter()
            .map(|info| DeviceEntry {
                reuse_budget: Arc::new(ReuseBudget::new(info.effective_reuse_budget())),
                info,
            })
            .collect();

        DeviceTable { devices }
    }

    pub(crate) fn get(&self, id: DeviceId) -> Option<&DeviceEntry> {
        self.devices.get(id.index() as usize)
    }

    pub(crate) fn contains(&self, id: DeviceId) -> bool {
        self.get(id).is_some()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub(crate) fn ids(&self) -> impl ExactSizeIterator<Item = DeviceId> {
        (0..self.devices.len() as u32).map(DeviceId::new)
    }

    /// Whether shared allocations with the given affinity can use the migratable strategy. An
    /// allocation without affinity needs every device to support migration.
    pub(crate) fn supports_shared_migration(&self, device: Option<DeviceId>) -> bool {
        match device {
            Some(id) => self.get(id).is_some_and(|entry| entry.info.shared_migration),
            None => {
                !self.is_empty() && self.devices.iter().all(|e| e.info.shared_migration)
            }
        }
    }
}
