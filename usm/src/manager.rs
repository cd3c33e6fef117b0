// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The entry point of the crate.
//!
//! # Freeing
//!
//! Freeing an allocation goes through these steps:
//!
//! 1. Allocations in the [deferred-free queue] that the device no longer references are
//!    destroyed.
//! 2. If the allocation is a device or host allocation and its cache accepts it, it is parked
//!    there and nothing else happens.
//! 3. Otherwise the allocation is destroyed. A blocking free waits for all device engines
//!    first. A non-blocking free of an allocation that the device still references moves it to
//!    the deferred-free queue instead.
//!
//! [`free_deferred`] skips the cache, and always defers allocations that are still in use.
//!
//! # Locking
//!
//! The registry is behind a reader/writer lock. The residency tracker has its own lock, which is
//! always taken before the registry lock when both are needed. Each cache and the deferred-free
//! queue have their own locks, which are never held while calling into the registry.
//!
//! [deferred-free queue]: DeferredFreeQueue
//! [`free_deferred`]: UnifiedMemoryManager::free_deferred

use crate::{
    backend::{
        AllocationBackend, BackendAllocateInfo, BackingBuffer, CommandStream, MemoryAdvice,
        MigrationHandler, Placement, StreamId, TaskCount,
    },
    cache::{AllocationCache, ReuseCreateInfo, ReuseCriteria},
    deferred::DeferredFreeQueue,
    device::{DeviceId, DeviceInfo, DeviceTable, ReuseBudget},
    record::{
        page_size_for_alignment, AllocationFlags, AllocationKind, AllocationRecord,
        BackingStorage, MemoryKind, RecordParts,
    },
    registry::AllocationRegistry,
    residency::{IndirectResidencyTracker, ResidencyEntry},
    align_up, AllocationInUse, DeviceSize, InvalidArgument, NonExhaustive, OomError, UsmError,
};
use parking_lot::{Mutex, RwLock};
use smallvec::{smallvec, SmallVec};
use std::{sync::Arc, time::Duration};

/// Parameters to create a new [`UnifiedMemoryManager`].
#[derive(Clone, Debug)]
pub struct UnifiedMemoryManagerCreateInfo {
    /// The devices that allocations can be made for. A [`DeviceId`] is an index into this list.
    ///
    /// The default value is empty.
    pub devices: Vec<DeviceInfo>,

    /// Reuse of freed device allocations. The budget of the cache is taken from each device's
    /// [`DeviceInfo::reuse_budget`].
    ///
    /// The default value is `ReuseCreateInfo::default()`.
    pub device_reuse: ReuseCreateInfo,

    /// Reuse of freed host allocations.
    ///
    /// The default value is `ReuseCreateInfo::default()`.
    pub host_reuse: ReuseCreateInfo,

    /// The maximum total size of host allocations that may be held in the host cache.
    ///
    /// The default value is 256 MiB.
    pub host_reuse_budget: DeviceSize,

    /// Performs prefetches and applies memory advice. If this is `None`, [`prefetch`] and
    /// [`advise`] only validate their arguments.
    ///
    /// The default value is `None`.
    ///
    /// [`prefetch`]: UnifiedMemoryManager::prefetch
    /// [`advise`]: UnifiedMemoryManager::advise
    pub migration_handler: Option<Arc<dyn MigrationHandler>>,

    pub _ne: NonExhaustive,
}

impl Default for UnifiedMemoryManagerCreateInfo {
    #[inline]
    fn default() -> Self {
        UnifiedMemoryManagerCreateInfo {
            devices: Vec::new(),
            device_reuse: ReuseCreateInfo::default(),
            host_reuse: ReuseCreateInfo::default(),
            host_reuse_budget: 256 * 1024 * 1024,
            migration_handler: None,
            _ne: NonExhaustive(()),
        }
    }
}

/// Parameters of a single allocation.
#[derive(Clone, Debug)]
pub struct AllocationCreateInfo {
    /// The size of the allocation in bytes. Must not be zero.
    ///
    /// The default value is `0`.
    pub size: DeviceSize,

    /// The minimum alignment of the allocation's address. Must be zero or a power of two.
    ///
    /// If this is `0`, the allocation is aligned to its page size: 64 KiB for allocations of at
    /// least 64 KiB, 4 KiB otherwise.
    ///
    /// The default value is `0`.
    pub alignment: DeviceSize,

    /// The kind of memory to allocate.
    ///
    /// The default value is [`AllocationKind::Host`].
    pub kind: AllocationKind,

    /// The device the allocation is for.
    ///
    /// This is required for device allocations and ignored for host allocations. A shared
    /// allocation without a device is accessible from all devices.
    ///
    /// The default value is `None`.
    pub device: Option<DeviceId>,

    /// The default value is `AllocationFlags::default()`.
    pub flags: AllocationFlags,

    pub _ne: NonExhaustive,
}

impl Default for AllocationCreateInfo {
    #[inline]
    fn default() -> Self {
        AllocationCreateInfo {
            size: 0,
            alignment: 0,
            kind: AllocationKind::Host,
            device: None,
            flags: AllocationFlags::default(),
            _ne: NonExhaustive(()),
        }
    }
}

/// Creates, tracks, reuses and destroys unified allocations.
///
/// Addresses returned by [`create`] stay valid until they're passed to [`free`] or
/// [`free_deferred`]. Dropping the manager destroys every allocation that is still alive.
///
/// See [the module-level documentation] for how freeing works.
///
/// [`create`]: Self::create
/// [`free`]: Self::free
/// [`free_deferred`]: Self::free_deferred
/// [the module-level documentation]: self
#[derive(Debug)]
pub struct UnifiedMemoryManager {
    backend: Arc<dyn AllocationBackend>,
    migration_handler: Option<Arc<dyn MigrationHandler>>,
    devices: DeviceTable,
    registry: RwLock<AllocationRegistry>,
    // Also serializes residency updates with the destruction of allocations.
    residency: Mutex<IndirectResidencyTracker>,
    device_cache: Option<AllocationCache>,
    host_cache: Option<AllocationCache>,
    host_budget: Arc<ReuseBudget>,
    deferred: DeferredFreeQueue,
}

impl UnifiedMemoryManager {
    /// Creates a new `UnifiedMemoryManager` that allocates through `backend`.
    ///
    /// # Panics
    ///
    /// - Panics if `create_info.device_reuse` or `create_info.host_reuse` is enabled and its
    ///   `minimal_utilization` is not in the range (0, 1].
    pub fn new(
        backend: Arc<dyn AllocationBackend>,
        create_info: UnifiedMemoryManagerCreateInfo,
    ) -> Self {
        let UnifiedMemoryManagerCreateInfo {
            devices,
            device_reuse,
            host_reuse,
            host_reuse_budget,
            migration_handler,
            _ne: _,
        } = create_info;

        let device_cache = device_reuse
            .enabled
            .then(|| AllocationCache::new(&device_reuse));
        let host_cache = host_reuse
            .enabled
            .then(|| AllocationCache::new(&host_reuse));

        UnifiedMemoryManager {
            backend,
            migration_handler,
            devices: DeviceTable::new(devices),
            registry: RwLock::new(AllocationRegistry::new()),
            residency: Mutex::new(IndirectResidencyTracker::new()),
            device_cache,
            host_cache,
            host_budget: Arc::new(ReuseBudget::new(host_reuse_budget)),
            deferred: DeferredFreeQueue::new(),
        }
    }

    /// Creates a new allocation and returns its address.
    ///
    /// A suitable allocation from the reuse cache is returned if there is one, without calling
    /// into the backend. If the backend fails, the caches are trimmed and the allocation is
    /// retried once.
    pub fn create(&self, create_info: &AllocationCreateInfo) -> Result<DeviceSize, UsmError> {
        let &AllocationCreateInfo {
            size,
            alignment,
            kind,
            device,
            flags,
            _ne: _,
        } = create_info;

        if size == 0 {
            return Err(InvalidArgument::ZeroSize.into());
        }

        if alignment != 0 && !alignment.is_power_of_two() {
            return Err(InvalidArgument::InvalidAlignment.into());
        }

        if let Some(device) = device {
            if !self.devices.contains(device) {
                return Err(InvalidArgument::UnknownDevice.into());
            }
        }

        let (memory_kind, device) = match kind {
            AllocationKind::Device => {
                let Some(device) = device else {
                    return Err(InvalidArgument::MissingDevice.into());
                };

                (MemoryKind::Device, Some(device))
            }
            AllocationKind::Host => (MemoryKind::Host, None),
            AllocationKind::Shared => {
                if self.devices.supports_shared_migration(device) {
                    (MemoryKind::SharedMigratable, device)
                } else {
                    (MemoryKind::SharedDualStorage, device)
                }
            }
        };

        let alignment = alignment.max(page_size_for_alignment(size));

        if let Some(cache) = self.cache_for(memory_kind) {
            let criteria = ReuseCriteria {
                device,
                flags,
                alignment,
            };

            if let Some(record) = cache.get(size, &criteria, &*self.backend) {
                tracing::trace!(
                    address = record.address(),
                    size,
                    kind = ?memory_kind,
                    "reusing cached allocation"
                );

                return Ok(record.address());
            }

            tracing::trace!(size, kind = ?memory_kind, "no cached allocation to reuse");
        }

        let storage = match self.allocate_storage(memory_kind, size, alignment, device, flags) {
            Ok(storage) => storage,
            Err(err) => {
                tracing::warn!(
                    size,
                    kind = ?memory_kind,
                    error = %err,
                    "allocation failed, trimming the reuse caches and retrying"
                );
                self.trim_caches();

                self.allocate_storage(memory_kind, size, alignment, device, flags)
                    .inspect_err(|err| {
                        tracing::warn!(
                            size,
                            kind = ?memory_kind,
                            error = %err,
                            "allocation failed after trimming the reuse caches"
                        );
                    })?
            }
        };

        let record = self.registry.write().insert(RecordParts {
            storage,
            size,
            alignment: create_info.alignment,
            kind: memory_kind,
            device,
            flags,
            imported: false,
        });

        tracing::debug!(
            address = record.address(),
            size,
            kind = ?memory_kind,
            id = record.id().get(),
            "created allocation"
        );

        Ok(record.address())
    }

    /// Registers a buffer that was created outside of the manager, for instance from an
    /// interprocess handle, and returns its address.
    ///
    /// Imported allocations are never cached. When they are freed, the backend is told that the
    /// buffer was imported.
    pub fn import(
        &self,
        buffer: BackingBuffer,
        kind: AllocationKind,
        device: Option<DeviceId>,
    ) -> Result<DeviceSize, UsmError> {
        if buffer.size() == 0 {
            return Err(InvalidArgument::ZeroSize.into());
        }

        if let Some(device) = device {
            if !self.devices.contains(device) {
                return Err(InvalidArgument::UnknownDevice.into());
            }
        }

        let (memory_kind, device) = match kind {
            AllocationKind::Device => {
                let Some(device) = device else {
                    return Err(InvalidArgument::MissingDevice.into());
                };

                (MemoryKind::Device, Some(device))
            }
            AllocationKind::Host => (MemoryKind::Host, None),
            AllocationKind::Shared => (MemoryKind::SharedMigratable, device),
        };

        let start = buffer.address();
        let Some(last) = start.checked_add(buffer.size() - 1) else {
            return Err(InvalidArgument::OutOfBounds.into());
        };

        let mut registry = self.registry.write();

        if registry.overlaps(start, last) {
            return Err(InvalidArgument::AlreadyRegistered.into());
        }

        let size = buffer.size();
        let record = registry.insert(RecordParts {
            storage: BackingStorage::new(smallvec![buffer], None),
            size,
            alignment: 0,
            kind: memory_kind,
            device,
            flags: AllocationFlags::default(),
            imported: true,
        });

        tracing::debug!(
            address = record.address(),
            size,
            kind = ?memory_kind,
            id = record.id().get(),
            "imported allocation"
        );

        Ok(record.address())
    }

    /// Frees the allocation at `address`, which must be an address returned by [`create`] or
    /// [`import`].
    ///
    /// If `blocking` is set, the call waits until the device no longer uses the allocation.
    /// Otherwise an allocation that is still in use is destroyed later.
    ///
    /// Freeing an allocation that is already cached or waiting for destruction does nothing.
    ///
    /// [`create`]: Self::create
    /// [`import`]: Self::import
    pub fn free(&self, address: DeviceSize, blocking: bool) -> Result<(), UsmError> {
        self.free_deferred_allocations();

        let record = self.get_exact(address)?;

        if record.is_pending_free() {
            return Ok(());
        }

        if let Some((cache, budget)) = self.cache_and_budget_for(&record) {
            if cache.insert(&record, budget, blocking, &*self.backend) {
                tracing::trace!(
                    address,
                    size = record.size(),
                    kind = ?record.kind(),
                    "saved allocation for reuse"
                );

                return Ok(());
            }
        }

        if blocking {
            self.wait_for_engines(&record);
            self.destroy(&record, false);
        } else if self.try_destroy(&record).is_err() {
            self.defer(record);
        }

        Ok(())
    }

    /// Frees the allocation at `address` without trying to cache it. If the device still uses
    /// the allocation, it is destroyed by a later call into the free path.
    pub fn free_deferred(&self, address: DeviceSize) -> Result<(), UsmError> {
        self.free_deferred_allocations();

        let record = self.get_exact(address)?;

        if record.is_pending_free() || record.is_saved_for_reuse() {
            return Ok(());
        }

        if self.try_destroy(&record).is_err() {
            self.defer(record);
        }

        Ok(())
    }

    /// Destroys the allocations in the deferred-free queue that the device no longer uses.
    ///
    /// This is called at the start of every free, so calling it explicitly is only needed to
    /// release memory without freeing anything else.
    pub fn free_deferred_allocations(&self) {
        if self.deferred.is_empty() {
            return;
        }

        let idle = self.deferred.take_idle(|record| !self.is_in_use(record));

        for record in idle {
            self.destroy(&record, true);
        }
    }

    /// Returns the allocation that contains `address`.
    pub fn find(&self, address: DeviceSize) -> Option<Arc<AllocationRecord>> {
        self.registry.read().find(address).cloned()
    }

    /// Makes all allocations that `stream` hasn't seen yet resident on it, pinning them so that
    /// kernels can reach them through embedded pointers. `task_count` is the task count of the
    /// submission that is about to be made.
    pub fn make_indirect_allocations_resident(
        &self,
        stream: &Arc<dyn CommandStream>,
        task_count: TaskCount,
    ) {
        let mut residency = self.residency.lock();
        let registry = self.registry.read();

        residency.make_resident(&registry, stream, task_count);
    }

    /// Returns the residency state of the stream, if allocations were ever made resident on it.
    pub fn residency_entry(&self, stream: StreamId) -> Option<ResidencyEntry> {
        self.residency.lock().entry(stream)
    }

    /// Forgets about the stream. Should be called when the stream is destroyed.
    pub fn unregister_stream(&self, stream: StreamId) {
        self.residency.lock().remove_stream(stream);
    }

    /// Migrates `size` bytes starting at `address` to `device`, as part of the work submitted to
    /// `stream`. `address` may point anywhere into an allocation.
    pub fn prefetch(
        &self,
        device: DeviceId,
        stream: &dyn CommandStream,
        address: DeviceSize,
        size: DeviceSize,
    ) -> Result<(), UsmError> {
        let (buffers, offset) = self.resolve_range(device, address, size)?;

        tracing::trace!(address, size, device = device.index(), "prefetching");

        if let Some(handler) = &self.migration_handler {
            handler.prefetch(device, stream, &buffers, offset, size);
        }

        Ok(())
    }

    /// Applies `advice` to `size` bytes starting at `address`. `address` may point anywhere into
    /// an allocation.
    pub fn advise(
        &self,
        device: DeviceId,
        address: DeviceSize,
        size: DeviceSize,
        advice: MemoryAdvice,
    ) -> Result<(), UsmError> {
        let (buffers, offset) = self.resolve_range(device, address, size)?;

        tracing::trace!(address, size, device = device.index(), ?advice, "applying advice");

        if let Some(handler) = &self.migration_handler {
            handler.advise(device, &buffers, offset, size, advice);
        }

        Ok(())
    }

    /// Destroys every cached allocation.
    pub fn trim_caches(&self) {
        for cache in [&self.device_cache, &self.host_cache].into_iter().flatten() {
            let trimmed = cache.trim();

            if !trimmed.is_empty() {
                tracing::debug!(count = trimmed.len(), "trimmed reuse cache");
            }

            self.release_trimmed(trimmed);
        }
    }

    /// Destroys cached allocations that have been held for longer than `max_hold_time`.
    ///
    /// If `trim_all` is `false`, at most the oldest such allocation of each cache is destroyed.
    pub fn trim_old_cache_entries(&self, max_hold_time: Duration, trim_all: bool) {
        for cache in [&self.device_cache, &self.host_cache].into_iter().flatten() {
            let trimmed = cache.trim_held_longer_than(max_hold_time, trim_all);

            if !trimmed.is_empty() {
                tracing::debug!(
                    count = trimmed.len(),
                    ?max_hold_time,
                    "trimmed old entries from reuse cache"
                );
            }

            self.release_trimmed(trimmed);
        }
    }

    /// Returns the number of live allocations, including cached ones and ones waiting for
    /// destruction.
    pub fn num_allocations(&self) -> usize {
        self.registry.read().len()
    }

    /// Returns the number of allocations waiting in the deferred-free queue.
    pub fn num_deferred(&self) -> usize {
        self.deferred.len()
    }

    /// Returns the cache for device allocations, if device reuse is enabled.
    #[inline]
    pub fn device_cache(&self) -> Option<&AllocationCache> {
        self.device_cache.as_ref()
    }

    /// Returns the cache for host allocations, if host reuse is enabled.
    #[inline]
    pub fn host_cache(&self) -> Option<&AllocationCache> {
        self.host_cache.as_ref()
    }

    /// Returns the reuse budget of `device`.
    pub fn device_reuse_budget(&self, device: DeviceId) -> Option<&ReuseBudget> {
        self.devices.get(device).map(|entry| &**entry.reuse_budget())
    }

    /// Returns the reuse budget shared by all host allocations.
    #[inline]
    pub fn host_reuse_budget(&self) -> &ReuseBudget {
        &self.host_budget
    }

    fn cache_for(&self, kind: MemoryKind) -> Option<&AllocationCache> {
        match kind {
            MemoryKind::Device => self.device_cache.as_ref(),
            MemoryKind::Host => self.host_cache.as_ref(),
            MemoryKind::SharedMigratable | MemoryKind::SharedDualStorage => None,
        }
    }

    fn cache_and_budget_for(
        &self,
        record: &AllocationRecord,
    ) -> Option<(&AllocationCache, &Arc<ReuseBudget>)> {
        let cache = self.cache_for(record.kind())?;
        let budget = match record.kind() {
            MemoryKind::Device => self.devices.get(record.device()?)?.reuse_budget(),
            _ => &self.host_budget,
        };

        Some((cache, budget))
    }

    fn get_exact(&self, address: DeviceSize) -> Result<Arc<AllocationRecord>, InvalidArgument> {
        let registry = self.registry.read();

        match registry.get(address) {
            Some(record) => Ok(record.clone()),
            None if registry.find(address).is_some() => Err(InvalidArgument::InteriorPointer),
            None => Err(InvalidArgument::UnknownPointer),
        }
    }

    fn resolve_range(
        &self,
        device: DeviceId,
        address: DeviceSize,
        size: DeviceSize,
    ) -> Result<(SmallVec<[BackingBuffer; 2]>, DeviceSize), InvalidArgument> {
        if !self.devices.contains(device) {
            return Err(InvalidArgument::UnknownDevice);
        }

        let record = self
            .registry
            .read()
            .find(address)
            .cloned()
            .ok_or(InvalidArgument::UnknownPointer)?;

        let offset = address - record.address();

        if size > record.size() - offset {
            return Err(InvalidArgument::OutOfBounds);
        }

        let storage = record.storage();
        let buffer = storage
            .buffer_for_device(device)
            .ok_or(InvalidArgument::NotAccessibleByDevice)?;
        let mut buffers = SmallVec::new();
        buffers.push(buffer.clone());
        buffers.extend(storage.cpu_buffer().cloned());

        Ok((buffers, offset))
    }

    fn allocate_storage(
        &self,
        kind: MemoryKind,
        size: DeviceSize,
        alignment: DeviceSize,
        device: Option<DeviceId>,
        flags: AllocationFlags,
    ) -> Result<BackingStorage, OomError> {
        let targets: SmallVec<[Option<DeviceId>; 4]> = match device {
            Some(device) => smallvec![Some(device)],
            None if self.devices.is_empty() => smallvec![None],
            None => self.devices.ids().map(Some).collect(),
        };

        let placement = match kind {
            MemoryKind::Device | MemoryKind::SharedDualStorage => Placement::DeviceLocal,
            MemoryKind::Host => Placement::System,
            MemoryKind::SharedMigratable => Placement::Migratable,
        };

        let mut requests: SmallVec<[(Placement, Option<DeviceId>); 4]> = SmallVec::new();

        // The host half of a dual-storage allocation comes first, so that the device halves are
        // placed at its address.
        if kind == MemoryKind::SharedDualStorage {
            requests.push((Placement::System, None));
        }

        requests.extend(targets.into_iter().map(|target| (placement, target)));

        let size = align_up(size, page_size_for_alignment(size));
        let mut buffers: SmallVec<[BackingBuffer; 1]> = SmallVec::new();

        for (placement, device) in requests {
            let info = BackendAllocateInfo {
                size,
                alignment,
                placement,
                device,
                existing_address: buffers.first().map(BackingBuffer::address),
                flags,
                _ne: NonExhaustive(()),
            };

            match self.backend.allocate(&info) {
                Ok(buffer) => buffers.push(buffer),
                Err(err) => {
                    for buffer in buffers {
                        self.backend.free(buffer, false);
                    }

                    return Err(err);
                }
            }
        }

        let cpu_buffer = (kind == MemoryKind::SharedDualStorage).then(|| buffers.remove(0));

        Ok(BackingStorage::new(buffers, cpu_buffer))
    }

    fn is_in_use(&self, record: &AllocationRecord) -> bool {
        record
            .storage()
            .buffers()
            .any(|buffer| self.backend.is_referenced_by_device(buffer))
    }

    fn wait_for_engines(&self, record: &AllocationRecord) {
        for buffer in record.storage().buffers() {
            self.backend.wait_for_all_engines(buffer);
        }
    }

    fn defer(&self, record: Arc<AllocationRecord>) {
        let address = record.address();

        if self.deferred.push(record) {
            tracing::debug!(address, "deferring destruction of allocation in use");
        }
    }

    fn try_destroy(&self, record: &Arc<AllocationRecord>) -> Result<(), AllocationInUse> {
        if self.is_in_use(record) {
            return Err(AllocationInUse);
        }

        self.destroy(record, true);

        Ok(())
    }

    // Cached allocations that were saved without waiting may still be in use.
    fn release_trimmed(&self, records: Vec<Arc<AllocationRecord>>) {
        for record in records {
            if self.try_destroy(&record).is_err() {
                self.defer(record);
            }
        }
    }

    /// Unregisters the allocation and returns its buffers to the backend. Does nothing if
    /// another thread destroyed the allocation first.
    fn destroy(&self, record: &Arc<AllocationRecord>, non_blocking_free: bool) {
        {
            let mut residency = self.residency.lock();
            let mut registry = self.registry.write();

            if !registry.is_registered(record) {
                return;
            }

            residency.prepare_for_destruction(record, non_blocking_free);
            registry.remove(record.address());
        }

        tracing::debug!(
            address = record.address(),
            size = record.size(),
            kind = ?record.kind(),
            id = record.id().get(),
            "destroying allocation"
        );

        for buffer in record.storage().buffers() {
            self.backend.free(buffer.clone(), record.is_imported());
        }
    }
}

impl Drop for UnifiedMemoryManager {
    fn drop(&mut self) {
        // Cached and deferred allocations are still registered.
        self.deferred.take_all();

        for cache in [&self.device_cache, &self.host_cache].into_iter().flatten() {
            cache.trim();
        }

        let records: Vec<_> = self.registry.get_mut().iter().cloned().collect();

        if !records.is_empty() {
            tracing::debug!(count = records.len(), "destroying remaining allocations");
        }

        for record in &records {
            self.wait_for_engines(record);
            self.destroy(record, false);
        }
    }
}
