// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use crate::{backend::BackingBuffer, device::DeviceId, DeviceSize, NonExhaustive};
use smallvec::SmallVec;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// The kind of memory that is requested from the manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AllocationKind {
    /// Memory that only the owning device accesses.
    Device,

    /// Host memory that is accessible from all devices.
    Host,

    /// Memory that is accessed from both host and devices, and migrates between them.
    Shared,
}

/// The kind of memory an [`AllocationRecord`] describes, which also determines how it is backed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MemoryKind {
    /// A single buffer in the local memory of the owning device.
    Device,

    /// A buffer in system memory, mapped for every device at the same address.
    Host,

    /// A single buffer whose pages the kernel-mode driver migrates on fault.
    SharedMigratable,

    /// A device buffer and a host buffer at the same virtual address. Coherence between the two
    /// is maintained by copying on page fault.
    SharedDualStorage,
}

impl MemoryKind {
    /// Returns whether the memory is a shared allocation.
    #[inline]
    pub fn is_shared(self) -> bool {
        matches!(self, Self::SharedMigratable | Self::SharedDualStorage)
    }
}

/// Properties requested for an allocation. Cached allocations are only reused for requests with
/// equal flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct AllocationFlags {
    /// The device only reads from the allocation.
    pub read_only: bool,

    /// Host writes are combined rather than cached.
    pub write_combined: bool,

    /// Host and device accesses are coherent without explicit flushes.
    pub coherent: bool,

    /// The allocation is used by the driver itself. Internal allocations are never cached.
    pub internal: bool,

    pub _ne: NonExhaustive,
}

/// Process-wide identifier of an allocation.
///
/// Ids are handed out in increasing order, starting at 1, and are never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AllocationId(u64);

impl AllocationId {
    #[inline]
    pub(crate) const fn new(id: u64) -> Self {
        AllocationId(id)
    }

    /// Returns the raw value of the id.
    #[inline]
    pub fn get(self) -> u64 {
        self.0
    }
}

/// The buffers that back an allocation.
///
/// There is one device-visible buffer per device the allocation is made for. The first of them
/// is the default buffer, whose address is the allocation's address. Dual-storage allocations
/// additionally have a host buffer at the same address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackingStorage {
    gpu_buffers: SmallVec<[BackingBuffer; 1]>,
    cpu_buffer: Option<BackingBuffer>,
}

impl BackingStorage {
    /// # Panics
    ///
    /// - Panics if `gpu_buffers` is empty.
    pub(crate) fn new(
        gpu_buffers: SmallVec<[BackingBuffer; 1]>,
        cpu_buffer: Option<BackingBuffer>,
    ) -> Self {
        assert!(!gpu_buffers.is_empty());
        debug_assert!(gpu_buffers
            .iter()
            .chain(&cpu_buffer)
            .all(|buffer| buffer.address() == gpu_buffers[0].address()));

        BackingStorage {
            gpu_buffers,
            cpu_buffer,
        }
    }

    /// Returns the buffer whose address is the address of the allocation.
    #[inline]
    pub fn default_buffer(&self) -> &BackingBuffer {
        &self.gpu_buffers[0]
    }

    /// Returns the device-visible buffers.
    #[inline]
    pub fn gpu_buffers(&self) -> &[BackingBuffer] {
        &self.gpu_buffers
    }

    /// Returns the host buffer of a dual-storage allocation.
    #[inline]
    pub fn cpu_buffer(&self) -> Option<&BackingBuffer> {
        self.cpu_buffer.as_ref()
    }

    /// Returns the buffer that `device` should access. Buffers created without device affinity
    /// serve every device.
    pub fn buffer_for_device(&self, device: DeviceId) -> Option<&BackingBuffer> {
        self.gpu_buffers
            .iter()
            .find(|buffer| buffer.device() == Some(device))
            .or_else(|| self.gpu_buffers.iter().find(|buffer| buffer.device().is_none()))
    }

    /// Returns all buffers, device-visible ones first.
    pub fn buffers(&self) -> impl Iterator<Item = &BackingBuffer> {
        self.gpu_buffers.iter().chain(&self.cpu_buffer)
    }
}

/// Describes one logical unified allocation.
///
/// There is exactly one record per pointer handed out to the user. Records are shared between
/// the registry and the reuse cache; whichever releases the last reference after the allocation
/// was destroyed drops it.
#[derive(Debug)]
pub struct AllocationRecord {
    id: AllocationId,
    storage: BackingStorage,
    size: AtomicU64,
    alignment: DeviceSize,
    page_size_for_alignment: DeviceSize,
    kind: MemoryKind,
    device: Option<DeviceId>,
    flags: AllocationFlags,
    imported: bool,
    saved_for_reuse: AtomicBool,
    pending_free: AtomicBool,
}

/// Everything a record is made of, except for the id which the registry assigns.
#[derive(Clone, Debug)]
pub(crate) struct RecordParts {
    pub(crate) storage: BackingStorage,
    pub(crate) size: DeviceSize,
    pub(crate) alignment: DeviceSize,
    pub(crate) kind: MemoryKind,
    pub(crate) device: Option<DeviceId>,
    pub(crate) flags: AllocationFlags,
    pub(crate) imported: bool,
}

impl AllocationRecord {
    pub(crate) fn from_parts(id: AllocationId, parts: RecordParts) -> Self {
        let RecordParts {
            storage,
            size,
            alignment,
            kind,
            device,
            flags,
            imported,
        } = parts;

        AllocationRecord {
            id,
            storage,
            size: AtomicU64::new(size),
            alignment,
            page_size_for_alignment: page_size_for_alignment(size),
            kind,
            device,
            flags,
            imported,
            saved_for_reuse: AtomicBool::new(false),
            pending_free: AtomicBool::new(false),
        }
    }

    /// Returns the id of the allocation.
    #[inline]
    pub fn id(&self) -> AllocationId {
        self.id
    }

    /// Returns the address of the allocation, which is the address of its default buffer.
    #[inline]
    pub fn address(&self) -> DeviceSize {
        self.storage.default_buffer().address()
    }

    /// Returns the buffers backing the allocation.
    #[inline]
    pub fn storage(&self) -> &BackingStorage {
        &self.storage
    }

    /// Returns the size the allocation was last requested with.
    ///
    /// When a cached allocation is reused for a smaller request, this is the size of the new
    /// request rather than the size of the backing buffers.
    #[inline]
    pub fn size(&self) -> DeviceSize {
        self.size.load(Ordering::Acquire)
    }

    pub(crate) fn set_size(&self, size: DeviceSize) {
        debug_assert!(size <= self.storage.default_buffer().size());
        self.size.store(size, Ordering::Release);
    }

    /// Returns the alignment that was requested, or `0` if none was.
    #[inline]
    pub fn requested_alignment(&self) -> DeviceSize {
        self.alignment
    }

    /// Returns the page size that the allocation's address is aligned to at least.
    #[inline]
    pub fn page_size_for_alignment(&self) -> DeviceSize {
        self.page_size_for_alignment
    }

    #[inline]
    pub fn kind(&self) -> MemoryKind {
        self.kind
    }

    /// Returns the device that requested the allocation, or `None` if the allocation is shared
    /// across all devices.
    #[inline]
    pub fn device(&self) -> Option<DeviceId> {
        self.device
    }

    #[inline]
    pub fn flags(&self) -> AllocationFlags {
        self.flags
    }

    #[inline]
    pub fn is_internal(&self) -> bool {
        self.flags.internal
    }

    /// Returns whether the backing buffer was imported rather than allocated by the backend.
    #[inline]
    pub fn is_imported(&self) -> bool {
        self.imported
    }

    /// Returns whether the allocation currently sits in a reuse cache.
    #[inline]
    pub fn is_saved_for_reuse(&self) -> bool {
        self.saved_for_reuse.load(Ordering::Acquire)
    }

    pub(crate) fn set_saved_for_reuse(&self, saved: bool) {
        self.saved_for_reuse.store(saved, Ordering::Release);
    }

    /// Returns whether the allocation is waiting in the deferred-free queue.
    #[inline]
    pub fn is_pending_free(&self) -> bool {
        self.pending_free.load(Ordering::Acquire)
    }

    /// Marks the allocation as pending destruction. Returns `false` if it already was.
    pub(crate) fn mark_pending_free(&self) -> bool {
        !self.pending_free.swap(true, Ordering::AcqRel)
    }

    /// Returns whether `address` lies within the allocation.
    #[inline]
    pub fn contains(&self, address: DeviceSize) -> bool {
        let base = self.address();

        address >= base && address - base < self.size()
    }
}

/// Allocations of at least 64 KiB are aligned to 64 KiB pages, smaller ones to 4 KiB pages.
pub(crate) const fn page_size_for_alignment(size: DeviceSize) -> DeviceSize {
    const PAGE_4K: DeviceSize = 4 * 1024;
    const PAGE_64K: DeviceSize = 64 * 1024;

    if size >= PAGE_64K {
        PAGE_64K
    } else {
        PAGE_4K
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Placement;
    use smallvec::smallvec;

    fn buffer(id: u64, address: DeviceSize, device: Option<u32>) -> BackingBuffer {
        BackingBuffer::new(
            id,
            address,
            0x1000,
            Placement::DeviceLocal,
            device.map(DeviceId::new),
        )
    }

    #[test]
    fn buffer_for_device_prefers_exact_device() {
        let storage = BackingStorage::new(
            smallvec![buffer(1, 0x10000, Some(0)), buffer(2, 0x10000, Some(1))],
            None,
        );

        assert_eq!(storage.buffer_for_device(DeviceId::new(1)).unwrap().id(), 2);
        assert!(storage.buffer_for_device(DeviceId::new(2)).is_none());

        let storage = BackingStorage::new(smallvec![buffer(3, 0x10000, None)], None);
        assert_eq!(storage.buffer_for_device(DeviceId::new(5)).unwrap().id(), 3);
    }

    #[test]
    fn contains_uses_current_size() {
        let record = AllocationRecord::from_parts(
            AllocationId::new(1),
            RecordParts {
                storage: BackingStorage::new(smallvec![buffer(1, 0x10000, Some(0))], None),
                size: 0x1000,
                alignment: 0,
                kind: MemoryKind::Device,
                device: Some(DeviceId::new(0)),
                flags: AllocationFlags::default(),
                imported: false,
            },
        );

        assert!(record.contains(0x10000));
        assert!(record.contains(0x10fff));
        assert!(!record.contains(0x11000));
        assert!(!record.contains(0xffff));

        record.set_size(0x100);
        assert!(!record.contains(0x10100));
        assert_eq!(record.page_size_for_alignment(), 4096);
    }

    #[test]
    fn pending_free_is_marked_once() {
        let record = AllocationRecord::from_parts(
            AllocationId::new(1),
            RecordParts {
                storage: BackingStorage::new(smallvec![buffer(1, 0x10000, None)], None),
                size: 0x1000,
                alignment: 0,
                kind: MemoryKind::Host,
                device: None,
                flags: AllocationFlags::default(),
                imported: false,
            },
        );

        assert!(record.mark_pending_free());
        assert!(!record.mark_pending_free());
        assert!(record.is_pending_free());
    }
}
