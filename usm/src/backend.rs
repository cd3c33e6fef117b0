// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Interfaces of the collaborators that the manager drives, but doesn't implement.
//!
//! - The [`AllocationBackend`] creates and destroys the physical allocations and knows whether
//!   the device still references them.
//! - A [`CommandStream`] is one engine's submission queue. It accepts residency requests.
//! - The [`MigrationHandler`] moves pages between host and device on prefetch and applies
//!   memory advice.

use crate::{device::DeviceId, record::AllocationFlags, DeviceSize, NonExhaustive, OomError};
use std::fmt::Debug;

/// Where the backend should place the physical pages of a buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Placement {
    /// Local memory of the device the buffer is created for.
    DeviceLocal,

    /// System memory, visible to the host and mapped for the device.
    System,

    /// Pages start out in system memory and are migrated by the kernel-mode driver on fault.
    Migratable,
}

/// One physical allocation made by the [`AllocationBackend`].
///
/// This is a plain description: dropping it doesn't free anything. The buffer is returned to the
/// backend through [`AllocationBackend::free`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BackingBuffer {
    id: u64,
    address: DeviceSize,
    size: DeviceSize,
    placement: Placement,
    device: Option<DeviceId>,
}

impl BackingBuffer {
    /// Creates a description of a buffer. `id` is an identifier of the backend's choosing that
    /// must be unique among the buffers that are alive at the same time.
    #[inline]
    pub const fn new(
        id: u64,
        address: DeviceSize,
        size: DeviceSize,
        placement: Placement,
        device: Option<DeviceId>,
    ) -> Self {
        BackingBuffer {
            id,
            address,
            size,
            placement,
            device,
        }
    }

    /// Returns the backend's identifier of the buffer.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the virtual address of the buffer.
    #[inline]
    pub fn address(&self) -> DeviceSize {
        self.address
    }

    /// Returns the size of the buffer.
    #[inline]
    pub fn size(&self) -> DeviceSize {
        self.size
    }

    /// Returns where the pages of the buffer live.
    #[inline]
    pub fn placement(&self) -> Placement {
        self.placement
    }

    /// Returns the device the buffer was created for, or `None` for a host-side buffer.
    #[inline]
    pub fn device(&self) -> Option<DeviceId> {
        self.device
    }
}

/// Parameters of a single [`AllocationBackend::allocate`] call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackendAllocateInfo {
    /// Size of the buffer in bytes.
    pub size: DeviceSize,

    /// Required alignment of the buffer's address. Always a power of two.
    pub alignment: DeviceSize,

    /// Where the pages of the buffer should live.
    pub placement: Placement,

    /// The device the buffer is for, or `None` for a host-side buffer.
    pub device: Option<DeviceId>,

    /// If set, the buffer must be created at exactly this virtual address. This is used to give
    /// all buffers of one allocation the same address.
    pub existing_address: Option<DeviceSize>,

    /// The flags the allocation was requested with.
    pub flags: AllocationFlags,

    pub _ne: NonExhaustive,
}

impl Default for BackendAllocateInfo {
    #[inline]
    fn default() -> Self {
        BackendAllocateInfo {
            size: 0,
            alignment: 1,
            placement: Placement::System,
            device: None,
            existing_address: None,
            flags: AllocationFlags::default(),
            _ne: NonExhaustive(()),
        }
    }
}

/// Performs the actual allocation and mapping of memory, usually by calling into the OS.
///
/// Implementations must be thread-safe; the manager calls them from any thread, but never while
/// holding one of its locks, except for [`is_referenced_by_device`] which may be called while a
/// cache is locked.
///
/// [`is_referenced_by_device`]: Self::is_referenced_by_device
pub trait AllocationBackend: Send + Sync {
    /// Creates a new buffer.
    fn allocate(&self, info: &BackendAllocateInfo) -> Result<BackingBuffer, OomError>;

    /// Destroys a buffer. `is_imported` is set if the buffer wasn't created by this backend but
    /// imported from elsewhere, in which case only the mapping should be released.
    ///
    /// The backend may defer the release at the OS level if the buffer is still in use.
    fn free(&self, buffer: BackingBuffer, is_imported: bool);

    /// Returns whether outstanding device work still references the buffer.
    fn is_referenced_by_device(&self, buffer: &BackingBuffer) -> bool;

    /// Blocks until no device engine references the buffer anymore.
    fn wait_for_all_engines(&self, buffer: &BackingBuffer);
}

/// Identifies a command stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u32);

/// Counter of work submitted to a command stream.
pub type TaskCount = u64;

/// A queue of work for one device engine, as seen by the residency tracker.
pub trait CommandStream: Send + Sync {
    /// Returns the id of the stream, unique among all live streams.
    fn id(&self) -> StreamId;

    /// Returns the device the stream submits to.
    fn device(&self) -> DeviceId;

    /// Adds the buffer to the resident set of the next submission.
    fn make_resident(&self, buffer: &BackingBuffer);

    /// Pins the buffer in (or unpins it from) the stream's resident set, so that it isn't evicted
    /// between submissions.
    fn set_always_resident(&self, buffer: &BackingBuffer, always_resident: bool);

    /// Returns the task count of the last submission known to use the buffer.
    fn buffer_task_count(&self, buffer: &BackingBuffer) -> TaskCount;

    /// Makes the buffer stay in the resident set only until the work with `task_count` has
    /// completed.
    fn clear_residency_watermark(&self, buffer: &BackingBuffer, task_count: TaskCount);
}

/// A hint about the expected access pattern of a memory range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MemoryAdvice {
    SetReadMostly,
    ClearReadMostly,
    SetPreferredLocationDevice,
    ClearPreferredLocationDevice,
    SetPreferredLocationSystem,
    ClearPreferredLocationSystem,
}

/// Moves pages of shared allocations between host and device.
///
/// The manager only resolves pointers to the buffers they belong to, the actual data movement
/// happens here.
pub trait MigrationHandler: Send + Sync {
    /// Migrates `size` bytes starting at `offset` within the allocation to `device`, as part of
    /// the work submitted to `stream`. `buffers` holds the device's buffer first, followed by the
    /// host buffer for dual-storage allocations.
    fn prefetch(
        &self,
        device: DeviceId,
        stream: &dyn CommandStream,
        buffers: &[BackingBuffer],
        offset: DeviceSize,
        size: DeviceSize,
    );

    /// Applies `advice` to `size` bytes starting at `offset` within the allocation.
    fn advise(
        &self,
        device: DeviceId,
        buffers: &[BackingBuffer],
        offset: DeviceSize,
        size: DeviceSize,
        advice: MemoryAdvice,
    );
}

impl Debug for dyn AllocationBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocationBackend").finish_non_exhaustive()
    }
}

impl Debug for dyn CommandStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandStream")
            .field("id", &self.id())
            .field("device", &self.device())
            .finish_non_exhaustive()
    }
}

impl Debug for dyn MigrationHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationHandler").finish_non_exhaustive()
    }
}
