// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Unified shared memory (USM) allocation manager for GPU compute drivers.
//!
//! USM is memory that host and device code address through the same pointer value. Creating it
//! is expensive: every allocation ends up in the kernel-mode driver, which maps pages and
//! programs page tables for each device. This crate sits between the API layer and the memory
//! backend and makes that cost mostly disappear, while keeping track of what the devices are
//! still using.
//!
//! # Brief summary
//!
//! - The [`UnifiedMemoryManager`] is the entry point. It is created with an
//!   [`AllocationBackend`], which performs the actual allocation and mapping of
//!   [`BackingBuffer`]s, and a table of devices described by [`DeviceInfo`]s.
//!
//! - Every live allocation is described by one [`AllocationRecord`], which is registered in the
//!   [`AllocationRegistry`] under the address of its primary buffer. Interior pointers can be
//!   resolved to their record with [`UnifiedMemoryManager::find`].
//!
//! - Freed device and host allocations are not destroyed right away, but parked in an
//!   [`AllocationCache`], from which a later request of similar size can take them without
//!   calling into the backend at all. A [`ReuseCleaner`] can release entries that were held for
//!   too long.
//!
//! - Allocations that are freed while the device still uses them are parked in the
//!   [`DeferredFreeQueue`] and destroyed once the backend reports them idle.
//!
//! - Allocations that kernels only reach through embedded pointers are made resident on a
//!   [`CommandStream`] by the [`IndirectResidencyTracker`], which uses the monotonic
//!   [`AllocationId`]s to only ever look at allocations it hasn't seen yet.
//!
//! # Allocation strategies
//!
//! Device and host allocations are backed by a single buffer per device. Shared allocations are
//! backed by a single migratable buffer if the device can migrate pages on fault, otherwise by a
//! host buffer and a device buffer that live at the same virtual address. See
//! [`MemoryKind`] for details.
//!
//! [`AllocationBackend`]: backend::AllocationBackend
//! [`BackingBuffer`]: backend::BackingBuffer
//! [`CommandStream`]: backend::CommandStream
//! [`DeviceInfo`]: device::DeviceInfo
//! [`AllocationRecord`]: record::AllocationRecord
//! [`AllocationId`]: record::AllocationId
//! [`MemoryKind`]: record::MemoryKind
//! [`AllocationRegistry`]: registry::AllocationRegistry
//! [`AllocationCache`]: cache::AllocationCache
//! [`DeferredFreeQueue`]: deferred::DeferredFreeQueue
//! [`IndirectResidencyTracker`]: residency::IndirectResidencyTracker
//! [`ReuseCleaner`]: cleaner::ReuseCleaner

pub use crate::manager::{
    AllocationCreateInfo, UnifiedMemoryManager, UnifiedMemoryManagerCreateInfo,
};
use std::{error::Error, fmt};


pub mod backend;
pub mod cache;
pub mod cleaner;
pub mod deferred;
pub mod device;
pub mod manager;
pub mod record;
pub mod registry;
pub mod residency;

/// Represents memory size, offset and address values of unified memory.
/// Analogous to the Rust `usize` type on the host.
pub type DeviceSize = u64;

/// A helper type for non-exhaustive structs.
///
/// This type cannot be constructed outside this crate. Structures with a field of this type can
/// only be constructed by calling a constructor function or `Default::default()`. The effect is
/// similar to the standard Rust `#[non_exhaustive]` attribute, except that it does not prevent
/// update syntax from being used.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)] // add traits as needed
pub struct NonExhaustive(pub(crate) ());

/// Error that can be returned by the operations of the [`UnifiedMemoryManager`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UsmError {
    /// The caller passed an argument that the manager can't act on.
    InvalidArgument(InvalidArgument),

    /// The backend failed to allocate memory, even after the caches were trimmed.
    OutOfMemory(OomError),
}

impl Error for UsmError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::InvalidArgument(err) => Some(err),
            Self::OutOfMemory(err) => Some(err),
        }
    }
}

impl fmt::Display for UsmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument(_) => write!(f, "an invalid argument was provided"),
            Self::OutOfMemory(_) => write!(f, "the allocation could not be created"),
        }
    }
}

impl From<InvalidArgument> for UsmError {
    fn from(err: InvalidArgument) -> Self {
        Self::InvalidArgument(err)
    }
}

impl From<OomError> for UsmError {
    fn from(err: OomError) -> Self {
        Self::OutOfMemory(err)
    }
}

/// The reason an argument was rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InvalidArgument {
    /// The pointer doesn't belong to any allocation known to the manager.
    UnknownPointer,

    /// The pointer points into an allocation, but not at its start.
    ///
    /// Only the pointer that was returned on creation may be freed.
    InteriorPointer,

    /// The requested size was zero.
    ZeroSize,

    /// The requested alignment was not a power of two.
    InvalidAlignment,

    /// The device id is not part of the manager's device table.
    UnknownDevice,

    /// A device allocation was requested without naming a device.
    MissingDevice,

    /// The range reaches past the end of the allocation it starts in.
    OutOfBounds,

    /// An allocation is already registered at the address of the imported buffer.
    AlreadyRegistered,

    /// The allocation has no storage that the device can access, for example a device
    /// allocation owned by another device.
    NotAccessibleByDevice,
}

impl Error for InvalidArgument {}

impl fmt::Display for InvalidArgument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::UnknownPointer => "the pointer doesn't belong to any unified allocation",
                Self::InteriorPointer => "the pointer doesn't point to the start of its allocation",
                Self::ZeroSize => "the requested size was zero",
                Self::InvalidAlignment => "the requested alignment is not a power of two",
                Self::UnknownDevice => "the device is not part of the device table",
                Self::MissingDevice => "a device allocation requires a device",
                Self::OutOfBounds => "the range reaches past the end of the allocation",
                Self::AlreadyRegistered => "an allocation is already registered at this address",
                Self::NotAccessibleByDevice => {
                    "the allocation has no storage accessible by the device"
                }
            }
        )
    }
}

/// Error type returned by the [`AllocationBackend`] when it runs out of memory.
///
/// [`AllocationBackend`]: backend::AllocationBackend
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OomError {
    /// There is no memory available on the host (ie. the CPU, RAM, etc.).
    OutOfHostMemory,
    /// There is no memory available on the device (ie. video memory).
    OutOfDeviceMemory,
}

impl Error for OomError {}

impl fmt::Display for OomError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                OomError::OutOfHostMemory => "no memory available on the host",
                OomError::OutOfDeviceMemory => "no memory available on the device",
            }
        )
    }
}

/// Signals that an allocation is still referenced by outstanding device work and can't be
/// destroyed yet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct AllocationInUse;

pub(crate) const fn align_up(val: DeviceSize, alignment: DeviceSize) -> DeviceSize {
    align_down(val + alignment - 1, alignment)
}

pub(crate) const fn align_down(val: DeviceSize, alignment: DeviceSize) -> DeviceSize {
    debug_assert!(alignment.is_power_of_two());

    val & !(alignment - 1)
}

pub(crate) const fn is_aligned(val: DeviceSize, alignment: DeviceSize) -> bool {
    val & (alignment - 1) == 0
}
