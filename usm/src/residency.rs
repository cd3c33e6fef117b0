// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Residency of allocations that kernels access indirectly.
//!
//! When a kernel reaches an allocation through a pointer stored in other memory, the driver can't
//! tell from the kernel arguments that the allocation is needed. Such allocations must be made
//! resident proactively, for every submission to every stream that might touch them.
//!
//! Walking all allocations before every submission would be too expensive. Instead, the tracker
//! remembers for each stream the highest [`AllocationId`] it has already made resident, and pins
//! those allocations as *always resident*. Since ids are handed out in increasing order, only
//! allocations with a higher id can be new to the stream.
//!
//! [`AllocationId`]: crate::record::AllocationId

use crate::{
    backend::{BackingBuffer, CommandStream, StreamId, TaskCount},
    device::DeviceId,
    record::AllocationRecord,
    registry::AllocationRegistry,
};
use foldhash::HashMap;
use std::{
    collections::hash_map::Entry,
    sync::{Arc, Weak},
};

/// The residency state of one stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResidencyEntry {
    /// The task count passed with the latest request to make allocations resident.
    pub latest_sent_task_count: TaskCount,

    /// The highest allocation id that was made resident on the stream. Never decreases.
    pub latest_resident_object_id: u64,
}

#[derive(Debug)]
struct StreamEntry {
    stream: Weak<dyn CommandStream>,
    state: ResidencyEntry,
}

impl StreamEntry {
    fn is_for(&self, stream: &Arc<dyn CommandStream>) -> bool {
        self.stream
            .upgrade()
            .is_some_and(|tracked| Arc::ptr_eq(&tracked, stream))
    }
}

/// Per-stream bookkeeping of which allocations were made resident indirectly.
///
/// See [the module-level documentation] for details.
///
/// The tracker must observe registry insertions in id order, which is why the manager keeps it
/// under the same lock as the [`AllocationRegistry`].
///
/// [the module-level documentation]: self
#[derive(Debug, Default)]
pub struct IndirectResidencyTracker {
    entries: HashMap<StreamId, StreamEntry>,
}

impl IndirectResidencyTracker {
    #[inline]
    pub fn new() -> Self {
        IndirectResidencyTracker::default()
    }

    /// Makes every allocation in `registry` that `stream` hasn't seen yet resident on it.
    ///
    /// The first call for a stream covers all registered allocations. Later calls only cover
    /// allocations registered since the previous call.
    pub fn make_resident(
        &mut self,
        registry: &AllocationRegistry,
        stream: &Arc<dyn CommandStream>,
        task_count: TaskCount,
    ) {
        let counter = registry.allocations_counter();
        let fresh = StreamEntry {
            stream: Arc::downgrade(stream),
            state: ResidencyEntry {
                latest_sent_task_count: task_count,
                latest_resident_object_id: counter,
            },
        };

        let after = match self.entries.entry(stream.id()) {
            Entry::Vacant(entry) => {
                entry.insert(fresh);

                0
            }
            // A new stream may have been created with the id of a dropped one. It hasn't seen
            // anything yet.
            Entry::Occupied(mut entry) if !entry.get().is_for(stream) => {
                entry.insert(fresh);

                0
            }
            Entry::Occupied(mut entry) => {
                let state = &mut entry.get_mut().state;
                state.latest_sent_task_count = task_count;

                if counter <= state.latest_resident_object_id {
                    return;
                }

                let after = state.latest_resident_object_id;
                state.latest_resident_object_id = counter;

                after
            }
        };

        tracing::trace!(
            stream = stream.id().0,
            after,
            up_to = counter,
            "making indirect allocations resident"
        );

        let device = stream.device();

        for (_, buffers) in registry.buffers_after(after) {
            for buffer in buffers.iter().filter(|buffer| belongs_to(buffer, device)) {
                stream.make_resident(buffer);
                stream.set_always_resident(buffer, true);
            }
        }
    }

    /// Unpins `record` from every stream that made it resident, replacing the pin with a
    /// task-count watermark so that the stream's resident set doesn't keep referencing the
    /// allocation after it's destroyed.
    ///
    /// The watermark is the later of the stream's latest task count and the allocation's last
    /// use on the stream. For a non-blocking free only the allocation's own last use counts.
    pub fn prepare_for_destruction(&mut self, record: &AllocationRecord, non_blocking_free: bool) {
        let id = record.id().get();

        self.entries.retain(|_, entry| {
            let Some(stream) = entry.stream.upgrade() else {
                return false;
            };

            if id > entry.state.latest_resident_object_id {
                return true;
            }

            let device = stream.device();

            for buffer in record.storage().gpu_buffers() {
                if !belongs_to(buffer, device) {
                    continue;
                }

                let buffer_task_count = stream.buffer_task_count(buffer);
                let task_count = if non_blocking_free {
                    buffer_task_count
                } else {
                    buffer_task_count.max(entry.state.latest_sent_task_count)
                };

                stream.set_always_resident(buffer, false);
                stream.clear_residency_watermark(buffer, task_count);
            }

            true
        });
    }

    /// Forgets about the stream.
    pub fn remove_stream(&mut self, id: StreamId) -> Option<ResidencyEntry> {
        self.entries.remove(&id).map(|entry| entry.state)
    }

    /// Returns the state of the stream, if it ever had allocations made resident.
    pub fn entry(&self, id: StreamId) -> Option<ResidencyEntry> {
        self.entries.get(&id).map(|entry| entry.state)
    }

    /// Returns the number of tracked streams.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn belongs_to(buffer: &BackingBuffer, device: DeviceId) -> bool {
    buffer.device().is_none_or(|d| d == device)
}
