// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Background release of allocations that sat in a reuse cache for too long.

use crate::{NonExhaustive, UnifiedMemoryManager};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::{
    io,
    sync::{Arc, Weak},
    thread::{self, JoinHandle},
    time::Duration,
};

/// Parameters to create a new [`ReuseCleaner`].
#[derive(Clone, Debug)]
pub struct ReuseCleanerCreateInfo {
    /// How long the cleaner sleeps between two sweeps. Must not be zero.
    ///
    /// The default value is 15 milliseconds.
    pub period: Duration,

    /// Cached allocations that have been held for longer than this are destroyed.
    ///
    /// The default value is 10 seconds.
    pub max_hold_time: Duration,

    pub _ne: NonExhaustive,
}

impl Default for ReuseCleanerCreateInfo {
    #[inline]
    fn default() -> Self {
        ReuseCleanerCreateInfo {
            period: Duration::from_millis(15),
            max_hold_time: Duration::from_secs(10),
            _ne: NonExhaustive(()),
        }
    }
}

/// A thread that periodically destroys allocations that have been held in the reuse caches of a
/// [`UnifiedMemoryManager`] for too long.
///
/// Each sweep destroys at most the oldest expired allocation of each cache, so that a burst of
/// frees is released gradually rather than all at once.
///
/// The cleaner doesn't keep the manager alive. It stops when it is dropped, or on its own once
/// the manager has been dropped.
#[derive(Debug)]
pub struct ReuseCleaner {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

#[derive(Debug, Default)]
struct Shared {
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl ReuseCleaner {
    /// Starts a cleaner for `manager`.
    ///
    /// # Panics
    ///
    /// - Panics if `create_info.period` is zero.
    pub fn spawn(
        manager: &Arc<UnifiedMemoryManager>,
        create_info: ReuseCleanerCreateInfo,
    ) -> io::Result<Self> {
        assert!(
            !create_info.period.is_zero(),
            "`create_info.period` must not be zero",
        );

        let shared = Arc::new(Shared::default());
        let manager = Arc::downgrade(manager);

        let thread = thread::Builder::new()
            .name("usm-reuse-cleaner".to_owned())
            .spawn({
                let shared = shared.clone();
                move || run(&manager, &shared, &create_info)
            })?;

        Ok(ReuseCleaner {
            shared,
            thread: Some(thread),
        })
    }

    /// Stops the cleaner and waits for its thread to exit.
    #[inline]
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        *self.shared.stopped.lock() = true;
        self.shared.wake.notify_all();

        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("reuse cleaner thread panicked");
            }
        }
    }
}

impl Drop for ReuseCleaner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(
    manager: &Weak<UnifiedMemoryManager>,
    shared: &Shared,
    create_info: &ReuseCleanerCreateInfo,
) {
    tracing::debug!(
        period = ?create_info.period,
        max_hold_time = ?create_info.max_hold_time,
        "reuse cleaner started"
    );

    let mut stopped = shared.stopped.lock();

    while !*stopped {
        shared.wake.wait_for(&mut stopped, create_info.period);

        if *stopped {
            break;
        }

        let Some(manager) = manager.upgrade() else {
            break;
        };

        MutexGuard::unlocked(&mut stopped, || {
            manager.trim_old_cache_entries(create_info.max_hold_time, false);
        });
    }

    tracing::debug!("reuse cleaner stopped");
}
