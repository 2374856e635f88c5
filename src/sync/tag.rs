//! The per-engine hardware completion cell.
//!
//! After executing a submitted batch, the hardware writes the batch's task
//! count into the engine's tag cell. That store is the only completion signal
//! the device produces: there is no interrupt and no OS wait object, so every
//! observer polls. Reads are lock-free and may happen concurrently on any
//! number of threads; only the hardware (or a simulation backend standing in
//! for it) writes.

use crate::config::WaitConfig;
use crate::sync::completion::{TASK_COUNT_NOT_READY, TaskCount};
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::Instant;

/// Result of a bounded poll on a completion cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Reached,
    TimedOut,
}

/// Contract through which work retirement reaches a tag cell.
///
/// Real hardware writes the mapped cell directly. Simulation backends (null
/// hardware, trace capture) satisfy the same contract by calling `retire`
/// when they consider a batch executed; everything above the cell is
/// indifferent to which backend is driving it.
pub trait TagWriter: Send + Sync {
    fn retire(&self, task_count: TaskCount);
}

#[derive(Debug)]
pub struct CompletionTag {
    value: AtomicU32,
}

impl CompletionTag {
    pub const INITIAL_HARDWARE_TAG: TaskCount = 0;

    #[must_use]
    pub const fn new(initial: TaskCount) -> Self {
        Self {
            value: AtomicU32::new(initial),
        }
    }

    #[inline]
    #[must_use]
    pub fn load_relaxed(&self) -> TaskCount {
        self.value.load(Ordering::Relaxed)
    }

    #[inline]
    #[must_use]
    pub fn load_acquire(&self) -> TaskCount {
        self.value.load(Ordering::Acquire)
    }

    /// `true` once the hardware has executed at least up to `task_count`.
    ///
    /// The not-ready sentinel is never considered reached: a count that was
    /// never assigned cannot complete.
    #[inline]
    #[must_use]
    pub fn is_reached(&self, task_count: TaskCount) -> bool {
        task_count != TASK_COUNT_NOT_READY && self.load_acquire() >= task_count
    }

    /// Polls the cell until `task_count` is reached, backing off per the
    /// supplied configuration: spin window, then yields, then sleeps.
    pub fn poll_until(&self, task_count: TaskCount, config: &WaitConfig) -> PollOutcome {
        let start = Instant::now();
        let mut probes: u32 = 0;

        loop {
            if self.is_reached(task_count) {
                return PollOutcome::Reached;
            }

            if let Some(timeout) = config.timeout
                && start.elapsed() >= timeout
            {
                return PollOutcome::TimedOut;
            }

            backoff_probe(config, probes);
            probes = probes.saturating_add(1);
        }
    }
}

/// One step of the staged poll backoff: spin while inside the spin window,
/// yield inside the yield window, sleep afterwards.
pub(crate) fn backoff_probe(config: &WaitConfig, probes: u32) {
    if probes < config.spin_iterations {
        std::hint::spin_loop();
    } else if probes < config.spin_iterations.saturating_add(config.yield_cycles) {
        thread::yield_now();
    } else {
        thread::sleep(config.sleep_interval);
    }
}

impl TagWriter for CompletionTag {
    /// Hardware-side store. Kept monotonic so a reordered retirement report
    /// cannot roll the visible completion state backwards.
    fn retire(&self, task_count: TaskCount) {
        self.value.fetch_max(task_count, Ordering::AcqRel);
    }
}
