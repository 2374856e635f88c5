//! Background reclamation of allocations whose completion could not be
//! confirmed at free-request time.
//!
//! Producers on any thread enqueue [`DeletionRequest`]s; one consumer thread
//! drains the queue, re-queueing requests whose allocation is still in flight
//! with a bounded backoff between passes. A request is never dropped while
//! its allocation is in use. Completion polling inside `apply` is lock-free;
//! only the queue itself takes the lock.

use crate::memory::allocation::GraphicsAllocation;
use crate::memory::manager::MemoryManager;
use crate::sync::engine::ContextRegistry;
use log::{debug, trace};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// A free that could not complete synchronously.
#[derive(Debug)]
pub struct DeletionRequest {
    memory_manager: Arc<dyn MemoryManager>,
    allocation: Box<GraphicsAllocation>,
}

impl DeletionRequest {
    #[must_use]
    pub fn new(memory_manager: Arc<dyn MemoryManager>, allocation: Box<GraphicsAllocation>) -> Self {
        Self {
            memory_manager,
            allocation,
        }
    }

    /// Attempts the free. Returns `None` once the allocation was released;
    /// returns the request back when some live context still holds an
    /// unreached obligation on it.
    pub fn apply(self, registry: &ContextRegistry) -> Option<Self> {
        if self.allocation.can_free(registry) {
            self.memory_manager.free_graphics_allocation(self.allocation);
            None
        } else {
            Some(self)
        }
    }

    #[must_use]
    pub fn allocation(&self) -> &GraphicsAllocation {
        &self.allocation
    }
}

#[derive(Debug, Default)]
struct DeleterState {
    queue: VecDeque<DeletionRequest>,
    /// Requests accepted but not yet freed; covers the window where the
    /// worker holds a popped request outside the queue.
    outstanding: usize,
    stop: bool,
    abandoned: bool,
}

impl DeleterState {
    fn should_stop(&self) -> bool {
        self.abandoned || (self.stop && self.queue.is_empty())
    }
}

#[derive(Debug)]
struct DeleterShared {
    state: Mutex<DeleterState>,
    condvar: Condvar,
    registry: Arc<ContextRegistry>,
    retry_interval: Duration,
}

/// Owns the consumer thread. Dropping the deleter stops it gracefully after
/// the queue has fully drained; use [`DeferredDeleter::abandon`] when exiting
/// with requests that can no longer complete.
#[derive(Debug)]
pub struct DeferredDeleter {
    shared: Arc<DeleterShared>,
    worker: Option<JoinHandle<()>>,
}

impl DeferredDeleter {
    #[must_use]
    pub fn new(registry: Arc<ContextRegistry>, retry_interval: Duration) -> Self {
        let shared = Arc::new(DeleterShared {
            state: Mutex::new(DeleterState::default()),
            condvar: Condvar::new(),
            registry,
            retry_interval,
        });

        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("gpu-sync-deleter".into())
            .spawn(move || run_worker(&worker_shared))
            .expect("failed to spawn deferred deleter thread");

        Self {
            shared,
            worker: Some(worker),
        }
    }

    /// Enqueues a request and wakes the consumer if it is idle. Callable from
    /// any number of producer threads concurrently.
    pub fn defer_deletion(&self, request: DeletionRequest) {
        let mut state = self.shared.state.lock().unwrap();
        state.queue.push_back(request);
        state.outstanding += 1;
        self.shared.condvar.notify_all();
    }

    #[must_use]
    pub fn pending_deletions(&self) -> usize {
        self.shared.state.lock().unwrap().outstanding
    }

    /// Blocks until every accepted request has been freed.
    pub fn drain(&self) {
        let mut state = self.shared.state.lock().unwrap();
        while state.outstanding > 0 {
            state = self.shared.condvar.wait(state).unwrap();
        }
    }

    /// Stops the consumer without waiting for pending requests to become
    /// freeable and returns them with their resources still owned.
    #[must_use]
    pub fn abandon(mut self) -> Vec<DeletionRequest> {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.abandoned = true;
            state.stop = true;
        }
        self.shared.condvar.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }

        let mut state = self.shared.state.lock().unwrap();
        let remaining: Vec<_> = state.queue.drain(..).collect();
        state.outstanding -= remaining.len();
        remaining
    }
}

impl Drop for DeferredDeleter {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.stop = true;
        }
        self.shared.condvar.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn run_worker(shared: &DeleterShared) {
    debug!("deferred deleter thread started");

    loop {
        let request = {
            let mut state = shared.state.lock().unwrap();
            loop {
                if state.abandoned {
                    debug!("deferred deleter abandoned with {} requests", state.queue.len());
                    return;
                }
                if let Some(request) = state.queue.pop_front() {
                    break request;
                }
                if state.should_stop() {
                    debug!("deferred deleter thread stopping, queue drained");
                    return;
                }
                state = shared.condvar.wait(state).unwrap();
            }
        };

        match request.apply(&shared.registry) {
            None => {
                let mut state = shared.state.lock().unwrap();
                state.outstanding -= 1;
                shared.condvar.notify_all();
            }
            Some(request) => {
                trace!(
                    "allocation {} still in use, requeueing",
                    request.allocation().id()
                );
                shared.state.lock().unwrap().queue.push_back(request);
                // Everything queued may be waiting on the same stalled tag.
                thread::sleep(shared.retry_interval);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WaitConfig;
    use crate::memory::manager::{AllocationProperties, SystemMemoryManager};
    use crate::memory::allocation::AllocationKind;
    use crate::sync::engine::{EngineContext, EngineKind};
    use crate::sync::tag::TagWriter;
    use std::time::Instant;

    const RETRY: Duration = Duration::from_micros(200);

    fn wait_for_freed(manager: &SystemMemoryManager, expected: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while manager.freed_count() < expected {
            assert!(Instant::now() < deadline, "deleter made no progress");
            thread::yield_now();
        }
    }

    #[test]
    fn completed_allocation_is_freed_promptly() {
        let registry = ContextRegistry::new();
        let manager = Arc::new(SystemMemoryManager::new());
        let deleter = DeferredDeleter::new(Arc::clone(&registry), RETRY);

        let allocation = manager
            .allocate_graphics_memory(&AllocationProperties::new(64, AllocationKind::Buffer))
            .unwrap();
        deleter.defer_deletion(DeletionRequest::new(
            Arc::clone(&manager) as Arc<dyn MemoryManager>,
            allocation,
        ));

        deleter.drain();
        assert_eq!(manager.freed_count(), 1);
        assert_eq!(deleter.pending_deletions(), 0);
    }

    #[test]
    fn in_flight_allocation_is_held_until_its_count_is_reached() {
        let registry = ContextRegistry::new();
        let manager = Arc::new(SystemMemoryManager::new());
        let context = EngineContext::create(
            &registry,
            EngineKind::Compute,
            Arc::clone(&manager) as Arc<dyn MemoryManager>,
            WaitConfig::new().with_timeout(Duration::from_millis(50)),
        );
        let deleter = DeferredDeleter::new(Arc::clone(&registry), RETRY);

        let allocation = manager
            .allocate_graphics_memory(&AllocationProperties::new(64, AllocationKind::Buffer))
            .unwrap();
        let stamp = context.flush();
        allocation.update_task_count(stamp.task_count, context.context_id());

        deleter.defer_deletion(DeletionRequest::new(
            Arc::clone(&manager) as Arc<dyn MemoryManager>,
            allocation,
        ));

        thread::sleep(Duration::from_millis(10));
        assert_eq!(manager.freed_count(), 0, "freed before the tag advanced");

        context.tag().retire(stamp.task_count);
        deleter.drain();
        assert_eq!(manager.freed_count(), 1);
    }

    #[test]
    fn two_allocations_free_exactly_once_in_tag_order() {
        let registry = ContextRegistry::new();
        let manager = Arc::new(SystemMemoryManager::new());
        let context = EngineContext::create(
            &registry,
            EngineKind::Compute,
            Arc::clone(&manager) as Arc<dyn MemoryManager>,
            WaitConfig::new().with_timeout(Duration::from_millis(50)),
        );
        let deleter = DeferredDeleter::new(Arc::clone(&registry), RETRY);

        let first = manager
            .allocate_graphics_memory(&AllocationProperties::new(64, AllocationKind::Buffer))
            .unwrap();
        let second = manager
            .allocate_graphics_memory(&AllocationProperties::new(64, AllocationKind::Buffer))
            .unwrap();
        first.update_task_count(context.flush().task_count, context.context_id());
        second.update_task_count(context.flush().task_count, context.context_id());

        // Deferred in reverse submission order; frees still follow the tag.
        deleter.defer_deletion(DeletionRequest::new(
            Arc::clone(&manager) as Arc<dyn MemoryManager>,
            second,
        ));
        deleter.defer_deletion(DeletionRequest::new(
            Arc::clone(&manager) as Arc<dyn MemoryManager>,
            first,
        ));
        assert_eq!(manager.freed_count(), 0);

        context.tag().retire(1);
        wait_for_freed(&manager, 1);
        assert_eq!(manager.freed_count(), 1, "only the count-1 allocation may free at tag 1");

        context.tag().retire(2);
        deleter.drain();
        assert_eq!(manager.freed_count(), 2);
        assert_eq!(manager.allocated_count(), 2);
    }

    #[test]
    fn abandon_returns_unfreeable_requests() {
        let registry = ContextRegistry::new();
        let manager = Arc::new(SystemMemoryManager::new());
        let context = EngineContext::create(
            &registry,
            EngineKind::Compute,
            Arc::clone(&manager) as Arc<dyn MemoryManager>,
            WaitConfig::new().with_timeout(Duration::from_millis(50)),
        );
        let deleter = DeferredDeleter::new(Arc::clone(&registry), RETRY);

        let allocation = manager
            .allocate_graphics_memory(&AllocationProperties::new(64, AllocationKind::Buffer))
            .unwrap();
        let stamp = context.flush();
        allocation.update_task_count(stamp.task_count, context.context_id());

        deleter.defer_deletion(DeletionRequest::new(
            Arc::clone(&manager) as Arc<dyn MemoryManager>,
            allocation,
        ));
        thread::sleep(Duration::from_millis(5));

        let remaining = deleter.abandon();
        assert_eq!(remaining.len(), 1);
        assert_eq!(manager.freed_count(), 0);

        context.tag().retire(stamp.task_count);
    }

    #[test]
    fn concurrent_producers_all_get_freed() {
        let registry = ContextRegistry::new();
        let manager = Arc::new(SystemMemoryManager::new());
        let deleter = Arc::new(DeferredDeleter::new(Arc::clone(&registry), RETRY));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let manager = Arc::clone(&manager);
            let deleter = Arc::clone(&deleter);
            handles.push(thread::spawn(move || {
                for _ in 0..8 {
                    let allocation = manager
                        .allocate_graphics_memory(&AllocationProperties::new(
                            64,
                            AllocationKind::Buffer,
                        ))
                        .unwrap();
                    deleter.defer_deletion(DeletionRequest::new(
                        Arc::clone(&manager) as Arc<dyn MemoryManager>,
                        allocation,
                    ));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        deleter.drain();
        assert_eq!(manager.freed_count(), 32);
    }
}
