//! Engine contexts and the registry of live contexts.
//!
//! An [`EngineContext`] identifies one independent hardware submission lane.
//! It owns the lane's completion tag, the monotonically increasing
//! last-submitted task count, the task level used for dependency ordering,
//! and the allocation store for memory the lane's work touches. Submission is
//! serialized per context: the owning queue thread is the only writer of the
//! submitted counters, while any thread may read them or poll the tag.

use crate::config::WaitConfig;
use crate::error::{DriverError, DriverResult};
use crate::memory::allocation::{AllocationId, AllocationKind, GraphicsAllocation};
use crate::memory::manager::{AllocationProperties, MemoryManager};
use crate::memory::storage::{AllocationStore, StorageKind};
use crate::sync::completion::{
    CompletionStamp, FlushStamp, FlushStampTracker, TASK_COUNT_NOT_USED, TaskCount,
};
use crate::sync::tag::{CompletionTag, backoff_probe};
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub type ContextId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    Compute,
    Copy,
}

// ===============================================================================================
// Context Registry
// ===============================================================================================

/// Registry of currently live engine contexts.
///
/// Hands out stable context ids and keeps each live context's tag reachable
/// for completion checks. Reclamation consults it to decide whether a
/// context's outstanding obligations still matter: a deregistered context can
/// never complete further work, so its obligations are treated as satisfied.
#[derive(Debug, Default)]
pub struct ContextRegistry {
    inner: Mutex<RegistryInner>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    next_id: ContextId,
    live: HashMap<ContextId, Arc<CompletionTag>>,
}

impl ContextRegistry {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn register(&self, tag: Arc<CompletionTag>) -> ContextId {
        let mut inner = self.inner.lock().unwrap();
        let context_id = inner.next_id;
        inner.next_id += 1;
        inner.live.insert(context_id, tag);
        debug!("registered engine context {context_id}");
        context_id
    }

    fn deregister(&self, context_id: ContextId) {
        self.inner.lock().unwrap().live.remove(&context_id);
        debug!("deregistered engine context {context_id}");
    }

    #[must_use]
    pub fn is_registered(&self, context_id: ContextId) -> bool {
        self.inner.lock().unwrap().live.contains_key(&context_id)
    }

    #[must_use]
    pub fn tag_for(&self, context_id: ContextId) -> Option<Arc<CompletionTag>> {
        self.inner.lock().unwrap().live.get(&context_id).cloned()
    }

    #[must_use]
    pub fn live_context_count(&self) -> usize {
        self.inner.lock().unwrap().live.len()
    }

    /// `true` when `task_count` no longer blocks anything on `context_id`:
    /// either the hardware has reached it, or the context is gone.
    #[must_use]
    pub fn is_obligation_satisfied(&self, context_id: ContextId, task_count: TaskCount) -> bool {
        match self.tag_for(context_id) {
            Some(tag) => tag.is_reached(task_count),
            None => true,
        }
    }
}

// ===============================================================================================
// Engine Context
// ===============================================================================================

#[derive(Debug)]
pub struct EngineContext {
    context_id: ContextId,
    engine_kind: EngineKind,
    tag: Arc<CompletionTag>,
    registry: Arc<ContextRegistry>,
    memory_manager: Arc<dyn MemoryManager>,
    storage: AllocationStore,
    wait_config: WaitConfig,

    /// Written only by the owning queue thread.
    task_count: AtomicU32,
    latest_flushed: AtomicU32,
    task_level: AtomicU32,
    next_flush_stamp: AtomicU64,
    flush_stamp: FlushStampTracker,
    hung: AtomicBool,
}

impl EngineContext {
    /// Opens a submission lane against a device engine and registers it.
    #[must_use]
    pub fn create(
        registry: &Arc<ContextRegistry>,
        engine_kind: EngineKind,
        memory_manager: Arc<dyn MemoryManager>,
        wait_config: WaitConfig,
    ) -> Arc<Self> {
        let tag = Arc::new(CompletionTag::new(CompletionTag::INITIAL_HARDWARE_TAG));
        let context_id = registry.register(Arc::clone(&tag));
        let storage = AllocationStore::new(Arc::clone(&tag), Arc::clone(&memory_manager));

        Arc::new(Self {
            context_id,
            engine_kind,
            tag,
            registry: Arc::clone(registry),
            memory_manager,
            storage,
            wait_config,
            task_count: AtomicU32::new(0),
            latest_flushed: AtomicU32::new(0),
            task_level: AtomicU32::new(0),
            next_flush_stamp: AtomicU64::new(0),
            flush_stamp: FlushStampTracker::new(),
            hung: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn context_id(&self) -> ContextId {
        self.context_id
    }

    #[must_use]
    pub fn engine_kind(&self) -> EngineKind {
        self.engine_kind
    }

    #[must_use]
    pub fn tag(&self) -> &Arc<CompletionTag> {
        &self.tag
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ContextRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn wait_config(&self) -> &WaitConfig {
        &self.wait_config
    }

    #[must_use]
    pub fn peek_task_count(&self) -> TaskCount {
        self.task_count.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn peek_task_level(&self) -> TaskCount {
        self.task_level.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn latest_flushed_task_count(&self) -> TaskCount {
        self.latest_flushed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn obtain_current_flush_stamp(&self) -> FlushStamp {
        self.flush_stamp.peek_stamp()
    }

    /// Bumps the dependency-ordering level. Called by the submission layer
    /// when an enqueued command introduces an ordering point.
    pub fn advance_task_level(&self) -> TaskCount {
        self.task_level.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Records one flushed submission and returns its completion stamp.
    ///
    /// Submission is serialized per context, so the increment order here is
    /// the task-count order the hardware will retire in.
    pub fn flush(&self) -> CompletionStamp {
        let submitted = self.task_count.fetch_add(1, Ordering::AcqRel) + 1;
        self.latest_flushed.fetch_max(submitted, Ordering::AcqRel);

        let stamp = self.next_flush_stamp.fetch_add(1, Ordering::AcqRel) + 1;
        self.flush_stamp.set_stamp(stamp);

        CompletionStamp::new(self.peek_task_level(), submitted, stamp)
    }

    /// Marks the engine as hung. Waits in progress return an error instead of
    /// polling a tag that will never advance.
    pub fn mark_hung(&self) {
        warn!("engine context {} reported a device hang", self.context_id);
        self.hung.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_hung(&self) -> bool {
        self.hung.load(Ordering::Acquire)
    }

    // =====================================================================================
    // Completion protocol
    // =====================================================================================

    /// Lock-free completion check: has the hardware reached `task_count`?
    #[inline]
    #[must_use]
    pub fn is_complete(&self, task_count: TaskCount) -> bool {
        self.tag.is_reached(task_count)
    }

    /// Busy-polls the tag until `task_count` is reached.
    ///
    /// Unbounded unless the context's [`WaitConfig`] carries a timeout;
    /// correctness relies only on eventual monotonic progress of the cell.
    pub fn wait_until_complete(&self, task_count: TaskCount) -> DriverResult<()> {
        let start = Instant::now();
        let mut probes: u32 = 0;

        loop {
            if self.is_complete(task_count) {
                return Ok(());
            }
            if self.is_hung() {
                return Err(DriverError::GpuHang(self.context_id));
            }
            if let Some(timeout) = self.wait_config.timeout
                && start.elapsed() >= timeout
            {
                return Err(DriverError::WaitTimeout);
            }

            backoff_probe(&self.wait_config, probes);
            probes = probes.saturating_add(1);
        }
    }

    /// Bounded wait variant for callers that layer their own timeout policy.
    /// Returns whether the count was reached.
    pub fn wait_with_timeout(
        &self,
        enable_timeout: bool,
        timeout: Duration,
        task_count: TaskCount,
    ) -> bool {
        let start = Instant::now();
        let mut probes: u32 = 0;

        loop {
            if self.is_complete(task_count) {
                return true;
            }
            if self.is_hung() {
                return false;
            }
            if enable_timeout && start.elapsed() >= timeout {
                return false;
            }

            backoff_probe(&self.wait_config, probes);
            probes = probes.saturating_add(1);
        }
    }

    // =====================================================================================
    // Residency
    // =====================================================================================

    /// Reflects a make-resident request into the allocation's counters. The
    /// usage task count only moves when the allocation was not already
    /// resident for the upcoming submission.
    pub fn make_resident(&self, allocation: &GraphicsAllocation) {
        let submission_task_count = self.peek_task_count() + 1;
        if allocation.is_residency_task_count_below(submission_task_count, self.context_id) {
            allocation.update_task_count(submission_task_count, self.context_id);
        }
        allocation.update_residency_task_count(submission_task_count, self.context_id);
    }

    pub fn make_non_resident(&self, allocation: &GraphicsAllocation) {
        allocation.release_residency_in_context(self.context_id);
    }

    // =====================================================================================
    // Allocation storage
    // =====================================================================================

    /// Hands an allocation to this context's store. Temporary entries carry
    /// the count of the submission they are in flight for; reusable entries
    /// carry the count they must reach before being handed out again.
    pub fn store_allocation(&self, allocation: Box<GraphicsAllocation>, kind: StorageKind) {
        let mut required = allocation.get_task_count(self.context_id);
        if required == TASK_COUNT_NOT_USED {
            // Never submitted on this context: nothing outstanding.
            required = CompletionTag::INITIAL_HARDWARE_TAG;
        }
        self.storage
            .store_allocation_with_task_count(allocation, kind, required);
    }

    pub fn clean_allocation_list(&self, completed_task_count: TaskCount, kind: StorageKind) {
        self.storage.clean_allocation_list(completed_task_count, kind);
    }

    #[must_use]
    pub fn obtain_reusable_allocation(
        &self,
        min_size: usize,
        kind: AllocationKind,
    ) -> Option<Box<GraphicsAllocation>> {
        self.storage.obtain_reusable_allocation(min_size, kind)
    }

    #[must_use]
    pub fn allocation_store(&self) -> &AllocationStore {
        &self.storage
    }

    /// Allocates (or reuses) a host-transfer surface for the next submission
    /// and tracks it as temporary. On failure nothing is left half-registered:
    /// the allocation either reaches the store with its usage recorded, or the
    /// error is returned before any registration happened.
    pub fn stage_host_transfer_allocation(&self, size: usize) -> DriverResult<AllocationId> {
        let allocation = match self.obtain_reusable_allocation(size, AllocationKind::HostTransfer) {
            Some(reused) => reused,
            None => self
                .memory_manager
                .allocate_graphics_memory(&AllocationProperties::new(
                    size,
                    AllocationKind::HostTransfer,
                ))?,
        };

        let id = allocation.id();
        allocation.update_task_count(self.peek_task_count() + 1, self.context_id);
        self.storage.store_allocation_with_task_count(
            allocation,
            StorageKind::Temporary,
            self.peek_task_count() + 1,
        );
        Ok(id)
    }

    /// Waits for `task_count`, then reclaims every store entry the hardware
    /// has provably passed. A hang or timeout still reclaims what completed.
    pub fn wait_for_task_count_and_clean(&self, task_count: TaskCount, kind: StorageKind) {
        let _ = self.wait_until_complete(task_count);
        self.storage
            .clean_allocation_list(self.tag.load_acquire(), kind);
    }

    /// Queue-destruction pass: waits for the latest flushed work, then drains
    /// both stores. Entries that never completed (hang, timeout) are freed
    /// unconditionally afterwards; a destroyed context cannot complete them.
    pub fn cleanup_resources(&self) {
        let target = self.latest_flushed_task_count();
        self.wait_for_task_count_and_clean(target, StorageKind::Temporary);
        self.wait_for_task_count_and_clean(target, StorageKind::Reusable);

        self.storage
            .clean_allocation_list(TaskCount::MAX, StorageKind::Temporary);
        self.storage
            .clean_allocation_list(TaskCount::MAX, StorageKind::Reusable);
    }
}

impl Drop for EngineContext {
    fn drop(&mut self) {
        self.cleanup_resources();
        self.registry.deregister(self.context_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::manager::SystemMemoryManager;
    use crate::sync::tag::TagWriter;

    fn test_context(registry: &Arc<ContextRegistry>) -> (Arc<EngineContext>, Arc<SystemMemoryManager>) {
        let manager = Arc::new(SystemMemoryManager::new());
        let context = EngineContext::create(
            registry,
            EngineKind::Compute,
            Arc::clone(&manager) as Arc<dyn MemoryManager>,
            WaitConfig::new().with_timeout(Duration::from_millis(50)),
        );
        (context, manager)
    }

    #[test]
    fn flush_produces_monotonic_stamps() {
        let registry = ContextRegistry::new();
        let (context, _manager) = test_context(&registry);

        let first = context.flush();
        let second = context.flush();
        assert_eq!(first.task_count, 1);
        assert_eq!(second.task_count, 2);
        assert!(second.flush_stamp > first.flush_stamp);
        assert_eq!(context.latest_flushed_task_count(), 2);

        context.tag().retire(2);
    }

    #[test]
    fn completion_follows_the_tag() {
        let registry = ContextRegistry::new();
        let (context, _manager) = test_context(&registry);

        let stamp = context.flush();
        assert!(!context.is_complete(stamp.task_count));

        context.tag().retire(stamp.task_count);
        assert!(context.is_complete(stamp.task_count));
        assert!(context.wait_until_complete(stamp.task_count).is_ok());
    }

    #[test]
    fn bounded_wait_reports_failure_without_hanging() {
        let registry = ContextRegistry::new();
        let (context, _manager) = test_context(&registry);

        let stamp = context.flush();
        assert!(!context.wait_with_timeout(true, Duration::from_millis(5), stamp.task_count));
        assert_eq!(
            context.wait_until_complete(stamp.task_count),
            Err(DriverError::WaitTimeout)
        );

        context.tag().retire(stamp.task_count);
    }

    #[test]
    fn hang_fails_blocking_waits() {
        let registry = ContextRegistry::new();
        let (context, _manager) = test_context(&registry);

        let stamp = context.flush();
        context.mark_hung();
        assert_eq!(
            context.wait_until_complete(stamp.task_count),
            Err(DriverError::GpuHang(context.context_id()))
        );

        context.tag().retire(stamp.task_count);
    }

    #[test]
    fn registry_tracks_context_lifecycle() {
        let registry = ContextRegistry::new();
        let id = {
            let (context, _manager) = test_context(&registry);
            let id = context.context_id();
            assert!(registry.is_registered(id));
            assert_eq!(registry.live_context_count(), 1);
            id
        };
        assert!(!registry.is_registered(id));
        assert_eq!(registry.live_context_count(), 0);
        // Obligations on a destroyed context are satisfied by definition.
        assert!(registry.is_obligation_satisfied(id, 17));
    }

    #[test]
    fn contexts_get_distinct_ids() {
        let registry = ContextRegistry::new();
        let (a, _ma) = test_context(&registry);
        let (b, _mb) = test_context(&registry);
        assert_ne!(a.context_id(), b.context_id());
    }
}
