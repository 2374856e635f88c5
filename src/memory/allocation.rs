//! Device memory regions and their per-context completion bookkeeping.
//!
//! A [`GraphicsAllocation`] tracks two independent things for every engine
//! context that touches it: the highest task count it was submitted with
//! (an outstanding completion obligation) and the task count at which it was
//! last made resident (current occupancy of device-visible memory). The
//! usage table is sparse: contexts appear in it only once they touch the
//! allocation.
//!
//! Counter updates are single-writer per context slot but readable from any
//! thread, so the slots hold atomics while the table itself takes a lock only
//! for structural inserts.

use crate::sync::completion::{TASK_COUNT_NOT_RESIDENT, TASK_COUNT_NOT_USED, TaskCount};
use crate::sync::engine::{ContextId, ContextRegistry};
use log::debug;
use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU32, Ordering};

pub type AllocationId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocationKind {
    Buffer,
    CommandBuffer,
    LinearStream,
    InternalHeap,
    TagBuffer,
    HostTransfer,
}

#[derive(Debug)]
struct ContextUsage {
    task_count: AtomicU32,
    residency_task_count: AtomicU32,
}

impl ContextUsage {
    fn new() -> Self {
        Self {
            task_count: AtomicU32::new(TASK_COUNT_NOT_USED),
            residency_task_count: AtomicU32::new(TASK_COUNT_NOT_RESIDENT),
        }
    }
}

#[derive(Debug)]
pub struct GraphicsAllocation {
    id: AllocationId,
    kind: AllocationKind,
    data: Box<[u8]>,
    usage: RwLock<HashMap<ContextId, ContextUsage>>,
}

impl GraphicsAllocation {
    pub(crate) fn new(id: AllocationId, kind: AllocationKind, size: usize) -> Self {
        Self {
            id,
            kind,
            data: vec![0u8; size].into_boxed_slice(),
            usage: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn id(&self) -> AllocationId {
        self.id
    }

    #[must_use]
    pub fn kind(&self) -> AllocationKind {
        self.kind
    }

    #[must_use]
    pub fn underlying_size(&self) -> usize {
        self.data.len()
    }

    // =====================================================================================
    // Usage tracking (outstanding completion obligations)
    // =====================================================================================

    /// Records a submission of this allocation on `context_id`.
    ///
    /// Task counts only move forward. A non-sentinel value below the recorded
    /// one signals a logic bug: it trips a debug assertion and is discarded in
    /// release builds so the counter never corrupts. The one legal decrease is
    /// the explicit reset to `TASK_COUNT_NOT_USED` when a context stops
    /// owning the slot (queue destruction).
    pub fn update_task_count(&self, task_count: TaskCount, context_id: ContextId) {
        {
            let usage = self.usage.read().unwrap();
            if let Some(slot) = usage.get(&context_id) {
                Self::store_task_count(slot, task_count, context_id, self.id);
                return;
            }
        }

        let mut usage = self.usage.write().unwrap();
        let slot = usage.entry(context_id).or_insert_with(ContextUsage::new);
        Self::store_task_count(slot, task_count, context_id, self.id);
    }

    fn store_task_count(
        slot: &ContextUsage,
        task_count: TaskCount,
        context_id: ContextId,
        allocation_id: AllocationId,
    ) {
        let current = slot.task_count.load(Ordering::Relaxed);
        if task_count != TASK_COUNT_NOT_USED
            && current != TASK_COUNT_NOT_USED
            && task_count < current
        {
            debug_assert!(
                false,
                "task count regression on allocation {allocation_id}, context {context_id}: {current} -> {task_count}"
            );
            debug!(
                "ignoring task count regression on allocation {allocation_id}, context {context_id}: {current} -> {task_count}"
            );
            return;
        }
        slot.task_count.store(task_count, Ordering::Release);
    }

    #[must_use]
    pub fn get_task_count(&self, context_id: ContextId) -> TaskCount {
        self.usage
            .read()
            .unwrap()
            .get(&context_id)
            .map_or(TASK_COUNT_NOT_USED, |slot| {
                slot.task_count.load(Ordering::Acquire)
            })
    }

    /// `true` while any context holds an outstanding submission record.
    #[must_use]
    pub fn is_used(&self) -> bool {
        self.usage
            .read()
            .unwrap()
            .values()
            .any(|slot| slot.task_count.load(Ordering::Acquire) != TASK_COUNT_NOT_USED)
    }

    #[must_use]
    pub fn is_used_by_context(&self, context_id: ContextId) -> bool {
        self.get_task_count(context_id) != TASK_COUNT_NOT_USED
    }

    /// Clears the usage record for `context_id`. Used when the owning queue is
    /// destroyed and the context must stop blocking frees.
    pub fn release_usage_in_context(&self, context_id: ContextId) {
        self.update_task_count(TASK_COUNT_NOT_USED, context_id);
    }

    // =====================================================================================
    // Residency tracking (current device-memory occupancy)
    // =====================================================================================

    pub fn update_residency_task_count(&self, task_count: TaskCount, context_id: ContextId) {
        {
            let usage = self.usage.read().unwrap();
            if let Some(slot) = usage.get(&context_id) {
                slot.residency_task_count.store(task_count, Ordering::Release);
                return;
            }
        }

        let mut usage = self.usage.write().unwrap();
        usage
            .entry(context_id)
            .or_insert_with(ContextUsage::new)
            .residency_task_count
            .store(task_count, Ordering::Release);
    }

    #[must_use]
    pub fn get_residency_task_count(&self, context_id: ContextId) -> TaskCount {
        self.usage
            .read()
            .unwrap()
            .get(&context_id)
            .map_or(TASK_COUNT_NOT_RESIDENT, |slot| {
                slot.residency_task_count.load(Ordering::Acquire)
            })
    }

    #[must_use]
    pub fn is_resident(&self, context_id: ContextId) -> bool {
        self.get_residency_task_count(context_id) != TASK_COUNT_NOT_RESIDENT
    }

    #[must_use]
    pub fn is_residency_task_count_below(
        &self,
        task_count: TaskCount,
        context_id: ContextId,
    ) -> bool {
        !self.is_resident(context_id) || self.get_residency_task_count(context_id) < task_count
    }

    pub fn release_residency_in_context(&self, context_id: ContextId) {
        self.update_residency_task_count(TASK_COUNT_NOT_RESIDENT, context_id);
    }

    // =====================================================================================
    // Reclamation
    // =====================================================================================

    /// `true` once no live context holds an unreached obligation. Contexts
    /// that have been deregistered never block a free: a destroyed context
    /// cannot complete further work.
    #[must_use]
    pub fn can_free(&self, registry: &ContextRegistry) -> bool {
        let usage = self.usage.read().unwrap();
        for (context_id, slot) in usage.iter() {
            let task_count = slot.task_count.load(Ordering::Acquire);
            if task_count == TASK_COUNT_NOT_USED {
                continue;
            }
            if !registry.is_obligation_satisfied(*context_id, task_count) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WaitConfig;
    use crate::memory::manager::{MemoryManager, SystemMemoryManager};
    use crate::sync::engine::{EngineContext, EngineKind};
    use crate::sync::tag::TagWriter;
    use std::sync::Arc;

    fn make_context(registry: &Arc<ContextRegistry>) -> Arc<EngineContext> {
        let manager: Arc<dyn MemoryManager> = Arc::new(SystemMemoryManager::new());
        EngineContext::create(registry, EngineKind::Compute, manager, WaitConfig::default())
    }

    #[test]
    fn fresh_allocation_is_unused_and_not_resident() {
        let allocation = GraphicsAllocation::new(1, AllocationKind::Buffer, 64);
        assert!(!allocation.is_used());
        assert!(!allocation.is_resident(0));
        assert_eq!(allocation.get_task_count(0), TASK_COUNT_NOT_USED);
    }

    #[test]
    fn accepted_updates_are_non_decreasing() {
        let allocation = GraphicsAllocation::new(1, AllocationKind::Buffer, 64);
        allocation.update_task_count(3, 0);
        allocation.update_task_count(3, 0);
        allocation.update_task_count(7, 0);
        assert_eq!(allocation.get_task_count(0), 7);
        assert!(allocation.is_used_by_context(0));
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "task count regression")]
    fn regression_trips_the_debug_assertion() {
        let allocation = GraphicsAllocation::new(1, AllocationKind::Buffer, 64);
        allocation.update_task_count(5, 0);
        allocation.update_task_count(2, 0);
    }

    #[test]
    fn not_used_reset_clears_the_context() {
        let allocation = GraphicsAllocation::new(1, AllocationKind::Buffer, 64);
        allocation.update_task_count(9, 0);
        allocation.release_usage_in_context(0);
        assert!(!allocation.is_used());
        // The slot can be reused with a lower count after the reset.
        allocation.update_task_count(1, 0);
        assert_eq!(allocation.get_task_count(0), 1);
    }

    #[test]
    fn residency_is_independent_of_usage() {
        let allocation = GraphicsAllocation::new(1, AllocationKind::Buffer, 64);
        allocation.update_residency_task_count(4, 2);
        assert!(allocation.is_resident(2));
        assert!(!allocation.is_used());

        allocation.release_residency_in_context(2);
        assert!(!allocation.is_resident(2));

        allocation.update_task_count(4, 2);
        assert!(allocation.is_used());
        assert!(!allocation.is_resident(2));
    }

    #[test]
    fn residency_below_check_covers_non_resident() {
        let allocation = GraphicsAllocation::new(1, AllocationKind::Buffer, 64);
        assert!(allocation.is_residency_task_count_below(1, 0));
        allocation.update_residency_task_count(5, 0);
        assert!(!allocation.is_residency_task_count_below(5, 0));
        assert!(allocation.is_residency_task_count_below(6, 0));
    }

    #[test]
    fn can_free_tracks_tag_progress_per_context() {
        let registry = ContextRegistry::new();
        let context = make_context(&registry);
        let allocation = GraphicsAllocation::new(1, AllocationKind::Buffer, 64);

        let stamp = context.flush();
        allocation.update_task_count(stamp.task_count, context.context_id());
        assert!(!allocation.can_free(&registry));

        context.tag().retire(stamp.task_count);
        assert!(allocation.can_free(&registry));
    }

    #[test]
    fn deregistered_context_never_blocks_a_free() {
        let registry = ContextRegistry::new();
        let allocation = GraphicsAllocation::new(1, AllocationKind::Buffer, 64);

        let context_id = {
            let context = make_context(&registry);
            let stamp = context.flush();
            allocation.update_task_count(stamp.task_count, context.context_id());
            assert!(!allocation.can_free(&registry));
            context.tag().retire(stamp.task_count);
            context.context_id()
        };

        assert!(!registry.is_registered(context_id));
        assert!(allocation.can_free(&registry));
    }
}
