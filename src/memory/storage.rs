//! Per-context allocation stores: the temporary in-flight list and the
//! reusable pool.
//!
//! Both lists are ordered by submission task count (submission is serialized
//! per context, so insertion order is task-count order). Entries are linked
//! through slot indices into an arena instead of raw pointers; detach from
//! the middle is O(1) under the store lock, and freed slots are recycled.
//! Destructors of detached allocations run outside the lock so a slow drop
//! cannot stall or corrupt a concurrent cleanup.

use crate::memory::allocation::{AllocationKind, GraphicsAllocation};
use crate::memory::manager::MemoryManager;
use crate::sync::completion::TaskCount;
use crate::sync::tag::CompletionTag;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Temporary,
    Reusable,
}

const NIL: usize = usize::MAX;

#[derive(Debug)]
struct Node {
    allocation: Box<GraphicsAllocation>,
    task_count: TaskCount,
    prev: usize,
    next: usize,
}

/// Doubly-linked list addressed by arena slot index.
#[derive(Debug)]
struct AllocationList {
    slots: Vec<Option<Node>>,
    free_slots: Vec<usize>,
    head: usize,
    tail: usize,
    len: usize,
}

impl AllocationList {
    const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_slots: Vec::new(),
            head: NIL,
            tail: NIL,
            len: 0,
        }
    }

    fn push_back(&mut self, allocation: Box<GraphicsAllocation>, task_count: TaskCount) {
        let node = Node {
            allocation,
            task_count,
            prev: self.tail,
            next: NIL,
        };

        let slot = match self.free_slots.pop() {
            Some(slot) => {
                self.slots[slot] = Some(node);
                slot
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        };

        if self.tail != NIL {
            self.slots[self.tail].as_mut().unwrap().next = slot;
        } else {
            self.head = slot;
        }
        self.tail = slot;
        self.len += 1;
    }

    /// Unlinks `slot` and returns its allocation, rewiring neighbor links.
    fn detach(&mut self, slot: usize) -> Box<GraphicsAllocation> {
        let node = self.slots[slot].take().unwrap();

        if node.prev != NIL {
            self.slots[node.prev].as_mut().unwrap().next = node.next;
        } else {
            self.head = node.next;
        }
        if node.next != NIL {
            self.slots[node.next].as_mut().unwrap().prev = node.prev;
        } else {
            self.tail = node.prev;
        }

        self.free_slots.push(slot);
        self.len -= 1;
        node.allocation
    }

    fn head(&self) -> usize {
        self.head
    }

    fn next(&self, slot: usize) -> usize {
        self.slots[slot].as_ref().unwrap().next
    }

    fn node(&self, slot: usize) -> (&GraphicsAllocation, TaskCount) {
        let node = self.slots[slot].as_ref().unwrap();
        (&node.allocation, node.task_count)
    }

    fn len(&self) -> usize {
        self.len
    }

    /// Detaches every entry whose recorded task count is at or below
    /// `completed_task_count`, preserving list order among the rest.
    fn detach_completed(&mut self, completed_task_count: TaskCount) -> Vec<Box<GraphicsAllocation>> {
        let mut detached = Vec::new();
        let mut slot = self.head;
        while slot != NIL {
            let next = self.next(slot);
            if self.node(slot).1 <= completed_task_count {
                detached.push(self.detach(slot));
            }
            slot = next;
        }
        detached
    }
}

/// The two per-context stores, guarded by one lock each.
#[derive(Debug)]
pub struct AllocationStore {
    tag: Arc<CompletionTag>,
    memory_manager: Arc<dyn MemoryManager>,
    temporary: Mutex<AllocationList>,
    reusable: Mutex<AllocationList>,
}

impl AllocationStore {
    #[must_use]
    pub fn new(tag: Arc<CompletionTag>, memory_manager: Arc<dyn MemoryManager>) -> Self {
        Self {
            tag,
            memory_manager,
            temporary: Mutex::new(AllocationList::new()),
            reusable: Mutex::new(AllocationList::new()),
        }
    }

    fn list_for(&self, kind: StorageKind) -> &Mutex<AllocationList> {
        match kind {
            StorageKind::Temporary => &self.temporary,
            StorageKind::Reusable => &self.reusable,
        }
    }

    /// Takes ownership of `allocation` until `task_count` is reached.
    /// Temporary entries are reclaimed then; reusable entries become eligible
    /// for handout then.
    pub fn store_allocation_with_task_count(
        &self,
        allocation: Box<GraphicsAllocation>,
        kind: StorageKind,
        task_count: TaskCount,
    ) {
        self.list_for(kind)
            .lock()
            .unwrap()
            .push_back(allocation, task_count);
    }

    /// Removes and frees every entry at or below `completed_task_count`.
    /// Idempotent: a second call with the same count is a no-op. Safe against
    /// concurrent insertion from the owning queue thread and against a second
    /// concurrent cleanup; detachment happens under the store lock, the frees
    /// happen after it is released.
    pub fn clean_allocation_list(&self, completed_task_count: TaskCount, kind: StorageKind) {
        let detached = self
            .list_for(kind)
            .lock()
            .unwrap()
            .detach_completed(completed_task_count);

        for allocation in detached {
            self.memory_manager.free_graphics_allocation(allocation);
        }
    }

    /// Linear scan of the reusable pool for the first entry matching `kind`
    /// with size at least `min_size` whose task count the hardware has
    /// reached. Detaches and returns it; never blocks, never allocates.
    #[must_use]
    pub fn obtain_reusable_allocation(
        &self,
        min_size: usize,
        kind: AllocationKind,
    ) -> Option<Box<GraphicsAllocation>> {
        let mut list = self.reusable.lock().unwrap();

        let mut slot = list.head();
        while slot != NIL {
            let (allocation, task_count) = list.node(slot);
            if allocation.kind() == kind
                && allocation.underlying_size() >= min_size
                && self.tag.is_reached(task_count)
            {
                return Some(list.detach(slot));
            }
            slot = list.next(slot);
        }
        None
    }

    #[must_use]
    pub fn stored_count(&self, kind: StorageKind) -> usize {
        self.list_for(kind).lock().unwrap().len()
    }
}
