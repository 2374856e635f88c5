//! The memory-manager seam.
//!
//! Allocation and freeing of device memory belong to a collaborator outside
//! this core; [`MemoryManager`] is the contract the core consumes. The
//! [`SystemMemoryManager`] implementation backs allocations with host memory
//! and is what simulation backends and the test suite run against.

use crate::error::{DriverError, DriverResult};
use crate::memory::allocation::{AllocationKind, GraphicsAllocation};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

const MIN_ALLOCATION_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy)]
pub struct AllocationProperties {
    pub size: usize,
    pub kind: AllocationKind,
}

impl AllocationProperties {
    #[must_use]
    pub const fn new(size: usize, kind: AllocationKind) -> Self {
        Self { size, kind }
    }
}

pub trait MemoryManager: Send + Sync + fmt::Debug {
    /// Allocates a device memory region. The returned allocation is owned by
    /// the caller until handed to a store or a deletion request.
    fn allocate_graphics_memory(
        &self,
        properties: &AllocationProperties,
    ) -> DriverResult<Box<GraphicsAllocation>>;

    /// Releases an allocation. Callers must only free allocations whose
    /// outstanding obligations are settled; the stores and the deferred
    /// deleter enforce that before routing anything here.
    fn free_graphics_allocation(&self, allocation: Box<GraphicsAllocation>);
}

/// Host-memory-backed manager. Tracks live bytes and allocation/free counts;
/// an optional capacity limit turns further allocation into `OutOfMemory`.
#[derive(Debug, Default)]
pub struct SystemMemoryManager {
    next_id: AtomicU64,
    live_bytes: AtomicUsize,
    allocation_count: AtomicUsize,
    free_count: AtomicUsize,
    capacity_limit: Option<usize>,
}

impl SystemMemoryManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capacity_limit(limit: usize) -> Self {
        Self {
            capacity_limit: Some(limit),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn allocated_count(&self) -> usize {
        self.allocation_count.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn freed_count(&self) -> usize {
        self.free_count.load(Ordering::Acquire)
    }
}

impl MemoryManager for SystemMemoryManager {
    fn allocate_graphics_memory(
        &self,
        properties: &AllocationProperties,
    ) -> DriverResult<Box<GraphicsAllocation>> {
        let size = properties.size.max(MIN_ALLOCATION_SIZE);

        if let Some(limit) = self.capacity_limit
            && self.live_bytes.load(Ordering::Acquire) + size > limit
        {
            return Err(DriverError::OutOfMemory);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.live_bytes.fetch_add(size, Ordering::AcqRel);
        self.allocation_count.fetch_add(1, Ordering::AcqRel);
        Ok(Box::new(GraphicsAllocation::new(id, properties.kind, size)))
    }

    fn free_graphics_allocation(&self, allocation: Box<GraphicsAllocation>) {
        self.live_bytes
            .fetch_sub(allocation.underlying_size(), Ordering::AcqRel);
        self.free_count.fetch_add(1, Ordering::AcqRel);
        drop(allocation);
    }
}
