pub mod allocation;
pub mod deferred;
pub mod manager;
pub mod storage;

pub use allocation::{AllocationId, AllocationKind, GraphicsAllocation};
pub use deferred::{DeferredDeleter, DeletionRequest};
pub use manager::{AllocationProperties, MemoryManager, SystemMemoryManager};
pub use storage::{AllocationStore, StorageKind};
