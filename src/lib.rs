//! Asynchronous-completion and resource-lifecycle core of a GPU compute
//! driver runtime.
//!
//! CPU threads submit work against independent hardware execution engines
//! without blocking; the hardware reports progress only through a polled,
//! monotonically increasing completion tag per engine. This crate provides
//! the pieces that make that model safe: per-engine completion counters,
//! the event status machine with dependency and callback handling, the
//! per-allocation usage/residency bookkeeping, the temporary/reusable
//! allocation stores, and the background deferred-deletion thread.

pub mod config;
pub mod error;
pub mod memory;
pub mod sync;

pub use config::WaitConfig;
pub use error::{DriverError, DriverResult};
