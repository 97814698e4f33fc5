//! Core primitives for the Cinder graphics runtime.
//!
//! This crate has no GPU dependency. It provides:
//! - `MemoryRange` interval arithmetic and a free-list sub-allocator
//! - Dense per-thread indices and per-thread storage
//! - `Event`, a one-shot completion signal with aggregation
//! - The core error type

pub mod error;
pub mod event;
pub mod range;
pub mod thread_index;

pub use error::{Error, Result};
pub use event::{Event, TriggerGuard};
pub use range::{FitPolicy, MemoryRange, RangeAllocator};
pub use thread_index::{PerThread, ThreadBudget, ThreadIndex, ThreadRegistry};

/// Runtime-wide constants.
pub mod constants {
    /// Upper bound on frames whose GPU work may be outstanding at once.
    ///
    /// Sizes per-frame synchronisation arrays; it is not the live count.
    pub const MAX_FRAMES_IN_FLIGHT: usize = 3;
}
