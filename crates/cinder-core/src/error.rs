//! Error types for the core primitives.

use thiserror::Error;

use crate::range::MemoryRange;

/// Core error type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A range was constructed with a size of zero.
    #[error("Memory range must have a non-zero size")]
    EmptyRange,

    /// `offset + size` does not fit in a `u64`.
    #[error("Memory range at {offset} with size {size} overflows the address space")]
    RangeOverflow { offset: u64, size: u64 },

    /// Split point outside `1..=size`.
    #[error("Invalid split at {at} for range of size {size}")]
    InvalidSplit { at: u64, size: u64 },

    /// Merge of two ranges that do not touch.
    #[error("Ranges are not adjacent: {first:?} does not end where {second:?} begins")]
    NotAdjacent {
        first: MemoryRange,
        second: MemoryRange,
    },

    /// No free range large enough for the request.
    #[error("Out of space: no free range can hold {requested} bytes")]
    OutOfSpace { requested: u64 },

    /// A freed range overlaps free space or lies outside the managed region.
    #[error("Range {0:?} was not allocated from this allocator")]
    UnknownRange(MemoryRange),

    /// The thread registry budget is exhausted.
    #[error("Too many threads: registry budget of {budget} exhausted")]
    TooManyThreads { budget: u32 },
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
