//! # Otter VM Garbage Collector: write barrier support
//!
//! Collector-side half of the generational write barrier.
//!
//! ## Design
//!
//! - **Object headers**: generation and remembered bits read by the barrier
//! - **Store buffer blocks**: fixed-capacity, thread-owned append buffers
//! - **Aggregate store buffer**: per-isolate sink for drained blocks, the
//!   remembered set the scavenger scans

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod barrier;
pub mod object;
pub mod store_buffer;

pub use barrier::{needs_store_barrier, remember_container};
pub use object::{GcHeader, RawObject};
pub use store_buffer::{
    BLOCK_CAPACITY, StoreBuffer, StoreBufferBlock, StoreBufferConfig, StoreBufferStats,
    ThresholdPolicy,
};
