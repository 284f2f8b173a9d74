//! # Otter VM Thread
//!
//! Per-native-thread VM context for the Otter runtime.
//!
//! ## Design
//!
//! - **One context per native thread**: allocated on first use, found in
//!   O(1) through a thread-local slot, tracked by a process-wide registry
//! - **Attachment**: a thread enters an isolate as its single mutator or as
//!   one of many restricted helpers
//! - **Write barrier**: mutators append to a thread-owned store buffer block
//!   and hand full blocks to the isolate
//! - **Cached constants**: hot VM values at fixed offsets from the thread
//!   pointer, for generated code
//! - **Thread-confined**: `Thread` is neither `Send` nor `Sync`

#![warn(clippy::all)]
#![warn(missing_docs)]
// The context is a `#[repr(C)]` ABI read by generated code.
// All unsafe code must have SAFETY comments

pub mod cached_constants;
pub mod cha;
pub mod error;
pub mod isolate;
pub mod registry;
pub mod thread;
pub mod write_barrier;

pub use cached_constants::{
    CachedConstant, CachedValues, ConstantKind, ConstantSources, ObjectSingletons, StubCode,
};
pub use cha::Cha;
pub use error::{ThreadError, ThreadResult};
pub use isolate::{Isolate, IsolateConfig, Zone};
pub use registry::ThreadRegistry;
pub use thread::{AttachState, Thread};

pub use otter_vm_gc::{RawObject, ThresholdPolicy};
