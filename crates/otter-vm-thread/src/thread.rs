//! The per-native-thread VM context.
//!
//! A `Thread` records which isolate the native thread is working on, owns
//! the thread's store buffer block, and carries a copy of the cached VM
//! constants. Generated code receives a pointer to the `Thread` and reads
//! these fields by fixed byte offsets, so the head of the struct is an ABI:
//!
//! | Offset | Field |
//! |---|---|
//! | `0` | `isolate` |
//! | `1 * WORD` | `store_buffer_block` |
//! | `2 * WORD ..` | cached constants, one word per slot |
//!
//! The layout is checked at compile time below. Fields after `constants`
//! are private to the runtime and may move freely.
//!
//! # Thread confinement
//!
//! `Thread` is neither `Send` nor `Sync`: every method runs on the native
//! thread that owns it. References obtained from [`Thread::current`] can not
//! be moved to another thread.

use std::cell::Cell;
use std::ptr::NonNull;
use std::thread::ThreadId;

use otter_vm_gc::StoreBufferBlock;

use crate::cached_constants::CachedConstants;
use crate::cha::Cha;
use crate::isolate::{Isolate, Zone};

/// Attachment state of a thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachState {
    /// Not attached to any isolate
    Detached,
    /// The isolate's mutator: may read and write the heap
    Mutator,
    /// Restricted concurrent access to copy-on-write isolate structures
    Helper,
}

/// A VM thread; may be executing managed code or helping with tasks such as
/// sweeping or compilation.
#[repr(C)]
pub struct Thread {
    /// Attached isolate. Non-owning; the isolate outlives the attachment.
    pub(crate) isolate: Cell<Option<NonNull<Isolate>>>,
    /// Active store buffer block, present exactly while attached as mutator
    pub(crate) store_buffer_block: Cell<Option<Box<StoreBufferBlock>>>,
    /// Cached VM constants
    pub(crate) constants: CachedConstants,
    /// Topmost CHA of the compilation running on this thread
    pub(crate) cha: Cell<Option<NonNull<Cha>>>,
    pub(crate) state: Cell<AttachState>,
    os_thread: ThreadId,
}

// Compile-time check: the code generator hard-codes these offsets.
const _: () = {
    let word = std::mem::size_of::<usize>();
    assert!(std::mem::offset_of!(Thread, isolate) == 0);
    assert!(std::mem::offset_of!(Thread, store_buffer_block) == word);
    assert!(std::mem::offset_of!(Thread, constants) == 2 * word);
    assert!(std::mem::size_of::<Option<NonNull<Isolate>>>() == word);
    assert!(std::mem::size_of::<Option<Box<StoreBufferBlock>>>() == word);
};

impl Thread {
    /// Create a detached context for the calling native thread.
    ///
    /// With `init_vm_constants == false` the cached constants keep their
    /// defaults; this is how the main thread is registered before the
    /// object model exists.
    pub(crate) fn new(init_vm_constants: bool) -> Self {
        let thread = Self {
            isolate: Cell::new(None),
            store_buffer_block: Cell::new(None),
            constants: CachedConstants::unset(),
            cha: Cell::new(None),
            state: Cell::new(AttachState::Detached),
            os_thread: std::thread::current().id(),
        };
        if init_vm_constants {
            thread.init_vm_constants();
        }
        thread
    }

    /// The native thread that owns this context
    pub fn os_thread(&self) -> ThreadId {
        self.os_thread
    }

    /// Current attachment state
    pub fn state(&self) -> AttachState {
        self.state.get()
    }

    /// Whether the thread is attached as its isolate's mutator
    pub fn is_mutator(&self) -> bool {
        self.state.get() == AttachState::Mutator
    }

    /// The isolate this thread is operating on, or `None` when detached
    pub fn isolate(&self) -> Option<&Isolate> {
        // SAFETY: The pointer is set only while attached, and whoever
        // attached guaranteed the isolate outlives the attachment.
        self.isolate.get().map(|isolate| unsafe { isolate.as_ref() })
    }

    /// The topmost zone used for allocation in this thread
    pub fn zone(&self) -> Option<&Zone> {
        self.isolate().map(Isolate::current_zone)
    }

    /// Byte offset of the isolate pointer
    pub const fn isolate_offset() -> usize {
        std::mem::offset_of!(Thread, isolate)
    }

    /// Byte offset of the store buffer block pointer
    pub const fn store_buffer_block_offset() -> usize {
        std::mem::offset_of!(Thread, store_buffer_block)
    }

    pub(crate) const fn constants_offset() -> usize {
        std::mem::offset_of!(Thread, constants)
    }

    /// The attached isolate.
    ///
    /// # Panics
    /// Panics if the thread is detached.
    pub(crate) fn isolate_ref(&self) -> &Isolate {
        match self.isolate() {
            Some(isolate) => isolate,
            None => panic!("thread {:?} is not attached to an isolate", self.os_thread),
        }
    }

    /// Take the active store buffer block out of the thread.
    ///
    /// # Panics
    /// Panics if the thread holds no block (detached or helper).
    pub(crate) fn take_store_buffer_block(&self) -> Box<StoreBufferBlock> {
        match self.store_buffer_block.take() {
            Some(block) => block,
            None => panic!(
                "thread {:?} has no store buffer block (state: {:?})",
                self.os_thread,
                self.state.get()
            ),
        }
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        debug_assert!(
            self.state.get() == AttachState::Detached || std::thread::panicking(),
            "thread context dropped while attached"
        );
    }
}

impl std::fmt::Debug for Thread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Thread")
            .field("os_thread", &self.os_thread)
            .field("state", &self.state.get())
            .field("isolate", &self.isolate().map(Isolate::name))
            .finish()
    }
}
