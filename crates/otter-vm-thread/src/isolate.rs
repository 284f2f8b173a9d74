//! Isolate attachment.
//!
//! An [`Isolate`] is the unit a [`Thread`] attaches to. This module holds the
//! parts of the isolate the thread context depends on (the mutator slot, the
//! current zone, the aggregate store buffer) and the enter/exit protocol.
//!
//! # Roles
//!
//! | State | Store buffer block | Heap mutation |
//! |---|---|---|
//! | `Detached` | none | no |
//! | `Mutator` | owned | yes |
//! | `Helper` | none | no (copy-on-write structures only) |
//!
//! At most one thread is an isolate's mutator at a time. Any number of
//! helpers may attach next to it.
//!
//! # Limitations
//!
//! Helper attachment is deliberately coarse: nothing at runtime stops a
//! helper from calling heap-mutating operations. The only sanctioned helper
//! is the concurrent sweeper, which reads the class table. Call sites of
//! mutating operations must not run in helper mode.
// TODO: Synchronize heap access with helpers so they can do more than read
// copy-on-write structures.

use parking_lot::{Condvar, Mutex};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread::ThreadId;

use otter_vm_gc::{StoreBuffer, StoreBufferConfig, ThresholdPolicy};

use crate::error::{ThreadError, ThreadResult};
use crate::thread::{AttachState, Thread};

static NEXT_ZONE_ID: AtomicU64 = AtomicU64::new(1);

/// Configuration for creating a new Isolate.
#[derive(Debug, Clone)]
pub struct IsolateConfig {
    /// Name used in diagnostics
    pub name: String,
    /// Store buffer configuration
    pub store_buffer: StoreBufferConfig,
}

impl Default for IsolateConfig {
    fn default() -> Self {
        Self {
            name: "main".to_string(),
            store_buffer: StoreBufferConfig::default(),
        }
    }
}

/// Handle to the isolate's current allocation zone.
///
/// Only the accounting is modelled here; the arena itself belongs to the
/// zone allocator.
#[derive(Debug)]
pub struct Zone {
    id: u64,
    allocated: AtomicUsize,
}

impl Zone {
    fn new() -> Self {
        Self {
            id: NEXT_ZONE_ID.fetch_add(1, Ordering::Relaxed),
            allocated: AtomicUsize::new(0),
        }
    }

    /// Unique zone id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Book `bytes` against this zone
    pub fn record_allocation(&self, bytes: usize) {
        self.allocated.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Bytes booked so far
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }
}

/// The thread-facing side of an isolate
pub struct Isolate {
    name: String,
    store_buffer: StoreBuffer,
    zone: Zone,
    /// Native thread currently holding the mutator role
    mutator: Mutex<Option<ThreadId>>,
    mutator_released: Condvar,
    helpers: AtomicUsize,
}

impl Isolate {
    /// Create a new isolate with the given configuration.
    pub fn new(config: IsolateConfig) -> Self {
        Self {
            name: config.name,
            store_buffer: StoreBuffer::with_config(config.store_buffer),
            zone: Zone::new(),
            mutator: Mutex::new(None),
            mutator_released: Condvar::new(),
            helpers: AtomicUsize::new(0),
        }
    }

    /// Isolate name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Aggregate store buffer receiving drained blocks
    pub fn store_buffer(&self) -> &StoreBuffer {
        &self.store_buffer
    }

    /// The topmost allocation zone
    pub fn current_zone(&self) -> &Zone {
        &self.zone
    }

    /// Native thread holding the mutator role, if any
    pub fn mutator_thread(&self) -> Option<ThreadId> {
        *self.mutator.lock()
    }

    /// Number of attached helper threads
    pub fn helper_count(&self) -> usize {
        self.helpers.load(Ordering::Acquire)
    }

    /// Whether any thread is attached in either role
    pub fn has_attached_threads(&self) -> bool {
        self.mutator_thread().is_some() || self.helper_count() > 0
    }

    fn acquire_mutator(&self, thread: ThreadId) {
        let mut slot = self.mutator.lock();
        while slot.is_some() {
            self.mutator_released.wait(&mut slot);
        }
        *slot = Some(thread);
    }

    fn try_acquire_mutator(&self, thread: ThreadId) -> bool {
        let mut slot = self.mutator.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(thread);
        true
    }

    fn release_mutator(&self, thread: ThreadId) {
        let mut slot = self.mutator.lock();
        assert_eq!(
            *slot,
            Some(thread),
            "mutator slot of isolate '{}' released by a thread that does not hold it",
            self.name
        );
        *slot = None;
        drop(slot);
        self.mutator_released.notify_one();
    }
}

impl Drop for Isolate {
    fn drop(&mut self) {
        debug_assert!(
            std::thread::panicking() || !self.has_attached_threads(),
            "isolate '{}' dropped with attached threads",
            self.name
        );
    }
}

impl std::fmt::Debug for Isolate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Isolate")
            .field("name", &self.name)
            .field("mutator", &self.mutator_thread())
            .field("helpers", &self.helper_count())
            .finish()
    }
}

impl Thread {
    /// Makes this thread enter `isolate` as its mutator, blocking while
    /// another thread holds the mutator role.
    ///
    /// Issues the thread a fresh store buffer block.
    ///
    /// # Safety
    /// `isolate` must stay alive until this thread exits it. The thread keeps
    /// a non-owning pointer to it for the whole attachment.
    ///
    /// # Panics
    /// Panics if the thread is already attached.
    pub unsafe fn enter_isolate(&self, isolate: &Isolate) {
        self.assert_detached("enter_isolate");
        isolate.acquire_mutator(self.os_thread());
        self.bind_mutator(isolate);
    }

    /// Like [`Thread::enter_isolate`], but fails instead of blocking when the
    /// mutator role is taken.
    ///
    /// # Safety
    /// Same contract as [`Thread::enter_isolate`].
    ///
    /// # Panics
    /// Panics if the thread is already attached.
    pub unsafe fn try_enter_isolate(&self, isolate: &Isolate) -> ThreadResult<()> {
        self.assert_detached("try_enter_isolate");
        if !isolate.try_acquire_mutator(self.os_thread()) {
            return Err(ThreadError::MutatorSlotOccupied {
                isolate: isolate.name().to_string(),
            });
        }
        self.bind_mutator(isolate);
        Ok(())
    }

    /// Makes this thread enter `isolate` as a helper.
    ///
    /// Helpers get no store buffer block and must not mutate the heap; see
    /// the module docs.
    ///
    /// # Safety
    /// Same contract as [`Thread::enter_isolate`].
    ///
    /// # Panics
    /// Panics if the thread is already attached.
    pub unsafe fn enter_isolate_as_helper(&self, isolate: &Isolate) {
        self.assert_detached("enter_isolate_as_helper");
        isolate.helpers.fetch_add(1, Ordering::AcqRel);
        self.isolate.set(Some(NonNull::from(isolate)));
        self.state.set(AttachState::Helper);

        tracing::trace!(target: "otter::thread", isolate = isolate.name(), "Entered isolate as helper");
    }

    /// Makes this thread exit its isolate, whichever role it entered in.
    ///
    /// A mutator's store buffer block is handed to the isolate, partially
    /// filled or not, and the mutator role is released.
    ///
    /// # Panics
    /// Panics if the thread is detached.
    pub fn exit_isolate(&self) {
        let state = self.state.get();
        assert!(
            state != AttachState::Detached,
            "exit_isolate called on thread {:?} that is not attached",
            self.os_thread()
        );
        let isolate = self.isolate_ref();

        match state {
            AttachState::Mutator => {
                let block = self.take_store_buffer_block();
                isolate
                    .store_buffer()
                    .push_block(block, ThresholdPolicy::CheckThreshold);
                isolate.release_mutator(self.os_thread());
            }
            AttachState::Helper => {
                isolate.helpers.fetch_sub(1, Ordering::AcqRel);
            }
            AttachState::Detached => unreachable!(),
        }

        tracing::trace!(target: "otter::thread", isolate = isolate.name(), role = ?state, "Exited isolate");

        self.isolate.set(None);
        self.state.set(AttachState::Detached);
    }

    /// Makes a helper thread exit its isolate.
    ///
    /// # Panics
    /// Panics if the thread is not attached as a helper.
    pub fn exit_isolate_as_helper(&self) {
        assert_eq!(
            self.state.get(),
            AttachState::Helper,
            "exit_isolate_as_helper called on a thread that is not a helper"
        );
        self.exit_isolate();
    }

    fn bind_mutator(&self, isolate: &Isolate) {
        self.isolate.set(Some(NonNull::from(isolate)));
        self.store_buffer_block
            .set(Some(isolate.store_buffer().pop_empty_block()));
        self.state.set(AttachState::Mutator);

        tracing::trace!(target: "otter::thread", isolate = isolate.name(), "Entered isolate as mutator");
    }

    fn assert_detached(&self, operation: &str) {
        debug_assert_eq!(
            std::thread::current().id(),
            self.os_thread(),
            "{operation} called from a foreign native thread"
        );
        assert!(
            self.state.get() == AttachState::Detached,
            "{operation} called on thread {:?} already attached as {:?}",
            self.os_thread(),
            self.state.get()
        );
    }
}
