//! Process-wide thread registry.
//!
//! Every native thread that runs VM code owns exactly one [`Thread`]. The
//! context is allocated on first use, published in a thread-local slot for
//! O(1) lookup, and recorded in the registry so that stop-the-world
//! operations can reach every live context.
//!
//! # Teardown
//!
//! On Unix-like targets the thread-local slot releases the context when the
//! native thread exits. On Windows the context is leaked at thread exit
//! instead; threads there must call [`Thread::cleanup`] before they finish.
//! A missed call leaks one context and nothing else: a detached context
//! holds no isolate state.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::cell::Cell;
use std::ptr::NonNull;
use std::sync::OnceLock;
use std::thread::ThreadId;

use crate::error::{ThreadError, ThreadResult};
use crate::thread::{AttachState, Thread};

static REGISTRY: OnceLock<ThreadRegistry> = OnceLock::new();

/// Owning pointer to a leaked context, freed by [`ThreadRegistry::release`]
struct ContextPtr(NonNull<Thread>);

// SAFETY: The registry only hands the pointer back to the owning thread or
// to a caller that has stopped every owning thread.
unsafe impl Send for ContextPtr {}

struct CurrentSlot {
    context: Cell<Option<NonNull<Thread>>>,
}

impl Drop for CurrentSlot {
    fn drop(&mut self) {
        if let Some(context) = self.context.take() {
            release_at_thread_exit(context);
        }
    }
}

thread_local! {
    static CURRENT: CurrentSlot = const {
        CurrentSlot {
            context: Cell::new(None),
        }
    };
}

#[cfg(not(target_os = "windows"))]
fn release_at_thread_exit(context: NonNull<Thread>) {
    // SAFETY: The slot was the last reference on this native thread, which
    // is about to exit.
    unsafe { ThreadRegistry::global().release(context) }
}

#[cfg(target_os = "windows")]
fn release_at_thread_exit(context: NonNull<Thread>) {
    // SAFETY: The context stays allocated; it is leaked, not freed.
    let os_thread = unsafe { context.as_ref() }.os_thread();
    tracing::warn!(
        target: "otter::thread",
        ?os_thread,
        "Native thread exited without Thread::cleanup; context leaked"
    );
}

/// Registry of the live thread contexts
pub struct ThreadRegistry {
    threads: Mutex<FxHashMap<ThreadId, ContextPtr>>,
}

impl ThreadRegistry {
    /// The process-wide registry, created on first access
    pub fn global() -> &'static ThreadRegistry {
        REGISTRY.get_or_init(|| ThreadRegistry {
            threads: Mutex::new(FxHashMap::default()),
        })
    }

    /// The context bound to the calling native thread, if any
    pub fn current() -> Option<&'static Thread> {
        let context = CURRENT.try_with(|slot| slot.context.get()).ok().flatten()?;
        // SAFETY: The context lives until `cleanup` (unsafe, caller promises
        // no outstanding references) or native-thread exit. `Thread` is not
        // `Sync`, so the reference can not outlive this native thread.
        Some(unsafe { context.as_ref() })
    }

    /// Bind a context to the calling native thread unless one exists.
    ///
    /// New contexts copy the canonical cached constants.
    ///
    /// # Panics
    /// Panics if the native thread is already tearing down its thread-locals;
    /// see [`ThreadRegistry::try_ensure_initialized`].
    pub fn ensure_initialized() -> &'static Thread {
        Self::ensure_or_panic(true)
    }

    /// Like [`ThreadRegistry::ensure_initialized`], but returns
    /// [`ThreadError::ThreadExiting`] when called from a thread-local
    /// destructor that runs after the context slot was destroyed.
    pub fn try_ensure_initialized() -> ThreadResult<&'static Thread> {
        Self::ensure(true)
    }

    pub(crate) fn ensure_or_panic(init_vm_constants: bool) -> &'static Thread {
        match Self::ensure(init_vm_constants) {
            Ok(thread) => thread,
            Err(err) => panic!("{err}"),
        }
    }

    fn ensure(init_vm_constants: bool) -> ThreadResult<&'static Thread> {
        if let Some(thread) = Self::current() {
            return Ok(thread);
        }

        let context = CURRENT
            .try_with(|slot| {
                let context = NonNull::from(Box::leak(Box::new(Thread::new(init_vm_constants))));
                slot.context.set(Some(context));
                context
            })
            .map_err(|_| ThreadError::ThreadExiting)?;
        // SAFETY: Freshly leaked, freed only through `release`
        let thread: &'static Thread = unsafe { context.as_ref() };

        Self::global()
            .threads
            .lock()
            .insert(thread.os_thread(), ContextPtr(context));

        tracing::debug!(
            target: "otter::thread",
            os_thread = ?thread.os_thread(),
            init_vm_constants,
            "Thread context created"
        );
        Ok(thread)
    }

    /// Release the calling native thread's context.
    ///
    /// A context still attached to an isolate is detached first.
    ///
    /// # Safety
    /// No reference obtained from [`ThreadRegistry::current`] on this native
    /// thread may be used afterwards.
    pub unsafe fn cleanup() -> ThreadResult<()> {
        let context = CURRENT
            .try_with(|slot| slot.context.take())
            .ok()
            .flatten()
            .ok_or(ThreadError::NotInitialized)?;
        // SAFETY: Unbound from the slot above; caller drops all references
        unsafe { Self::global().release(context) };
        Ok(())
    }

    /// Number of live contexts
    pub fn registered_count(&self) -> usize {
        self.threads.lock().len()
    }

    /// Whether `os_thread` has a live context
    pub fn is_registered(&self, os_thread: ThreadId) -> bool {
        self.threads.lock().contains_key(&os_thread)
    }

    /// Visit every live context while holding the registry lock.
    ///
    /// # Safety
    /// Every owning thread must be stopped or detached and idle, since `f`
    /// touches their contexts from the calling thread. No context may be
    /// registered concurrently.
    pub(crate) unsafe fn for_each_thread(&self, mut f: impl FnMut(&Thread)) {
        let threads = self.threads.lock();
        for context in threads.values() {
            // SAFETY: Registered contexts are live until removed under this
            // lock; exclusivity is the caller's contract.
            f(unsafe { context.0.as_ref() });
        }
    }

    /// Detach if needed, unregister and free `context`.
    ///
    /// # Safety
    /// `context` must come from `ensure` and must no longer be bound to the
    /// thread-local slot.
    unsafe fn release(&self, context: NonNull<Thread>) {
        {
            // SAFETY: Live until the `Box::from_raw` below
            let thread = unsafe { context.as_ref() };
            if thread.state() != AttachState::Detached {
                tracing::warn!(
                    target: "otter::thread",
                    os_thread = ?thread.os_thread(),
                    state = ?thread.state(),
                    "Releasing a thread context that is still attached"
                );
                thread.exit_isolate();
            }
            self.threads.lock().remove(&thread.os_thread());
            tracing::debug!(
                target: "otter::thread",
                os_thread = ?thread.os_thread(),
                "Thread context released"
            );
        }
        // SAFETY: Unregistered and unbound, this is the last owner
        drop(unsafe { Box::from_raw(context.as_ptr()) });
    }
}

impl Thread {
    /// The context bound to the calling native thread, or `None` if
    /// [`Thread::ensure_initialized`] was never called on it.
    pub fn current() -> Option<&'static Thread> {
        ThreadRegistry::current()
    }

    /// Idempotent: bind a context to the calling native thread.
    pub fn ensure_initialized() -> &'static Thread {
        ThreadRegistry::ensure_initialized()
    }

    /// Fallible form of [`Thread::ensure_initialized`] for code that may run
    /// during native-thread teardown.
    pub fn try_ensure_initialized() -> ThreadResult<&'static Thread> {
        ThreadRegistry::try_ensure_initialized()
    }

    /// Release the calling native thread's context.
    ///
    /// Required on Windows; optional elsewhere, where native-thread exit
    /// releases the context.
    ///
    /// # Safety
    /// See [`ThreadRegistry::cleanup`].
    pub unsafe fn cleanup() -> ThreadResult<()> {
        // SAFETY: Forwarded contract
        unsafe { ThreadRegistry::cleanup() }
    }
}

impl std::fmt::Debug for ThreadRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadRegistry")
            .field("registered", &self.registered_count())
            .finish()
    }
}
