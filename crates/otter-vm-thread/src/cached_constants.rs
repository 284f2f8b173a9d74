//! VM-wide constants cached inline in every [`Thread`].
//!
//! Generated code loads a handful of hot values (the null and boolean
//! singletons, the store buffer stub entry point) with a single load
//! relative to the thread pointer instead of going through the constant
//! pool.
//!
//! A single list, `cached_constants_list!`, drives everything derived from
//! the table: the per-thread storage layout, the canonical value table, the
//! [`CachedConstant`] slot enum with its offsets, the `Thread::*_offset()`
//! accessors, and the initializers.
//!
//! # Start-up
//!
//! 1. [`Thread::init_once_before_isolate`] registers the main thread with
//!    default values; the object model does not exist yet.
//! 2. [`Thread::init_once_after_object_and_stub_code`] resolves every
//!    initializer into the canonical table and refreshes the calling thread.
//! 3. Every context created afterwards copies the canonical table once.
//!
//! # Relocation
//!
//! A moving collector that relocates a cached singleton must call
//! [`Thread::relocate_cached_objects`], which rewrites the canonical table
//! and the copy in every live context.

use parking_lot::RwLock;
use std::cell::Cell;
use std::mem::offset_of;

use otter_vm_gc::RawObject;

use crate::error::{ThreadError, ThreadResult};
use crate::registry::ThreadRegistry;
use crate::thread::Thread;

/// Canonical VM singleton objects, provided by the object model
pub trait ObjectSingletons {
    /// The null object
    fn null(&self) -> RawObject;
    /// The `true` object
    fn bool_true(&self) -> RawObject;
    /// The `false` object
    fn bool_false(&self) -> RawObject;
}

/// Resolved entry points of generated stubs
pub trait StubCode {
    /// Entry point of the stub that appends to the store buffer
    fn update_store_buffer_entry_point(&self) -> usize;
}

/// Inputs to the cached constant initializers
pub struct ConstantSources<'a> {
    /// Object model singletons
    pub objects: &'a dyn ObjectSingletons,
    /// Stub code entry points
    pub stubs: &'a dyn StubCode,
}

/// What a cached slot holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstantKind {
    /// A VM object reference
    Object,
    /// A native code address
    Address,
}

/// The cached constant list.
///
/// Entry format: `Slot, field, offset_accessor = initializer, default value;`
macro_rules! cached_constants_list {
    ($declare:ident) => {
        $declare! {
            objects {
                ObjectNull, object_null, object_null_offset =
                    |s: &ConstantSources<'_>| s.objects.null(), default RawObject::UNSET;
                BoolTrue, bool_true, bool_true_offset =
                    |s: &ConstantSources<'_>| s.objects.bool_true(), default RawObject::UNSET;
                BoolFalse, bool_false, bool_false_offset =
                    |s: &ConstantSources<'_>| s.objects.bool_false(), default RawObject::UNSET;
            }
            addresses {
                UpdateStoreBufferEntryPoint, update_store_buffer_entry_point,
                update_store_buffer_entry_point_offset =
                    |s: &ConstantSources<'_>| s.stubs.update_store_buffer_entry_point(), default 0;
            }
        }
    };
}

macro_rules! declare_cached_constants {
    (
        objects {
            $($oslot:ident, $ofield:ident, $ooffset:ident = $oinit:expr, default $odefault:expr;)*
        }
        addresses {
            $($aslot:ident, $afield:ident, $aoffset:ident = $ainit:expr, default $adefault:expr;)*
        }
    ) => {
        /// Named slot in the cached constant table
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum CachedConstant {
            $(
                #[doc = concat!("`", stringify!($ofield), "`")]
                $oslot,
            )*
            $(
                #[doc = concat!("`", stringify!($afield), "`")]
                $aslot,
            )*
        }

        impl CachedConstant {
            /// Every slot, in layout order
            pub const ALL: &'static [CachedConstant] =
                &[$(CachedConstant::$oslot,)* $(CachedConstant::$aslot,)*];

            /// Slot name as declared
            pub const fn name(self) -> &'static str {
                match self {
                    $(CachedConstant::$oslot => stringify!($ofield),)*
                    $(CachedConstant::$aslot => stringify!($afield),)*
                }
            }

            /// What the slot holds
            pub const fn kind(self) -> ConstantKind {
                match self {
                    $(CachedConstant::$oslot => ConstantKind::Object,)*
                    $(CachedConstant::$aslot => ConstantKind::Address,)*
                }
            }

            /// Byte offset of the slot from the start of a [`Thread`]
            pub const fn offset(self) -> usize {
                Thread::constants_offset() + self.table_offset()
            }

            const fn table_offset(self) -> usize {
                match self {
                    $(CachedConstant::$oslot => offset_of!(CachedConstants, $ofield),)*
                    $(CachedConstant::$aslot => offset_of!(CachedConstants, $afield),)*
                }
            }
        }

        /// Per-thread copies, laid out inline in [`Thread`]
        #[repr(C)]
        pub(crate) struct CachedConstants {
            $($ofield: Cell<RawObject>,)*
            $($afield: Cell<usize>,)*
        }

        /// Canonical values of the cached constants
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct CachedValues {
            $(
                #[doc = concat!("Canonical `", stringify!($ofield), "`")]
                pub $ofield: RawObject,
            )*
            $(
                #[doc = concat!("Canonical `", stringify!($afield), "`")]
                pub $afield: usize,
            )*
        }

        impl CachedValues {
            fn resolve(sources: &ConstantSources<'_>) -> Self {
                Self {
                    $($ofield: {
                        let init: fn(&ConstantSources<'_>) -> RawObject = $oinit;
                        init(sources)
                    },)*
                    $($afield: {
                        let init: fn(&ConstantSources<'_>) -> usize = $ainit;
                        init(sources)
                    },)*
                }
            }

            fn objects(&self) -> impl Iterator<Item = (CachedConstant, RawObject)> {
                [$((CachedConstant::$oslot, self.$ofield),)*].into_iter()
            }

            fn forward_objects(&mut self, forward: &mut dyn FnMut(RawObject) -> RawObject) {
                $(self.$ofield = forward(self.$ofield);)*
            }
        }

        impl CachedConstants {
            pub(crate) const fn unset() -> Self {
                Self {
                    $($ofield: Cell::new($odefault),)*
                    $($afield: Cell::new($adefault),)*
                }
            }

            fn load(&self, values: &CachedValues) {
                $(self.$ofield.set(values.$ofield);)*
                $(self.$afield.set(values.$afield);)*
            }

            fn snapshot(&self) -> CachedValues {
                CachedValues {
                    $($ofield: self.$ofield.get(),)*
                    $($afield: self.$afield.get(),)*
                }
            }
        }

        impl Thread {
            $(
                #[doc = concat!("Cached `", stringify!($ofield), "` object")]
                pub fn $ofield(&self) -> RawObject {
                    self.constants.$ofield.get()
                }

                #[doc = concat!("Byte offset of the cached `", stringify!($ofield), "` slot")]
                pub const fn $ooffset() -> usize {
                    CachedConstant::$oslot.offset()
                }
            )*
            $(
                #[doc = concat!("Cached `", stringify!($afield), "` address")]
                pub fn $afield(&self) -> usize {
                    self.constants.$afield.get()
                }

                #[doc = concat!("Byte offset of the cached `", stringify!($afield), "` slot")]
                pub const fn $aoffset() -> usize {
                    CachedConstant::$aslot.offset()
                }
            )*
        }

        const SLOT_OFFSETS: &[usize] = &[
            $(offset_of!(CachedConstants, $ofield),)*
            $(offset_of!(CachedConstants, $afield),)*
        ];
    };
}

cached_constants_list!(declare_cached_constants);

// Compile-time check: slots are word-sized and packed in declaration order.
const _: () = {
    let word = std::mem::size_of::<usize>();
    let mut i = 0;
    while i < SLOT_OFFSETS.len() {
        assert!(SLOT_OFFSETS[i] == i * word);
        i += 1;
    }
    assert!(std::mem::size_of::<CachedConstants>() == SLOT_OFFSETS.len() * word);
};

/// Canonical table, `None` until the second start-up phase
static CANONICAL: RwLock<Option<CachedValues>> = parking_lot::const_rwlock(None);

impl Thread {
    /// First start-up phase: establish the registry and register the calling
    /// thread before the object model exists.
    pub fn init_once_before_isolate() -> &'static Thread {
        let thread = ThreadRegistry::ensure_or_panic(false);
        tracing::debug!(target: "otter::thread", "Thread registry initialized");
        thread
    }

    /// Second start-up phase: resolve every cached constant and refresh the
    /// calling thread's copy.
    ///
    /// Must run after the object singletons and the stub code exist.
    pub fn init_once_after_object_and_stub_code(
        objects: &dyn ObjectSingletons,
        stubs: &dyn StubCode,
    ) -> ThreadResult<()> {
        if CANONICAL.read().is_some() {
            return Err(ThreadError::ConstantsAlreadyInitialized);
        }
        // Resolved outside the lock: collaborators may query the table.
        let values = CachedValues::resolve(&ConstantSources { objects, stubs });
        {
            let mut canonical = CANONICAL.write();
            if canonical.is_some() {
                return Err(ThreadError::ConstantsAlreadyInitialized);
            }
            *canonical = Some(values);
        }

        if let Some(thread) = Thread::current() {
            thread.init_vm_constants();
        }
        tracing::debug!(
            target: "otter::thread",
            slots = CachedConstant::ALL.len(),
            "Cached VM constants resolved"
        );
        Ok(())
    }

    /// Copy the canonical values into this thread.
    ///
    /// Leaves the defaults in place if the canonical table is not resolved.
    pub(crate) fn init_vm_constants(&self) {
        if let Some(values) = *CANONICAL.read() {
            self.constants.load(&values);
        }
    }

    /// Snapshot of this thread's cached values
    pub fn cached_values(&self) -> CachedValues {
        self.constants.snapshot()
    }

    /// The canonical values, once resolved
    pub fn canonical_values() -> Option<CachedValues> {
        *CANONICAL.read()
    }

    /// Whether generated code can load `object` directly from the thread
    pub fn can_load_from_thread(object: RawObject) -> bool {
        Self::offset_from_thread(object).is_some()
    }

    /// Offset of the slot caching `object`, or `None` if it is not cached.
    ///
    /// Total: any value outside the cached set, and every value before the
    /// table is resolved, yields `None`.
    pub fn offset_from_thread(object: RawObject) -> Option<usize> {
        if object.is_unset() {
            return None;
        }
        let canonical = CANONICAL.read();
        canonical
            .as_ref()?
            .objects()
            .find(|&(_, cached)| cached == object)
            .map(|(slot, _)| slot.offset())
    }

    /// Rewrite cached object references after the collector moved them.
    ///
    /// Updates the canonical table and the copy in every registered context.
    ///
    /// # Safety
    /// Every registered thread must be stopped (at a safepoint or detached
    /// and idle): their contexts are written from the calling thread.
    pub unsafe fn relocate_cached_objects(forward: &mut dyn FnMut(RawObject) -> RawObject) {
        let values = {
            let mut canonical = CANONICAL.write();
            let Some(values) = canonical.as_mut() else {
                return;
            };
            values.forward_objects(forward);
            *values
        };

        let mut updated = 0;
        // SAFETY: Caller guarantees every owning thread is stopped
        unsafe {
            ThreadRegistry::global().for_each_thread(|thread| {
                thread.constants.load(&values);
                updated += 1;
            });
        }
        tracing::debug!(target: "otter::thread", threads = updated, "Cached VM objects relocated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_offsets_are_distinct_and_stable() {
        let offsets: HashSet<usize> = CachedConstant::ALL.iter().map(|s| s.offset()).collect();
        assert_eq!(offsets.len(), CachedConstant::ALL.len());

        for slot in CachedConstant::ALL {
            assert_eq!(slot.offset(), slot.offset());
            // Slots sit behind the isolate and store buffer block pointers
            assert!(slot.offset() >= Thread::constants_offset());
            assert_eq!(slot.offset() % std::mem::size_of::<usize>(), 0);
        }
    }

    #[test]
    fn test_named_accessors_match_slots() {
        assert_eq!(Thread::object_null_offset(), CachedConstant::ObjectNull.offset());
        assert_eq!(Thread::bool_true_offset(), CachedConstant::BoolTrue.offset());
        assert_eq!(Thread::bool_false_offset(), CachedConstant::BoolFalse.offset());
        assert_eq!(
            Thread::update_store_buffer_entry_point_offset(),
            CachedConstant::UpdateStoreBufferEntryPoint.offset()
        );
    }

    #[test]
    fn test_slot_metadata() {
        assert_eq!(CachedConstant::ObjectNull.name(), "object_null");
        assert_eq!(CachedConstant::ObjectNull.kind(), ConstantKind::Object);
        assert_eq!(
            CachedConstant::UpdateStoreBufferEntryPoint.kind(),
            ConstantKind::Address
        );
        assert_eq!(CachedConstant::ALL.first(), Some(&CachedConstant::ObjectNull));
    }

    #[test]
    fn test_uninitialized_thread_keeps_defaults() {
        let thread = Thread::new(false);
        assert!(thread.object_null().is_unset());
        assert!(thread.bool_true().is_unset());
        assert_eq!(thread.update_store_buffer_entry_point(), 0);
    }

    #[test]
    fn test_unset_is_never_cached() {
        assert!(!Thread::can_load_from_thread(RawObject::UNSET));
        assert_eq!(Thread::offset_from_thread(RawObject::UNSET), None);
    }
}
