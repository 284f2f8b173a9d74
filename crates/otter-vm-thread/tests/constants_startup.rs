//! Two-phase start-up of the cached constant table.
//!
//! A single test: the canonical table is process-global and the sequence
//! must be observed from the start.

mod common;

use std::cell::Cell;
use std::thread;

use otter_vm_gc::RawObject;
use otter_vm_thread::{CachedConstant, ObjectSingletons, Thread, ThreadRegistry};

/// Object model that consults the constant table while it is being resolved
struct QueryingSingletons {
    queried: Cell<usize>,
}

impl QueryingSingletons {
    fn observe(&self, obj: RawObject) -> RawObject {
        assert!(!Thread::can_load_from_thread(obj));
        assert!(Thread::canonical_values().is_none());
        self.queried.set(self.queried.get() + 1);
        obj
    }
}

impl ObjectSingletons for QueryingSingletons {
    fn null(&self) -> RawObject {
        self.observe(common::Singletons.null())
    }

    fn bool_true(&self) -> RawObject {
        self.observe(common::Singletons.bool_true())
    }

    fn bool_false(&self) -> RawObject {
        self.observe(common::Singletons.bool_false())
    }
}

#[test]
fn test_two_phase_startup() {
    common::init_tracing();
    let null = RawObject::from_header(&common::NULL);

    // Before phase one nothing is known
    assert!(Thread::canonical_values().is_none());
    assert!(!Thread::can_load_from_thread(null));

    // Phase one: the main thread is registered with defaults
    let main = Thread::init_once_before_isolate();
    assert!(ThreadRegistry::global().is_registered(main.os_thread()));
    assert!(std::ptr::eq(main, Thread::ensure_initialized()));
    assert!(main.object_null().is_unset());
    assert_eq!(main.update_store_buffer_entry_point(), 0);
    assert_eq!(Thread::offset_from_thread(null), None);

    // Threads created in between keep defaults too
    let early = thread::spawn(|| Thread::ensure_initialized().cached_values())
        .join()
        .unwrap();
    assert!(early.bool_true.is_unset());

    // Phase two resolves the table and refreshes the calling thread
    let objects = QueryingSingletons {
        queried: Cell::new(0),
    };
    Thread::init_once_after_object_and_stub_code(&objects, &common::Stubs).unwrap();
    assert_eq!(objects.queried.get(), 3);
    assert_eq!(main.object_null(), null);
    assert_eq!(main.bool_false(), RawObject::from_header(&common::FALSE));
    assert_eq!(main.update_store_buffer_entry_point(), common::stub_entry_point());
    assert_eq!(
        Thread::offset_from_thread(null),
        Some(CachedConstant::ObjectNull.offset())
    );
    assert_eq!(Thread::canonical_values(), Some(main.cached_values()));

    let late = thread::spawn(|| Thread::ensure_initialized().cached_values())
        .join()
        .unwrap();
    assert_eq!(late, main.cached_values());
}
