//! Shared fixtures for thread context integration tests
#![allow(dead_code)]

use std::sync::Once;

use otter_vm_gc::object::tags;
use otter_vm_gc::{GcHeader, RawObject, StoreBufferConfig};
use otter_vm_thread::{Isolate, IsolateConfig, ObjectSingletons, StubCode, Thread};

pub static NULL: GcHeader = GcHeader::new_old(tags::NULL);
pub static TRUE: GcHeader = GcHeader::new_old(tags::BOOL);
pub static FALSE: GcHeader = GcHeader::new_old(tags::BOOL);

extern "C" fn update_store_buffer_stub() {}

pub struct Singletons;

impl ObjectSingletons for Singletons {
    fn null(&self) -> RawObject {
        RawObject::from_header(&NULL)
    }

    fn bool_true(&self) -> RawObject {
        RawObject::from_header(&TRUE)
    }

    fn bool_false(&self) -> RawObject {
        RawObject::from_header(&FALSE)
    }
}

pub struct Stubs;

impl StubCode for Stubs {
    fn update_store_buffer_entry_point(&self) -> usize {
        update_store_buffer_stub as *const () as usize
    }
}

pub fn stub_entry_point() -> usize {
    Stubs.update_store_buffer_entry_point()
}

/// Run both start-up phases once per test binary, on whichever test thread
/// gets here first.
pub fn init_vm() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        Thread::init_once_before_isolate();
        Thread::init_once_after_object_and_stub_code(&Singletons, &Stubs)
            .expect("constants initialized once per binary");
    });
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn isolate(name: &str, threshold: usize) -> Isolate {
    Isolate::new(IsolateConfig {
        name: name.to_string(),
        store_buffer: StoreBufferConfig {
            block_threshold: threshold,
            ..StoreBufferConfig::default()
        },
    })
}

/// Synthetic object reference, never dereferenced
pub fn obj(n: usize) -> RawObject {
    RawObject::from_addr(0x10_0000 + n * 16)
}
