//! Per-thread side of the generational write barrier.
//!
//! A mutator appends containers that gained an old-to-young reference to its
//! own store buffer block without synchronization. Once the block reaches
//! its threshold it is handed to the isolate's [`StoreBuffer`] and replaced
//! by an empty one.
//!
//! [`StoreBuffer`]: otter_vm_gc::StoreBuffer

use otter_vm_gc::{RawObject, ThresholdPolicy, remember_container};

use crate::thread::Thread;

impl Thread {
    /// Record `obj` in this thread's store buffer block.
    ///
    /// A full block is drained immediately; the isolate may raise a scavenge
    /// request in response.
    ///
    /// # Panics
    /// Panics unless the thread is attached as a mutator.
    #[inline]
    pub fn store_buffer_add_object(&self, obj: RawObject) {
        if self.append(obj) {
            self.store_buffer_block_process(ThresholdPolicy::CheckThreshold);
        }
    }

    /// Like [`Thread::store_buffer_add_object`], for the collector recording
    /// while it runs as the mutator. Draining raises no new scavenge request.
    ///
    /// # Panics
    /// Panics unless the thread is attached as a mutator.
    #[inline]
    pub fn store_buffer_add_object_gc(&self, obj: RawObject) {
        if self.append(obj) {
            self.store_buffer_block_process(ThresholdPolicy::IgnoreThreshold);
        }
    }

    /// Hand the current block to the isolate and install a fresh one.
    ///
    /// # Panics
    /// Panics unless the thread is attached as a mutator.
    #[cold]
    pub fn store_buffer_block_process(&self, policy: ThresholdPolicy) {
        let block = self.take_store_buffer_block();
        let store_buffer = self.isolate_ref().store_buffer();

        tracing::trace!(
            target: "otter::thread",
            entries = block.len(),
            ?policy,
            "Draining store buffer block"
        );

        store_buffer.push_block(block, policy);
        self.store_buffer_block
            .set(Some(store_buffer.pop_empty_block()));
    }

    /// Drain the current block, whatever its fill level, before a
    /// collection.
    ///
    /// # Panics
    /// Panics unless the thread is attached as a mutator.
    pub fn prepare_for_gc(&self) {
        assert!(
            self.is_mutator(),
            "prepare_for_gc called on thread {:?} in state {:?}",
            self.os_thread(),
            self.state()
        );
        self.store_buffer_block_process(ThresholdPolicy::IgnoreThreshold);
    }

    /// Generational store barrier for `container.field = value`.
    ///
    /// Records `container` the first time in a collection cycle that it
    /// gains a reference to a young object.
    ///
    /// # Safety
    /// Both references must be unset or point at live object headers.
    ///
    /// # Panics
    /// Panics unless the thread is attached as a mutator. The remembered bit
    /// is left untouched in that case.
    #[inline]
    pub unsafe fn store_barrier(&self, container: RawObject, value: RawObject) {
        assert!(
            self.is_mutator(),
            "store_barrier called on thread {:?} in state {:?}",
            self.os_thread(),
            self.state()
        );
        // SAFETY: Forwarded contract
        if unsafe { remember_container(container, value) } {
            self.store_buffer_add_object(container);
        }
    }

    /// Whether the current block holds `obj`. Verification only.
    pub fn store_buffer_contains(&self, obj: RawObject) -> bool {
        self.with_block(|block| block.is_some_and(|b| b.contains(obj)))
    }

    /// Entries in the current block, zero without a block
    pub fn store_buffer_block_len(&self) -> usize {
        self.with_block(|block| block.map_or(0, |b| b.len()))
    }

    /// Push `obj` into the block, returning whether it is now full.
    #[inline(always)]
    fn append(&self, obj: RawObject) -> bool {
        let mut block = self.take_store_buffer_block();
        block.push(obj);
        let full = block.is_full();
        self.store_buffer_block.set(Some(block));
        full
    }

    fn with_block<R>(&self, f: impl FnOnce(Option<&otter_vm_gc::StoreBufferBlock>) -> R) -> R {
        let block = self.store_buffer_block.take();
        let result = f(block.as_deref());
        self.store_buffer_block.set(block);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isolate::{Isolate, IsolateConfig};
    use otter_vm_gc::StoreBufferConfig;

    fn isolate_with_threshold(threshold: usize) -> Isolate {
        Isolate::new(IsolateConfig {
            name: "test".to_string(),
            store_buffer: StoreBufferConfig {
                block_threshold: threshold,
                ..StoreBufferConfig::default()
            },
        })
    }

    #[test]
    fn test_drain_on_threshold() {
        let isolate = isolate_with_threshold(2);
        let thread = Thread::new(false);
        // SAFETY: isolate outlives the attachment
        unsafe { thread.enter_isolate(&isolate) };

        thread.store_buffer_add_object(RawObject::from_addr(0x100));
        assert_eq!(thread.store_buffer_block_len(), 1);
        assert_eq!(isolate.store_buffer().full_block_count(), 0);

        thread.store_buffer_add_object(RawObject::from_addr(0x108));
        assert_eq!(thread.store_buffer_block_len(), 0);
        assert_eq!(isolate.store_buffer().entry_count(), 2);

        thread.exit_isolate();
    }

    #[test]
    fn test_contains_tracks_current_block() {
        let isolate = isolate_with_threshold(4);
        let thread = Thread::new(false);
        let obj = RawObject::from_addr(0x200);
        assert!(!thread.store_buffer_contains(obj));

        // SAFETY: isolate outlives the attachment
        unsafe { thread.enter_isolate(&isolate) };
        thread.store_buffer_add_object(obj);
        assert!(thread.store_buffer_contains(obj));

        thread.prepare_for_gc();
        assert!(!thread.store_buffer_contains(obj));
        assert_eq!(isolate.store_buffer().entry_count(), 1);

        thread.exit_isolate();
        assert_eq!(thread.store_buffer_block_len(), 0);
    }

    #[test]
    fn test_gc_recording_never_overflows() {
        let isolate = Isolate::new(IsolateConfig {
            name: "gc".to_string(),
            store_buffer: StoreBufferConfig {
                block_threshold: 1,
                max_full_blocks: 1,
                ..StoreBufferConfig::default()
            },
        });
        let thread = Thread::new(false);
        // SAFETY: isolate outlives the attachment
        unsafe { thread.enter_isolate(&isolate) };

        for n in 0..4 {
            thread.store_buffer_add_object_gc(RawObject::from_addr(0x1000 + n * 8));
        }
        assert_eq!(isolate.store_buffer().full_block_count(), 4);
        assert!(!isolate.store_buffer().is_overflowing());

        thread.store_buffer_add_object(RawObject::from_addr(0x2000));
        assert!(isolate.store_buffer().is_overflowing());

        thread.exit_isolate();
    }
}
