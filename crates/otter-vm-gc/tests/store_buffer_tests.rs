//! Store buffer protocol tests
//!
//! These tests drive blocks through the full mutator/collector cycle:
//! barrier check, append, hand-off, collector scan, recycle.

use otter_vm_gc::object::tags;
use otter_vm_gc::{
    BLOCK_CAPACITY, GcHeader, RawObject, StoreBuffer, StoreBufferConfig, ThresholdPolicy,
    remember_container,
};

fn buffer_with_threshold(threshold: usize) -> StoreBuffer {
    StoreBuffer::with_config(StoreBufferConfig {
        block_threshold: threshold,
        ..StoreBufferConfig::default()
    })
}

#[test]
fn test_scavenge_cycle_clears_remembered_bits() {
    let buffer = buffer_with_threshold(4);
    let old_objects: Vec<GcHeader> = (0..6).map(|_| GcHeader::new_old(tags::ARRAY)).collect();
    let young = GcHeader::new(tags::OBJECT);
    let value = RawObject::from_header(&young);

    let mut block = buffer.pop_empty_block();

    // Two stores into each old container; only the first is recorded.
    for _ in 0..2 {
        for old in &old_objects {
            let container = RawObject::from_header(old);
            // SAFETY: All headers outlive the loop
            if unsafe { remember_container(container, value) } {
                block.push(container);
                if block.is_full() {
                    buffer.push_block(block, ThresholdPolicy::CheckThreshold);
                    block = buffer.pop_empty_block();
                }
            }
        }
    }
    buffer.push_block(block, ThresholdPolicy::IgnoreThreshold);

    assert_eq!(buffer.entry_count(), old_objects.len());
    assert_eq!(buffer.full_block_count(), 2);

    // Collector: scan each remembered container, then reset its bit.
    let mut scanned = Vec::new();
    buffer.process_blocks(|obj| {
        // SAFETY: Every recorded object is one of the live old headers
        unsafe { obj.header() }.clear_remembered();
        scanned.push(obj);
    });

    let expected: Vec<_> = old_objects.iter().map(RawObject::from_header).collect();
    assert_eq!(scanned, expected);
    assert!(old_objects.iter().all(|h| !h.is_remembered()));
    assert_eq!(buffer.entry_count(), 0);
}

#[test]
fn test_full_capacity_block() {
    let buffer = StoreBuffer::new();
    let mut block = buffer.pop_empty_block();
    assert_eq!(block.threshold(), BLOCK_CAPACITY);

    for n in 0..BLOCK_CAPACITY {
        assert!(!block.is_full());
        block.push(RawObject::from_addr(0x10_000 + n * 8));
    }
    assert!(block.is_full());
    assert_eq!(block.len(), BLOCK_CAPACITY);

    buffer.push_block(block, ThresholdPolicy::CheckThreshold);
    assert_eq!(buffer.entry_count(), BLOCK_CAPACITY);
}

#[test]
fn test_hand_off_across_threads() {
    let buffer = std::sync::Arc::new(buffer_with_threshold(8));

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let buffer = buffer.clone();
            std::thread::spawn(move || {
                let mut block = buffer.pop_empty_block();
                for n in 0..20 {
                    block.push(RawObject::from_addr((t + 1) * 0x1_0000 + n * 8));
                    if block.is_full() {
                        buffer.push_block(block, ThresholdPolicy::CheckThreshold);
                        block = buffer.pop_empty_block();
                    }
                }
                buffer.push_block(block, ThresholdPolicy::CheckThreshold);
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    // 20 entries per thread: two full blocks of 8 and one partial of 4
    assert_eq!(buffer.entry_count(), 80);
    assert_eq!(buffer.full_block_count(), 12);

    // Within one thread's blocks, program order is preserved
    let blocks = buffer.take_blocks();
    for t in 0..4 {
        let base = (t + 1) * 0x1_0000;
        let own: Vec<usize> = blocks
            .iter()
            .flat_map(|b| b.iter().map(RawObject::addr).collect::<Vec<_>>())
            .filter(|addr| (base..base + 0x1_0000).contains(addr))
            .collect();
        let expected: Vec<usize> = (0..20).map(|n| base + n * 8).collect();
        assert_eq!(own, expected);
    }
}
