//! Store buffer: the remembered set of the generational collector
//!
//! Mutator threads record old objects that may point into young space by
//! appending them to a thread-owned [`StoreBufferBlock`]. When a block fills
//! up (or a collection is imminent) the thread hands the whole block to the
//! isolate's [`StoreBuffer`] and takes a fresh empty one. The collector later
//! takes every full block and scans the recorded objects as extra roots.
//!
//! ## Design
//!
//! - **Block append is lock-free**: a block belongs to exactly one thread
//!   until it is pushed, so appending is a plain store plus an increment
//! - **Hand-off is amortized**: the mutex is touched once per block, never
//!   per recorded object
//! - **Blocks are recycled**: processed blocks return to an empty list, so a
//!   steady-state mutator never allocates
//! - **Duplicates are allowed**: the collector's scan is idempotent

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crate::object::RawObject;

/// Number of object slots in every store buffer block
pub const BLOCK_CAPACITY: usize = 1024;

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// Fixed-capacity append buffer of remembered objects.
///
/// Layout is part of the contract with generated code, which appends inline:
/// load `top`, compare with `threshold`, store into `pointers[top]`, bump
/// `top`. Field order must not change without updating the code generator.
#[repr(C)]
pub struct StoreBufferBlock {
    /// Number of occupied slots
    top: usize,
    /// Fill level at which the owning thread hands the block off
    threshold: usize,
    /// Id of the [`StoreBuffer`] that issued this block
    owner: u64,
    /// Recorded objects, `pointers[..top]` are valid
    pointers: [RawObject; BLOCK_CAPACITY],
}

impl StoreBufferBlock {
    fn new(owner: u64, threshold: usize) -> Box<Self> {
        Box::new(Self {
            top: 0,
            threshold,
            owner,
            pointers: [RawObject::UNSET; BLOCK_CAPACITY],
        })
    }

    /// Append an object.
    ///
    /// # Panics
    /// Panics if the block is already at [`BLOCK_CAPACITY`]. Owners hand the
    /// block off once it reaches its threshold, so this never happens in a
    /// correct caller.
    #[inline]
    pub fn push(&mut self, obj: RawObject) {
        debug_assert!(
            self.top < self.threshold,
            "push into a store buffer block past its threshold"
        );
        self.pointers[self.top] = obj;
        self.top += 1;
    }

    /// Remove and return the most recently recorded object
    pub fn pop(&mut self) -> Option<RawObject> {
        if self.top == 0 {
            return None;
        }
        self.top -= 1;
        Some(self.pointers[self.top])
    }

    /// Number of recorded objects
    pub fn len(&self) -> usize {
        self.top
    }

    /// Check if no object has been recorded
    pub fn is_empty(&self) -> bool {
        self.top == 0
    }

    /// Whether the fill level reached the hand-off threshold
    #[inline]
    pub fn is_full(&self) -> bool {
        self.top >= self.threshold
    }

    /// The hand-off threshold for this block
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Linear search for `obj`. Verification tooling only.
    pub fn contains(&self, obj: RawObject) -> bool {
        self.as_slice().contains(&obj)
    }

    /// Recorded objects in insertion order
    pub fn as_slice(&self) -> &[RawObject] {
        &self.pointers[..self.top]
    }

    /// Iterate recorded objects in insertion order
    pub fn iter(&self) -> impl Iterator<Item = RawObject> + '_ {
        self.as_slice().iter().copied()
    }

    /// Forget all recorded objects
    pub fn reset(&mut self) {
        self.top = 0;
    }

    /// Byte offset of the fill counter
    pub const fn top_offset() -> usize {
        std::mem::offset_of!(StoreBufferBlock, top)
    }

    /// Byte offset of the hand-off threshold
    pub const fn threshold_offset() -> usize {
        std::mem::offset_of!(StoreBufferBlock, threshold)
    }

    /// Byte offset of the first pointer slot
    pub const fn pointers_offset() -> usize {
        std::mem::offset_of!(StoreBufferBlock, pointers)
    }
}

impl std::fmt::Debug for StoreBufferBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreBufferBlock")
            .field("top", &self.top)
            .field("threshold", &self.threshold)
            .field("owner", &self.owner)
            .finish()
    }
}

// Compile-time check: generated code addresses these fields by fixed offsets.
const _: () = {
    let word = std::mem::size_of::<usize>();
    assert!(StoreBufferBlock::top_offset() == 0);
    assert!(StoreBufferBlock::threshold_offset() == word);
    assert!(StoreBufferBlock::pointers_offset() >= 3 * word);
};

/// Whether a block hand-off may raise a scavenge request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdPolicy {
    /// Raise the overflow flag when too many full blocks are pending
    CheckThreshold,
    /// Never raise the overflow flag (the caller is the collector)
    IgnoreThreshold,
}

/// Store buffer configuration
#[derive(Debug, Clone)]
pub struct StoreBufferConfig {
    /// Fill level at which a thread hands its block off (default: capacity)
    pub block_threshold: usize,
    /// Pending full blocks before a scavenge is requested (default: 100)
    pub max_full_blocks: usize,
    /// Empty blocks kept for reuse (default: 100)
    pub max_cached_empty_blocks: usize,
}

impl Default for StoreBufferConfig {
    fn default() -> Self {
        Self {
            block_threshold: BLOCK_CAPACITY,
            max_full_blocks: 100,
            max_cached_empty_blocks: 100,
        }
    }
}

/// Store buffer statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreBufferStats {
    /// Non-empty blocks handed off by threads
    pub blocks_pushed: usize,
    /// Empty blocks handed off (recycled without reaching the collector)
    pub empty_pushes: usize,
    /// Times the overflow flag was raised
    pub overflows: usize,
}

struct BlockLists {
    /// Blocks waiting for the collector, oldest first
    full: VecDeque<Box<StoreBufferBlock>>,
    /// Processed blocks ready for reuse
    empty: Vec<Box<StoreBufferBlock>>,
}

/// Isolate-wide aggregate of drained store buffer blocks
pub struct StoreBuffer {
    id: u64,
    config: StoreBufferConfig,
    lists: Mutex<BlockLists>,
    /// Raised when pending blocks exceed `max_full_blocks`
    overflow: CachePadded<AtomicBool>,
    blocks_pushed: AtomicUsize,
    empty_pushes: AtomicUsize,
    overflows: AtomicUsize,
}

impl StoreBuffer {
    /// Create a store buffer with default config
    pub fn new() -> Self {
        Self::with_config(StoreBufferConfig::default())
    }

    /// Create a store buffer with custom config
    ///
    /// # Panics
    /// Panics if `block_threshold` is zero or exceeds [`BLOCK_CAPACITY`].
    pub fn with_config(config: StoreBufferConfig) -> Self {
        assert!(
            (1..=BLOCK_CAPACITY).contains(&config.block_threshold),
            "store buffer block threshold {} outside 1..={}",
            config.block_threshold,
            BLOCK_CAPACITY
        );
        Self {
            id: NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
            config,
            lists: Mutex::new(BlockLists {
                full: VecDeque::new(),
                empty: Vec::new(),
            }),
            overflow: CachePadded::new(AtomicBool::new(false)),
            blocks_pushed: AtomicUsize::new(0),
            empty_pushes: AtomicUsize::new(0),
            overflows: AtomicUsize::new(0),
        }
    }

    /// Get config
    pub fn config(&self) -> &StoreBufferConfig {
        &self.config
    }

    /// Hand out an empty block owned by this buffer
    pub fn pop_empty_block(&self) -> Box<StoreBufferBlock> {
        let recycled = self.lists.lock().empty.pop();
        match recycled {
            Some(mut block) => {
                block.reset();
                block.threshold = self.config.block_threshold;
                block
            }
            None => StoreBufferBlock::new(self.id, self.config.block_threshold),
        }
    }

    /// Take ownership of a block from a thread.
    ///
    /// Empty blocks go straight back to the empty list. Non-empty blocks
    /// queue up for the collector in hand-off order.
    ///
    /// # Panics
    /// Panics if the block was issued by a different store buffer.
    pub fn push_block(&self, block: Box<StoreBufferBlock>, policy: ThresholdPolicy) {
        assert_eq!(
            block.owner, self.id,
            "store buffer block pushed into a foreign store buffer"
        );

        if block.is_empty() {
            self.empty_pushes.fetch_add(1, Ordering::Relaxed);
            self.cache_empty(block);
            return;
        }

        let pending = {
            let mut lists = self.lists.lock();
            lists.full.push_back(block);
            lists.full.len()
        };
        self.blocks_pushed.fetch_add(1, Ordering::Relaxed);

        if policy == ThresholdPolicy::CheckThreshold
            && pending > self.config.max_full_blocks
            && !self.overflow.swap(true, Ordering::AcqRel)
        {
            self.overflows.fetch_add(1, Ordering::Relaxed);

            #[cfg(feature = "gc_logging")]
            tracing::debug!(
                target: "otter::gc",
                pending_blocks = pending,
                limit = self.config.max_full_blocks,
                "Store buffer overflow, scavenge requested"
            );
        }
    }

    /// Take every pending block, oldest first, and clear the overflow flag
    pub fn take_blocks(&self) -> Vec<Box<StoreBufferBlock>> {
        let blocks: Vec<_> = self.lists.lock().full.drain(..).collect();
        self.overflow.store(false, Ordering::Release);
        blocks
    }

    /// Return a processed block for reuse
    ///
    /// # Panics
    /// Panics if the block was issued by a different store buffer.
    pub fn recycle(&self, mut block: Box<StoreBufferBlock>) {
        assert_eq!(
            block.owner, self.id,
            "store buffer block recycled into a foreign store buffer"
        );
        block.reset();
        self.cache_empty(block);
    }

    /// Visit every pending entry in insertion order, then recycle the blocks.
    ///
    /// Returns the number of entries visited.
    pub fn process_blocks<F>(&self, mut visitor: F) -> usize
    where
        F: FnMut(RawObject),
    {
        let mut visited = 0;
        for block in self.take_blocks() {
            for obj in block.iter() {
                visitor(obj);
                visited += 1;
            }
            self.recycle(block);
        }

        #[cfg(feature = "gc_logging")]
        tracing::debug!(target: "otter::gc", entries = visited, "Store buffer processed");

        visited
    }

    /// Whether a scavenge has been requested because of pending blocks
    pub fn is_overflowing(&self) -> bool {
        self.overflow.load(Ordering::Acquire)
    }

    /// Number of blocks waiting for the collector
    pub fn full_block_count(&self) -> usize {
        self.lists.lock().full.len()
    }

    /// Number of empty blocks cached for reuse
    pub fn empty_block_count(&self) -> usize {
        self.lists.lock().empty.len()
    }

    /// Number of entries waiting for the collector
    pub fn entry_count(&self) -> usize {
        self.lists.lock().full.iter().map(|b| b.len()).sum()
    }

    /// Get statistics
    pub fn stats(&self) -> StoreBufferStats {
        StoreBufferStats {
            blocks_pushed: self.blocks_pushed.load(Ordering::Relaxed),
            empty_pushes: self.empty_pushes.load(Ordering::Relaxed),
            overflows: self.overflows.load(Ordering::Relaxed),
        }
    }

    fn cache_empty(&self, block: Box<StoreBufferBlock>) {
        let mut lists = self.lists.lock();
        if lists.empty.len() < self.config.max_cached_empty_blocks {
            lists.empty.push(block);
        }
    }
}

impl Default for StoreBuffer {
    fn default() -> Self {
        Self::new()
    }
}
