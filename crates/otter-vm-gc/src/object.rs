//! GC object layout as seen by the write barrier

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Header bit: the object lives in the old generation.
const OLD_BIT: u8 = 1 << 0;
/// Header bit: the object is already in some store buffer block.
const REMEMBERED_BIT: u8 = 1 << 1;

/// GC object header
#[repr(C)]
pub struct GcHeader {
    /// Generation and remembered-set bits
    flags: AtomicU8,
    /// Object type tag
    tag: u8,
    /// Reserved
    _reserved: [u8; 6],
}

impl GcHeader {
    /// Create a header for a freshly allocated (young) object
    pub const fn new(tag: u8) -> Self {
        Self {
            flags: AtomicU8::new(0),
            tag,
            _reserved: [0; 6],
        }
    }

    /// Create a header for an object allocated directly in old space
    pub const fn new_old(tag: u8) -> Self {
        Self {
            flags: AtomicU8::new(OLD_BIT),
            tag,
            _reserved: [0; 6],
        }
    }

    /// Get object tag
    pub fn tag(&self) -> u8 {
        self.tag
    }

    /// Whether the object has been promoted to the old generation
    pub fn is_old(&self) -> bool {
        self.flags.load(Ordering::Acquire) & OLD_BIT != 0
    }

    /// Promote the object to the old generation
    pub fn set_old(&self) {
        self.flags.fetch_or(OLD_BIT, Ordering::AcqRel);
    }

    /// Whether the object is currently recorded in the remembered set
    pub fn is_remembered(&self) -> bool {
        self.flags.load(Ordering::Acquire) & REMEMBERED_BIT != 0
    }

    /// Claim the remembered bit.
    ///
    /// Returns true only for the caller that flipped the bit from clear to
    /// set, so exactly one barrier records the object per cycle.
    pub fn try_set_remembered(&self) -> bool {
        self.flags.fetch_or(REMEMBERED_BIT, Ordering::AcqRel) & REMEMBERED_BIT == 0
    }

    /// Clear the remembered bit (collector, after processing the object)
    pub fn clear_remembered(&self) {
        self.flags.fetch_and(!REMEMBERED_BIT, Ordering::AcqRel);
    }
}

impl fmt::Debug for GcHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GcHeader")
            .field("tag", &self.tag)
            .field("old", &self.is_old())
            .field("remembered", &self.is_remembered())
            .finish()
    }
}

/// Untagged reference to a heap object, as stored in a store buffer block.
///
/// One machine word wide so that generated code can read and write it with a
/// single load or store.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct RawObject(usize);

impl RawObject {
    /// The all-zero word. Marks slots that have not been populated yet.
    pub const UNSET: RawObject = RawObject(0);

    /// Reference the object that owns `header`
    pub fn from_header(header: &GcHeader) -> Self {
        Self(header as *const GcHeader as usize)
    }

    /// Wrap a raw address
    pub const fn from_addr(addr: usize) -> Self {
        Self(addr)
    }

    /// The raw address
    pub const fn addr(self) -> usize {
        self.0
    }

    /// Whether this is [`RawObject::UNSET`]
    pub const fn is_unset(self) -> bool {
        self.0 == 0
    }

    /// Header pointer for this object
    pub fn as_header_ptr(self) -> *const GcHeader {
        self.0 as *const GcHeader
    }

    /// Borrow the object's header.
    ///
    /// # Safety
    /// The reference must point to a live `GcHeader` for the whole of `'a`.
    pub unsafe fn header<'a>(self) -> &'a GcHeader {
        // SAFETY: Caller guarantees the address is a live header
        unsafe { &*self.as_header_ptr() }
    }
}

impl fmt::Debug for RawObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawObject({:#x})", self.0)
    }
}

/// Object type tags
pub mod tags {
    /// The null singleton
    pub const NULL: u8 = 1;
    /// Boolean singletons
    pub const BOOL: u8 = 2;
    /// Plain object
    pub const OBJECT: u8 = 3;
    /// Array object
    pub const ARRAY: u8 = 4;
    /// Class object
    pub const CLASS: u8 = 5;
}
