//! Generational write barrier predicate
//!
//! A pointer store needs recording when it creates an old-to-young edge: the
//! next scavenge only scans the young generation plus the remembered set, so
//! any old container that points into young space must be in the set.
//!
//! The predicate lives here, next to the header bits it reads. Appending to a
//! store buffer block is the job of the thread that owns the block.

use crate::object::RawObject;

/// Returns true when storing `value` into `container` creates an
/// old-to-young edge.
///
/// # Safety
/// Both references must be [`RawObject::UNSET`] or point to live headers.
#[inline]
pub unsafe fn needs_store_barrier(container: RawObject, value: RawObject) -> bool {
    if container.is_unset() || value.is_unset() {
        return false;
    }

    // SAFETY: Caller guarantees both headers are live
    let (container, value) = unsafe { (container.header(), value.header()) };
    container.is_old() && !value.is_old()
}

/// Generational barrier with deduplication.
///
/// Returns true if `container` must be appended to the store buffer: the
/// store creates an old-to-young edge and this call claimed the container's
/// remembered bit. A container already remembered in this cycle is skipped.
///
/// # Safety
/// Both references must be [`RawObject::UNSET`] or point to live headers.
#[inline]
pub unsafe fn remember_container(container: RawObject, value: RawObject) -> bool {
    // SAFETY: Forwarded caller guarantee
    if !unsafe { needs_store_barrier(container, value) } {
        return false;
    }
    // SAFETY: needs_store_barrier rejected the unset reference
    unsafe { container.header() }.try_set_remembered()
}
