//! The process-wide default heap and its entry points.
//!
//! The four operations here mirror the `std::alloc` names and run against a
//! hidden [`Heap`] backed by the program break, initialized lazily on the
//! first call. All of them are `unsafe fn`s with the same contract: the
//! allocator is strictly single-threaded, so no two calls into this module
//! (including the introspection functions) may be in flight at once.
//!
//! Allocation failures of every kind (zero or oversized requests,
//! exhaustion, a refused reservation) come back as null pointers, never as
//! panics.

use core::ptr::{self, NonNull};
use std::cell::UnsafeCell;

use crate::{Brk, Heap, HeapStats, HEADER_SIZE};

/// The hidden default heap.
///
/// `Sync` is a loan against the crate's single-threaded contract: the
/// `unsafe` entry points require that no other call into this module is in
/// flight, which is exactly what makes the unsynchronized interior access
/// sound.
struct DefaultHeap(UnsafeCell<Option<Heap<Brk>>>);

unsafe impl Sync for DefaultHeap {}

static DEFAULT: DefaultHeap = DefaultHeap(UnsafeCell::new(None));

/// Runs `f` on the default heap, reserving it first if this is the first
/// use. Returns `None` when the reservation fails.
///
/// # Safety
///
/// No other call into this module may be in flight.
unsafe fn with_default<T>(f: impl FnOnce(&mut Heap<Brk>) -> T) -> Option<T> {
    let slot = unsafe { &mut *DEFAULT.0.get() };
    if slot.is_none() {
        // Reservation, PRNG seeding and cookie generation happen exactly
        // once, on the first successful pass through here.
        *slot = Heap::try_new_brk().ok();
    }

    slot.as_mut().map(f)
}

/// Counter snapshot that never forces the reservation.
fn snapshot() -> HeapStats {
    unsafe { (*DEFAULT.0.get()).as_ref() }
        .map(Heap::stats)
        .unwrap_or_default()
}

/// Allocates `size` bytes from the default heap.
///
/// Returns null when `size` is zero, exceeds
/// [`MAX_REQUEST`](crate::MAX_REQUEST), or no block can be obtained.
///
/// # Safety
///
/// No other call into this module may be in flight; the allocator is
/// strictly single-threaded.
pub unsafe fn alloc(size: usize) -> *mut u8 {
    unsafe { with_default(|heap| heap.allocate(size)) }
        .flatten()
        .map_or(ptr::null_mut(), NonNull::as_ptr)
}

/// Allocates `count * elem_size` zero-filled bytes from the default heap.
///
/// Returns null under the same conditions as [`alloc`], and when the
/// product overflows.
///
/// # Safety
///
/// No other call into this module may be in flight.
pub unsafe fn alloc_zeroed(count: usize, elem_size: usize) -> *mut u8 {
    unsafe { with_default(|heap| heap.allocate_zeroed(count, elem_size)) }
        .flatten()
        .map_or(ptr::null_mut(), NonNull::as_ptr)
}

/// Frees an allocation made by this module. Null and already-free pointers
/// are silent no-ops.
///
/// # Safety
///
/// `ptr` must be null or a pointer previously returned by this module
/// whose block has not been recycled into another allocation, and no other
/// call into this module may be in flight.
pub unsafe fn dealloc(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }

    // SAFETY: the caller upholds this module's pointer contract.
    unsafe { with_default(|heap| unsafe { heap.free(ptr) }) };
}

/// Resizes an allocation made by this module, preserving contents up to
/// the smaller of the old and new sizes. A null `ptr` behaves like
/// [`alloc`]. Returns null, leaving the old block intact, when no block
/// for the new size can be obtained.
///
/// # Safety
///
/// `ptr` must be null or a live pointer from this module, and no other
/// call into this module may be in flight. On success the old pointer is
/// invalidated unless it is the one returned.
pub unsafe fn realloc(ptr: *mut u8, new_size: usize) -> *mut u8 {
    // SAFETY: the caller upholds this module's pointer contract.
    unsafe { with_default(|heap| unsafe { heap.resize(ptr, new_size) }) }
        .flatten()
        .map_or(ptr::null_mut(), NonNull::as_ptr)
}

/// Free blocks across the default heap's free lists. Zero before first use.
pub fn free_blocks() -> usize {
    snapshot().free_blocks
}

/// Free payload bytes across the default heap. Zero before first use.
pub fn free_bytes() -> usize {
    snapshot().free_bytes
}

/// Every block the default heap owns, free and used. Zero before first use.
pub fn allocated_blocks() -> usize {
    snapshot().allocated_blocks
}

/// Payload bytes across every block the default heap owns. Zero before
/// first use.
pub fn allocated_bytes() -> usize {
    snapshot().allocated_bytes
}

/// Bytes consumed by block headers.
pub fn meta_data_bytes() -> usize {
    snapshot().meta_bytes()
}

/// Size in bytes of a single block header. Meaningful before first use.
pub fn size_meta_data() -> usize {
    HEADER_SIZE
}
