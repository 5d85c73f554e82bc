//! A user-space buddy heap over the program break.
//!
//! `crumb_alloc` services the classic four-operation interface (allocate,
//! zero-allocate, free, resize) from a 4 MiB buddy-managed region reserved
//! by extending the program break once, with oversized requests routed to
//! dedicated anonymous page mappings (huge-page hinted where the request
//! qualifies).
//!
//! Every block, buddy-managed or page-mapped, is prefixed by an inline
//! header carrying a process-wide random cookie. Any access to a header
//! whose cookie does not match terminates the process: a mismatch means a
//! user write ran off the end of its allocation and the heap metadata can
//! no longer be trusted.
//!
//! The allocator is strictly single-threaded. There are no locks and no
//! atomics anywhere; the module-level entry points in [`global`] are
//! `unsafe fn`s whose contract is that no two calls into the default heap
//! are ever in flight at once. Code that wants its own heap (tests do) can
//! construct a [`Heap`] handle instead and rely on `&mut self`.
//!
//! ```no_run
//! let mut heap = crumb_alloc::Heap::try_new().unwrap();
//!
//! let p = heap.allocate(100).unwrap();
//! let p = unsafe { heap.resize(p.as_ptr(), 200) }.unwrap();
//! unsafe { heap.free(p.as_ptr()) };
//!
//! assert_eq!(heap.stats(), heap.recount());
//! ```

#![warn(missing_debug_implementations)]
#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]

mod base;
mod buddy;
pub mod global;
mod header;
mod large;
mod list;
mod stats;
mod sys;

#[cfg(test)]
mod tests;

use core::ptr::NonNull;

#[doc(inline)]
pub use crate::{buddy::Heap, stats::HeapStats};

/// Size in bytes of an order-0 block, the minimum split granularity.
pub const MIN_BLOCK_SIZE: usize = 128;

/// Number of buddy orders.
pub const ORDER_COUNT: usize = 11;

/// The largest order.
pub const MAX_ORDER: usize = ORDER_COUNT - 1;

/// Size in bytes of a maximal-order block.
pub const MAX_BLOCK_SIZE: usize = MIN_BLOCK_SIZE << MAX_ORDER;

/// Number of maximal-order blocks reserved at initialization.
pub const BLOCK_COUNT: usize = 32;

/// Total size of the buddy region. Never changes after reservation.
pub const REGION_SIZE: usize = BLOCK_COUNT * MAX_BLOCK_SIZE;

/// Hard upper bound on a single user request, in bytes.
pub const MAX_REQUEST: usize = 100_000_000;

/// The kernel's huge-page length.
pub const HUGE_PAGE_SIZE: usize = 2 * 1024 * 1024;

/// A plain allocation of at least this many user bytes asks for huge pages.
pub const ALLOC_HUGE_THRESHOLD: usize = 4 * 1024 * 1024;

/// A zero-allocate whose *element* size strictly exceeds this asks for huge
/// pages, regardless of the element count.
pub const ZEROED_HUGE_THRESHOLD: usize = 2 * 1024 * 1024;

/// Size in bytes of the inline header prefixing every block.
pub const HEADER_SIZE: usize = core::mem::size_of::<header::BlockHeader>();

/// Size in bytes of an order-`order` block.
pub(crate) fn order_size(order: usize) -> usize {
    MIN_BLOCK_SIZE << order
}

/// The order whose blocks are exactly `size` bytes, if there is one.
pub(crate) fn order_of(size: usize) -> Option<usize> {
    if size < MIN_BLOCK_SIZE || size > MAX_BLOCK_SIZE || !size.is_power_of_two() {
        return None;
    }

    Some((size / MIN_BLOCK_SIZE).trailing_zeros() as usize)
}

/// The smallest order whose blocks can hold `total` bytes.
///
/// `total` must not exceed [`MAX_BLOCK_SIZE`].
pub(crate) fn fit_order(total: usize) -> usize {
    (0..ORDER_COUNT)
        .find(|&order| order_size(order) >= total)
        .expect("request larger than the largest order")
}

/// The error type for heap constructors.
#[derive(Clone, Debug)]
pub enum HeapInitError {
    /// The host refused to provide the buddy region.
    ///
    /// For a [`Brk`]-backed heap this means the program break could not be
    /// extended; for a [`Global`]-backed heap, that the global allocator
    /// returned null.
    ReservationFailed,
}

/// Types which provide the memory backing a heap's buddy region.
///
/// This trait is sealed; the only implementors are the [`Brk`] and
/// [`Global`] marker types.
pub trait BackingMemory: Sealed {
    /// Returns the buddy region to wherever it came from, if anywhere.
    ///
    /// # Safety
    ///
    /// `region` must be the pointer the heap was constructed over, with no
    /// outstanding references or allocations into it.
    unsafe fn release(&self, region: NonNull<u8>);
}

/// A marker type indicating that the buddy region was carved out of the
/// program break.
///
/// Program-break memory is never returned to the operating system; the
/// region lives until the process exits.
#[derive(Clone, Debug)]
pub struct Brk;

impl Sealed for Brk {}
impl BackingMemory for Brk {
    unsafe fn release(&self, _region: NonNull<u8>) {}
}

/// A marker type indicating that the buddy region was obtained from the
/// global allocator.
///
/// The region is handed back when the heap is dropped. This is the backing
/// the test suite uses, since the program break is process-wide.
#[derive(Clone, Debug)]
pub struct Global;

impl Sealed for Global {}
impl BackingMemory for Global {
    unsafe fn release(&self, region: NonNull<u8>) {
        unsafe { std::alloc::dealloc(region.as_ptr(), buddy::region_layout()) };
    }
}

#[doc(hidden)]
mod private {
    pub trait Sealed {}
}
use private::Sealed;
