//! The large-allocation path.
//!
//! Requests that cannot fit a maximal-order block bypass the buddy region
//! entirely: each gets its own anonymous mapping with a header at the
//! front, linked into the mapped list. No splitting or merging applies;
//! free hands the whole mapping back.

use core::ptr::NonNull;

use crate::header::{self, BlockHeader};
use crate::{sys, BackingMemory, Heap, ALLOC_HUGE_THRESHOLD, HEADER_SIZE, ZEROED_HUGE_THRESHOLD};

/// Whether a plain allocation of `size` user bytes asks for huge pages.
pub(crate) fn huge_eligible_alloc(size: usize) -> bool {
    size >= ALLOC_HUGE_THRESHOLD
}

/// Whether a zero-allocate asks for huge pages.
///
/// The rule keys on the element size alone, strictly above the threshold;
/// the element count plays no part.
pub(crate) fn huge_eligible_zeroed(elem_size: usize) -> bool {
    elem_size > ZEROED_HUGE_THRESHOLD
}

/// Obtains the backing mapping, degrading from the huge-page hint to a
/// plain mapping when the kernel has no pool to honor it.
fn map_region(total: usize, huge_eligible: bool) -> Option<(NonNull<u8>, bool)> {
    if huge_eligible {
        if let Some(region) = sys::map_anonymous(total, true) {
            return Some((region, true));
        }
        log::debug!("huge-page mapping of {total} bytes refused; retrying without the hint");
    }

    sys::map_anonymous(total, false).map(|region| (region, false))
}

impl<B: BackingMemory> Heap<B> {
    /// Services an oversized request with a dedicated anonymous mapping of
    /// `total` bytes (header included). Returns the payload pointer.
    ///
    /// The header's huge flag records whether the mapping really carries
    /// huge pages, since that governs the unmap length on free.
    pub(crate) fn map_block(&mut self, total: usize, huge_eligible: bool) -> Option<NonNull<u8>> {
        let (region, huge) = map_region(total, huge_eligible)?;

        // SAFETY: a fresh page-aligned mapping of `total` > HEADER_SIZE bytes.
        let block = unsafe { BlockHeader::emplace(region, total, false, huge, self.cookie) };
        unsafe { self.mapped.insert(block, self.cookie) };

        self.stats.allocated_blocks += 1;
        self.stats.allocated_bytes += total - HEADER_SIZE;

        Some(unsafe { header::payload_of(block) })
    }

    /// Unlinks a page-mapped block and releases its mapping.
    ///
    /// The counters use the stored size; the huge-page rounding applies to
    /// the `munmap` length only. A refused unmap is logged and swallowed,
    /// and the accounting proceeds regardless.
    ///
    /// # Safety
    ///
    /// `block` must be a live element of the mapped list. The mapping is
    /// gone when this returns.
    pub(crate) unsafe fn unmap_block(&mut self, block: NonNull<BlockHeader>) {
        let cookie = self.cookie;
        let total = unsafe { block.as_ref() }.size(cookie);
        let len = unsafe { block.as_ref() }.unmap_len(cookie);

        unsafe { self.mapped.remove(block, cookie) };
        self.stats.allocated_blocks -= 1;
        self.stats.allocated_bytes -= total - HEADER_SIZE;

        unsafe { sys::unmap(block.cast::<u8>(), len) };
    }
}
