//! The buddy allocator core.

use core::fmt;
use core::ptr::{self, NonNull};
use std::alloc::Layout;

use crate::base::BasePtr;
use crate::header::{self, BlockHeader};
use crate::large;
use crate::list::BlockList;
use crate::stats::HeapStats;
use crate::{
    fit_order, order_of, sys, BackingMemory, Brk, Global, HeapInitError, BLOCK_COUNT, HEADER_SIZE,
    MAX_BLOCK_SIZE, MAX_ORDER, MAX_REQUEST, ORDER_COUNT, REGION_SIZE,
};

/// Layout of the buddy region, for backings that go through `std::alloc`.
pub(crate) fn region_layout() -> Layout {
    Layout::from_size_align(REGION_SIZE, MAX_BLOCK_SIZE).unwrap()
}

/// A buddy heap over a fixed 4 MiB region, with a page-mapping escape hatch
/// for oversized requests.
///
/// The region is partitioned into power-of-two blocks from 128 bytes up to
/// 128 KiB, tracked by one address-sorted free list per order. Allocation
/// takes the smallest fitting block and splits it down; free merges a block
/// with its buddy as far as the neighbors allow. Requests too large for the
/// region get a dedicated anonymous mapping instead.
///
/// The default backing is [`Brk`]; tests and embedders can use
/// [`Heap::try_new`] for a region from the global allocator that is
/// returned on drop.
pub struct Heap<B: BackingMemory = Brk> {
    pub(crate) base: BasePtr,
    pub(crate) free_lists: [BlockList; ORDER_COUNT],
    pub(crate) used: BlockList,
    pub(crate) mapped: BlockList,
    pub(crate) cookie: u32,
    pub(crate) stats: HeapStats,
    backing: B,
}

impl Heap<Brk> {
    /// Reserves the buddy region by extending the program break.
    ///
    /// The reservation happens once and is never returned; the region lives
    /// until the process exits. Nothing else in the process may move the
    /// break afterwards.
    pub fn try_new_brk() -> Result<Heap<Brk>, HeapInitError> {
        let region = sys::extend_break(REGION_SIZE).ok_or(HeapInitError::ReservationFailed)?;

        // SAFETY: the fresh break range is ours alone and spans REGION_SIZE.
        Ok(unsafe { Heap::from_region(region, Brk) })
    }
}

impl Heap<Global> {
    /// Builds a heap whose buddy region comes from the global allocator.
    ///
    /// Dropping the heap returns the region. Mostly useful for tests and
    /// embedding; the process-wide default instance uses the program break.
    pub fn try_new() -> Result<Heap<Global>, HeapInitError> {
        let region = NonNull::new(unsafe { std::alloc::alloc(region_layout()) })
            .ok_or(HeapInitError::ReservationFailed)?;

        // SAFETY: a fresh allocation of region_layout() spans REGION_SIZE.
        Ok(unsafe { Heap::from_region(region, Global) })
    }
}

impl<B: BackingMemory> Heap<B> {
    /// Carves `region` into maximal-order blocks and links them into the
    /// top free list.
    ///
    /// # Safety
    ///
    /// `region` must be valid for reads and writes for [`REGION_SIZE`]
    /// bytes and used by nothing else for the heap's lifetime.
    unsafe fn from_region(region: NonNull<u8>, backing: B) -> Heap<B> {
        let cookie = header::fresh_cookie();
        let base = BasePtr::new(region, REGION_SIZE);

        // Descending construction makes every insert a head insert, so the
        // list comes out address-sorted without any walking.
        let mut top = BlockList::new();
        for index in (0..BLOCK_COUNT).rev() {
            let at = base
                .with_offset(index * MAX_BLOCK_SIZE)
                .expect("maximal block outside the region");
            let block = unsafe { BlockHeader::emplace(at, MAX_BLOCK_SIZE, true, false, cookie) };
            unsafe { top.insert(block, cookie) };
        }

        const EMPTY: BlockList = BlockList::new();
        let mut free_lists = [EMPTY; ORDER_COUNT];
        free_lists[MAX_ORDER] = top;

        let payload = MAX_BLOCK_SIZE - HEADER_SIZE;
        let stats = HeapStats {
            free_blocks: BLOCK_COUNT,
            free_bytes: BLOCK_COUNT * payload,
            allocated_blocks: BLOCK_COUNT,
            allocated_bytes: BLOCK_COUNT * payload,
        };

        log::debug!(
            "buddy region reserved: {BLOCK_COUNT} blocks of {MAX_BLOCK_SIZE} bytes at {region:p}"
        );

        Heap {
            base,
            free_lists,
            used: BlockList::new(),
            mapped: BlockList::new(),
            cookie,
            stats,
            backing,
        }
    }

    /// Allocates at least `size` bytes and returns the payload pointer.
    ///
    /// Returns `None` when `size` is zero, exceeds
    /// [`MAX_REQUEST`](crate::MAX_REQUEST), or no block can be obtained;
    /// the heap is unchanged in every failure case.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 || size > MAX_REQUEST {
            return None;
        }

        let total = size + HEADER_SIZE;
        if total > MAX_BLOCK_SIZE {
            return self.map_block(total, large::huge_eligible_alloc(size));
        }

        let (block, order) = self.smallest_fit(total)?;
        self.reserve(block, order, size);

        // SAFETY: the block spans at least HEADER_SIZE + size bytes.
        Some(unsafe { header::payload_of(block) })
    }

    /// Allocates `count * elem_size` bytes and zero-fills them.
    ///
    /// The product is computed with checked arithmetic; overflow fails the
    /// request. The huge-page hint follows the element size here, not the
    /// product: an element strictly larger than
    /// [`ZEROED_HUGE_THRESHOLD`](crate::ZEROED_HUGE_THRESHOLD) qualifies
    /// regardless of the count.
    pub fn allocate_zeroed(&mut self, count: usize, elem_size: usize) -> Option<NonNull<u8>> {
        let size = count.checked_mul(elem_size)?;
        if size == 0 || size > MAX_REQUEST {
            return None;
        }

        let total = size + HEADER_SIZE;
        let payload = if total > MAX_BLOCK_SIZE {
            self.map_block(total, large::huge_eligible_zeroed(elem_size))?
        } else {
            let (block, order) = self.smallest_fit(total)?;
            self.reserve(block, order, size);
            unsafe { header::payload_of(block) }
        };

        // SAFETY: the payload spans at least `size` writable bytes.
        unsafe { ptr::write_bytes(payload.as_ptr(), 0, size) };

        Some(payload)
    }

    /// Returns `ptr`'s block to the heap.
    ///
    /// A null pointer and a block that is already free are silent no-ops.
    /// Buddy blocks coalesce with their free neighbors as far as possible;
    /// page-mapped blocks are handed back to the operating system.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a payload pointer previously returned by this
    /// heap whose block has not been recycled into another allocation.
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        let Some(payload) = NonNull::new(ptr) else {
            return;
        };

        let block = unsafe { header::from_payload(payload) };
        let header = unsafe { block.as_ref() };
        if header.is_free(self.cookie) {
            return;
        }

        if header.size(self.cookie) > MAX_BLOCK_SIZE {
            unsafe { self.unmap_block(block) };
            return;
        }

        unsafe { self.release(block, None) };
    }

    /// Resizes the allocation at `ptr` to at least `new_size` payload
    /// bytes, preserving the old contents up to the smaller of the two
    /// sizes.
    ///
    /// A null `ptr` delegates to [`Heap::allocate`]. A buddy block whose
    /// capacity already covers the request is returned as-is, and growth is
    /// attempted in place by absorbing forward buddies before falling back
    /// to allocate-copy-free. A page-mapped block is returned as-is only on
    /// an exact payload-size match. On failure the old block is untouched
    /// and `None` is returned.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live payload pointer from this heap. When
    /// the call succeeds the old pointer is invalidated unless it is the
    /// one returned.
    pub unsafe fn resize(&mut self, ptr: *mut u8, new_size: usize) -> Option<NonNull<u8>> {
        let Some(old) = NonNull::new(ptr) else {
            return self.allocate(new_size);
        };

        let block = unsafe { header::from_payload(old) };
        let old_payload = unsafe { block.as_ref() }.payload_size(self.cookie);
        let mapped = unsafe { block.as_ref() }.size(self.cookie) > MAX_BLOCK_SIZE;

        if mapped {
            if new_size == old_payload {
                return Some(old);
            }
        } else {
            if new_size <= old_payload {
                return Some(old);
            }
            if new_size + HEADER_SIZE <= self.max_mergeable(block) {
                return Some(unsafe { self.grow_in_place(block, old_payload, new_size) });
            }
        }

        // Allocate-copy-free. The old block is untouched when no new block
        // can be obtained.
        let new = self.allocate(new_size)?;
        unsafe {
            ptr::copy_nonoverlapping(old.as_ptr(), new.as_ptr(), old_payload.min(new_size));
            self.free(old.as_ptr());
        }
        Some(new)
    }

    /// Snapshot of the O(1) counters.
    pub fn stats(&self) -> HeapStats {
        self.stats
    }

    /// Smallest-fit search: the head of the lowest-order free list whose
    /// blocks can hold `total` bytes.
    fn smallest_fit(&self, total: usize) -> Option<(NonNull<BlockHeader>, usize)> {
        let start = fit_order(total);
        (start..ORDER_COUNT).find_map(|order| self.free_lists[order].head().map(|b| (b, order)))
    }

    /// Takes `block` (free, in `free_lists[order]`) into use for a
    /// `requested`-byte allocation, splitting while the half still fits.
    fn reserve(&mut self, mut block: NonNull<BlockHeader>, order: usize, requested: usize) {
        let cookie = self.cookie;
        let mut order = order;
        let mut size = unsafe { block.as_ref() }.size(cookie);

        unsafe { self.free_lists[order].remove(block, cookie) };
        self.stats.free_blocks -= 1;
        self.stats.free_bytes -= size - HEADER_SIZE;

        while order > 0 && requested + HEADER_SIZE <= size / 2 {
            let buddy = unsafe { self.split(block) };
            size /= 2;
            order -= 1;

            unsafe { self.free_lists[order].insert(buddy, cookie) };

            // The new buddy is one more block, and its header eats into
            // what used to be payload.
            self.stats.allocated_blocks += 1;
            self.stats.free_blocks += 1;
            self.stats.free_bytes += size - HEADER_SIZE;
            self.stats.allocated_bytes -= HEADER_SIZE;
        }

        unsafe {
            block.as_mut().set_free(cookie, false);
            self.used.insert(block, cookie);
        }
    }

    /// Halves `block` and emplaces the upper half as a fresh free header.
    unsafe fn split(&self, mut block: NonNull<BlockHeader>) -> NonNull<BlockHeader> {
        let half = unsafe { block.as_mut() }.halve(self.cookie);
        let at = self
            .base
            .with_offset(self.base.offset_of(block) + half)
            .expect("split midpoint outside the region");

        unsafe { BlockHeader::emplace(at, half, true, false, self.cookie) }
    }

    /// Moves a used buddy block onto its free list and merges upward.
    ///
    /// With a `target` payload size the merge loop stops at the first size
    /// that satisfies it (the in-place-grow path); without one it merges as
    /// far as the buddies allow. Returns the final block, which is free.
    ///
    /// # Safety
    ///
    /// `block` must be a live, used, buddy-region block in the used list.
    unsafe fn release(
        &mut self,
        block: NonNull<BlockHeader>,
        target: Option<usize>,
    ) -> NonNull<BlockHeader> {
        let cookie = self.cookie;
        let mut block = block;
        let mut size = unsafe { block.as_ref() }.size(cookie);
        let order = order_of(size).expect("used block with a non-buddy size");

        unsafe {
            self.used.remove(block, cookie);
            block.as_mut().set_free(cookie, true);
            self.free_lists[order].insert(block, cookie);
        }
        self.stats.free_blocks += 1;
        self.stats.free_bytes += size - HEADER_SIZE;

        loop {
            if let Some(target) = target {
                if target <= size - HEADER_SIZE {
                    break;
                }
            }
            let Some(buddy) = self.mergeable_buddy(block, size) else {
                break;
            };
            block = unsafe { self.merge_step(block, buddy, size) };
            size *= 2;
        }

        block
    }

    /// Merges `block` with its free, equal-size `buddy`; the lower address
    /// absorbs the upper and moves one order up.
    ///
    /// # Safety
    ///
    /// Both blocks must be free, `size` bytes, in `free_lists[order]`, and
    /// buddies of each other.
    unsafe fn merge_step(
        &mut self,
        block: NonNull<BlockHeader>,
        buddy: NonNull<BlockHeader>,
        size: usize,
    ) -> NonNull<BlockHeader> {
        let cookie = self.cookie;
        let order = order_of(size).expect("merging a non-buddy size");
        let (mut low, high) = if block.addr() < buddy.addr() {
            (block, buddy)
        } else {
            (buddy, block)
        };

        unsafe {
            self.free_lists[order].remove(low, cookie);
            self.free_lists[order].remove(high, cookie);
            low.as_mut().absorb(cookie, size);
            self.free_lists[order + 1].insert(low, cookie);
        }

        // Two blocks became one; the absorbed header returns to payload.
        self.stats.free_blocks -= 1;
        self.stats.allocated_blocks -= 1;
        self.stats.free_bytes += HEADER_SIZE;
        self.stats.allocated_bytes += HEADER_SIZE;

        low
    }

    /// The buddy of `block`, when it exists, is free, and spans exactly
    /// `size` bytes.
    ///
    /// Maximal-order blocks have no buddy. The buddy address always holds
    /// some live header (splitting creates the sibling header before either
    /// half is handed out), so reading it is sound; its cookie is checked
    /// like any other access.
    pub(crate) fn mergeable_buddy(
        &self,
        block: NonNull<BlockHeader>,
        size: usize,
    ) -> Option<NonNull<BlockHeader>> {
        if size >= MAX_BLOCK_SIZE {
            return None;
        }

        let offset = self.base.offset_of(block);
        if offset % size != 0 {
            return None;
        }

        let buddy = self.base.with_offset(offset ^ size)?.cast::<BlockHeader>();
        let header = unsafe { buddy.as_ref() };
        (header.is_free(self.cookie) && header.size(self.cookie) == size).then_some(buddy)
    }

    /// Largest contiguous size reachable from `block` by repeated buddy
    /// absorption. Probes only; nothing is modified.
    fn max_mergeable(&self, block: NonNull<BlockHeader>) -> usize {
        let mut low = block;
        let mut size = unsafe { block.as_ref() }.size(self.cookie);

        while size < MAX_BLOCK_SIZE {
            let Some(buddy) = self.mergeable_buddy(low, size) else {
                break;
            };
            if buddy.addr() < low.addr() {
                low = buddy;
            }
            size *= 2;
        }

        size
    }

    /// Grows `block` in place by absorbing forward buddies until
    /// `new_size` fits, then moves the payload down if the block start
    /// changed.
    ///
    /// # Safety
    ///
    /// `block` must be a live, used buddy block, and
    /// [`Heap::max_mergeable`] must have cleared `new_size + HEADER_SIZE`.
    unsafe fn grow_in_place(
        &mut self,
        block: NonNull<BlockHeader>,
        old_payload: usize,
        new_size: usize,
    ) -> NonNull<u8> {
        let old = unsafe { header::payload_of(block) };

        let merged = unsafe { self.release(block, Some(new_size)) };
        let size = unsafe { merged.as_ref() }.size(self.cookie);
        let order = order_of(size).expect("merged block with a non-buddy size");
        self.reserve(merged, order, new_size);

        let new = unsafe { header::payload_of(merged) };
        if new != old {
            // A leftward merge moves the payload down; the ranges may
            // overlap, and ptr::copy tolerates that.
            unsafe { ptr::copy(old.as_ptr(), new.as_ptr(), old_payload.min(new_size)) };
        }

        new
    }
}

impl<B: BackingMemory> Drop for Heap<B> {
    fn drop(&mut self) {
        // Outstanding mappings are still owned here; hand them back before
        // the region itself.
        while let Some(block) = self.mapped.head() {
            unsafe { self.unmap_block(block) };
        }

        unsafe { self.backing.release(self.base.ptr()) };
    }
}

impl<B: BackingMemory> fmt::Debug for Heap<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("base", &self.base.ptr())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}
