//! Inline block metadata.
//!
//! A [`BlockHeader`] sits immediately before every payload the heap hands
//! out, whether the block lives in the buddy region or in its own page
//! mapping. Every field access goes through an accessor that first compares
//! the stored cookie with the heap's; a mismatch means something wrote past
//! the end of the previous block, and the process is terminated on the spot
//! rather than allocating out of corrupt metadata.

use core::mem;
use core::ptr::NonNull;
use std::process;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::{rngs::SmallRng, Rng, SeedableRng};

use crate::{HEADER_SIZE, HUGE_PAGE_SIZE};

/// Exit status used when a header fails its cookie check.
pub(crate) const CORRUPTION_EXIT_STATUS: i32 = 0xDEAD_BEEF_u32 as i32;

/// Inline metadata prefixing every block the heap manages.
///
/// `size` counts the whole block, header included: a power of two between
/// [`MIN_BLOCK_SIZE`](crate::MIN_BLOCK_SIZE) and
/// [`MAX_BLOCK_SIZE`](crate::MAX_BLOCK_SIZE) for buddy blocks, request plus
/// header for page-mapped ones. The links tie the block into whichever list
/// currently owns it.
#[repr(C)]
pub(crate) struct BlockHeader {
    cookie: u32,
    free: bool,
    huge: bool,
    size: usize,
    prev: Option<NonNull<BlockHeader>>,
    next: Option<NonNull<BlockHeader>>,
}

impl BlockHeader {
    /// Writes a fresh, unlinked header at `at`.
    ///
    /// # Safety
    ///
    /// `at` must be aligned for `BlockHeader` and valid for writes of
    /// [`HEADER_SIZE`] bytes.
    pub(crate) unsafe fn emplace(
        at: NonNull<u8>,
        size: usize,
        free: bool,
        huge: bool,
        cookie: u32,
    ) -> NonNull<BlockHeader> {
        debug_assert_eq!(at.as_ptr().align_offset(mem::align_of::<BlockHeader>()), 0);

        let header = at.cast::<BlockHeader>();
        unsafe {
            header.as_ptr().write(BlockHeader {
                cookie,
                free,
                huge,
                size,
                prev: None,
                next: None,
            });
        }

        header
    }

    #[inline]
    fn check(&self, cookie: u32) {
        if self.cookie != cookie {
            integrity_failure();
        }
    }

    /// Total block size in bytes, header included.
    pub(crate) fn size(&self, cookie: u32) -> usize {
        self.check(cookie);
        self.size
    }

    /// Payload capacity in bytes.
    pub(crate) fn payload_size(&self, cookie: u32) -> usize {
        self.size(cookie) - HEADER_SIZE
    }

    pub(crate) fn is_free(&self, cookie: u32) -> bool {
        self.check(cookie);
        self.free
    }

    pub(crate) fn set_free(&mut self, cookie: u32, free: bool) {
        self.check(cookie);
        self.free = free;
    }

    pub(crate) fn next(&self, cookie: u32) -> Option<NonNull<BlockHeader>> {
        self.check(cookie);
        self.next
    }

    pub(crate) fn set_next(&mut self, cookie: u32, next: Option<NonNull<BlockHeader>>) {
        self.check(cookie);
        self.next = next;
    }

    pub(crate) fn prev(&self, cookie: u32) -> Option<NonNull<BlockHeader>> {
        self.check(cookie);
        self.prev
    }

    pub(crate) fn set_prev(&mut self, cookie: u32, prev: Option<NonNull<BlockHeader>>) {
        self.check(cookie);
        self.prev = prev;
    }

    /// Halves the block in place and returns the new size.
    ///
    /// The caller emplaces the upper half's header; this only shrinks the
    /// lower one.
    pub(crate) fn halve(&mut self, cookie: u32) -> usize {
        self.check(cookie);
        self.size /= 2;
        self.size
    }

    /// Grows the block by `bytes`, absorbing a merged buddy.
    pub(crate) fn absorb(&mut self, cookie: u32, bytes: usize) {
        self.check(cookie);
        self.size += bytes;
    }

    /// The length to unmap when the block is released.
    ///
    /// Huge-page mappings must be unmapped in multiples of the huge-page
    /// length even though the block's logical size is smaller.
    pub(crate) fn unmap_len(&self, cookie: u32) -> usize {
        self.check(cookie);
        if !self.huge {
            return self.size;
        }

        self.size.div_ceil(HUGE_PAGE_SIZE) * HUGE_PAGE_SIZE
    }
}

/// Pointer to the first payload byte of `block`.
///
/// # Safety
///
/// `block` must point to a live header prefixing at least one payload byte.
pub(crate) unsafe fn payload_of(block: NonNull<BlockHeader>) -> NonNull<u8> {
    unsafe { NonNull::new_unchecked(block.as_ptr().cast::<u8>().add(HEADER_SIZE)) }
}

/// Recovers the header from a payload pointer handed out earlier.
///
/// # Safety
///
/// `payload` must have been produced by [`payload_of`].
pub(crate) unsafe fn from_payload(payload: NonNull<u8>) -> NonNull<BlockHeader> {
    unsafe { NonNull::new_unchecked(payload.as_ptr().sub(HEADER_SIZE)).cast::<BlockHeader>() }
}

/// Generates the heap's cookie. Called exactly once per heap.
pub(crate) fn fresh_cookie() -> u32 {
    let seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as u64)
        .unwrap_or_default();

    SmallRng::seed_from_u64(seed).gen()
}

#[cold]
#[inline(never)]
fn integrity_failure() -> ! {
    log::error!("block header failed its cookie check; heap memory is corrupt");
    process::exit(CORRUPTION_EXIT_STATUS)
}
