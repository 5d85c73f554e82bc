//! Thin wrappers over the host's virtual-memory primitives.

use core::ptr::{self, NonNull};
use std::io;

use libc::{c_void, intptr_t, MAP_ANONYMOUS, MAP_FAILED, MAP_HUGETLB, MAP_PRIVATE, PROT_READ, PROT_WRITE};

/// Extends the program break by `len` bytes and returns the start of the
/// fresh range.
///
/// The heap calls this exactly once, at reservation time. The memory is
/// never returned; if anything else in the process moves the break
/// afterwards, all bets are off.
pub(crate) fn extend_break(len: usize) -> Option<NonNull<u8>> {
    // sbrk reports failure as (void*)-1.
    let prev = unsafe { libc::sbrk(len as intptr_t) };
    if prev == usize::MAX as *mut c_void {
        log::debug!("sbrk({len}) failed: {}", io::Error::last_os_error());
        return None;
    }

    NonNull::new(prev.cast::<u8>())
}

/// Obtains an anonymous, private, read-write mapping of `len` bytes,
/// carrying the kernel's huge-page hint when `huge` is set.
pub(crate) fn map_anonymous(len: usize, huge: bool) -> Option<NonNull<u8>> {
    let mut flags = MAP_PRIVATE | MAP_ANONYMOUS;
    if huge {
        flags |= MAP_HUGETLB;
    }

    let addr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            PROT_READ | PROT_WRITE,
            flags,
            -1,
            0,
        )
    };
    if addr == MAP_FAILED {
        log::debug!(
            "mmap({len} bytes, huge: {huge}) failed: {}",
            io::Error::last_os_error()
        );
        return None;
    }

    NonNull::new(addr.cast::<u8>())
}

/// Releases a mapping obtained from [`map_anonymous`].
///
/// Failure is logged and otherwise swallowed; the caller's accounting
/// proceeds regardless.
///
/// # Safety
///
/// `ptr` must be the start of a live mapping at least `len` bytes long,
/// with nothing else referencing it.
pub(crate) unsafe fn unmap(ptr: NonNull<u8>, len: usize) {
    if unsafe { libc::munmap(ptr.as_ptr().cast::<c_void>(), len) } != 0 {
        log::debug!(
            "munmap({:p}, {len}) failed: {}",
            ptr,
            io::Error::last_os_error()
        );
    }
}
