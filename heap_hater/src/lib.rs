//! A small library for ~~hating on~~ exercising heap allocators.
//!
//! An [`Evaluator`] drives a [`Subject`] through a workload of the four
//! classic heap operations, painting every block with an id pattern and
//! verifying the pattern before the block is freed or resized. A block
//! whose pattern has changed means two allocations overlapped, or a resize
//! lost the preserved prefix.
#![deny(unsafe_op_in_unsafe_fn)]

use arbitrary::Arbitrary;
use core::ptr::NonNull;
use core::slice;

/// Cap on generated request sizes, expressed in bits.
const SIZE_LIMIT_BITS: u8 = 18;

#[derive(arbitrary::Arbitrary)]
enum HeapOpTag {
    Alloc,
    AllocZeroed,
    Free,
    Resize,
}

/// One step of a generated workload.
#[derive(Clone, Debug)]
pub enum HeapOp {
    /// Allocate `size` bytes.
    Alloc {
        /// Requested payload size.
        size: usize,
    },
    /// Allocate and zero `count * elem_size` bytes.
    AllocZeroed {
        /// Element count.
        count: usize,
        /// Size of one element.
        elem_size: usize,
    },
    /// Free an outstanding allocation.
    ///
    /// Given `n` outstanding allocations, the one freed is at `index % n`.
    Free {
        /// Selector into the outstanding allocations.
        index: usize,
    },
    /// Resize an outstanding allocation, selected as for [`HeapOp::Free`].
    Resize {
        /// Selector into the outstanding allocations.
        index: usize,
        /// Requested new payload size.
        new_size: usize,
    },
}

fn arb_size(u: &mut arbitrary::Unstructured<'_>) -> arbitrary::Result<usize> {
    // Pick a random bit width first so sizes spread across the whole range
    // instead of clustering at the cap.
    let shift = u8::arbitrary(u)? % (SIZE_LIMIT_BITS + 1);
    Ok(usize::arbitrary(u)? % (1usize << shift).max(2))
}

impl arbitrary::Arbitrary<'_> for HeapOp {
    fn arbitrary(u: &mut arbitrary::Unstructured<'_>) -> arbitrary::Result<Self> {
        let op = match HeapOpTag::arbitrary(u)? {
            HeapOpTag::Alloc => HeapOp::Alloc { size: arb_size(u)? },
            HeapOpTag::AllocZeroed => HeapOp::AllocZeroed {
                count: usize::arbitrary(u)? % 64,
                elem_size: usize::arbitrary(u)? % 8192,
            },
            HeapOpTag::Free => HeapOp::Free {
                index: usize::arbitrary(u)?,
            },
            HeapOpTag::Resize => HeapOp::Resize {
                index: usize::arbitrary(u)?,
                new_size: arb_size(u)?,
            },
        };

        Ok(op)
    }
}

/// A heap under evaluation.
pub trait Subject {
    /// Allocates `size` bytes.
    fn allocate(&mut self, size: usize) -> Option<NonNull<u8>>;

    /// Allocates `count * elem_size` zero-filled bytes.
    fn allocate_zeroed(&mut self, count: usize, elem_size: usize) -> Option<NonNull<u8>>;

    /// Frees the block at `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a block currently allocated by this subject.
    unsafe fn free(&mut self, ptr: NonNull<u8>);

    /// Resizes the block at `ptr` to `new_size` bytes, preserving contents
    /// up to the smaller of the two sizes.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a block currently allocated by this subject. On
    /// success the old pointer is invalid unless it is the one returned;
    /// on failure the old block must be untouched.
    unsafe fn resize(&mut self, ptr: NonNull<u8>, new_size: usize) -> Option<NonNull<u8>>;
}

struct Block {
    ptr: NonNull<u8>,
    len: usize,
    // The unique id of the operation that last painted this block.
    id: u64,
}

unsafe fn paint(ptr: NonNull<u8>, len: usize, id: u64) {
    let bytes = id.to_le_bytes();
    let buf = unsafe { slice::from_raw_parts_mut(ptr.as_ptr(), len) };
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte = bytes[i % bytes.len()];
    }
}

unsafe fn verify(ptr: NonNull<u8>, len: usize, id: u64) -> bool {
    let bytes = id.to_le_bytes();
    let buf = unsafe { slice::from_raw_parts(ptr.as_ptr(), len) };
    buf.iter()
        .enumerate()
        .all(|(i, byte)| *byte == bytes[i % bytes.len()])
}

/// A failed evaluation: the operations that completed, and the one that
/// surfaced the corruption.
#[derive(Clone, Debug)]
pub struct Failed {
    /// Every operation applied before the failure.
    pub completed: Vec<HeapOp>,
    /// The operation whose verification failed.
    pub failed_op: HeapOp,
}

/// Drives a [`Subject`] through a workload.
pub struct Evaluator<S: Subject> {
    subject: S,
}

impl<S: Subject> Evaluator<S> {
    /// Wraps `subject` for evaluation.
    pub fn new(subject: S) -> Evaluator<S> {
        Evaluator { subject }
    }

    /// Hands the subject back, for end-state assertions.
    pub fn into_inner(self) -> S {
        self.subject
    }

    /// Applies `ops` in order, verifying payload integrity throughout, and
    /// frees whatever is still outstanding at the end.
    pub fn evaluate(&mut self, ops: impl IntoIterator<Item = HeapOp>) -> Result<(), Failed> {
        let mut completed = Vec::new();
        let mut blocks: Vec<Block> = Vec::new();

        for (op_id, op) in ops.into_iter().enumerate() {
            let id: u64 = op_id.try_into().unwrap();
            match op.clone() {
                HeapOp::Alloc { size } => {
                    if let Some(ptr) = self.subject.allocate(size) {
                        unsafe { paint(ptr, size, id) };
                        blocks.push(Block { ptr, len: size, id });
                    }
                }

                HeapOp::AllocZeroed { count, elem_size } => {
                    let Some(len) = count.checked_mul(elem_size) else {
                        continue;
                    };
                    if let Some(ptr) = self.subject.allocate_zeroed(count, elem_size) {
                        let buf = unsafe { slice::from_raw_parts(ptr.as_ptr(), len) };
                        if buf.iter().any(|&byte| byte != 0) {
                            return Err(Failed {
                                completed,
                                failed_op: op,
                            });
                        }
                        unsafe { paint(ptr, len, id) };
                        blocks.push(Block { ptr, len, id });
                    }
                }

                HeapOp::Free { index } => {
                    if blocks.is_empty() {
                        continue;
                    }
                    let block = blocks.swap_remove(index % blocks.len());
                    if !unsafe { verify(block.ptr, block.len, block.id) } {
                        return Err(Failed {
                            completed,
                            failed_op: op,
                        });
                    }
                    unsafe { self.subject.free(block.ptr) };
                }

                HeapOp::Resize { index, new_size } => {
                    if blocks.is_empty() {
                        continue;
                    }
                    let slot = index % blocks.len();
                    let block = &mut blocks[slot];
                    match unsafe { self.subject.resize(block.ptr, new_size) } {
                        Some(ptr) => {
                            if !unsafe { verify(ptr, block.len.min(new_size), block.id) } {
                                return Err(Failed {
                                    completed,
                                    failed_op: op,
                                });
                            }
                            block.ptr = ptr;
                            block.len = new_size;
                            unsafe { paint(ptr, new_size, block.id) };
                        }
                        None => {
                            if !unsafe { verify(block.ptr, block.len, block.id) } {
                                return Err(Failed {
                                    completed,
                                    failed_op: op,
                                });
                            }
                        }
                    }
                }
            }

            completed.push(op);
        }

        for block in blocks {
            unsafe { self.subject.free(block.ptr) };
        }

        Ok(())
    }
}
