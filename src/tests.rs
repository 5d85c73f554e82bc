use core::ptr::{self, NonNull};
use core::slice;
use std::process::Command;

use quickcheck::{Arbitrary, Gen, QuickCheck};

use crate::header::CORRUPTION_EXIT_STATUS;
use crate::{
    global, large, order_size, Global, Heap, HeapStats, ALLOC_HUGE_THRESHOLD, BLOCK_COUNT,
    HEADER_SIZE, MAX_BLOCK_SIZE, MAX_ORDER, MAX_REQUEST, ORDER_COUNT, ZEROED_HUGE_THRESHOLD,
};

fn heap() -> Heap<Global> {
    Heap::try_new().unwrap()
}

fn initial_stats() -> HeapStats {
    let payload = MAX_BLOCK_SIZE - HEADER_SIZE;
    HeapStats {
        free_blocks: BLOCK_COUNT,
        free_bytes: BLOCK_COUNT * payload,
        allocated_blocks: BLOCK_COUNT,
        allocated_bytes: BLOCK_COUNT * payload,
    }
}

unsafe fn paint(ptr: NonNull<u8>, len: usize, id: u64) {
    let bytes = id.to_le_bytes();
    let buf = unsafe { slice::from_raw_parts_mut(ptr.as_ptr(), len) };
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte = bytes[i % bytes.len()];
    }
}

unsafe fn holds_pattern(ptr: NonNull<u8>, len: usize, id: u64) -> bool {
    let bytes = id.to_le_bytes();
    let buf = unsafe { slice::from_raw_parts(ptr.as_ptr(), len) };
    buf.iter()
        .enumerate()
        .all(|(i, byte)| *byte == bytes[i % bytes.len()])
}

#[test]
fn fresh_heap_counters() {
    let heap = heap();
    let stats = heap.stats();

    assert_eq!(stats, initial_stats());
    assert_eq!(heap.recount(), stats);
    assert_eq!(stats.used_blocks(), 0);
    assert_eq!(stats.used_bytes(), 0);
    assert_eq!(stats.meta_bytes(), BLOCK_COUNT * HEADER_SIZE);
    assert_eq!(stats.size_meta_data(), HEADER_SIZE);
    assert!(stats.allocated_bytes <= stats.allocated_blocks * MAX_BLOCK_SIZE);
}

#[test]
fn saturating_one_order_then_coalescing_back() {
    let mut heap = heap();
    let payload = order_size(9) - HEADER_SIZE;

    // Each allocation consumes one half of a maximal block; 64 of them
    // exhaust the region.
    let blocks: Vec<NonNull<u8>> = (0..2 * BLOCK_COUNT)
        .map(|_| heap.allocate(payload).unwrap())
        .collect();

    assert!(heap.allocate(40).is_none());

    let stats = heap.stats();
    assert_eq!(stats.allocated_blocks, 2 * BLOCK_COUNT);
    assert_eq!(stats.free_blocks, 0);
    assert_eq!(stats.free_bytes, 0);
    assert_eq!(heap.recount(), stats);

    // Freeing in reverse order coalesces every pair back to the top.
    for ptr in blocks.into_iter().rev() {
        unsafe { heap.free(ptr.as_ptr()) };
    }

    assert_eq!(heap.stats(), initial_stats());
    assert_eq!(heap.recount(), heap.stats());
    for order in 0..MAX_ORDER {
        assert!(
            heap.free_lists[order].head().is_none(),
            "order {order} not empty"
        );
    }

    let tops: Vec<_> = heap.free_lists[MAX_ORDER].iter(heap.cookie).collect();
    assert_eq!(tops.len(), BLOCK_COUNT);
    assert!(tops.windows(2).all(|pair| pair[0].addr() < pair[1].addr()));
}

#[test]
fn free_lists_stay_sorted_and_coalesced() {
    let mut heap = heap();

    let sizes = [100, 5000, 777, 64, 12000, 300, 129, 2048, 96, 40000];
    let blocks: Vec<NonNull<u8>> = sizes.iter().map(|&n| heap.allocate(n).unwrap()).collect();
    for ptr in blocks.iter().skip(1).step_by(2) {
        unsafe { heap.free(ptr.as_ptr()) };
    }

    for order in 0..ORDER_COUNT {
        let elements: Vec<_> = heap.free_lists[order].iter(heap.cookie).collect();
        assert!(elements.windows(2).all(|pair| pair[0].addr() < pair[1].addr()));

        for &block in &elements {
            let header = unsafe { block.as_ref() };
            assert!(header.is_free(heap.cookie));
            assert_eq!(header.size(heap.cookie), order_size(order));
            // Between public calls no free buddy pair may coexist.
            assert!(heap.mergeable_buddy(block, order_size(order)).is_none());
        }
    }

    for ptr in blocks.iter().step_by(2) {
        unsafe { heap.free(ptr.as_ptr()) };
    }
    assert_eq!(heap.stats(), initial_stats());
}

#[test]
fn oversized_requests_are_page_mapped() {
    let mut heap = heap();

    // The exact boundary stays in the buddy region...
    let edge = heap.allocate(MAX_BLOCK_SIZE - HEADER_SIZE).unwrap();
    assert_eq!(heap.stats().allocated_blocks, BLOCK_COUNT);
    assert_eq!(heap.stats().free_blocks, BLOCK_COUNT - 1);
    unsafe { heap.free(edge.as_ptr()) };

    // ...and one header past it gets its own mapping.
    let mapped = heap.allocate(MAX_BLOCK_SIZE).unwrap();
    let stats = heap.stats();
    assert_eq!(stats.allocated_blocks, BLOCK_COUNT + 1);
    assert_eq!(stats.free_blocks, BLOCK_COUNT);
    assert_eq!(stats.free_bytes, initial_stats().free_bytes);
    assert_eq!(heap.recount(), stats);

    unsafe { paint(mapped, MAX_BLOCK_SIZE, 11) };
    assert!(unsafe { holds_pattern(mapped, MAX_BLOCK_SIZE, 11) });

    unsafe { heap.free(mapped.as_ptr()) };
    assert_eq!(heap.stats(), initial_stats());
}

#[test]
fn huge_eligible_allocate_leaves_the_region_untouched() {
    let mut heap = heap();

    let big = heap.allocate(ALLOC_HUGE_THRESHOLD).unwrap();
    let stats = heap.stats();
    assert_eq!(stats.allocated_blocks, BLOCK_COUNT + 1);
    assert_eq!(stats.free_blocks, BLOCK_COUNT);
    assert_eq!(stats.free_bytes, initial_stats().free_bytes);
    assert_eq!(heap.recount(), stats);

    unsafe { heap.free(big.as_ptr()) };
    assert_eq!(heap.stats(), initial_stats());
}

#[test]
fn huge_page_thresholds() {
    assert!(large::huge_eligible_alloc(ALLOC_HUGE_THRESHOLD));
    assert!(large::huge_eligible_alloc(ALLOC_HUGE_THRESHOLD + 1));
    assert!(!large::huge_eligible_alloc(ALLOC_HUGE_THRESHOLD - 1));

    // The zero-allocate rule is strict, and the element count is
    // irrelevant.
    assert!(large::huge_eligible_zeroed(ZEROED_HUGE_THRESHOLD + 1));
    assert!(!large::huge_eligible_zeroed(ZEROED_HUGE_THRESHOLD));
    assert!(!large::huge_eligible_zeroed(ZEROED_HUGE_THRESHOLD - 1));
}

#[test]
fn grow_in_place_keeps_the_pointer() {
    let mut heap = heap();

    // The first allocation splits down to the order-1 block at the region
    // base, so its right buddy is free. Growing past the 224-byte payload
    // has to absorb that buddy.
    let p = heap.allocate(100).unwrap();
    unsafe { paint(p, 100, 3) };

    let q = unsafe { heap.resize(p.as_ptr(), 300) }.unwrap();
    assert_eq!(q, p);
    assert!(unsafe { holds_pattern(q, 100, 3) });
    assert_eq!(heap.recount(), heap.stats());

    unsafe { heap.free(q.as_ptr()) };
    assert_eq!(heap.stats(), initial_stats());
}

#[test]
fn growing_into_a_left_buddy_moves_the_payload() {
    let mut heap = heap();

    let a = heap.allocate(100).unwrap();
    let b = heap.allocate(100).unwrap();
    unsafe { paint(b, 100, 7) };
    unsafe { heap.free(a.as_ptr()) };

    // b's free buddy sits below it; growing past b's own 224-byte payload
    // merges the two, and the payload travels down to the buddy's start.
    let grown = unsafe { heap.resize(b.as_ptr(), 300) }.unwrap();
    assert_eq!(grown, a);
    assert!(unsafe { holds_pattern(grown, 100, 7) });
    assert_eq!(heap.recount(), heap.stats());

    unsafe { heap.free(grown.as_ptr()) };
    assert_eq!(heap.stats(), initial_stats());
}

#[test]
fn resize_falls_back_to_copy_when_buddies_are_used() {
    let mut heap = heap();

    let a = heap.allocate(90).unwrap();
    let b = heap.allocate(90).unwrap();
    unsafe { paint(a, 90, 5) };

    let moved = unsafe { heap.resize(a.as_ptr(), 200) }.unwrap();
    assert_ne!(moved, a);
    assert!(unsafe { holds_pattern(moved, 90, 5) });
    assert_eq!(heap.recount(), heap.stats());

    unsafe {
        heap.free(moved.as_ptr());
        heap.free(b.as_ptr());
    }
    assert_eq!(heap.stats(), initial_stats());
}

#[test]
fn resize_within_capacity_returns_the_same_pointer() {
    let mut heap = heap();

    // 300 + header rounds up to a 512-byte block.
    let p = heap.allocate(300).unwrap();
    let capacity = 512 - HEADER_SIZE;

    assert_eq!(unsafe { heap.resize(p.as_ptr(), 300) }.unwrap(), p);
    assert_eq!(unsafe { heap.resize(p.as_ptr(), capacity) }.unwrap(), p);
    assert_eq!(unsafe { heap.resize(p.as_ptr(), 100) }.unwrap(), p);

    unsafe { heap.free(p.as_ptr()) };
    assert_eq!(heap.stats(), initial_stats());
}

#[test]
fn resizing_a_mapped_block() {
    let mut heap = heap();

    let p = heap.allocate(150_000).unwrap();
    unsafe { paint(p, 150_000, 9) };

    // Exact payload match keeps the mapping.
    assert_eq!(unsafe { heap.resize(p.as_ptr(), 150_000) }.unwrap(), p);

    // Anything else allocates, copies and frees.
    let q = unsafe { heap.resize(p.as_ptr(), 200_000) }.unwrap();
    assert_ne!(q, p);
    assert!(unsafe { holds_pattern(q, 150_000, 9) });
    assert_eq!(heap.stats().allocated_blocks, BLOCK_COUNT + 1);
    assert_eq!(heap.recount(), heap.stats());

    unsafe { heap.free(q.as_ptr()) };
    assert_eq!(heap.stats(), initial_stats());
}

#[test]
fn zero_allocate_zero_fills() {
    let mut heap = heap();

    let p = heap.allocate_zeroed(16, 32).unwrap();
    let buf = unsafe { slice::from_raw_parts(p.as_ptr(), 16 * 32) };
    assert!(buf.iter().all(|&byte| byte == 0));

    unsafe { heap.free(p.as_ptr()) };
    assert_eq!(heap.stats(), initial_stats());
}

#[test]
fn zero_allocate_rejects_overflow_and_zero() {
    let mut heap = heap();

    assert!(heap.allocate_zeroed(usize::MAX, 2).is_none());
    assert!(heap.allocate_zeroed(0, 16).is_none());
    assert!(heap.allocate_zeroed(16, 0).is_none());
    assert_eq!(heap.stats(), initial_stats());
}

#[test]
fn invalid_requests_fail_without_state_change() {
    let mut heap = heap();

    assert!(heap.allocate(0).is_none());
    assert!(heap.allocate(MAX_REQUEST + 1).is_none());
    assert_eq!(heap.stats(), initial_stats());
}

#[test]
fn exhaustion_fails_without_state_change() {
    let mut heap = heap();
    let payload = MAX_BLOCK_SIZE - HEADER_SIZE;

    let blocks: Vec<NonNull<u8>> = (0..BLOCK_COUNT)
        .map(|_| heap.allocate(payload).unwrap())
        .collect();

    let saturated = heap.stats();
    assert_eq!(saturated.free_blocks, 0);
    assert!(heap.allocate(1).is_none());
    assert_eq!(heap.stats(), saturated);

    for ptr in blocks {
        unsafe { heap.free(ptr.as_ptr()) };
    }
    assert_eq!(heap.stats(), initial_stats());
}

#[test]
fn allocate_free_round_trips_restore_the_counters() {
    let mut heap = heap();

    let sizes = [
        1,
        96,
        128,
        5000,
        MAX_BLOCK_SIZE - HEADER_SIZE,
        MAX_BLOCK_SIZE,
        150_000,
    ];
    for size in sizes {
        let before = heap.stats();
        let p = heap.allocate(size).unwrap();
        unsafe { heap.free(p.as_ptr()) };
        assert_eq!(heap.stats(), before, "size {size}");
        assert_eq!(heap.recount(), before, "size {size}");
    }
}

#[test]
fn free_tolerates_null_and_double_free() {
    let mut heap = heap();

    unsafe { heap.free(ptr::null_mut()) };
    assert_eq!(heap.stats(), initial_stats());

    let p = heap.allocate(64).unwrap();
    unsafe {
        heap.free(p.as_ptr());
        heap.free(p.as_ptr());
    }
    assert_eq!(heap.stats(), initial_stats());
    assert_eq!(heap.recount(), heap.stats());
}

#[derive(Clone, Debug)]
enum HeapOp {
    Alloc { len: usize },
    AllocZeroed { count: usize, elem: usize },
    Free { index: usize },
    Resize { index: usize, len: usize },
}

impl Arbitrary for HeapOp {
    fn arbitrary(g: &mut Gen) -> HeapOp {
        // Spread request sizes across the orders and into the mapped range,
        // staying clear of the huge-page thresholds.
        fn arb_len(g: &mut Gen) -> usize {
            let exp = u8::arbitrary(g) % 19;
            usize::arbitrary(g) % (1usize << exp).max(2)
        }

        match *g.choose(&[0u8, 0, 1, 2, 2, 3]).unwrap() {
            0 => HeapOp::Alloc { len: arb_len(g) },
            1 => HeapOp::AllocZeroed {
                count: usize::arbitrary(g) % 64,
                elem: usize::arbitrary(g) % 8192,
            },
            2 => HeapOp::Free {
                index: usize::arbitrary(g),
            },
            _ => HeapOp::Resize {
                index: usize::arbitrary(g),
                len: arb_len(g),
            },
        }
    }
}

struct Painted {
    ptr: NonNull<u8>,
    len: usize,
    id: u64,
}

fn run_ops(ops: Vec<HeapOp>) -> bool {
    let mut heap = Heap::try_new().unwrap();
    let initial = heap.stats();
    let mut live: Vec<Painted> = Vec::new();

    for (op_id, op) in ops.into_iter().enumerate() {
        let id = op_id as u64 + 1;
        match op {
            HeapOp::Alloc { len } => {
                if let Some(ptr) = heap.allocate(len) {
                    unsafe { paint(ptr, len, id) };
                    live.push(Painted { ptr, len, id });
                }
            }

            HeapOp::AllocZeroed { count, elem } => {
                let Some(len) = count.checked_mul(elem) else {
                    continue;
                };
                if let Some(ptr) = heap.allocate_zeroed(count, elem) {
                    let zeroed = unsafe { slice::from_raw_parts(ptr.as_ptr(), len) };
                    if zeroed.iter().any(|&byte| byte != 0) {
                        return false;
                    }
                    unsafe { paint(ptr, len, id) };
                    live.push(Painted { ptr, len, id });
                }
            }

            HeapOp::Free { index } => {
                if live.is_empty() {
                    continue;
                }
                let block = live.swap_remove(index % live.len());
                if !unsafe { holds_pattern(block.ptr, block.len, block.id) } {
                    return false;
                }
                unsafe { heap.free(block.ptr.as_ptr()) };
            }

            HeapOp::Resize { index, len } => {
                if live.is_empty() {
                    continue;
                }
                let slot = index % live.len();
                let block = &mut live[slot];
                match unsafe { heap.resize(block.ptr.as_ptr(), len) } {
                    Some(ptr) => {
                        if !unsafe { holds_pattern(ptr, block.len.min(len), block.id) } {
                            return false;
                        }
                        block.ptr = ptr;
                        block.len = len;
                        unsafe { paint(ptr, len, block.id) };
                    }
                    // A failed resize must leave the old block intact.
                    None => {
                        if !unsafe { holds_pattern(block.ptr, block.len, block.id) } {
                            return false;
                        }
                    }
                }
            }
        }

        if heap.recount() != heap.stats() {
            return false;
        }
    }

    for block in live.drain(..) {
        if !unsafe { holds_pattern(block.ptr, block.len, block.id) } {
            return false;
        }
        unsafe { heap.free(block.ptr.as_ptr()) };
    }

    heap.stats() == initial && heap.recount() == initial
}

#[test]
fn random_op_sequences_preserve_payloads_and_counters() {
    let mut qc = QuickCheck::new();
    qc.quickcheck(run_ops as fn(Vec<HeapOp>) -> bool);
}

#[test]
fn default_instance_smoke() {
    // The only in-process test touching the default heap, so the pre-init
    // readings are deterministic.
    assert_eq!(global::size_meta_data(), HEADER_SIZE);
    assert_eq!(global::allocated_blocks(), 0);
    assert_eq!(global::free_blocks(), 0);

    unsafe {
        let p = global::alloc(100);
        assert!(!p.is_null());
        assert!(global::allocated_blocks() >= BLOCK_COUNT);
        assert_eq!(
            global::meta_data_bytes(),
            global::allocated_blocks() * HEADER_SIZE
        );

        let q = global::realloc(p, 50);
        assert_eq!(q, p);
        global::dealloc(q);
    }

    assert_eq!(global::free_blocks(), global::allocated_blocks());
    assert_eq!(global::free_bytes(), global::allocated_bytes());
}

const CORRUPTION_CHILD_ENV: &str = "CRUMB_ALLOC_CORRUPTION_CHILD";

#[test]
fn overflowing_an_allocation_terminates_the_process() {
    if std::env::var_os(CORRUPTION_CHILD_ENV).is_some() {
        unsafe {
            let p = global::alloc(16);
            assert!(!p.is_null());
            // Trample far past the allocation, across the neighboring
            // headers.
            ptr::write_bytes(p, 0xAA, 2000);
            // The next call reads a trampled header and must not return.
            let _ = global::alloc(16);
        }
        unreachable!("a corrupted heap survived another call");
    }

    let exe = std::env::current_exe().unwrap();
    let status = Command::new(exe)
        .args([
            "tests::overflowing_an_allocation_terminates_the_process",
            "--exact",
            "--test-threads=1",
        ])
        .env(CORRUPTION_CHILD_ENV, "1")
        .status()
        .unwrap();

    assert_eq!(status.code(), Some(CORRUPTION_EXIT_STATUS & 0xFF));
}
