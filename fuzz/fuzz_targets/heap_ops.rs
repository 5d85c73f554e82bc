#![no_main]

use core::ptr::NonNull;

use crumb_alloc::{Global, Heap};
use heap_hater::{Evaluator, HeapOp, Subject};
use libfuzzer_sys::fuzz_target;

struct HeapSubject(Heap<Global>);

impl Subject for HeapSubject {
    fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        self.0.allocate(size)
    }

    fn allocate_zeroed(&mut self, count: usize, elem_size: usize) -> Option<NonNull<u8>> {
        self.0.allocate_zeroed(count, elem_size)
    }

    unsafe fn free(&mut self, ptr: NonNull<u8>) {
        unsafe { self.0.free(ptr.as_ptr()) };
    }

    unsafe fn resize(&mut self, ptr: NonNull<u8>, new_size: usize) -> Option<NonNull<u8>> {
        unsafe { self.0.resize(ptr.as_ptr(), new_size) }
    }
}

fuzz_target!(|ops: Vec<HeapOp>| {
    let Ok(heap) = Heap::try_new() else { return };
    let initial = heap.stats();

    let mut evaluator = Evaluator::new(HeapSubject(heap));
    if let Err(failed) = evaluator.evaluate(ops) {
        panic!("payload corrupted: {failed:?}");
    }

    // Everything was freed; the heap must be back in its initial shape.
    let heap = evaluator.into_inner().0;
    assert_eq!(heap.stats(), initial);
    assert_eq!(heap.recount(), initial);
});
