//! End-to-end scenarios against the public API.
//!
//! Each test builds its own `Heap` instance rather than touching the
//! crate-root singleton, so scenarios never interfere with each other when
//! the test binary runs them concurrently.

use blockheap::{CapturingSink, DiagnosticEvent, Heap};

#[test]
fn fresh_allocate_free_cycle() {
    let heap = Heap::new();
    heap.initialize();
    let baseline = heap.stats();

    let p = heap.allocate(100);
    assert!(!p.is_null());
    assert_eq!(heap.size_of(p), 100);

    let bytes = unsafe { std::slice::from_raw_parts(p, 100) };
    assert!(bytes.iter().all(|&b| b == 0), "a fresh allocation must be zeroed");

    heap.free(p);

    let after = heap.stats();
    assert_eq!(after.allocated_blocks, 0);
    assert_eq!(after.free_blocks, baseline.free_blocks);
    assert_eq!(after.free_bytes, baseline.free_bytes);
}

#[test]
fn best_fit_across_classes() {
    let heap = Heap::new();
    heap.initialize();

    let a = heap.allocate(32);
    let b = heap.allocate(64);
    let c = heap.allocate(128);
    let d = heap.allocate(256);
    assert!([a, b, c, d].iter().all(|p| !p.is_null()));

    heap.free(b);
    let reused = heap.allocate(50);
    assert_eq!(
        reused, b,
        "a 50-byte request should best-fit into the freed 64-byte slot, not extend the region"
    );

    heap.free(a);
    heap.free(c);
    heap.free(d);
    heap.free(reused);
}

#[test]
fn split_produces_remainder_free_block() {
    let heap = Heap::new();
    heap.initialize();
    let baseline = heap.stats();

    let p = heap.allocate(32);
    assert!(!p.is_null());

    let stats = heap.stats();
    assert_eq!(stats.allocated_blocks, 1);
    assert_eq!(stats.free_blocks, baseline.free_blocks, "splitting keeps exactly one free block");
    assert!(stats.free_bytes < baseline.free_bytes);

    heap.free(p);
}

#[test]
fn coalesce_bidirectional() {
    let heap = Heap::new();
    heap.initialize();
    let baseline = heap.stats();

    let a = heap.allocate(64);
    let b = heap.allocate(64);
    let c = heap.allocate(64);
    assert!([a, b, c].iter().all(|p| !p.is_null()));

    // Free the middle block last so its neighbors on both sides are already
    // free, exercising both the next- and previous-physical merge paths.
    heap.free(a);
    heap.free(c);
    heap.free(b);

    let after = heap.stats();
    assert_eq!(after.allocated_blocks, 0);
    assert_eq!(
        after.free_blocks, baseline.free_blocks,
        "three adjacent frees should coalesce back into the original single free block"
    );
    assert_eq!(after.free_bytes, baseline.free_bytes);
}

#[test]
fn reallocate_shrink_in_place() {
    let heap = Heap::new();
    heap.initialize();

    let p = heap.allocate(200);
    assert!(!p.is_null());
    unsafe { std::ptr::write_bytes(p, 0xAB, 200) };

    let q = heap.reallocate(p, 80);
    assert_eq!(q, p, "shrinking should never need to move the allocation");
    assert_eq!(heap.size_of(q), 80);

    let bytes = unsafe { std::slice::from_raw_parts(q, 80) };
    assert!(bytes.iter().all(|&b| b == 0xAB));
}

#[test]
fn reallocate_grow_out_of_place() {
    let heap = Heap::new();
    heap.initialize();

    let p = heap.allocate(200);
    assert!(!p.is_null());
    unsafe { std::ptr::write_bytes(p, 0xCD, 200) };

    // Allocate a blocker immediately after `p` so there is no room to grow
    // `p` in place, forcing reallocate onto the allocate-copy-free path.
    let blocker = heap.allocate(200);
    assert!(!blocker.is_null());

    let q = heap.reallocate(p, 400);
    assert!(!q.is_null());
    assert_ne!(q, p, "growing past the in-place limit must move the allocation");
    assert_eq!(heap.size_of(q), 400);

    let bytes = unsafe { std::slice::from_raw_parts(q, 200) };
    assert!(bytes.iter().all(|&b| b == 0xCD), "the first 200 bytes must survive the move");

    heap.free(blocker);
    heap.free(q);
}

#[test]
fn double_free_is_reported_and_inert() {
    let heap = Heap::new();
    heap.initialize();

    let sink = CapturingSink::new();
    heap.set_diagnostic_sink(Box::new(sink.clone()));

    let p = heap.allocate(32);
    assert!(!p.is_null());

    heap.free(p);
    let before_second_free = heap.stats();

    heap.free(p);
    let after_second_free = heap.stats();

    assert_eq!(before_second_free.free_blocks, after_second_free.free_blocks);
    assert_eq!(before_second_free.allocated_blocks, after_second_free.allocated_blocks);
    assert_eq!(before_second_free.free_bytes, after_second_free.free_bytes);

    assert!(
        sink.events()
            .iter()
            .any(|event| matches!(event, DiagnosticEvent::DoubleFree { .. })),
        "the second free of the same pointer must report a double-free diagnostic"
    );
}

#[cfg(feature = "memory-guards")]
#[test]
fn guard_overrun_is_reported_on_free() {
    let heap = Heap::new();
    heap.initialize();

    let sink = CapturingSink::new();
    heap.set_diagnostic_sink(Box::new(sink.clone()));

    let p = heap.allocate(32);
    assert!(!p.is_null());

    // One byte past the requested size lands in the trailing guard band.
    unsafe { std::ptr::write(p.add(32), 0x00) };

    heap.free(p);

    assert!(
        sink.events()
            .iter()
            .any(|event| matches!(event, DiagnosticEvent::BufferOverrun { .. })),
        "writing into the trailing guard band must report a buffer overrun at free time"
    );
}

#[cfg(feature = "memory-guards")]
#[test]
fn untouched_guard_bands_free_cleanly() {
    let heap = Heap::new();
    heap.initialize();

    let sink = CapturingSink::new();
    heap.set_diagnostic_sink(Box::new(sink.clone()));

    let p = heap.allocate(48);
    assert!(!p.is_null());
    unsafe { std::ptr::write_bytes(p, 0xAB, 48) };

    heap.free(p);

    assert!(
        sink.events()
            .iter()
            .all(|event| !matches!(event, DiagnosticEvent::BufferOverrun { .. })),
        "a payload-only write must never trip the guard check"
    );
}

#[cfg(feature = "leak-detection")]
#[test]
fn leaked_allocations_tracks_outstanding_pointers() {
    let heap = Heap::new();
    heap.initialize();

    assert!(heap.leaked_allocations().is_empty());

    let p = heap.allocate(96);
    assert!(!p.is_null());

    let leaks = heap.leaked_allocations();
    assert_eq!(leaks.len(), 1);
    let (leaked_ptr, record) = leaks[0];
    assert_eq!(leaked_ptr, p as usize);
    assert_eq!(record.requested_size, 96);

    heap.free(p);
    assert!(
        heap.leaked_allocations().is_empty(),
        "a freed allocation must no longer appear in the leak table"
    );
}

#[test]
fn zero_allocate_overflow_guard() {
    let heap = Heap::new();
    heap.initialize();
    let baseline = heap.stats();

    let p = heap.zero_allocate(usize::MAX, 2);
    assert!(p.is_null(), "count * element_size overflow must fail rather than wrap");

    let after = heap.stats();
    assert_eq!(after.free_blocks, baseline.free_blocks);
    assert_eq!(after.free_bytes, baseline.free_bytes);
    assert_eq!(after.allocated_blocks, baseline.allocated_blocks);
}
