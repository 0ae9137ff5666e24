use std::sync::Arc;

use tgc::memory::{Allocator, MemoryError, SystemMemoryProvider};

fn planner() -> Allocator<SystemMemoryProvider> {
    Allocator::new(Arc::new(SystemMemoryProvider))
}

#[test]
fn sizes_are_rounded_up_to_the_alignment_quantum() {
    let mut alloc = planner();
    assert_eq!(alloc.aligned_size(30), 32);
    assert_eq!(alloc.aligned_size(32), 32);
    assert_eq!(alloc.aligned_size(1), 8);

    let first = alloc.alloc(30).unwrap();
    let second = alloc.alloc(1).unwrap();
    assert_eq!(first, 0);
    assert_eq!(second, 32, "second block starts at the aligned end of the first");
    assert_eq!(alloc.info().used, 40);
}

#[test]
fn freed_block_is_reused_exactly() {
    let mut alloc = planner();
    let size = 48;
    let a = alloc.alloc(size).unwrap();
    let b = alloc.alloc(size).unwrap();
    let c = alloc.alloc(size).unwrap();

    alloc.free(b, size).unwrap();
    let holes: Vec<_> = alloc.free_blocks().collect();
    assert_eq!(holes, vec![(b, size)], "exactly one hole spanning b");

    let d = alloc.alloc(size).unwrap();
    assert_eq!(d, b, "a same-sized request must reuse b's offset");
    assert_eq!(alloc.free_blocks().count(), 0);
    assert_ne!(a, c);
}

#[test]
fn end_of_arena_block_is_reused_without_stale_entries() {
    let mut alloc = planner();
    let size = 48;
    alloc.alloc(size).unwrap();
    alloc.alloc(size).unwrap();
    let c = alloc.alloc(size).unwrap();

    alloc.free(c, size).unwrap();
    let d = alloc.alloc(size).unwrap();
    assert_eq!(c, d, "the tail block must be reused");
    assert_eq!(
        alloc.free_blocks().count(),
        0,
        "no stale hole may remain before the reused block"
    );
}

#[test]
fn splitting_a_larger_hole_keeps_the_remainder_free() {
    let mut alloc = planner();
    let a = alloc.alloc(64).unwrap();
    let b = alloc.alloc(64).unwrap();
    alloc.alloc(8).unwrap();

    alloc.free(a, 64).unwrap();
    alloc.free(b, 64).unwrap();
    let holes: Vec<_> = alloc.free_blocks().collect();
    assert_eq!(holes, vec![(0, 128)], "adjacent holes coalesce into one");

    let small = alloc.alloc(32).unwrap();
    assert_eq!(small, 0);
    let holes: Vec<_> = alloc.free_blocks().collect();
    assert_eq!(holes, vec![(32, 96)], "remainder of the split stays free");
}

#[test]
fn all_bytes_return_after_every_block_is_freed() {
    let mut alloc = planner();
    let a = alloc.alloc(48).unwrap();
    let b = alloc.alloc(16).unwrap();
    let c = alloc.alloc(80).unwrap();

    alloc.free(a, 48).unwrap();
    alloc.free(c, 80).unwrap();
    alloc.free(b, 16).unwrap();

    assert_eq!(alloc.info().used, 0);
    assert_eq!(
        alloc.free_blocks().count(),
        1,
        "the whole arena coalesces back into a single hole"
    );
}

#[test]
fn peak_tracks_the_high_water_mark() {
    let mut alloc = planner();
    let a = alloc.alloc(64).unwrap();
    let b = alloc.alloc(64).unwrap();
    assert_eq!(alloc.info().peak, 128);

    alloc.free(b, 64).unwrap();
    let small = alloc.alloc(32).unwrap();
    assert_eq!(small, b, "first fit reuses the freed hole");
    assert_eq!(alloc.info().peak, 128, "peak never shrinks");
    assert_eq!(alloc.info().used, 96);

    alloc.free(a, 64).unwrap();
    alloc.free(small, 32).unwrap();
    assert_eq!(alloc.info().used, 0);
}

#[test]
fn materialize_is_idempotent_and_freezes_placement() {
    let mut alloc = planner();
    alloc.alloc(100).unwrap();
    assert!(!alloc.is_committed());

    let first = alloc.materialize().unwrap();
    let second = alloc.materialize().unwrap();
    assert_eq!(first.base_ptr(), second.base_ptr());
    assert_eq!(first.len(), alloc.info().peak);
    assert!(alloc.is_committed());

    match alloc.alloc(8) {
        Err(MemoryError::Committed { peak, .. }) => assert_eq!(peak, 104),
        other => panic!("alloc after commit must fail, got {other:?}"),
    }
    assert!(matches!(
        alloc.free(0, 8),
        Err(MemoryError::Committed { .. })
    ));
}

#[test]
fn empty_plan_commits_an_empty_buffer() {
    let mut alloc = planner();
    let buffer = alloc.materialize().unwrap();
    assert!(buffer.is_empty());
    assert_eq!(alloc.info().peak, 0);
}
