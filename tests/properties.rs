//! Property tests for the invariants observable through the public API
//! (round-trip allocation, alignment, `Owns` idempotence, `GetAllocSize`
//! monotonicity). Invariants that require peeking at internal bookkeeping
//! (block-list tiling, lookup-table consistency, free-list soundness) are
//! covered by the unit tests in `src/block.rs` instead, since this crate
//! does not expose that state publicly.

use dbgheap::DebugHeap;
use proptest::prelude::*;

const HEAP_BYTES: usize = 4 * 1024 * 1024;

fn powers_of_two_alignment() -> impl Strategy<Value = usize> {
    prop_oneof![
        Just(1usize),
        Just(2),
        Just(4),
        Just(8),
        Just(16),
        Just(32),
        Just(64),
        Just(128),
        Just(256),
        Just(512),
        Just(1024),
    ]
}

proptest! {
    #[test]
    fn round_trip_respects_alignment_and_size(
        size in 1usize..4096,
        align in powers_of_two_alignment(),
    ) {
        let mut heap = DebugHeap::init(HEAP_BYTES).expect("reservation should succeed");
        let p = heap.allocate(size, align).expect("small allocation should always fit a fresh heap");

        prop_assert_eq!(p.as_ptr() as usize % align, 0);

        let usable = unsafe { heap.get_alloc_size(p) };
        prop_assert!(usable >= size);

        unsafe {
            for i in 0..usable {
                p.as_ptr().add(i).write((i & 0xFF) as u8);
            }
            for i in 0..usable {
                prop_assert_eq!(p.as_ptr().add(i).read(), (i & 0xFF) as u8);
            }
        }

        prop_assert!(heap.owns(p.as_ptr()));
        unsafe { heap.free(p) };
        prop_assert!(heap.owns(p.as_ptr()), "Owns must stay true after Free");
    }

    #[test]
    fn sequential_small_allocations_never_alias(
        sizes in prop::collection::vec(1usize..256, 1..16),
    ) {
        // No two live allocations should ever overlap: each pointer must
        // stay writable across its own usable range without touching a
        // neighbor's guard page.
        let mut heap = DebugHeap::init(HEAP_BYTES).expect("reservation should succeed");
        let mut handles = Vec::new();
        for &size in &sizes {
            if let Some(p) = heap.allocate(size, 1) {
                let usable = unsafe { heap.get_alloc_size(p) };
                unsafe { p.as_ptr().write_bytes(0xAA, usable) };
                handles.push((p, usable));
            }
        }
        for (p, usable) in &handles {
            for (q, qusable) in &handles {
                if std::ptr::eq(p.as_ptr(), q.as_ptr()) {
                    continue;
                }
                let (lo, lo_len) = (p.as_ptr() as usize, *usable);
                let (hi, hi_len) = (q.as_ptr() as usize, *qusable);
                prop_assert!(lo + lo_len <= hi || hi + hi_len <= lo, "live allocations must not overlap");
            }
        }
        for (p, _) in handles {
            unsafe { heap.free(p) };
        }
    }
}
