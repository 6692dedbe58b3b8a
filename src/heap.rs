//! Allocation policy and the `DebugHeap` handle: best-fit carve, guard-page
//! placement, free/flush, size query and ownership test.

use std::ptr::NonNull;

use crate::block::{BlockArena, BlockState};
use crate::guard::ReentrancyGuard;
use crate::os;
use crate::stats::Stats;
use crate::PAGE_SIZE;

/// Byte written into the padding between a user pointer and its guard page.
/// A future out-of-bounds *read* of that padding (as opposed to a write
/// past the allocation) will see this rather than whatever happened to be
/// in memory, which is occasionally a useful tell on its own; it is never
/// read back by this crate unless `verify_fill_on_free` is enabled.
const FILL_BYTE: u8 = 0xFC;

/// A deliberately slow, memory-profligate, page-granular allocator that
/// backs every allocation with a trailing decommitted guard page, and keeps
/// freed blocks decommitted on a pending list before they are ever reused.
///
/// Not thread-safe: concurrent use is detected (via an internal reentrancy
/// guard) and panics, not supported. Note that `DebugHeap` is neither `Send`
/// nor `Sync` — it holds a raw pointer into its own reserved address range,
/// and there is no sound way to hand that access to another thread under
/// this heap's single-threaded contract.
pub struct DebugHeap {
    base: NonNull<u8>,
    page_count: usize,
    arena: BlockArena,
    guard: ReentrancyGuard,
    verify_fill_on_free: bool,
    stats: Stats,
}

impl DebugHeap {
    /// Construct a heap over a `byte_budget`-byte user region. `byte_budget`
    /// must be at least two pages and a multiple of `PAGE_SIZE` — "at least
    /// two pages per sub-4k allocation; more is better", since the
    /// observation window's effectiveness scales with heap size relative to
    /// the working set. Returns `None` only if the OS could not satisfy the
    /// address-space reservation.
    pub fn init(byte_budget: usize) -> Option<Self> {
        Self::init_with_options(byte_budget, false)
    }

    /// As [`DebugHeap::init`], additionally enabling the optional fill-
    /// pattern check on free: every byte between the user pointer and the
    /// page it sits in is verified to still hold [`FILL_BYTE`] before the
    /// block is decommitted, catching a negative/underrun write the guard
    /// page alone cannot.
    pub fn init_with_options(byte_budget: usize, verify_fill_on_free: bool) -> Option<Self> {
        assert!(
            byte_budget >= 2 * PAGE_SIZE,
            "debug heap: byte budget must cover at least two pages"
        );
        assert_eq!(
            byte_budget % PAGE_SIZE,
            0,
            "debug heap: byte budget must be a multiple of the page size"
        );

        let page_count = byte_budget / PAGE_SIZE;
        let max_allocs = page_count / 2;

        let base = match os::reserve(page_count) {
            Ok(p) => p,
            Err(err) => {
                log::warn!("{}", err);
                return None;
            }
        };

        Some(DebugHeap {
            base: NonNull::new(base).expect("os::reserve returned a null pointer on success"),
            page_count,
            arena: BlockArena::new(page_count, max_allocs),
            guard: ReentrancyGuard::new(),
            verify_fill_on_free,
            stats: Stats::default(),
        })
    }

    fn user_base(&self, page_index: usize) -> *mut u8 {
        // SAFETY: `page_index < page_count` is an invariant upheld by every
        // caller in this module before this is invoked.
        unsafe { self.base.as_ptr().add(page_index * PAGE_SIZE) }
    }

    fn page_index_of(&self, ptr: *const u8) -> usize {
        let base = self.base.as_ptr() as usize;
        let addr = ptr as usize;
        assert!(addr >= base, "debug heap: pointer precedes the heap's region");
        (addr - base) / PAGE_SIZE
    }

    /// Allocate `size` bytes aligned to `align` (a power of two), returning
    /// a pointer right-justified against the allocation's trailing guard
    /// page. Returns `None` only when no free block is large enough even
    /// after flushing the pending-free list; never partially mutates state
    /// on failure.
    pub fn allocate(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        assert!(size > 0, "debug heap: zero-size allocation is not supported");
        assert!(
            align > 0 && align.is_power_of_two(),
            "debug heap: alignment must be a nonzero power of two"
        );
        let _scope = self.guard.enter();

        // one page per `size` (rounded up) plus the trailing guard page.
        let pages = 1 + (size + PAGE_SIZE - 1) / PAGE_SIZE;

        let block = match self.arena.carve(pages) {
            Some(id) => id,
            None => {
                self.arena.flush();
                self.stats.record_flush();
                self.arena.carve(pages)?
            }
        };

        self.arena.set_lookup(block);
        let start = self.arena.start_of(block);
        let user_region = self.user_base(start);

        // Commit every page but the trailing guard page, which stays
        // decommitted (either untouched since reservation, or left
        // decommitted by a previous free of this same range).
        os::commit(user_region, pages - 1);

        let ideal_offset = (PAGE_SIZE - size) % PAGE_SIZE;
        let offset = ideal_offset & !(align - 1);

        // SAFETY: `user_region` is committed for `pages - 1` pages, and
        // `offset < PAGE_SIZE <= (pages - 1) * PAGE_SIZE` since `pages >= 1`
        // and we just committed at least one full page.
        unsafe {
            user_region.write_bytes(FILL_BYTE, offset);
        }

        self.stats.record_allocate();
        let ptr = unsafe { user_region.add(offset) };
        Some(NonNull::new(ptr).expect("non-null region plus in-page offset cannot be null"))
    }

    /// Free a pointer previously returned by [`DebugHeap::allocate`] on this
    /// heap. Fatal-asserts on a pointer outside the region, a double free,
    /// or a pointer into a block that is not currently allocated.
    ///
    /// # Safety
    /// `ptr` must have been returned by a prior `allocate` call on this
    /// heap and not already freed.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) {
        let _scope = self.guard.enter();

        let page_index = self.page_index_of(ptr.as_ptr());
        assert!(
            page_index < self.page_count,
            "debug heap: free() called with a pointer outside this heap's region"
        );
        let block = self
            .arena
            .lookup(page_index)
            .unwrap_or_else(|| panic!("debug heap: double free (or invalid pointer) at {:p}", ptr));
        assert_eq!(
            self.arena.state_of(block),
            BlockState::Allocated,
            "debug heap: free() on a block that is not allocated (heap corruption or double free)"
        );

        if self.verify_fill_on_free {
            self.verify_fill(ptr, block);
        }

        let (start, pages) = self.arena.begin_pending_free(block);
        let user_region = self.user_base(start);
        // The guard page (the last page of the block) is already
        // decommitted; decommit the rest.
        os::decommit(user_region, pages - 1);

        self.stats.record_free();
    }

    fn verify_fill(&self, ptr: NonNull<u8>, block: crate::block::BlockId) {
        let start = self.arena.start_of(block);
        let page_base = self.user_base(start);
        let offset = (ptr.as_ptr() as usize) - (page_base as usize);
        // SAFETY: `[page_base, page_base + offset)` was written with
        // `FILL_BYTE` by `allocate` and is still committed (we have not
        // decommitted it yet).
        for i in 0..offset {
            let byte = unsafe { page_base.add(i).read() };
            assert_eq!(
                byte, FILL_BYTE,
                "debug heap: fill pattern corrupted at offset {} — likely an underrun write",
                i
            );
        }
    }

    /// Report the usable capacity of a live allocation: the number of bytes
    /// from `ptr` to the start of its guard page. May exceed the originally
    /// requested size by up to `align - 1` bytes.
    ///
    /// # Safety
    /// `ptr` must be a pointer currently live from a prior `allocate` call
    /// on this heap.
    pub unsafe fn get_alloc_size(&self, ptr: NonNull<u8>) -> usize {
        let _scope = self.guard.enter();

        let page_index = self.page_index_of(ptr.as_ptr());
        assert!(
            page_index < self.page_count,
            "debug heap: get_alloc_size() called with a pointer outside this heap's region"
        );
        let block = self
            .arena
            .lookup(page_index)
            .unwrap_or_else(|| panic!("debug heap: get_alloc_size() on an unowned pointer at {:p}", ptr));
        assert_eq!(
            self.arena.state_of(block),
            BlockState::Allocated,
            "debug heap: get_alloc_size() on a block that is not allocated"
        );

        let pages = self.arena.pages_of(block);
        let in_page_offset = (ptr.as_ptr() as usize) % PAGE_SIZE;
        (pages - 1) * PAGE_SIZE - in_page_offset
    }

    /// Cheap range check: true iff `ptr` falls within this heap's reserved
    /// region, whether or not it currently points at a live allocation (a
    /// pointer into a freed block still answers `true`).
    pub fn owns(&self, ptr: *const u8) -> bool {
        let _scope = self.guard.enter();
        let base = self.base.as_ptr() as usize;
        let addr = ptr as usize;
        addr >= base && addr <= base + self.page_count * PAGE_SIZE
    }

    /// Snapshot of internal bookkeeping counters. Not part of the public
    /// six-operation interface; a debugging/observability side-channel only.
    pub fn stats(&self) -> Stats {
        self.stats
    }
}

impl Drop for DebugHeap {
    fn drop(&mut self) {
        os::release(self.base.as_ptr(), self.page_count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_heap() -> DebugHeap {
        DebugHeap::init(2 * 1024 * 1024).expect("reservation should succeed in tests")
    }

    #[test]
    fn setup_and_teardown() {
        let heap = small_heap();
        drop(heap);
    }

    #[test]
    fn aligned_full_page_allocation() {
        let mut heap = small_heap();
        let p = heap.allocate(4096, 8).expect("should allocate");
        assert_eq!(p.as_ptr() as usize % 8, 0);
        let size = unsafe { heap.get_alloc_size(p) };
        assert!(size >= 4096);
        unsafe {
            p.as_ptr().write(0x11);
            p.as_ptr().add(4095).write(0x22);
        }
    }

    #[test]
    fn array_overrun_stays_within_guard_until_the_boundary() {
        let mut heap = small_heap();
        let p = heap.allocate(128, 4).expect("should allocate");
        let usable = unsafe { heap.get_alloc_size(p) };
        assert!(usable >= 128);
        unsafe {
            p.as_ptr().add(usable - 1).write(b'a');
        }
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_trips_fatal_assertion() {
        let mut heap = small_heap();
        let p = heap.allocate(128, 4).expect("should allocate");
        unsafe {
            heap.free(p);
            heap.free(p);
        }
    }

    #[test]
    fn owns_remains_true_after_free() {
        let mut heap = small_heap();
        let p = heap.allocate(128, 4).expect("should allocate");
        assert!(heap.owns(p.as_ptr()));
        unsafe { heap.free(p) };
        assert!(heap.owns(p.as_ptr()));
    }

    #[test]
    fn coalescing_contracts_three_freed_neighbors_into_one_block() {
        let mut heap = small_heap();
        let a = heap.allocate(1, 1).unwrap();
        let b = heap.allocate(1, 1).unwrap();
        let c = heap.allocate(1, 1).unwrap();
        unsafe {
            heap.free(a);
            heap.free(b);
            heap.free(c);
        }
        // Force a flush by requesting something that cannot be satisfied by
        // any single still-unflushed free block.
        let big = heap.allocate(1024 * 1024, 1);
        assert!(big.is_some());
        assert!(heap.stats().flushes >= 1);
    }

    #[test]
    fn exhaustion_returns_none_within_max_allocs() {
        let mut heap = small_heap();
        let max_allocs = (2 * 1024 * 1024 / PAGE_SIZE) / 2;
        let mut count = 0;
        while heap.allocate(1, 1).is_some() {
            count += 1;
            assert!(count <= max_allocs, "exceeded theoretical max allocation count");
        }
    }

    // The reentrancy guard itself (overlapping `enter()` calls panicking)
    // is exercised directly in `guard::tests`. `DebugHeap` is intentionally
    // neither `Send` nor `Sync` (it owns a raw pointer into its own
    // reservation), so two threads calling `allocate` concurrently is a
    // compile-time impossibility here rather than a runtime race.
}
