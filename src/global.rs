//! Optional `GlobalAlloc` adapter, enabled by the `global` Cargo feature.
//!
//! A thin wrapper that forwards straight to the six core operations, using
//! a `Mutex` to serialize access across threads before ever reaching
//! [`DebugHeap`] itself — a `#[global_allocator]` must tolerate concurrent
//! callers, and `DebugHeap` is not `Sync`: it has no locking of its own, and
//! its reentrancy guard only catches a *single* thread calling back into
//! itself, not two threads racing to take an exclusive reference in the
//! first place. The `Mutex` here is what makes that safe; the guard inside
//! `DebugHeap` remains a backstop against the in-thread case (a caller
//! reentering from a `Drop` glue or signal handler while already inside
//! this heap).

use std::alloc::{GlobalAlloc, Layout};
use std::ptr::{self, NonNull};
use std::sync::Mutex;

use crate::DebugHeap;

/// A [`DebugHeap`] usable as a `#[global_allocator]`. The backing
/// reservation is created lazily, sized to `budget` bytes, on first use.
pub struct GlobalDebugHeap {
    inner: Mutex<Option<DebugHeap>>,
    budget: usize,
}

// SAFETY: `DebugHeap` holds a raw `NonNull<u8>` and so is not `Sync` on its
// own, but every access here goes through `inner`'s `Mutex`, which is the
// actual exclusion mechanism: only one thread ever holds the lock guard
// (and hence the `&mut DebugHeap` inside it) at a time.
unsafe impl Sync for GlobalDebugHeap {}

impl GlobalDebugHeap {
    pub const fn new(budget: usize) -> Self {
        GlobalDebugHeap {
            inner: Mutex::new(None),
            budget,
        }
    }

    fn with_heap<R>(&self, f: impl FnOnce(&mut DebugHeap) -> R) -> R {
        let mut guard = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let heap = guard.get_or_insert_with(|| {
            DebugHeap::init(self.budget).expect("GlobalDebugHeap: failed to reserve address space")
        });
        f(heap)
    }
}

unsafe impl GlobalAlloc for GlobalDebugHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.with_heap(|heap| {
            heap.allocate(layout.size().max(1), layout.align())
                .map_or(ptr::null_mut(), NonNull::as_ptr)
        })
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Some(p) = NonNull::new(ptr) {
            self.with_heap(|heap| unsafe { heap.free(p) });
        }
    }
}
