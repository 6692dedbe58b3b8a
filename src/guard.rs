//! Reentrancy-based concurrency-misuse detector.
//!
//! The heap is not internally synchronized; callers are responsible for
//! serializing access. Every public operation brackets its body with this
//! guard so that two threads entering concurrently trip a fatal assertion
//! instead of corrupting bookkeeping silently.

use std::sync::atomic::{AtomicIsize, Ordering};

pub struct ReentrancyGuard {
    depth: AtomicIsize,
}

impl ReentrancyGuard {
    pub const fn new() -> Self {
        ReentrancyGuard {
            depth: AtomicIsize::new(0),
        }
    }

    /// Enter a public operation. Panics if another call is already in
    /// progress. The returned scope decrements the counter on drop.
    #[track_caller]
    pub fn enter(&self) -> GuardScope<'_> {
        let depth = self.depth.fetch_add(1, Ordering::SeqCst) + 1;
        assert_eq!(
            depth, 1,
            "debug heap: concurrent entry detected — two calls overlapped on this heap"
        );
        GuardScope { guard: self }
    }
}

pub struct GuardScope<'a> {
    guard: &'a ReentrancyGuard,
}

impl Drop for GuardScope<'_> {
    fn drop(&mut self) {
        let depth = self.guard.depth.fetch_sub(1, Ordering::SeqCst) - 1;
        // If we're already unwinding (e.g. from the "concurrent entry
        // detected" panic raised by a nested `enter()`), the counter is
        // still nonzero here — asserting would panic a second time while
        // unwinding, which Rust aborts the process for instead of letting
        // the original panic propagate and be caught normally.
        if !std::thread::panicking() {
            assert_eq!(depth, 0, "debug heap: reentrancy counter corrupted on exit");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enter_and_exit_is_transparent() {
        let guard = ReentrancyGuard::new();
        {
            let _scope = guard.enter();
        }
        {
            let _scope = guard.enter();
        }
    }

    #[test]
    #[should_panic(expected = "concurrent entry detected")]
    fn nested_enter_trips() {
        let guard = ReentrancyGuard::new();
        let _outer = guard.enter();
        let _inner = guard.enter();
    }
}
