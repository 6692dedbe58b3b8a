//! Bookkeeping-only statistics, kept as a side-channel outside the six
//! core public operations. Plain (non-atomic) counters are enough since
//! the heap is single-threaded by contract.

#[derive(Debug, Clone, Copy, Default)]
pub struct Stats {
    pub allocations: u64,
    pub frees: u64,
    pub flushes: u64,
    pub current_allocated_blocks: u64,
    pub peak_allocated_blocks: u64,
}

impl Stats {
    pub fn record_allocate(&mut self) {
        self.allocations += 1;
        self.current_allocated_blocks += 1;
        self.peak_allocated_blocks = self.peak_allocated_blocks.max(self.current_allocated_blocks);
    }

    pub fn record_free(&mut self) {
        self.frees += 1;
        self.current_allocated_blocks -= 1;
    }

    pub fn record_flush(&mut self) {
        self.flushes += 1;
    }
}
