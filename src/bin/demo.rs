//! Command-line driver exercising the debug heap's failure modes.
//!
//! This binary is a thin integration shim kept outside the allocator core:
//! it only talks to `dbgheap` through the crate's public six operations.
//! Several scenarios here deliberately
//! crash the process (SIGSEGV from touching a decommitted page, or a
//! panic from a fatal assertion) — that is the entire point of the tool.

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use dbgheap::DebugHeap;

#[derive(Debug, thiserror::Error)]
enum DemoError {
    #[error("failed to reserve a {0}-byte debug heap (out of address space?)")]
    HeapConstruction(usize),
}

#[derive(Parser, Debug)]
#[command(
    name = "dbgheap-demo",
    about = "Exercises the debug heap's crash-on-first-fault detection scenarios"
)]
struct Cli {
    /// Heap budget, in MiB. Must be at least large enough for two pages;
    /// bigger budgets widen the use-after-free "observation window".
    #[arg(long, default_value_t = 2)]
    budget_mib: usize,

    /// Verify the 0xFC fill pattern on every free (catches underrun writes;
    /// off by default, as the core allocator leaves this unchecked).
    #[arg(long)]
    verify_fill: bool,

    #[command(subcommand)]
    scenario: Scenario,
}

#[derive(Subcommand, Debug)]
enum Scenario {
    /// Construct and destroy a heap; expect no faults.
    SetupTeardown,
    /// Allocate one full page aligned to 8 bytes, write its first and last
    /// byte, then report its usable size.
    AlignedAlloc,
    /// Allocate 128 bytes and write one byte past the end: faults on the
    /// guard page.
    Overrun,
    /// Free the same pointer twice: trips a fatal assertion.
    DoubleFree,
    /// Free a pointer, then read through it: faults on the decommitted page.
    UseAfterFree,
    /// Allocate and free three adjacent single-page blocks, then force a
    /// flush with a large request and report how many free blocks remain.
    Coalesce,
    /// Allocate 1-byte chunks until the heap is exhausted; report the count.
    Exhaustion,
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let budget = cli.budget_mib * 1024 * 1024;
    let mut heap = match DebugHeap::init_with_options(budget, cli.verify_fill) {
        Some(heap) => heap,
        None => {
            eprintln!("error: {}", DemoError::HeapConstruction(budget));
            return ExitCode::FAILURE;
        }
    };

    match cli.scenario {
        Scenario::SetupTeardown => {
            println!("heap constructed over {} bytes; dropping now", budget);
            drop(heap);
            println!("teardown complete, no faults");
        }
        Scenario::AlignedAlloc => {
            let p = heap.allocate(4096, 8).expect("allocation should succeed");
            let size = unsafe { heap.get_alloc_size(p) };
            println!("allocated {:p}, aligned to 8, usable size {} bytes", p, size);
            unsafe {
                p.as_ptr().write(0x11);
                p.as_ptr().add(size - 1).write(0x22);
            }
            println!("wrote first and last byte without faulting");
        }
        Scenario::Overrun => {
            let p = heap.allocate(128, 4).expect("allocation should succeed");
            let size = unsafe { heap.get_alloc_size(p) };
            println!("allocated {} usable bytes at {:p}; writing one byte past the end", size, p);
            unsafe {
                // This write lands on the guard page and must fault.
                p.as_ptr().add(size).write(b'a');
            }
            println!("(unreachable: the guard page should have faulted)");
        }
        Scenario::DoubleFree => {
            let p = heap.allocate(128, 4).expect("allocation should succeed");
            unsafe {
                heap.free(p);
                println!("first free succeeded; freeing the same pointer again");
                heap.free(p);
            }
            println!("(unreachable: double free should have panicked)");
        }
        Scenario::UseAfterFree => {
            let p = heap.allocate(128, 4).expect("allocation should succeed");
            unsafe {
                heap.free(p);
                println!("freed {:p}; reading through it now", p);
                let _ = p.as_ptr().read();
            }
            println!("(unreachable: the decommitted page should have faulted)");
        }
        Scenario::Coalesce => {
            let a = heap.allocate(1, 1).expect("allocation should succeed");
            let b = heap.allocate(1, 1).expect("allocation should succeed");
            let c = heap.allocate(1, 1).expect("allocation should succeed");
            unsafe {
                heap.free(a);
                heap.free(b);
                heap.free(c);
            }
            println!("freed three adjacent single-page blocks; forcing a flush");
            let _ = heap.allocate(1024 * 1024, 1);
            println!("flush count so far: {}", heap.stats().flushes);
        }
        Scenario::Exhaustion => {
            let mut count = 0u64;
            while heap.allocate(1, 1).is_some() {
                count += 1;
            }
            println!("exhausted after {} one-byte allocations", count);
        }
    }

    ExitCode::SUCCESS
}
