//! OS virtual-memory shim.
//!
//! Four primitives over a page-aligned range: reserve, release, commit,
//! decommit. This is the only OS-dependent surface in the crate; everything
//! above it works purely in page indices. Detection of out-of-bounds writes
//! and use-after-free relies on decommitted pages faulting on access, so a
//! "successful" decommit that silently leaves a page readable would defeat
//! the whole tool.

use std::ptr::null_mut;

use crate::PAGE_SIZE;

#[cfg(not(windows))]
use libc::{MAP_ANONYMOUS, MAP_FAILED, MAP_PRIVATE, PROT_NONE, PROT_READ, PROT_WRITE};

#[cfg(windows)]
use winapi::{
    ctypes::c_void,
    um::memoryapi::{VirtualAlloc, VirtualFree},
    um::winnt::{MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_NOACCESS, PAGE_READWRITE},
};

/// Failure reserving a fresh range of address space from the OS. This is the
/// only virtual-memory operation this crate treats as recoverable; commit,
/// decommit and release are assumed infallible in the logical model (a
/// failure there is a fatal assertion, not an error value).
#[derive(Debug, thiserror::Error)]
#[error("failed to reserve {pages} page(s) of address space (os error {code})")]
pub struct ReserveError {
    pages: usize,
    code: i32,
}

/// Reserve `pages` contiguous pages of address space with no backing and no
/// access. Returns the base address.
pub fn reserve(pages: usize) -> Result<*mut u8, ReserveError> {
    let size = pages * PAGE_SIZE;
    debug_assert!(size > 0);

    #[cfg(not(windows))]
    {
        // SAFETY: `mmap` with MAP_PRIVATE|MAP_ANONYMOUS and a null fd/offset
        // is always sound to call; the only question is whether it succeeds.
        let p = unsafe {
            libc::mmap(
                null_mut(),
                size,
                PROT_NONE,
                MAP_PRIVATE | MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if p == MAP_FAILED {
            let code = errno::errno().0;
            log::warn!("mmap(PROT_NONE) failed reserving {} pages: errno {}", pages, code);
            return Err(ReserveError { pages, code });
        }
        Ok(p as *mut u8)
    }
    #[cfg(windows)]
    {
        // SAFETY: VirtualAlloc with a null address lets the OS pick the
        // range; MEM_RESERVE without MEM_COMMIT leaves it inaccessible.
        let p = unsafe { VirtualAlloc(null_mut(), size, MEM_RESERVE, PAGE_NOACCESS) };
        if p.is_null() {
            let code = unsafe { winapi::um::errhandlingapi::GetLastError() } as i32;
            log::warn!("VirtualAlloc(MEM_RESERVE) failed reserving {} pages: error {}", pages, code);
            return Err(ReserveError { pages, code });
        }
        Ok(p as *mut u8)
    }
}

/// Return a previously reserved range to the OS.
pub fn release(base: *mut u8, pages: usize) {
    if base.is_null() || pages == 0 {
        return;
    }
    let size = pages * PAGE_SIZE;

    #[cfg(not(windows))]
    {
        // SAFETY: caller guarantees `base`/`pages` describe a live reservation.
        let ok = unsafe { libc::munmap(base as *mut _, size) } == 0;
        if !ok {
            log::error!("munmap failed releasing {} pages at {:p}: errno {}", pages, base, errno::errno());
        }
        assert!(ok, "debug heap: failed to release reserved address range");
    }
    #[cfg(windows)]
    {
        // MEM_RELEASE requires the size to be zero and frees the whole
        // reservation, so `pages` is only used for the diagnostic message.
        let ok = unsafe { VirtualFree(base as *mut c_void, 0, MEM_RELEASE) } != 0;
        if !ok {
            let code = unsafe { winapi::um::errhandlingapi::GetLastError() };
            log::error!("VirtualFree(MEM_RELEASE) failed releasing {} pages at {:p}: error {}", pages, base, code);
        }
        assert!(ok, "debug heap: failed to release reserved address range");
    }
}

/// Make `[base, base + pages*PAGE_SIZE)` readable and writable, backed by
/// physical memory on demand. Treated as infallible: a failure here means
/// the OS is out of memory/overcommit room, which this tool has no
/// meaningful recovery for.
pub fn commit(base: *mut u8, pages: usize) {
    if pages == 0 {
        return;
    }
    let size = pages * PAGE_SIZE;

    #[cfg(not(windows))]
    {
        // SAFETY: `base` lies within a range this heap reserved with mmap.
        let ok = unsafe { libc::mprotect(base as *mut _, size, PROT_READ | PROT_WRITE) } == 0;
        if !ok {
            log::error!("mprotect(RW) failed committing {} pages at {:p}: errno {}", pages, base, errno::errno());
        }
        assert!(ok, "debug heap: failed to commit pages");
    }
    #[cfg(windows)]
    {
        let p = unsafe { VirtualAlloc(base as *mut c_void, size, MEM_COMMIT, PAGE_READWRITE) };
        let ok = !p.is_null();
        if !ok {
            let code = unsafe { winapi::um::errhandlingapi::GetLastError() };
            log::error!("VirtualAlloc(MEM_COMMIT) failed committing {} pages at {:p}: error {}", pages, base, code);
        }
        assert!(ok, "debug heap: failed to commit pages");
    }
}

/// Make `[base, base + pages*PAGE_SIZE)` inaccessible; any access must fault.
/// Where the platform allows it, backing pages are returned to the OS
/// first (this must not silently no-op: correctness of use-after-free and
/// guard-page detection depends on the access genuinely faulting).
pub fn decommit(base: *mut u8, pages: usize) {
    if pages == 0 {
        return;
    }
    let size = pages * PAGE_SIZE;

    #[cfg(not(windows))]
    {
        // SAFETY: `base` lies within a range this heap reserved with mmap.
        unsafe {
            // Hint the kernel the pages are no longer needed so it can drop
            // the backing physical memory, then flip the range to
            // PROT_NONE so any access faults regardless of whether the
            // kernel actually reclaimed anything.
            libc::madvise(base as *mut _, size, libc::MADV_DONTNEED);
        }
        let ok = unsafe { libc::mprotect(base as *mut _, size, PROT_NONE) } == 0;
        if !ok {
            log::error!("mprotect(NONE) failed decommitting {} pages at {:p}: errno {}", pages, base, errno::errno());
        }
        assert!(ok, "debug heap: failed to decommit pages");
    }
    #[cfg(windows)]
    {
        let ok = unsafe { VirtualFree(base as *mut c_void, size, MEM_DECOMMIT) } != 0;
        if !ok {
            let code = unsafe { winapi::um::errhandlingapi::GetLastError() };
            log::error!("VirtualFree(MEM_DECOMMIT) failed decommitting {} pages at {:p}: error {}", pages, base, code);
        }
        assert!(ok, "debug heap: failed to decommit pages");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_then_release_round_trips() {
        let base = reserve(4).expect("reservation should succeed");
        assert!(!base.is_null());
        release(base, 4);
    }

    #[test]
    fn commit_allows_access_decommit_forbids_it() {
        let base = reserve(2).expect("reservation should succeed");
        commit(base, 1);
        unsafe {
            base.write(0xAB);
            assert_eq!(base.read(), 0xAB);
        }
        // The second page stays reserved-but-not-committed; we don't touch
        // it here since that would fault by design.
        release(base, 2);
    }
}
