//! Primitive allocation from the operating system's anonymous page mapping
//! facility. This is the only module that talks to the OS directly; every
//! other module deals exclusively in `BlockHeader`/page abstractions.

#[cfg(not(windows))]
use libc::{mmap, munmap, sysconf, MAP_ANONYMOUS, MAP_FAILED, MAP_PRIVATE, PROT_READ, PROT_WRITE, _SC_PAGESIZE};
#[cfg(windows)]
use winapi::{
    shared::minwindef::LPVOID,
    um::{
        memoryapi::{VirtualAlloc, VirtualFree},
        sysinfoapi::{GetSystemInfo, SYSTEM_INFO},
        winnt::{MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE},
    },
};

use core::ptr::null_mut;
use core::sync::atomic::{AtomicUsize, Ordering};
use log::warn;

// Cached system page size; initialized lazily on first use so the crate
// never needs a process-init hook to do it ahead of time.
static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

pub fn page_size() -> usize {
    let cached = PAGE_SIZE.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    let size = query_page_size();
    PAGE_SIZE.store(size, Ordering::Relaxed);
    size
}

#[cfg(not(windows))]
fn query_page_size() -> usize {
    let result = unsafe { sysconf(_SC_PAGESIZE) };
    if result > 0 {
        result as usize
    } else {
        4096
    }
}

#[cfg(windows)]
fn query_page_size() -> usize {
    unsafe {
        let mut si: SYSTEM_INFO = core::mem::zeroed();
        GetSystemInfo(&mut si);
        if si.dwPageSize > 0 {
            si.dwPageSize as usize
        } else {
            4096
        }
    }
}

pub fn align_up(size: usize, align: usize) -> usize {
    let rem = size % align;
    if rem == 0 {
        size
    } else {
        size + (align - rem)
    }
}

/// Maps a fresh, zero-filled, read-write anonymous region of exactly `size`
/// bytes (which must already be a whole multiple of `page_size()`).
/// Returns `None` on OS refusal; callers surface this as `OutOfMemory`.
pub fn map_pages(size: usize) -> Option<*mut u8> {
    debug_assert!(size > 0 && size % page_size() == 0);

    #[cfg(not(windows))]
    {
        let p = unsafe {
            mmap(
                null_mut(),
                size,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if p == MAP_FAILED {
            warn!("mmap failed for {} bytes", size);
            None
        } else {
            Some(p as *mut u8)
        }
    }

    #[cfg(windows)]
    {
        let p = unsafe {
            VirtualAlloc(
                null_mut(),
                size,
                MEM_RESERVE | MEM_COMMIT,
                PAGE_READWRITE,
            )
        };
        if p.is_null() {
            warn!("VirtualAlloc failed for {} bytes", size);
            None
        } else {
            Some(p as *mut u8)
        }
    }
}

/// Returns a previously mapped region to the OS.
///
/// # Safety
/// `base` must be exactly the pointer returned by a prior `map_pages` call
/// and `size` must be exactly the size passed to that call.
pub unsafe fn unmap_pages(base: *mut u8, size: usize) {
    #[cfg(not(windows))]
    {
        let err = unsafe { munmap(base as *mut _, size) } != 0;
        if err {
            warn!("munmap failed, addr {:p}, size {}", base, size);
        }
    }

    #[cfg(windows)]
    {
        let _ = size;
        let ok = unsafe { VirtualFree(base as LPVOID, 0, MEM_RELEASE) } != 0;
        if !ok {
            warn!("VirtualFree failed, addr {:p}", base);
        }
    }
}
