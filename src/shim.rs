//! The process-wide heap shim: four C-ABI symbols (`malloc`, `free`,
//! `realloc`, `calloc`) backed by a single, lazily-initialized global
//! `Heap`, plus a `GlobalAlloc` wrapper for Rust consumers who would rather
//! set `#[global_allocator]` than link against the C symbols directly.

use core::ffi::c_void;
use core::ptr::null_mut;
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::init::Heap;
use crate::types::ALIGN;

static GLOBAL_HEAP: AtomicPtr<()> = AtomicPtr::new(null_mut());

/// Double-checked, lock-free lazy init of the one process-global heap. The
/// re-entrancy hazard spec.md §5 calls out -- code running under the
/// heap's own lock must never itself allocate -- is why this path talks to
/// `os`/`segment` directly through `Heap::init` rather than through any
/// layer that might recurse back into `malloc`.
fn global_heap() -> *mut () {
    let existing = GLOBAL_HEAP.load(Ordering::Acquire);
    if !existing.is_null() {
        return existing;
    }

    match Heap::init() {
        Some(heap) => {
            let leaked = heap.into_raw();
            match GLOBAL_HEAP.compare_exchange(
                null_mut(),
                leaked,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => leaked,
                Err(winner) => {
                    // another thread won the race; drop our duplicate heap
                    unsafe { Heap::from_raw(leaked) }.destroy();
                    winner
                }
            }
        }
        None => null_mut(),
    }
}

fn with_global_heap<R>(f: impl FnOnce(&Heap) -> R, default: R) -> R {
    let raw = global_heap();
    if raw.is_null() {
        return default;
    }
    // Safety: `raw` was produced by `Heap::into_raw` and never reconstructed
    // elsewhere; `Heap`'s internal lock makes shared access across threads sound.
    let heap = unsafe { Heap::from_raw(raw) };
    let result = f(&heap);
    core::mem::forget(heap); // still owned by GLOBAL_HEAP
    result
}

/// # Safety
/// Standard `malloc` contract.
#[no_mangle]
pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
    with_global_heap(|h| h.alloc(size) as *mut c_void, null_mut())
}

/// # Safety
/// Standard `free` contract: `ptr` must be null or a pointer previously
/// returned by `malloc`/`calloc`/`realloc` on this process's global heap.
#[no_mangle]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    with_global_heap(|h| h.free(ptr as *mut u8), ())
}

/// # Safety
/// `realloc(null, n) == malloc(n)`; `realloc(p, 0)` frees `p` and returns
/// null, matching the platform-standard contract.
#[no_mangle]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    if ptr.is_null() {
        return unsafe { malloc(size) };
    }
    if size == 0 {
        unsafe { free(ptr) };
        return null_mut();
    }
    with_global_heap(|h| h.realloc(ptr as *mut u8, size) as *mut c_void, null_mut())
}

/// # Safety
/// Standard `calloc` contract. Overflow in `nmemb * size` is checked before
/// any allocation is attempted and yields a null return.
#[no_mangle]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut c_void {
    if nmemb.checked_mul(size).is_none() {
        return null_mut();
    }
    with_global_heap(|h| h.calloc(nmemb, size) as *mut c_void, null_mut())
}

/// `#[global_allocator]`-compatible wrapper around the same process-global
/// heap the C shim above uses. The natural Rust-idiomatic sibling of the C
/// symbols, not an additional feature: installing this or linking the C
/// symbols both route through the same `global_heap()`.
pub struct SystemHeap;

unsafe impl core::alloc::GlobalAlloc for SystemHeap {
    unsafe fn alloc(&self, layout: core::alloc::Layout) -> *mut u8 {
        if layout.align() > ALIGN {
            return null_mut(); // fixed alignment only; spec.md Non-goals
        }
        with_global_heap(|h| h.alloc(layout.size()), null_mut())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: core::alloc::Layout) {
        with_global_heap(|h| h.free(ptr), ())
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: core::alloc::Layout, new_size: usize) -> *mut u8 {
        if layout.align() > ALIGN {
            return null_mut();
        }
        with_global_heap(|h| h.realloc(ptr, new_size), null_mut())
    }

    unsafe fn alloc_zeroed(&self, layout: core::alloc::Layout) -> *mut u8 {
        if layout.align() > ALIGN {
            return null_mut();
        }
        with_global_heap(|h| h.calloc(1, layout.size()), null_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec::Vec;

    #[test]
    fn malloc_free_round_trip() {
        unsafe {
            let p = malloc(128);
            assert!(!p.is_null());
            assert_eq!(p as usize % ALIGN, 0);
            free(p);
        }
    }

    #[test]
    fn realloc_null_is_malloc_and_zero_size_is_free() {
        unsafe {
            let p = realloc(null_mut(), 64);
            assert!(!p.is_null());
            let q = realloc(p, 0);
            assert!(q.is_null());
        }
    }

    #[test]
    fn calloc_overflow_returns_null() {
        unsafe {
            assert!(calloc(usize::MAX, 2).is_null());
        }
    }

    #[test]
    fn concurrent_malloc_free_stress() {
        use std::thread;

        let handles: Vec<_> = (0..8)
            .map(|i| {
                thread::spawn(move || unsafe {
                    for j in 0..200 {
                        let size = 8 + (i * 37 + j) % 500;
                        let p = malloc(size);
                        assert!(!p.is_null());
                        core::ptr::write_bytes(p as *mut u8, 0xAB, size);
                        free(p);
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
    }
}
