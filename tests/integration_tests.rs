use blockheap::{Heap, ALIGN};
use std::thread;
use std::vec::Vec;

#[test]
fn init_destroy_round_trip() {
    let h = Heap::init().expect("init");
    h.destroy();
}

#[test]
fn allocations_are_aligned_and_non_overlapping() {
    let h = Heap::init().expect("init");
    let mut ptrs = Vec::new();
    for n in [1usize, 7, 16, 17, 255, 1024, 4096] {
        let p = h.alloc(n);
        assert!(!p.is_null(), "alloc({}) failed", n);
        assert_eq!(p as usize % ALIGN, 0);
        ptrs.push((p, n));
    }
    for i in 0..ptrs.len() {
        for j in (i + 1)..ptrs.len() {
            let (pi, ni) = ptrs[i];
            let (pj, _) = ptrs[j];
            let (lo, hi) = if (pi as usize) < (pj as usize) { (pi, pj) } else { (pj, pi) };
            assert!((lo as usize) + ni <= hi as usize, "overlap between allocations");
        }
    }
    for (p, _) in ptrs {
        h.free(p);
    }
    h.destroy();
}

#[test]
fn freed_small_block_is_reused_under_worst_fit() {
    let h = Heap::init().expect("init");
    let _a = h.alloc(50);
    let b = h.alloc(120);
    h.free(b);
    let c = h.alloc(120);
    assert_eq!(b, c, "worst-fit should hand back the only adequate free block");
    h.free(c);
    h.destroy();
}

#[test]
fn coalescing_reclaims_neighbouring_frees() {
    let h = Heap::init().expect("init");
    let a = h.alloc(64);
    let b = h.alloc(64);
    let c = h.alloc(64);
    h.free(a);
    h.free(c);
    h.free(b); // merges with both neighbours
    // No single one of the three original 64-byte blocks can satisfy this on
    // its own; succeeding proves all three (plus their two now-reclaimed
    // headers) coalesced into one contiguous free block.
    let big = h.alloc(200);
    assert!(!big.is_null());
    h.free(big);
    h.destroy();
}

#[test]
fn large_allocation_releases_its_page_on_free() {
    let h = Heap::init().expect("init");
    let page = blockheap_page_size();
    let before = h.mapped_bytes();
    let p = h.alloc(10 * page);
    assert!(!p.is_null());
    assert!(h.mapped_bytes() > before);
    h.free(p);
    assert_eq!(h.mapped_bytes(), before, "fully-free page must be unmapped");
    h.destroy();
}

#[test]
fn calloc_zeroes_the_full_region() {
    let h = Heap::init().expect("init");
    let p = h.calloc(100, 10);
    assert!(!p.is_null());
    unsafe {
        for i in 0..1000 {
            assert_eq!(*p.add(i), 0);
        }
    }
    h.free(p);
    h.destroy();
}

#[test]
fn calloc_overflow_is_null_and_maps_nothing() {
    let h = Heap::init().expect("init");
    let before = h.mapped_bytes();
    let p = h.calloc(usize::MAX, 2);
    assert!(p.is_null());
    assert_eq!(h.mapped_bytes(), before);
    h.destroy();
}

#[test]
fn realloc_grows_shrinks_and_preserves_bytes() {
    let h = Heap::init().expect("init");
    let p = h.alloc(32);
    unsafe { core::ptr::write_bytes(p, 0x42, 32) };

    let shrunk = h.realloc(p, 4);
    assert_eq!(shrunk, p, "shrinking must be a no-op per spec");

    let grown = h.realloc(shrunk, 4096);
    assert!(!grown.is_null());
    unsafe {
        for i in 0..4 {
            assert_eq!(*grown.add(i), 0x42, "byte {} not preserved across realloc move", i);
        }
    }
    h.free(grown);
    h.destroy();
}

#[test]
fn double_free_is_silently_ignored_and_heap_stays_usable() {
    let h = Heap::init().expect("init");
    let a = h.alloc(50);
    h.free(a);
    h.free(a);
    h.free(a);
    let b = h.alloc(10);
    assert!(!b.is_null());
    h.free(b);
    h.destroy();
}

#[test]
fn null_free_is_a_no_op() {
    let h = Heap::init().expect("init");
    h.free(core::ptr::null_mut());
    h.destroy();
}

#[test]
fn scenario_one_full_lifecycle() {
    let h = Heap::init().expect("init");
    let page = blockheap_page_size();

    let mut p1 = h.alloc(1000);
    let mut p2 = h.alloc(5000);
    assert!(!p1.is_null() && !p2.is_null());

    h.free(p2);
    p1 = h.realloc(p1, 4000);
    assert!(!p1.is_null());

    p2 = h.calloc(10000, 1);
    assert!(!p2.is_null());

    let p3 = h.alloc(2 * page);
    assert!(!p3.is_null());

    h.free(p1);
    h.free(p2);
    h.free(p3);

    h.destroy();
}

#[test]
fn stress_many_threads_share_one_heap() {
    let h = std::sync::Arc::new(Heap::init().expect("init"));
    let handles: Vec<_> = (0..8)
        .map(|i| {
            let h = h.clone();
            thread::spawn(move || {
                let mut ptrs: Vec<(*mut u8, usize, u8)> = Vec::new();
                for j in 0..250usize {
                    let size = 8 + (i * 53 + j) % 2000;
                    let fill = ((i + j) % 256) as u8;
                    let p = h.alloc(size);
                    assert!(!p.is_null());
                    unsafe { core::ptr::write_bytes(p, fill, size) };
                    ptrs.push((p, size, fill));
                    if ptrs.len() > 16 {
                        let (old, old_size, old_fill) = ptrs.remove(0);
                        unsafe {
                            for k in 0..old_size {
                                assert_eq!(*old.add(k), old_fill);
                            }
                        }
                        h.free(old);
                    }
                }
                for (p, _, _) in ptrs {
                    h.free(p);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    let h = std::sync::Arc::try_unwrap(h).unwrap_or_else(|_| panic!("dangling heap refs"));
    h.destroy();
}

fn blockheap_page_size() -> usize {
    // A conservative stand-in for the system page size without exposing an
    // OS-specific API across the crate boundary: large enough on every
    // platform this crate targets to force a grow() past a single page.
    4096
}
