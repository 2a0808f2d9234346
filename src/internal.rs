//! The free-list manager and the allocation engine: everything that decides
//! *which* block to hand back, how to split and coalesce, and when a page
//! goes back to the OS. Operates on a `HeapCore` whose caller (`init::Heap`)
//! is responsible for holding the heap-wide lock around every call here.

use core::ptr::NonNull;

use crate::segment;
use crate::types::{align, AllocError, BlockHeader, HEADER_SIZE};

/// The heap's registry head, free-list head and cumulative mapped byte
/// count -- the mutable state the allocation engine operates on. Lives
/// embedded in the first mapped page; see `init::HeapState`.
pub struct HeapCore {
    pub registry_head: NonNull<BlockHeader>,
    pub free_head: Option<NonNull<BlockHeader>>,
    pub mapped_bytes: usize,
    /// Base and length of the first page, which is never released back to
    /// the OS because it carries the heap's own control block.
    pub first_page: (*mut u8, usize),
}

// ---------------------------------------------------------------------
// Free-list manager: LIFO insert-at-head, remove from any position.
// ---------------------------------------------------------------------

mod free_list {
    use super::*;

    /// Inserts `block` at the head of the free list.
    ///
    /// # Safety
    /// `block` must not already be a member of the free list and must not
    /// be a sentinel.
    pub unsafe fn insert(core: &mut HeapCore, mut block: NonNull<BlockHeader>) {
        unsafe {
            debug_assert!(!block.as_ref().is_end_sentinel());
            block.as_mut().prev_free = None;
            block.as_mut().next_free = core.free_head;
            if let Some(mut old_head) = core.free_head {
                old_head.as_mut().prev_free = Some(block);
                old_head.as_mut().seal();
            }
            block.as_mut().is_free = true;
            block.as_mut().seal();
            core.free_head = Some(block);
        }
    }

    /// Unlinks `block` from the free list, wherever it sits (head, middle,
    /// tail), and restores its former neighbours' checksums.
    ///
    /// # Safety
    /// `block` must currently be a member of the free list rooted at
    /// `core.free_head`.
    pub unsafe fn remove(core: &mut HeapCore, mut block: NonNull<BlockHeader>) {
        unsafe {
            let prev = block.as_ref().prev_free;
            let next = block.as_ref().next_free;
            match prev {
                Some(mut p) => {
                    p.as_mut().next_free = next;
                    p.as_mut().seal();
                }
                None => core.free_head = next,
            }
            if let Some(mut n) = next {
                n.as_mut().prev_free = prev;
                n.as_mut().seal();
            }
            block.as_mut().prev_free = None;
            block.as_mut().next_free = None;
            block.as_mut().seal();
        }
    }
}

/// Inserts a page's freshly-initialized start header into the free list.
/// Used by `init::Heap::init` to seed the first page and by `grow` for
/// every subsequent one.
///
/// # Safety
/// `block` must be a just-initialized, free, non-sentinel header not yet on
/// any free list.
pub unsafe fn seed_free_block(core: &mut HeapCore, block: NonNull<BlockHeader>) {
    unsafe { free_list::insert(core, block) }
}

// ---------------------------------------------------------------------
// Allocation engine
// ---------------------------------------------------------------------

/// Scans the free list and returns the block maximizing `size - s` among
/// those with `size >= s` (worst-fit among adequate blocks), or `None` if
/// no free block is adequate (including an empty free list).
unsafe fn find_worst_fit(core: &HeapCore, s: usize) -> Option<NonNull<BlockHeader>> {
    let mut best: Option<NonNull<BlockHeader>> = None;
    let mut best_slack = 0usize;
    let mut cursor = core.free_head;
    while let Some(block) = cursor {
        let header = unsafe { block.as_ref() };
        if header.size >= s {
            let slack = header.size - s;
            if best.is_none() || slack > best_slack {
                best = Some(block);
                best_slack = slack;
            }
        }
        cursor = header.next_free;
    }
    best
}

/// Walks the registry from `registry_head` to the last (globally final)
/// end sentinel.
unsafe fn last_end_sentinel(core: &HeapCore) -> NonNull<BlockHeader> {
    let mut cursor = core.registry_head;
    loop {
        let next = unsafe { cursor.as_ref().next };
        match next {
            Some(n) => cursor = n,
            None => return cursor,
        }
    }
}

/// Maps a fresh page sized for at least `payload_bytes`, links it onto the
/// end of the registry, and inserts its start header into the free list.
unsafe fn grow(core: &mut HeapCore, payload_bytes: usize) -> Option<NonNull<BlockHeader>> {
    let page = segment::new_page(payload_bytes, 0).ok()?;

    let mut last = unsafe { last_end_sentinel(core) };
    unsafe {
        last.as_mut().next = Some(page.start);
        last.as_mut().seal();
        let mut start = page.start;
        start.as_mut().prev = Some(last);
        start.as_mut().seal();

        free_list::insert(core, page.start);
    }
    core.mapped_bytes += page.total_len;
    Some(page.start)
}

/// Pre: `block.size >= s + HEADER_SIZE + ALIGN`. Splits off the trailing
/// `block.size - s - HEADER_SIZE` bytes into a new free block, leaving
/// `block` sized exactly `s`, and returns the new tail block. The caller is
/// responsible for inserting the returned block into the free list -- it is
/// not yet reachable from `core.free_head` when this returns.
unsafe fn split(mut block: NonNull<BlockHeader>, s: usize) -> NonNull<BlockHeader> {
    unsafe {
        let old_size = block.as_ref().size;
        let old_next = block.as_ref().next;
        let new_size = old_size - s - HEADER_SIZE;

        let new_header_ptr = (BlockHeader::payload_ptr(block)).add(s) as *mut BlockHeader;
        let new_block = BlockHeader::init_in_place(
            NonNull::new_unchecked(new_header_ptr),
            new_size,
            true,
            Some(block),
            old_next,
            0,
        );

        if let Some(mut n) = old_next {
            n.as_mut().prev = Some(new_block);
            n.as_mut().seal();
        }

        block.as_mut().size = s;
        block.as_mut().next = Some(new_block);
        block.as_mut().seal();

        new_block
    }
}

/// Allocates a payload of at least `n` bytes, or returns `None` on
/// `SizeOverflow`/`OutOfMemory`.
pub unsafe fn allocate(core: &mut HeapCore, n: usize) -> Option<*mut u8> {
    let s = align(n)?;

    let candidate = unsafe { find_worst_fit(core, s) };
    let block = match candidate {
        Some(b) => b,
        None => unsafe { grow(core, s) }?,
    };

    unsafe {
        let size = block.as_ref().size;
        if size >= s + HEADER_SIZE + crate::types::ALIGN {
            let tail = split(block, s);
            free_list::insert(core, tail);
        }

        free_list::remove(core, block);
        let mut b = block;
        b.as_mut().is_free = false;
        b.as_mut().seal();

        Some(BlockHeader::payload_ptr(block))
    }
}

/// Merges `block` with any immediately-adjacent free, non-sentinel
/// neighbours (first the previous, then the next), removing each absorbed
/// neighbour from the free list. Returns the resulting block, whose address
/// equals the original `block`'s unless the previous neighbour was absorbed.
unsafe fn coalesce(core: &mut HeapCore, block: NonNull<BlockHeader>) -> NonNull<BlockHeader> {
    let mut block = block;

    unsafe {
        if let Some(prev) = block.as_ref().prev {
            let prev_is_free_block = prev.as_ref().is_free && !prev.as_ref().is_end_sentinel();
            if prev_is_free_block {
                free_list::remove(core, prev);
                let blk_size = block.as_ref().size;
                let next = block.as_ref().next;

                let mut prev = prev;
                prev.as_mut().size += blk_size + HEADER_SIZE;
                prev.as_mut().next = next;
                if let Some(mut n) = next {
                    n.as_mut().prev = Some(prev);
                    n.as_mut().seal();
                }
                prev.as_mut().seal();
                block = prev;
            }
        }

        if let Some(next) = block.as_ref().next {
            let next_is_free_block = next.as_ref().is_free && !next.as_ref().is_end_sentinel();
            if next_is_free_block {
                free_list::remove(core, next);
                let next_size = next.as_ref().size;
                let next_next = next.as_ref().next;

                let mut block_m = block;
                block_m.as_mut().size += next_size + HEADER_SIZE;
                block_m.as_mut().next = next_next;
                if let Some(mut n) = next_next {
                    n.as_mut().prev = Some(block_m);
                    n.as_mut().seal();
                }
                block_m.as_mut().seal();
            }
        }
    }

    block
}

/// If `block` is now the sole block of its page (next is an end sentinel,
/// and block is itself a start header), splices the page out of the
/// registry and returns it to the OS. Never releases the first page.
unsafe fn try_release_page(core: &mut HeapCore, block: NonNull<BlockHeader>) {
    unsafe {
        if block == core.registry_head {
            return; // first-page protection
        }

        let next = block.as_ref().next;
        let is_next_end_sentinel = matches!(next, Some(n) if n.as_ref().is_end_sentinel());
        if !is_next_end_sentinel {
            return;
        }
        if !block.as_ref().is_start_header() {
            return;
        }

        let end = next.unwrap();
        let page_base = block.as_ptr() as *mut u8;
        let page_len = end.as_ref().garbage;

        free_list::remove(core, block);

        let prev = block.as_ref().prev;
        let after_end = end.as_ref().next;
        match prev {
            Some(mut p) => {
                p.as_mut().next = after_end;
                p.as_mut().seal();
            }
            None => core.registry_head = after_end.unwrap_or(core.registry_head),
        }
        if let Some(mut a) = after_end {
            a.as_mut().prev = prev;
            a.as_mut().seal();
        }

        segment::release_page(page_base, page_len);
        core.mapped_bytes -= page_len;
    }
}

/// Validates the header at `payload - HEADER_SIZE`, frees it, coalesces with
/// free neighbours, reinserts into the free list, and attempts to release
/// the page. A checksum mismatch or a block that is already free (the
/// double-free guard -- see `DESIGN.md`) makes this a silent no-op.
pub unsafe fn deallocate(core: &mut HeapCore, payload: *mut u8) {
    if payload.is_null() {
        return;
    }

    unsafe {
        let header = BlockHeader::from_payload(payload);
        if !header.as_ref().is_valid() {
            return; // CorruptedHeader
        }
        if header.as_ref().is_free {
            return; // already freed -- treat as corrupted, do not touch it twice
        }

        let merged = coalesce(core, header);
        free_list::insert(core, merged);
        try_release_page(core, merged);
    }
}

/// `None` if `payload` is not a live, validly-checksummed block owned by
/// this heap; otherwise the current payload size in bytes.
pub unsafe fn current_size(payload: *mut u8) -> Option<usize> {
    if payload.is_null() {
        return None;
    }
    unsafe {
        let header = BlockHeader::from_payload(payload);
        if header.as_ref().is_valid() && !header.as_ref().is_free {
            Some(header.as_ref().size)
        } else {
            None
        }
    }
}

/// Resizes the block behind `payload` in place when possible, otherwise
/// moves it. Returns `None` (leaving the original block untouched) only
/// when a fresh allocation was required and failed.
pub unsafe fn reallocate(core: &mut HeapCore, payload: *mut u8, new_size: usize) -> Option<*mut u8> {
    let current = unsafe { current_size(payload) }?;
    unsafe {
        let header = BlockHeader::from_payload(payload);

        let s = align(new_size)?;
        if current >= s {
            return Some(payload);
        }

        let prev_free = match header.as_ref().prev {
            Some(p) => p.as_ref().is_free && !p.as_ref().is_end_sentinel(),
            None => false,
        };
        let next_free = match header.as_ref().next {
            Some(n) => n.as_ref().is_free && !n.as_ref().is_end_sentinel(),
            None => false,
        };

        if prev_free || next_free {
            let prev_gain = if prev_free {
                header.as_ref().prev.unwrap().as_ref().size + HEADER_SIZE
            } else {
                0
            };
            let next_gain = if next_free {
                header.as_ref().next.unwrap().as_ref().size + HEADER_SIZE
            } else {
                0
            };
            let potential = current + prev_gain + next_gain;

            if potential >= s {
                let merged = coalesce(core, header);

                if merged != header {
                    let new_payload = BlockHeader::payload_ptr(merged);
                    core::ptr::copy(payload, new_payload, current);
                }

                let mut merged = merged;
                if merged.as_ref().size >= s + HEADER_SIZE + crate::types::ALIGN {
                    let tail = split(merged, s);
                    free_list::insert(core, tail);
                }
                merged.as_mut().is_free = false;
                merged.as_mut().seal();

                return Some(BlockHeader::payload_ptr(merged));
            }
        }

        let fresh = allocate(core, new_size)?;
        core::ptr::copy_nonoverlapping(payload, fresh, current);
        deallocate(core, payload);
        Some(fresh)
    }
}

/// `allocate(n)` followed by zero-filling exactly `n` bytes.
pub unsafe fn allocate_zeroed(core: &mut HeapCore, n: usize) -> Option<*mut u8> {
    let p = unsafe { allocate(core, n)? };
    unsafe { core::ptr::write_bytes(p, 0, n) };
    Some(p)
}

/// `count * elem_size` with overflow detection performed *before* any
/// allocation is attempted, then `allocate_zeroed`.
pub unsafe fn count_allocate(core: &mut HeapCore, count: usize, elem_size: usize) -> Result<*mut u8, AllocError> {
    let total = count
        .checked_mul(elem_size)
        .ok_or(AllocError::SizeOverflow)?;
    unsafe { allocate_zeroed(core, total) }.ok_or(AllocError::OutOfMemory)
}
