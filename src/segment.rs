//! Carves a single OS-mapped page into its sentinel-bounded block layout.
//!
//! A page is: `[ optional control block ][ start header + payload ][ end
//! sentinel ]`. The control block only exists on the very first page, where
//! it holds the heap's own bookkeeping (see `init::HeapState`) -- there is
//! nothing else to allocate it *from* yet.

use core::ptr::NonNull;

use crate::os;
use crate::types::{align, AllocError, BlockHeader, HEADER_SIZE};

pub struct PageLayout {
    pub base: *mut u8,
    pub total_len: usize,
    pub start: NonNull<BlockHeader>,
    pub control: Option<NonNull<u8>>,
}

/// Maps a fresh page sized to hold `control_bytes` (0 unless this is the
/// first page) plus two headers plus at least `payload_bytes` of usable
/// space, and initializes its start header and end sentinel.
pub fn new_page(payload_bytes: usize, control_bytes: usize) -> Result<PageLayout, AllocError> {
    let control_bytes = align(control_bytes).ok_or(AllocError::SizeOverflow)?;

    let needed = control_bytes
        .checked_add(HEADER_SIZE)
        .and_then(|v| v.checked_add(HEADER_SIZE))
        .and_then(|v| v.checked_add(payload_bytes))
        .ok_or(AllocError::SizeOverflow)?;

    let page_size = os::page_size();
    let map_size = os::align_up(needed, page_size);

    let base = os::map_pages(map_size).ok_or(AllocError::OutOfMemory)?;

    let control = if control_bytes > 0 {
        Some(unsafe { NonNull::new_unchecked(base) })
    } else {
        None
    };

    let start_size = map_size - control_bytes - 2 * HEADER_SIZE;
    let start_ptr = unsafe { base.add(control_bytes) } as *mut BlockHeader;
    let start = unsafe {
        BlockHeader::init_in_place(
            NonNull::new_unchecked(start_ptr),
            start_size,
            true,
            None,
            None,
            0,
        )
    };

    let end_ptr = unsafe { base.add(map_size - HEADER_SIZE) } as *mut BlockHeader;
    let end = unsafe {
        BlockHeader::init_in_place(
            NonNull::new_unchecked(end_ptr),
            0,
            false,
            Some(start),
            None,
            map_size,
        )
    };

    unsafe {
        let mut start = start;
        start.as_mut().next = Some(end);
        start.as_mut().seal();
    }

    Ok(PageLayout {
        base,
        total_len: map_size,
        start,
        control,
    })
}

/// Returns a page previously obtained from `new_page` back to the OS.
///
/// # Safety
/// `base`/`total_len` must be exactly the values recorded when the page was
/// mapped (the end sentinel's `garbage` field is the source of truth for
/// `total_len`), and no live references into the page may outlive this call.
pub unsafe fn release_page(base: *mut u8, total_len: usize) {
    unsafe { os::unmap_pages(base, total_len) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_and_end_are_linked_and_sealed() {
        let page = new_page(64, 0).expect("map a fresh page");
        unsafe {
            let start = page.start.as_ref();
            assert!(start.is_valid());
            assert!(start.is_free);
            assert!(start.is_start_header());
            assert!(!start.is_end_sentinel());

            let end = start.next.expect("start links to end sentinel");
            let end_ref = end.as_ref();
            assert!(end_ref.is_valid());
            assert!(!end_ref.is_free);
            assert!(end_ref.is_end_sentinel());
            assert_eq!(end_ref.garbage, page.total_len);
            assert_eq!(end_ref.prev, Some(page.start));

            release_page(page.base, page.total_len);
        }
    }

    #[test]
    fn first_page_reserves_control_block() {
        let page = new_page(64, 128).expect("map with control block");
        assert!(page.control.is_some());
        let control = page.control.unwrap().as_ptr() as usize;
        let start = page.start.as_ptr() as usize;
        assert!(start > control);
        assert!(start - control >= 128);
        unsafe { release_page(page.base, page.total_len) };
    }
}
