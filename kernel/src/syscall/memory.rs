//! User heap syscalls.

use crate::{
    mm::{frame_allocator, page_table, FRAME_SIZE},
    sched,
};

/// Bump-allocate user pages. Rounds the request up to whole pages, maps
/// them at the process heap pointer, returns the VA (0 on failure).
pub fn sys_alloc(size: u64) -> i64 {
    let size = if size == 0 {
        FRAME_SIZE as u64
    } else {
        size.next_multiple_of(FRAME_SIZE as u64)
    };
    let num_pages = size / FRAME_SIZE as u64;

    let target = sched::with_current(|p| (p.pml4_phys, p.heap_next));
    let Some((pml4, base_va)) = target else {
        return 0;
    };

    for i in 0..num_pages {
        let Ok(page) = frame_allocator::allocate_zeroed() else {
            return 0;
        };
        if page_table::map_user(pml4, page, base_va + i * FRAME_SIZE as u64).is_err() {
            frame_allocator::free(page, 1);
            return 0;
        }
    }

    sched::with_current(|p| p.heap_next += size);
    base_va as i64
}

/// No-op in this kernel: the user heap never reuses freed ranges, so a
/// long-lived process leaks virtual (and physical) heap space. Reclaim
/// happens wholesale when the process dies.
pub fn sys_free(_va: u64) -> i64 {
    0
}
