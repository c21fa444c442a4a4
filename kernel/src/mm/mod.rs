//! Memory management: physical frame allocator, higher-half direct map,
//! per-process page tables and the kernel heap.

pub mod frame_allocator;
pub mod heap;
pub mod hhdm;
pub mod page_table;

pub use frame_allocator::FRAME_SIZE;

use bootloader_api::info::{MemoryRegionKind, MemoryRegions};

use crate::error::{KernelError, KernelResult};

/// Round a byte count up to whole pages.
pub fn pages_for(bytes: u64) -> usize {
    (bytes as usize).div_ceil(FRAME_SIZE)
}

/// Bring up physical memory management from the bootloader's memory map.
///
/// The frame bitmap is placed at the start of the largest usable region;
/// everything usable (minus the bitmap itself) is released to the pool.
pub fn init(regions: &MemoryRegions, physical_memory_offset: u64) -> KernelResult<()> {
    hhdm::init(physical_memory_offset);

    let usable = regions
        .iter()
        .filter(|r| r.kind == MemoryRegionKind::Usable);

    let max_end = usable
        .clone()
        .map(|r| r.end)
        .max()
        .ok_or(KernelError::OutOfMemory)?;
    let frame_count = (max_end as usize) / FRAME_SIZE;
    let bitmap_bytes = frame_count.div_ceil(8);
    let bitmap_pages = pages_for(bitmap_bytes as u64);

    let host = usable
        .clone()
        .find(|r| (r.end - r.start) as usize >= bitmap_pages * FRAME_SIZE)
        .ok_or(KernelError::OutOfMemory)?;
    let bitmap_phys = (host.start as usize).next_multiple_of(FRAME_SIZE);

    // SAFETY: the bitmap region is usable RAM covered by the direct map and
    // is reserved below before any frame can be handed out of it.
    let bitmap: &'static mut [u8] = unsafe {
        core::slice::from_raw_parts_mut(
            hhdm::phys_to_virt(bitmap_phys as u64) as *mut u8,
            bitmap_bytes,
        )
    };

    let mut allocator = frame_allocator::BitmapFrameAllocator::new(bitmap, frame_count);
    for region in regions
        .iter()
        .filter(|r| r.kind == MemoryRegionKind::Usable)
    {
        let start = (region.start as usize).div_ceil(FRAME_SIZE);
        let end = (region.end as usize) / FRAME_SIZE;
        if end > start {
            allocator.free_range(start, end - start);
        }
    }
    allocator.reserve_range(bitmap_phys / FRAME_SIZE, bitmap_pages);
    // Never hand out the zero frame; a zero physical address doubles as
    // "no PML4" in the process table.
    allocator.reserve_range(0, 1);

    frame_allocator::install(allocator);

    #[cfg(target_os = "none")]
    {
        use x86_64::registers::control::Cr3;
        page_table::set_master_pml4(Cr3::read().0.start_address().as_u64());
    }

    heap::init()?;
    Ok(())
}
