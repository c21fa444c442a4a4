//! Kernel heap.
//!
//! Backs `alloc` for kernel objects (ELF file buffers, window metadata,
//! VFS overlay files). The heap lives in a contiguous frame run aliased
//! through the direct map, so no extra mapping work is needed.

use crate::{
    error::KernelResult,
    mm::{frame_allocator, hhdm},
};

/// Kernel heap size: 8 MiB. Large enough to stage a whole user ELF image
/// while it is being mapped.
pub const HEAP_SIZE: usize = 8 * 1024 * 1024;
const HEAP_PAGES: usize = HEAP_SIZE / frame_allocator::FRAME_SIZE;

/// Carve the heap out of physical memory and hand it to the global
/// allocator. Called once during boot, after the frame allocator is up.
#[cfg(target_os = "none")]
pub fn init() -> KernelResult<()> {
    let phys = frame_allocator::allocate_contiguous(HEAP_PAGES)?;
    let virt = hhdm::phys_to_virt(phys);
    // SAFETY: the frame run was just allocated for exclusive heap use and
    // its direct-map alias is mapped and writable.
    unsafe {
        crate::ALLOCATOR.lock().init(virt as *mut u8, HEAP_SIZE);
    }
    log::info!(target: "mm", "kernel heap: {} KiB at {:#x}", HEAP_SIZE / 1024, virt);
    Ok(())
}

#[cfg(not(target_os = "none"))]
pub fn init() -> KernelResult<()> {
    // Host builds use the system allocator.
    let _ = hhdm::offset();
    Ok(())
}
