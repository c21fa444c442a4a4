//! Address-space manager.
//!
//! Mapping primitives that operate on a *target* PML4 physical address: the
//! caller's process may differ from the one being mutated, so all table
//! walks go through the direct map and never touch CR3. The kernel half
//! (entries 256–511 of the top table) is aliased from the master PML4 into
//! every process and is immutable after boot; the user half (0–255) is
//! per-process and is reclaimed leaf-first on process death.

use core::sync::atomic::{AtomicU64, Ordering};

use x86_64::structures::paging::PageTableFlags;

use crate::{
    error::{KernelError, KernelResult},
    mm::{frame_allocator, hhdm},
};

const ENTRY_COUNT: usize = 512;
const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// Kernel master PML4, captured from CR3 at boot. Source of the shared
/// kernel half for every process address space.
static MASTER_PML4: AtomicU64 = AtomicU64::new(0);

pub fn set_master_pml4(phys: u64) {
    MASTER_PML4.store(phys, Ordering::Release);
}

pub fn master_pml4() -> u64 {
    MASTER_PML4.load(Ordering::Acquire)
}

fn table_mut(phys: u64) -> &'static mut [u64; ENTRY_COUNT] {
    // SAFETY: `phys` is a page-table frame owned by this module (allocated
    // by it or handed over at boot) and the direct map covers it.
    unsafe { &mut *(hhdm::phys_to_virt(phys) as *mut [u64; ENTRY_COUNT]) }
}

#[inline]
fn pml4_index(virt: u64) -> usize {
    ((virt >> 39) & 0x1FF) as usize
}

#[inline]
fn pdpt_index(virt: u64) -> usize {
    ((virt >> 30) & 0x1FF) as usize
}

#[inline]
fn pd_index(virt: u64) -> usize {
    ((virt >> 21) & 0x1FF) as usize
}

#[inline]
fn pt_index(virt: u64) -> usize {
    ((virt >> 12) & 0x1FF) as usize
}

/// Follow `entry`, allocating a zeroed table when absent. Interior flags
/// are permissive; the leaf PTE enforces the real policy.
fn ensure_table(entry: &mut u64, interior_flags: PageTableFlags) -> KernelResult<u64> {
    if *entry & PageTableFlags::PRESENT.bits() == 0 {
        let phys = frame_allocator::allocate_zeroed()?;
        *entry = phys | interior_flags.bits();
        return Ok(phys);
    }
    Ok(*entry & ADDR_MASK)
}

fn map_in(pml4_phys: u64, phys: u64, virt: u64, leaf_flags: PageTableFlags) -> KernelResult<()> {
    let interior =
        PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE;

    let pml4 = table_mut(pml4_phys);
    let pdpt_phys = ensure_table(&mut pml4[pml4_index(virt)], interior)?;
    let pdpt = table_mut(pdpt_phys);
    let pd_phys = ensure_table(&mut pdpt[pdpt_index(virt)], interior)?;
    let pd = table_mut(pd_phys);
    let pt_phys = ensure_table(&mut pd[pd_index(virt)], interior)?;
    let pt = table_mut(pt_phys);
    pt[pt_index(virt)] = (phys & ADDR_MASK) | leaf_flags.bits();
    Ok(())
}

/// Install a 4 KiB user mapping (present | writable | user).
pub fn map_user(pml4_phys: u64, phys: u64, virt: u64) -> KernelResult<()> {
    map_in(
        pml4_phys,
        phys,
        virt,
        PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE,
    )
}

/// Install a 4 KiB user mapping with the write-combining memory type.
/// Relies on PAT entry 1 being reprogrammed to WC at boot
/// ([`crate::arch::x86_64::pat`]), which the PWT bit then selects.
pub fn map_user_wc(pml4_phys: u64, phys: u64, virt: u64) -> KernelResult<()> {
    map_in(
        pml4_phys,
        phys,
        virt,
        PageTableFlags::PRESENT
            | PageTableFlags::WRITABLE
            | PageTableFlags::USER_ACCESSIBLE
            | PageTableFlags::WRITE_THROUGH,
    )
}

/// Map device MMIO at its direct-map alias in the master PML4, uncacheable.
/// Must happen before the first user PML4 is created so the kernel-half
/// alias picks it up.
pub fn map_mmio(phys: u64) -> KernelResult<()> {
    map_in(
        master_pml4(),
        phys,
        hhdm::phys_to_virt(phys),
        PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::NO_CACHE,
    )
}

/// Clear the leaf PTE for `virt` and, if the target address space is live,
/// invalidate the TLB entry. The frame itself is not freed.
pub fn unmap_user(pml4_phys: u64, virt: u64) {
    let pml4 = table_mut(pml4_phys);
    let e4 = pml4[pml4_index(virt)];
    if e4 & PageTableFlags::PRESENT.bits() == 0 {
        return;
    }
    let pdpt = table_mut(e4 & ADDR_MASK);
    let e3 = pdpt[pdpt_index(virt)];
    if e3 & PageTableFlags::PRESENT.bits() == 0 {
        return;
    }
    let pd = table_mut(e3 & ADDR_MASK);
    let e2 = pd[pd_index(virt)];
    if e2 & PageTableFlags::PRESENT.bits() == 0 {
        return;
    }
    let pt = table_mut(e2 & ADDR_MASK);
    pt[pt_index(virt)] = 0;

    #[cfg(target_os = "none")]
    {
        use x86_64::registers::control::Cr3;
        if Cr3::read().0.start_address().as_u64() == pml4_phys {
            x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(virt));
        }
    }
}

/// Walk the target address space and resolve `virt` to a physical address.
pub fn translate(pml4_phys: u64, virt: u64) -> Option<u64> {
    let present = PageTableFlags::PRESENT.bits();
    let huge = PageTableFlags::HUGE_PAGE.bits();

    let e4 = table_mut(pml4_phys)[pml4_index(virt)];
    if e4 & present == 0 {
        return None;
    }
    let e3 = table_mut(e4 & ADDR_MASK)[pdpt_index(virt)];
    if e3 & present == 0 {
        return None;
    }
    if e3 & huge != 0 {
        return Some((e3 & ADDR_MASK & !0x3FFF_FFFF) + (virt & 0x3FFF_FFFF));
    }
    let e2 = table_mut(e3 & ADDR_MASK)[pd_index(virt)];
    if e2 & present == 0 {
        return None;
    }
    if e2 & huge != 0 {
        return Some((e2 & ADDR_MASK & !0x1F_FFFF) + (virt & 0x1F_FFFF));
    }
    let e1 = table_mut(e2 & ADDR_MASK)[pt_index(virt)];
    if e1 & present == 0 {
        return None;
    }
    Some((e1 & ADDR_MASK) + (virt & 0xFFF))
}

/// Allocate a fresh PML4: zeroed user half, kernel half aliased from the
/// master table.
pub fn create_user_pml4() -> KernelResult<u64> {
    let master = master_pml4();
    if master == 0 {
        return Err(KernelError::InvalidState {
            expected: "master PML4 captured",
            actual: "uninitialized",
        });
    }
    let phys = frame_allocator::allocate_zeroed()?;
    let new = table_mut(phys);
    let src = table_mut(master);
    new[ENTRY_COUNT / 2..].copy_from_slice(&src[ENTRY_COUNT / 2..]);
    Ok(phys)
}

/// Free every physical frame reachable from the user half of `pml4_phys`
/// (leaf frames and interior table frames) and clear the entries. The PML4
/// frame itself stays allocated; the process teardown frees it last.
pub fn free_user_half(pml4_phys: u64) {
    let present = PageTableFlags::PRESENT.bits();
    let huge = PageTableFlags::HUGE_PAGE.bits();
    let pml4 = table_mut(pml4_phys);

    for e4 in pml4[..ENTRY_COUNT / 2].iter_mut() {
        if *e4 & present == 0 {
            continue;
        }
        let pdpt_phys = *e4 & ADDR_MASK;
        let pdpt = table_mut(pdpt_phys);
        for e3 in pdpt.iter_mut() {
            if *e3 & present == 0 || *e3 & huge != 0 {
                continue;
            }
            let pd_phys = *e3 & ADDR_MASK;
            let pd = table_mut(pd_phys);
            for e2 in pd.iter_mut() {
                if *e2 & present == 0 || *e2 & huge != 0 {
                    continue;
                }
                let pt_phys = *e2 & ADDR_MASK;
                let pt = table_mut(pt_phys);
                for e1 in pt.iter_mut() {
                    if *e1 & present != 0 {
                        frame_allocator::free(*e1 & ADDR_MASK, 1);
                        *e1 = 0;
                    }
                }
                frame_allocator::free(pt_phys, 1);
                *e2 = 0;
            }
            frame_allocator::free(pd_phys, 1);
            *e3 = 0;
        }
        frame_allocator::free(pdpt_phys, 1);
        *e4 = 0;
    }
}

#[cfg(test)]
mod tests {
    extern crate alloc;

    use alloc::{boxed::Box, vec};

    use super::*;
    use crate::mm::frame_allocator::{BitmapFrameAllocator, FRAME_SIZE};

    /// Stand up a fake physical arena: frame numbers [0, n) backed by host
    /// memory, with the direct-map offset pointing at the arena base. The
    /// whole mm stack then runs unmodified.
    fn arena_setup(frames: usize) -> u64 {
        #[repr(align(4096))]
        struct Arena([u8; FRAME_SIZE]);
        let mem = Box::leak(
            (0..frames)
                .map(|_| Arena([0; FRAME_SIZE]))
                .collect::<alloc::vec::Vec<_>>()
                .into_boxed_slice(),
        );
        let base = mem.as_ptr() as u64;
        hhdm::init(base);
        let bitmap = Box::leak(vec![0u8; frames.div_ceil(8)].into_boxed_slice());
        let mut a = BitmapFrameAllocator::new(bitmap, frames);
        a.free_range(0, frames);
        // Frame 0 doubles as the "uninitialized" sentinel for MASTER_PML4;
        // reserve it here the same way the real boot path does (mm::init).
        a.reserve_range(0, 1);
        frame_allocator::reset_with(a);
        base
    }

    /// Single scenario test: the globals (allocator, HHDM offset, master
    /// PML4) are process-wide, so the walk/map/free laws are exercised in
    /// one sequence rather than racing across the parallel test harness.
    #[test]
    fn address_space_lifecycle_is_frame_balanced() {
        arena_setup(256);

        // Fake master PML4 with an empty kernel half.
        let master = frame_allocator::allocate_zeroed().unwrap();
        set_master_pml4(master);

        let baseline = frame_allocator::free_frames();

        // create_user_pml4 + free_user_half is frame-balanced.
        let pml4 = create_user_pml4().unwrap();
        let page_a = frame_allocator::allocate_zeroed().unwrap();
        let page_b = frame_allocator::allocate_zeroed().unwrap();
        map_user(pml4, page_a, 0x40000000).unwrap();
        map_user(pml4, page_b, 0x40001000).unwrap();

        // Mappings resolve to the frames we installed.
        assert_eq!(translate(pml4, 0x40000000), Some(page_a));
        assert_eq!(translate(pml4, 0x40001777), Some(page_b + 0x777));
        assert_eq!(translate(pml4, 0x40002000), None);

        // Unmap clears the leaf but keeps the frame allocated.
        unmap_user(pml4, 0x40001000);
        assert_eq!(translate(pml4, 0x40001000), None);
        // Re-map so free_user_half owns both data pages again.
        map_user(pml4, page_b, 0x40001000).unwrap();

        free_user_half(pml4);
        frame_allocator::free(pml4, 1);
        assert_eq!(frame_allocator::free_frames(), baseline);

        // A second address space sees the kernel half but not the user half.
        let pml4b = create_user_pml4().unwrap();
        assert_eq!(translate(pml4b, 0x40000000), None);
        free_user_half(pml4b);
        frame_allocator::free(pml4b, 1);
        assert_eq!(frame_allocator::free_frames(), baseline);
    }
}
