//! Higher-half direct map.
//!
//! The bootloader maps all physical memory at a fixed offset in the upper
//! half. This module records that offset and supplies the `phys ↔ virt`
//! bijection every other kernel subsystem uses to touch physical pages.

use core::sync::atomic::{AtomicU64, Ordering};

static HHDM_OFFSET: AtomicU64 = AtomicU64::new(0);

/// Record the direct-map offset. Called once, before any translation.
pub fn init(offset: u64) {
    HHDM_OFFSET.store(offset, Ordering::Release);
}

pub fn offset() -> u64 {
    HHDM_OFFSET.load(Ordering::Acquire)
}

/// Kernel-virtual alias of a physical address.
#[inline]
pub fn phys_to_virt(phys: u64) -> u64 {
    offset() + phys
}

/// Physical address behind a direct-map alias. Only valid for addresses
/// produced by [`phys_to_virt`].
#[inline]
pub fn virt_to_phys(virt: u64) -> u64 {
    virt - offset()
}
