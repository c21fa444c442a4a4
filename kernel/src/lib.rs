//! ZenithOS kernel library.
//!
//! Single-core x86_64 kernel: process scheduler and address-space
//! manager, fast-syscall boundary, I/O redirection rings, window server,
//! xHCI host controller with HID input, and a user-reachable TCP/IP
//! stack. The binary crate (`main.rs`) drives boot; this library holds
//! everything else and also builds for the host triple so the
//! hardware-independent logic runs under `cargo test`.

#![no_std]
#![feature(abi_x86_interrupt)]
#![cfg_attr(target_os = "none", feature(alloc_error_handler))]

extern crate alloc;

// Host builds (unit tests) link std and use the system allocator.
#[cfg(not(target_os = "none"))]
extern crate std;

#[cfg(target_os = "none")]
use linked_list_allocator::LockedHeap;

#[cfg(target_os = "none")]
#[global_allocator]
pub static ALLOCATOR: LockedHeap = LockedHeap::empty();

#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

#[macro_use]
pub mod print;

pub mod arch;
pub mod drivers;
pub mod elf;
pub mod error;
pub mod fs;
pub mod graphics;
pub mod ipc;
pub mod klog;
pub mod mm;
pub mod net;
pub mod sched;
pub mod serial;
pub mod syscall;
pub mod timer;
pub mod win;

/// Heap allocation failure in a no_std kernel is unrecoverable.
#[cfg(target_os = "none")]
#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("kernel heap allocation failed: {:?}", layout);
}
