//! ZenithOS boot path.
//!
//! One-shot bring-up in dependency order — serial/logging, descriptor
//! tables, physical memory and the heap, APIC timer, syscall MSRs, VFS,
//! PCI and the xHCI controller, the network stack, the scheduler — then
//! spawn init and settle into the idle loop. The tick preempts from here
//! on; the idle context is what the scheduler falls back to when no slot
//! is Ready.

#![no_std]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(not(target_os = "none"))]
extern crate std;

#[cfg(target_os = "none")]
mod boot {
    use bootloader_api::{
        config::Mapping,
        info::{MemoryRegionKind, Optional},
        entry_point, BootInfo, BootloaderConfig,
    };
    use zenith_kernel::{arch, fs, graphics, klog, mm, net, sched, serial};

    pub static BOOTLOADER_CONFIG: BootloaderConfig = {
        let mut config = BootloaderConfig::new_default();
        config.mappings.physical_memory = Some(Mapping::Dynamic);
        config
    };

    entry_point!(kernel_main, config = &BOOTLOADER_CONFIG);

    fn kernel_main(boot_info: &'static mut BootInfo) -> ! {
        serial::init();
        klog::init();
        log::info!(target: "boot", "ZenithOS {} starting", env!("CARGO_PKG_VERSION"));

        arch::x86_64::early_init();

        let physical_memory_offset = boot_info
            .physical_memory_offset
            .into_option()
            .expect("bootloader did not map physical memory");
        mm::init(&boot_info.memory_regions, physical_memory_offset)
            .expect("memory management init failed");

        // The framebuffer geometry + physical base back fb_info/fb_map.
        if let Optional::Some(fb) = &mut boot_info.framebuffer {
            let info = fb.info();
            let virt = fb.buffer_mut().as_mut_ptr() as u64;
            let phys = mm::page_table::translate(
                mm::page_table::master_pml4(),
                virt,
            )
            .unwrap_or(0);
            graphics::init(graphics::Framebuffer {
                width: info.width as u64,
                height: info.height as u64,
                pitch: (info.stride * info.bytes_per_pixel) as u64,
                bpp: (info.bytes_per_pixel * 8) as u64,
                phys_base: phys,
            });
        }

        arch::x86_64::init().expect("platform init failed");

        // Read-only root filesystem from the boot ramdisk.
        match boot_info.ramdisk_addr.into_option() {
            Some(addr) if boot_info.ramdisk_len > 0 => {
                // SAFETY: bootloader-reserved region, mapped and immutable
                // for the kernel's lifetime.
                let image = unsafe {
                    core::slice::from_raw_parts(addr as *const u8, boot_info.ramdisk_len as usize)
                };
                fs::init(image);
            }
            _ => log::warn!(target: "boot", "no ramdisk provided, VFS is empty"),
        }

        zenith_kernel::drivers::pci::scan();
        if zenith_kernel::drivers::usb::xhci::init().is_err() {
            log::warn!(target: "boot", "continuing without USB");
        }
        net::init();

        sched::init();
        match sched::spawn("0:/init.elf", "") {
            Ok(pid) => log::info!(target: "boot", "spawned init as pid {}", pid),
            Err(e) => log::warn!(target: "boot", "no init program: {}", e),
        }

        log::info!(target: "boot",
            "boot complete, {} MiB free",
            mm::frame_allocator::free_frames() * mm::FRAME_SIZE / (1024 * 1024));

        // Sanity check the memory map contained usable RAM at all.
        debug_assert!(boot_info
            .memory_regions
            .iter()
            .any(|r| r.kind == MemoryRegionKind::Usable));

        sched::idle_loop();
    }

    #[panic_handler]
    fn panic(info: &core::panic::PanicInfo) -> ! {
        log::error!(target: "panic", "{}", info);
        zenith_kernel::println!("[PANIC] {}", info);
        zenith_kernel::arch::halt();
    }
}

#[cfg(not(target_os = "none"))]
fn main() {
    // The kernel binary has no host-side behavior; `cargo test` exercises
    // the library.
}
