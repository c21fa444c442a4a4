//! System information, framebuffer, terminal metrics, time, randomness,
//! device listing and reset.

extern crate alloc;

use alloc::format;

use crate::{
    drivers::{input, pci, usb::xhci},
    error::{KernelError, KernelResult},
    graphics, net, sched,
    syscall::abi::{self, copy_cstr, DevInfo, FbInfo, SysInfo},
    timer,
};

use super::{user_bytes_mut, user_write};

const OS_NAME: &str = "ZenithOS";
const API_VERSION: u32 = 2;

pub fn sys_get_info(out_ptr: u64) -> i64 {
    if out_ptr == 0 {
        return -1;
    }
    let mut info = SysInfo {
        os_name: [0; 32],
        os_version: [0; 32],
        api_version: API_VERSION,
        max_processes: sched::MAX_PROCESSES as u32,
    };
    copy_cstr(&mut info.os_name, OS_NAME);
    copy_cstr(&mut info.os_version, env!("CARGO_PKG_VERSION"));
    user_write(out_ptr, info);
    0
}

pub fn sys_fb_info(out_ptr: u64) -> i64 {
    if out_ptr == 0 {
        return -1;
    }
    let fb = graphics::framebuffer().unwrap_or_default();
    user_write(
        out_ptr,
        FbInfo {
            width: fb.width,
            height: fb.height,
            pitch: fb.pitch,
            bpp: fb.bpp,
            user_addr: 0,
        },
    );
    0
}

/// Map the framebuffer into the caller, write-combining, at a fixed VA.
pub fn sys_fb_map() -> KernelResult<i64> {
    const FB_USER_VA: u64 = 0x5000_0000;

    let fb = graphics::framebuffer().ok_or(KernelError::NotFound {
        resource: "framebuffer",
    })?;
    let pml4 = sched::with_current(|p| p.pml4_phys).ok_or(KernelError::InvalidState {
        expected: "process context",
        actual: "idle",
    })?;

    let size = fb.height * fb.pitch;
    let pages = crate::mm::pages_for(size);
    for i in 0..pages as u64 {
        crate::mm::page_table::map_user_wc(
            pml4,
            fb.phys_base + i * crate::mm::FRAME_SIZE as u64,
            FB_USER_VA + i * crate::mm::FRAME_SIZE as u64,
        )?;
    }
    log::info!(target: "graphics",
        "mapped framebuffer for pid {}: {} pages at {:#x}",
        sched::current_pid(), pages, FB_USER_VA);
    Ok(FB_USER_VA as i64)
}

/// (rows << 32) | cols. A redirected process reports its virtual terminal
/// geometry; everyone else sees the console metrics.
pub fn sys_term_size() -> i64 {
    let redirected = sched::with_redir_target(|owner| {
        (owner.term_cols > 0 && owner.term_rows > 0)
            .then_some(((owner.term_rows as u64) << 32) | owner.term_cols as u64 & 0xFFFF_FFFF)
    })
    .flatten();
    if let Some(packed) = redirected {
        return packed as i64;
    }
    let (rows, cols) = graphics::console_dimensions();
    ((rows << 32) | (cols & 0xFFFF_FFFF)) as i64
}

/// scale_x == 0 queries the current scale; otherwise rescales and returns
/// the new packed (rows, cols).
pub fn sys_term_scale(scale_x: u64, scale_y: u64) -> i64 {
    if scale_x == 0 {
        let (sx, sy) = graphics::font_scale();
        return ((sy << 32) | (sx & 0xFFFF_FFFF)) as i64;
    }
    graphics::set_font_scale(scale_x, scale_y);
    let (rows, cols) = graphics::console_dimensions();
    ((rows << 32) | (cols & 0xFFFF_FFFF)) as i64
}

pub fn sys_get_time(out_ptr: u64) -> i64 {
    if out_ptr == 0 {
        return -1;
    }
    let now = timer::date_time();
    user_write(
        out_ptr,
        abi::DateTime {
            year: now.year,
            month: now.month,
            day: now.day,
            hour: now.hour,
            minute: now.minute,
            second: now.second,
        },
    );
    0
}

/// xorshift64* stream reseeded with RDTSC per block. RDRAND is avoided on
/// purpose: firmware can disable the unit while CPUID still advertises
/// it, which faults on real hardware.
pub fn sys_get_random(buf_ptr: u64, len: u64) -> i64 {
    let Some(buf) = user_bytes_mut(buf_ptr, len) else {
        return -1;
    };

    #[cfg(target_os = "none")]
    fn tsc() -> u64 {
        // SAFETY: RDTSC is unprivileged and side-effect free.
        unsafe { core::arch::x86_64::_rdtsc() }
    }
    #[cfg(not(target_os = "none"))]
    fn tsc() -> u64 {
        0x9E37_79B9_7F4A_7C15
    }

    let mut state = tsc();
    for chunk in buf.chunks_mut(8) {
        state ^= tsc();
        state ^= state >> 12;
        state ^= state << 25;
        state ^= state >> 27;
        let value = state.wrapping_mul(0x2545_F491_4F6C_DD1D);
        let bytes = value.to_le_bytes();
        chunk.copy_from_slice(&bytes[..chunk.len()]);
    }
    len as i64
}

pub fn sys_mouse_state(out_ptr: u64) -> i64 {
    if out_ptr == 0 {
        return -1;
    }
    user_write(out_ptr, input::mouse_state());
    0
}

/// Reboot by triple fault: load an empty IDT and take an interrupt.
pub fn sys_reset() -> i64 {
    #[cfg(target_os = "none")]
    {
        use x86_64::structures::DescriptorTablePointer;
        let null_idt = DescriptorTablePointer {
            limit: 0,
            base: x86_64::VirtAddr::new(0),
        };
        // SAFETY: intentionally fatal; the faulting interrupt with no IDT
        // escalates to a triple fault and resets the machine.
        unsafe {
            x86_64::instructions::tables::lidt(&null_idt);
            core::arch::asm!("int3", options(noreturn));
        }
    }
    #[cfg(not(target_os = "none"))]
    unreachable!("reset is only meaningful on hardware");
}

pub fn sys_dev_list(out_ptr: u64, max_count: i32) -> i64 {
    if out_ptr == 0 || max_count <= 0 {
        return 0;
    }
    let mut count = 0i64;
    let mut add = |info: DevInfo| {
        if count < max_count as i64 {
            user_write(
                out_ptr + count as u64 * core::mem::size_of::<DevInfo>() as u64,
                info,
            );
            count += 1;
        }
    };

    add(DevInfo::new(0, "Processor", "x86_64, 1 core"));
    add(DevInfo::new(1, "Local APIC", "Per-CPU interrupt controller"));
    add(DevInfo::new(2, "LAPIC Timer", "Local APIC periodic timer"));

    if xhci::is_initialized() {
        for slot in 1..=xhci::MAX_SLOTS {
            let Some(dev) = xhci::device_summary(slot) else {
                continue;
            };
            let name = match (dev.iface_class, dev.iface_protocol) {
                (0x03, 0x01) => "USB HID Keyboard",
                (0x03, 0x02) => "USB HID Mouse",
                (0x03, _) => "USB HID Device",
                (0x08, _) => "USB Mass Storage",
                (0x09, _) => "USB Hub",
                _ => "USB Device",
            };
            add(DevInfo::new(
                4,
                name,
                &format!(
                    "Port {}, VID:{:04x} PID:{:04x}",
                    dev.port_id, dev.vendor_id, dev.product_id
                ),
            ));
        }
    }

    if net::device::is_registered() {
        add(DevInfo::new(5, "Ethernet NIC", "Registered network device"));
    }
    if graphics::framebuffer().is_some() {
        add(DevInfo::new(6, "Framebuffer", "Boot-provided linear framebuffer"));
    }

    for dev in pci::devices() {
        add(DevInfo::new(
            7,
            pci::class_name(dev.class_code, dev.subclass),
            &format!(
                "{:02x}:{:02x}.{} {:04x}:{:04x}",
                dev.bus, dev.device, dev.function, dev.vendor_id, dev.device_id
            ),
        ));
    }

    count
}
