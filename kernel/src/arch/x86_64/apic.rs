//! Local APIC: spurious vector, EOI, and the periodic timer that drives
//! scheduling. The timer is calibrated once against PIT channel 2.

use core::sync::atomic::{AtomicU64, Ordering};

use x86_64::{instructions::port::Port, registers::model_specific::Msr};

use crate::{
    error::{KernelError, KernelResult},
    mm::{hhdm, page_table},
    timer,
};

use super::idt::{SPURIOUS_VECTOR, TIMER_VECTOR};

const IA32_APIC_BASE: u32 = 0x1B;
const APIC_BASE_ENABLE: u64 = 1 << 11;

/// MSI address targeting the BSP with fixed delivery / physical destination.
/// Handed to PCI devices (xHCI) when programming their MSI capability.
pub const MSI_ADDRESS_BASE: u32 = 0xFEE0_0000;

// Register offsets from the APIC base.
const LAPIC_TPR: u64 = 0x080;
const LAPIC_EOI: u64 = 0x0B0;
const LAPIC_SVR: u64 = 0x0F0;
const LAPIC_LVT_TIMER: u64 = 0x320;
const LAPIC_TIMER_INIT_COUNT: u64 = 0x380;
const LAPIC_TIMER_CUR_COUNT: u64 = 0x390;
const LAPIC_TIMER_DIV: u64 = 0x3E0;

/// SVR software-enable bit.
const SVR_ENABLE: u32 = 1 << 8;
/// LVT timer periodic mode bit.
const LVT_TIMER_PERIODIC: u32 = 1 << 17;
/// Divide configuration for divide-by-16.
const TIMER_DIV_16: u32 = 0b0011;

static LAPIC_BASE: AtomicU64 = AtomicU64::new(0);

fn write_reg(offset: u64, value: u32) {
    let base = LAPIC_BASE.load(Ordering::Relaxed);
    // SAFETY: the LAPIC MMIO page was mapped uncacheable during init and
    // the offset is one of the architectural register offsets.
    unsafe {
        core::ptr::write_volatile((base + offset) as *mut u32, value);
    }
}

fn read_reg(offset: u64) -> u32 {
    let base = LAPIC_BASE.load(Ordering::Relaxed);
    // SAFETY: see write_reg.
    unsafe { core::ptr::read_volatile((base + offset) as *const u32) }
}

/// Signal end-of-interrupt.
pub fn eoi() {
    write_reg(LAPIC_EOI, 0);
}

/// Enable the local APIC and start the 10 ms periodic scheduler tick.
pub fn init() -> KernelResult<()> {
    let mut msr = Msr::new(IA32_APIC_BASE);
    // SAFETY: IA32_APIC_BASE is a valid architectural MSR in ring 0.
    let base_val = unsafe { msr.read() };
    let phys = base_val & 0xF_FFFF_F000;
    page_table::map_mmio(phys)?;
    LAPIC_BASE.store(hhdm::phys_to_virt(phys), Ordering::Relaxed);
    // SAFETY: setting the architectural global-enable bit.
    unsafe {
        msr.write(base_val | APIC_BASE_ENABLE);
    }

    write_reg(LAPIC_SVR, SVR_ENABLE | SPURIOUS_VECTOR as u32);
    write_reg(LAPIC_TPR, 0);

    let ticks_per_slice = calibrate_timer()?;
    write_reg(LAPIC_TIMER_DIV, TIMER_DIV_16);
    write_reg(
        LAPIC_LVT_TIMER,
        LVT_TIMER_PERIODIC | TIMER_VECTOR as u32,
    );
    write_reg(LAPIC_TIMER_INIT_COUNT, ticks_per_slice);

    log::info!(target: "apic",
        "local APIC at {:#x}, timer {} ticks / {} ms slice",
        phys, ticks_per_slice, timer::TICK_MS);
    Ok(())
}

/// Measure how many divide-by-16 APIC timer ticks elapse in one scheduler
/// slice, using PIT channel 2 in one-shot mode as the reference.
fn calibrate_timer() -> KernelResult<u32> {
    const PIT_FREQUENCY: u32 = 1_193_182;
    let pit_count = (PIT_FREQUENCY * timer::TICK_MS as u32 / 1000) as u16;

    let mut gate: Port<u8> = Port::new(0x61);
    let mut cmd: Port<u8> = Port::new(0x43);
    let mut data: Port<u8> = Port::new(0x42);

    write_reg(LAPIC_TIMER_DIV, TIMER_DIV_16);
    // SAFETY: standard PIT/keyboard-controller ports; channel 2 is wired to
    // the speaker gate and is free for timing use.
    unsafe {
        // Gate channel 2 on, speaker off.
        let g = gate.read();
        gate.write((g & !0x02) | 0x01);
        // Channel 2, lobyte/hibyte, mode 0 (interrupt on terminal count).
        cmd.write(0xB0u8);
        data.write((pit_count & 0xFF) as u8);
        data.write((pit_count >> 8) as u8);
    }

    write_reg(LAPIC_TIMER_INIT_COUNT, u32::MAX);

    // Bounded wait for the PIT OUT pin.
    let mut spins: u64 = 0;
    // SAFETY: port read as above.
    while unsafe { gate.read() } & 0x20 == 0 {
        spins += 1;
        if spins > 100_000_000 {
            return Err(KernelError::Timeout {
                operation: "PIT calibration",
            });
        }
        core::hint::spin_loop();
    }

    let elapsed = u32::MAX - read_reg(LAPIC_TIMER_CUR_COUNT);
    write_reg(LAPIC_TIMER_INIT_COUNT, 0);
    if elapsed == 0 {
        return Err(KernelError::HardwareError {
            device: "lapic-timer",
            code: 0,
        });
    }
    Ok(elapsed)
}
