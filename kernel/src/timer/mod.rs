//! Tick source and time keeping.
//!
//! The local APIC fires every [`TICK_MS`] milliseconds; the handler bumps
//! the tick counter, runs deferred work (USB hot-plug processing) and then
//! hands control to the scheduler for slice accounting.

use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

pub use crate::arch::x86_64::rtc::DateTime;

/// Scheduler tick period in milliseconds.
pub const TICK_MS: u64 = 10;

const MAX_DEFERRED: usize = 4;

static TICKS: AtomicU64 = AtomicU64::new(0);
static DEFERRED_WORK: Mutex<[Option<fn()>; MAX_DEFERRED]> = Mutex::new([None; MAX_DEFERRED]);

/// Ticks since boot.
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Milliseconds since boot, at tick granularity.
pub fn now_ms() -> u64 {
    ticks() * TICK_MS
}

/// Register a routine to run on every tick, outside the hot interrupt
/// paths that merely queue work (xHCI hot-plug lands here).
pub fn register_tick_work(work: fn()) {
    let mut slots = DEFERRED_WORK.lock();
    for slot in slots.iter_mut() {
        if slot.is_none() {
            *slot = Some(work);
            return;
        }
    }
    log::warn!(target: "timer", "deferred work table full, handler dropped");
}

/// Timer interrupt body. Runs with interrupts off.
pub fn on_tick() {
    TICKS.fetch_add(1, Ordering::Relaxed);
    let work = *DEFERRED_WORK.lock();
    for handler in work.into_iter().flatten() {
        handler();
    }
}

/// Wall-clock date and time.
pub fn date_time() -> DateTime {
    #[cfg(target_os = "none")]
    {
        crate::arch::x86_64::rtc::read()
    }
    #[cfg(not(target_os = "none"))]
    {
        DateTime::default()
    }
}

/// Sleep for at least `ms` milliseconds, yielding the CPU to any other
/// runnable process. Interrupts are enabled for the duration so the tick
/// keeps advancing even when the sleeper is the only process.
pub fn sleep_ms(ms: u64) {
    let deadline = now_ms() + ms;
    #[cfg(target_os = "none")]
    x86_64::instructions::interrupts::enable();
    while now_ms() < deadline {
        crate::sched::yield_now();
    }
}

/// Short bounded delay usable from any context, including the timer tick
/// itself (where the ms clock cannot advance). With interrupts enabled it
/// spins on the tick counter; with them masked it falls back to port 0x80
/// writes at roughly 1 µs apiece.
pub fn busy_wait_ms(ms: u64) {
    #[cfg(target_os = "none")]
    {
        use x86_64::instructions::port::Port;
        if x86_64::registers::rflags::read()
            .contains(x86_64::registers::rflags::RFlags::INTERRUPT_FLAG)
        {
            let start = now_ms();
            while now_ms() - start < ms {
                core::hint::spin_loop();
            }
        } else {
            let mut port: Port<u8> = Port::new(0x80);
            for _ in 0..ms * 1000 {
                // SAFETY: port 0x80 is the POST diagnostic port; writes are
                // side-effect free and take ~1 µs.
                unsafe {
                    port.write(0u8);
                }
            }
        }
    }
    #[cfg(not(target_os = "none"))]
    {
        let _ = ms;
    }
}

#[cfg(test)]
pub fn advance_ticks_for_test(n: u64) {
    TICKS.fetch_add(n, Ordering::Relaxed);
}
