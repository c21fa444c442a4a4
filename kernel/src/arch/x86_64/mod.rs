//! x86_64 hardware abstraction: descriptor tables, interrupts, the local
//! APIC, context switching and the fast-syscall trampoline.

pub mod apic;
pub mod context;
pub mod gdt;
pub mod idt;
pub mod pat;
pub mod rtc;
pub mod syscall;

/// One-shot CPU setup performed early in boot, before memory management.
pub fn early_init() {
    gdt::init();
    idt::init();
}

/// Second-stage setup once paging and the frame allocator are live.
pub fn init() -> crate::error::KernelResult<()> {
    pat::init();
    apic::init()?;
    syscall::init();
    Ok(())
}
