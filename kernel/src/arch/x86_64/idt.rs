//! IDT setup and IRQ dispatch.
//!
//! Exception handlers plus a small fixed window of device vectors
//! (0x30..0x38) whose handlers are registered at runtime (the xHCI MSI
//! lands here). The timer has its own dedicated vector.

use lazy_static::lazy_static;
use spin::Mutex;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

use super::{apic, gdt};

/// Local-APIC timer vector.
pub const TIMER_VECTOR: u8 = 0x20;
/// First runtime-registered device vector.
pub const IRQ_BASE_VECTOR: u8 = 0x30;
/// Number of runtime-registrable device vectors.
pub const IRQ_SLOTS: usize = 8;
/// Spurious-interrupt vector programmed into the APIC SVR.
pub const SPURIOUS_VECTOR: u8 = 0xFF;

type IrqHandler = fn();

static IRQ_HANDLERS: Mutex<[Option<IrqHandler>; IRQ_SLOTS]> = Mutex::new([None; IRQ_SLOTS]);

/// Register a handler for device vector `IRQ_BASE_VECTOR + slot`.
pub fn register_irq_handler(slot: usize, handler: IrqHandler) {
    if slot < IRQ_SLOTS {
        IRQ_HANDLERS.lock()[slot] = Some(handler);
    }
}

fn dispatch_irq(slot: usize) {
    let handler = IRQ_HANDLERS.lock()[slot];
    if let Some(h) = handler {
        h();
    }
    apic::eoi();
}

macro_rules! irq_stub {
    ($name:ident, $slot:expr) => {
        extern "x86-interrupt" fn $name(_frame: InterruptStackFrame) {
            dispatch_irq($slot);
        }
    };
}

irq_stub!(irq_handler_0, 0);
irq_stub!(irq_handler_1, 1);
irq_stub!(irq_handler_2, 2);
irq_stub!(irq_handler_3, 3);
irq_stub!(irq_handler_4, 4);
irq_stub!(irq_handler_5, 5);
irq_stub!(irq_handler_6, 6);
irq_stub!(irq_handler_7, 7);

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt.invalid_opcode.set_handler_fn(invalid_opcode_handler);
        idt.general_protection_fault
            .set_handler_fn(general_protection_handler);
        idt.page_fault.set_handler_fn(page_fault_handler);
        // SAFETY: the IST index refers to the dedicated double-fault stack
        // installed by gdt::init before the IDT is loaded.
        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(gdt::DOUBLE_FAULT_IST_INDEX);
        }
        idt[TIMER_VECTOR].set_handler_fn(timer_handler);
        idt[SPURIOUS_VECTOR].set_handler_fn(spurious_handler);
        idt[IRQ_BASE_VECTOR].set_handler_fn(irq_handler_0);
        idt[IRQ_BASE_VECTOR + 1].set_handler_fn(irq_handler_1);
        idt[IRQ_BASE_VECTOR + 2].set_handler_fn(irq_handler_2);
        idt[IRQ_BASE_VECTOR + 3].set_handler_fn(irq_handler_3);
        idt[IRQ_BASE_VECTOR + 4].set_handler_fn(irq_handler_4);
        idt[IRQ_BASE_VECTOR + 5].set_handler_fn(irq_handler_5);
        idt[IRQ_BASE_VECTOR + 6].set_handler_fn(irq_handler_6);
        idt[IRQ_BASE_VECTOR + 7].set_handler_fn(irq_handler_7);
        idt
    };
}

pub fn init() {
    IDT.load();
}

extern "x86-interrupt" fn breakpoint_handler(frame: InterruptStackFrame) {
    log::warn!(target: "idt", "breakpoint at {:#x}", frame.instruction_pointer.as_u64());
}

extern "x86-interrupt" fn invalid_opcode_handler(frame: InterruptStackFrame) {
    if frame.code_segment.rpl() == x86_64::PrivilegeLevel::Ring3 {
        log::error!(target: "idt",
            "invalid opcode in pid {} at {:#x}, terminating",
            crate::sched::current_pid(),
            frame.instruction_pointer.as_u64());
        crate::sched::exit_current();
    }
    panic!("invalid opcode in kernel at {:#x}", frame.instruction_pointer.as_u64());
}

extern "x86-interrupt" fn general_protection_handler(frame: InterruptStackFrame, code: u64) {
    if frame.code_segment.rpl() == x86_64::PrivilegeLevel::Ring3 {
        log::error!(target: "idt",
            "#GP({:#x}) in pid {} at {:#x}, terminating",
            code,
            crate::sched::current_pid(),
            frame.instruction_pointer.as_u64());
        crate::sched::exit_current();
    }
    panic!(
        "#GP({:#x}) in kernel at {:#x}",
        code,
        frame.instruction_pointer.as_u64()
    );
}

extern "x86-interrupt" fn page_fault_handler(frame: InterruptStackFrame, code: PageFaultErrorCode) {
    let addr = x86_64::registers::control::Cr2::read()
        .map(|a| a.as_u64())
        .unwrap_or(0);
    if code.contains(PageFaultErrorCode::USER_MODE) {
        log::error!(target: "idt",
            "page fault in pid {}: addr={:#x} code={:?} rip={:#x}, terminating",
            crate::sched::current_pid(),
            addr,
            code,
            frame.instruction_pointer.as_u64());
        crate::sched::exit_current();
    }
    panic!(
        "kernel page fault: addr={:#x} code={:?} rip={:#x}",
        addr,
        code,
        frame.instruction_pointer.as_u64()
    );
}

extern "x86-interrupt" fn double_fault_handler(frame: InterruptStackFrame, _code: u64) -> ! {
    panic!("double fault: {:#?}", frame);
}

extern "x86-interrupt" fn timer_handler(_frame: InterruptStackFrame) {
    // EOI before the tick: the tick may context-switch away and not return
    // here for a full slice.
    apic::eoi();
    crate::timer::on_tick();
    crate::sched::tick();
}

extern "x86-interrupt" fn spurious_handler(_frame: InterruptStackFrame) {}
