//! GDT and TSS.
//!
//! Segment layout is fixed by the SYSCALL/SYSRET STAR contract:
//! kernel code 0x08, kernel data 0x10, user data 0x18, user code 0x20,
//! TSS 0x28. SYSCALL loads CS/SS from the kernel pair; 64-bit SYSRET loads
//! CS = user_base+16 and SS = user_base+8 with RPL 3, which this ordering
//! satisfies with a user base of 0x10.

use core::ptr::{addr_of, addr_of_mut};

use x86_64::{
    instructions::tables::load_tss,
    registers::segmentation::{Segment, CS, DS, ES, SS},
    structures::{
        gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector},
        tss::TaskStateSegment,
    },
    VirtAddr,
};

/// IST slot used by the double-fault handler.
pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

const IST_STACK_SIZE: usize = 4096 * 5;

static mut DOUBLE_FAULT_STACK: [u8; IST_STACK_SIZE] = [0; IST_STACK_SIZE];
static mut TSS: TaskStateSegment = TaskStateSegment::new();
static mut GDT: GlobalDescriptorTable = GlobalDescriptorTable::new();

#[derive(Clone, Copy)]
pub struct Selectors {
    pub kernel_code: SegmentSelector,
    pub kernel_data: SegmentSelector,
    pub user_data: SegmentSelector,
    pub user_code: SegmentSelector,
    pub tss: SegmentSelector,
}

static SELECTORS: spin::Once<Selectors> = spin::Once::new();

pub fn selectors() -> Selectors {
    *SELECTORS.get().expect("GDT not initialized")
}

/// Build and load the GDT, load the TSS, reload segment registers.
pub fn init() {
    // SAFETY: runs once on the boot CPU before interrupts are enabled;
    // nothing else references these statics yet.
    unsafe {
        let tss = &mut *addr_of_mut!(TSS);
        let stack_top =
            VirtAddr::from_ptr(addr_of!(DOUBLE_FAULT_STACK)) + IST_STACK_SIZE as u64;
        tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] = stack_top;

        let gdt = &mut *addr_of_mut!(GDT);
        let kernel_code = gdt.append(Descriptor::kernel_code_segment());
        let kernel_data = gdt.append(Descriptor::kernel_data_segment());
        let user_data = gdt.append(Descriptor::user_data_segment());
        let user_code = gdt.append(Descriptor::user_code_segment());
        let tss_sel = gdt.append(Descriptor::tss_segment(&*addr_of!(TSS)));

        (*addr_of!(GDT)).load_unsafe();
        CS::set_reg(kernel_code);
        SS::set_reg(kernel_data);
        DS::set_reg(kernel_data);
        ES::set_reg(kernel_data);
        load_tss(tss_sel);

        SELECTORS.call_once(|| Selectors {
            kernel_code,
            kernel_data,
            user_data,
            user_code,
            tss: tss_sel,
        });
    }
}

/// Point TSS.rsp0 at the given kernel stack top. Rewritten on every context
/// switch together with the syscall trampoline's `KERNEL_RSP`; missing
/// either one corrupts the next ring-3 interrupt or syscall.
pub fn set_kernel_stack(top: u64) {
    // SAFETY: single core; the CPU reads rsp0 only on a ring transition,
    // which cannot happen mid-store.
    unsafe {
        (*addr_of_mut!(TSS)).privilege_stack_table[0] = VirtAddr::new(top);
    }
}
