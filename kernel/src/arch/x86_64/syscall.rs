//! SYSCALL/SYSRET setup and the entry trampoline.
//!
//! The trampoline swaps to the per-process kernel stack published in
//! `KERNEL_RSP` (rewritten on every context switch, in lockstep with
//! TSS.rsp0), builds a [`SyscallFrame`] and calls the dispatcher. IF is
//! masked on entry via FMASK; handlers that wait re-enable it themselves.

use core::arch::naked_asm;

use x86_64::{
    registers::{
        model_specific::{Efer, EferFlags, LStar, SFMask, Star},
        rflags::RFlags,
    },
    VirtAddr,
};

use super::gdt;

/// Per-process kernel stack top, read by the trampoline on every SYSCALL.
#[no_mangle]
static mut KERNEL_RSP: u64 = 0;

/// Scratch slot for the user RSP between the stack swap and the frame push.
/// A single cell suffices: one core, and IF is masked from entry until the
/// frame lives on the kernel stack.
#[no_mangle]
static mut USER_RSP_SCRATCH: u64 = 0;

/// Publish the kernel stack top for the next SYSCALL from ring 3.
pub fn set_kernel_rsp(top: u64) {
    // SAFETY: single core; SYSCALL cannot preempt a ring-0 store.
    unsafe {
        core::ptr::write(core::ptr::addr_of_mut!(KERNEL_RSP), top);
    }
}

/// Saved register frame handed to the dispatcher. Field order mirrors the
/// push sequence in [`syscall_entry`]; keep the two in sync.
#[repr(C)]
#[derive(Debug)]
pub struct SyscallFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub arg6: u64,
    pub arg5: u64,
    pub arg4: u64,
    pub arg3: u64,
    pub arg2: u64,
    pub arg1: u64,
    pub syscall_nr: u64,
    pub user_rip: u64,
    pub user_rflags: u64,
    pub user_rsp: u64,
}

/// SYSCALL instruction entry point.
///
/// Register conventions on entry: RAX = syscall number, RDI/RSI/RDX/R10/
/// R8/R9 = args 1..6, RCX = user RIP, R11 = user RFLAGS.
///
/// # Safety
/// Reached only via the SYSCALL instruction with the MSRs programmed by
/// [`init`].
#[unsafe(naked)]
pub unsafe extern "C" fn syscall_entry() {
    naked_asm!(
        // Stash user RSP, adopt the per-process kernel stack.
        "mov [rip + {user_rsp}], rsp",
        "mov rsp, [rip + {kernel_rsp}]",
        // Frame: user state, number, args, callee-saved.
        "push qword ptr [rip + {user_rsp}]",
        "push r11",
        "push rcx",
        "push rax",
        "push rdi",
        "push rsi",
        "push rdx",
        "push r10",
        "push r8",
        "push r9",
        "push rbx",
        "push rbp",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov rdi, rsp",
        "call {dispatch}",
        // Result stays in RAX; unwind the frame.
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbp",
        "pop rbx",
        "add rsp, 7 * 8",
        "pop rcx",
        "pop r11",
        "pop rsp",
        "sysretq",
        user_rsp = sym USER_RSP_SCRATCH,
        kernel_rsp = sym KERNEL_RSP,
        dispatch = sym crate::syscall::dispatch,
    );
}

/// Program EFER.SCE, STAR, LSTAR and FMASK.
pub fn init() {
    let sel = gdt::selectors();
    // SAFETY: boot-time MSR programming with selectors that satisfy the
    // STAR layout contract (validated by Star::write).
    unsafe {
        Efer::update(|flags| flags.insert(EferFlags::SYSTEM_CALL_EXTENSIONS));
        LStar::write(VirtAddr::new(syscall_entry as usize as u64));
        // User selectors come out of the GDT with RPL 3 already set.
        Star::write(sel.user_code, sel.user_data, sel.kernel_code, sel.kernel_data)
            .expect("GDT layout violates the STAR contract");
        // Mask IF on entry; handlers that block re-enable it.
        SFMask::write(RFlags::INTERRUPT_FLAG);
    }
    log::info!(target: "syscall", "SYSCALL/SYSRET initialized, LSTAR={:#x}",
        syscall_entry as usize);
}
