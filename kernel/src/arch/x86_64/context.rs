//! Kernel context switch and the first entry into ring 3.
//!
//! The switch frame holds only the callee-saved registers; everything else
//! is dead across the call per the SysV ABI. A freshly spawned process gets
//! a hand-primed frame whose return address is the scheduler's startup
//! routine, so the very first switch "returns" into it.

use core::arch::naked_asm;

/// Swap callee-saved registers, RSP and CR3.
///
/// Stores the outgoing stack pointer through `old_rsp`, loads `new_rsp`,
/// and switches CR3 to `new_cr3` unless it is already active (the kernel
/// half is shared, so only the user half needs remapping).
///
/// # Safety
/// `old_rsp` must point at the saved-RSP slot of the outgoing context and
/// `new_rsp`/`new_cr3` must describe a context previously saved by this
/// function (or primed by spawn).
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(old_rsp: *mut u64, new_rsp: u64, new_cr3: u64) {
    naked_asm!(
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov [rdi], rsp",
        "mov rsp, rsi",
        "mov rax, cr3",
        "cmp rax, rdx",
        "je 2f",
        "mov cr3, rdx",
        "2:",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "ret",
    );
}

/// IRETQ into ring 3 at `entry` with the user stack loaded. Never returns.
///
/// Selector constants match the GDT layout (user data 0x18, user code
/// 0x20, both with RPL 3). RFLAGS carries IF so the timer can preempt.
///
/// # Safety
/// `entry` and `user_rsp` must be mapped user-accessible in the live
/// address space; the caller must have set TSS.rsp0 and `KERNEL_RSP`.
#[unsafe(naked)]
pub unsafe extern "C" fn enter_user(entry: u64, user_rsp: u64) -> ! {
    naked_asm!(
        "mov ax, 0x1B",
        "mov ds, ax",
        "mov es, ax",
        "push 0x1B",      // SS = user data | RPL3
        "push rsi",       // RSP
        "push 0x202",     // RFLAGS: IF set
        "push 0x23",      // CS = user code | RPL3
        "push rdi",       // RIP
        "iretq",
    );
}

/// Save the FPU/SSE state into a 512-byte, 16-byte-aligned area.
///
/// # Safety
/// `area` must be valid for 512 bytes and 16-byte aligned.
#[inline]
pub unsafe fn fxsave(area: *mut u8) {
    // SAFETY: contract forwarded to the caller.
    unsafe {
        core::arch::asm!("fxsave64 [{}]", in(reg) area, options(nostack));
    }
}

/// Restore the FPU/SSE state saved by [`fxsave`].
///
/// # Safety
/// `area` must hold a state image previously written by [`fxsave`].
#[inline]
pub unsafe fn fxrstor(area: *const u8) {
    // SAFETY: contract forwarded to the caller.
    unsafe {
        core::arch::asm!("fxrstor64 [{}]", in(reg) area, options(nostack));
    }
}
