//! Preemptive round-robin scheduler and process table.
//!
//! Sixteen fixed slots; one CPU. The timer tick decrements the running
//! slice and rotates to the next Ready slot on expiry. Context switches
//! swap callee-saved registers, RSP and CR3; the kernel half of every
//! address space is shared, so only the user half remaps. On every switch
//! both `KERNEL_RSP` (syscall trampoline) and TSS.rsp0 (ring-3 interrupts)
//! are rewritten — forgetting either corrupts the next kernel entry.

extern crate alloc;

use alloc::{boxed::Box, string::String};

use spin::Mutex;

use crate::{
    arch::x86_64::{context, gdt, syscall as arch_syscall},
    elf,
    error::{KernelError, KernelResult},
    ipc::{ByteRing, KeyQueue},
    mm::{frame_allocator, hhdm, page_table, FRAME_SIZE},
    timer,
    win,
};

/// Process table capacity.
pub const MAX_PROCESSES: usize = 16;
/// Kernel stack: 4 contiguous frames (16 KiB) per process.
pub const STACK_PAGES: usize = 4;
pub const STACK_SIZE: u64 = (STACK_PAGES * FRAME_SIZE) as u64;
/// User stack: 16 KiB mapped just under [`USER_STACK_TOP`].
pub const USER_STACK_PAGES: usize = 4;
pub const USER_STACK_SIZE: u64 = (USER_STACK_PAGES * FRAME_SIZE) as u64;
pub const USER_STACK_TOP: u64 = 0x7F_FFFF_F000;
/// User heap bump allocator starts here.
pub const USER_HEAP_BASE: u64 = 0x4000_0000;
/// Fixed VA of the 6-byte exit stub a naive `_start` return lands on.
pub const EXIT_STUB_ADDR: u64 = 0x3F_F000;
/// Time slice per process.
pub const TIME_SLICE_MS: u64 = 10;
const SLICE_TICKS: u64 = TIME_SLICE_MS / timer::TICK_MS;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Free = 0,
    Ready = 1,
    Running = 2,
    Terminated = 3,
}

/// FXSAVE area, 16-byte aligned by the hardware's requirement.
#[repr(C, align(16))]
pub struct FpuArea(pub [u8; 512]);

impl FpuArea {
    const fn new() -> Self {
        Self([0; 512])
    }
}

/// One process-table slot.
pub struct Process {
    pub pid: i32,
    pub state: ProcessState,
    pub name: String,
    pub args: String,
    pub saved_rsp: u64,
    /// Physical base of the kernel stack run.
    pub kernel_stack_phys: u64,
    /// Direct-map address one past the kernel stack.
    pub kernel_stack_top: u64,
    pub entry_point: u64,
    pub slice_remaining: u64,
    /// Physical address of the private PML4; 0 iff the slot is Free.
    pub pml4_phys: u64,
    pub user_stack_top: u64,
    /// Bump pointer for the user virtual heap.
    pub heap_next: u64,

    // I/O redirection. A process either owns the rings (spawned via
    // spawn_redir) or inherited the flag and points at the owner by pid;
    // spawn collapses chains so the owner is always one hop away.
    pub redirected: bool,
    pub parent_pid: i32,
    pub out_ring: Option<ByteRing>,
    pub in_ring: Option<ByteRing>,
    pub key_queue: KeyQueue,
    pub term_cols: i32,
    pub term_rows: i32,

    pub fpu: FpuArea,
}

impl Process {
    fn empty() -> Self {
        Self {
            pid: -1,
            state: ProcessState::Free,
            name: String::new(),
            args: String::new(),
            saved_rsp: 0,
            kernel_stack_phys: 0,
            kernel_stack_top: 0,
            entry_point: 0,
            slice_remaining: 0,
            pml4_phys: 0,
            user_stack_top: 0,
            heap_next: 0,
            redirected: false,
            parent_pid: -1,
            out_ring: None,
            in_ring: None,
            key_queue: KeyQueue::new(),
            term_cols: 0,
            term_rows: 0,
            fpu: FpuArea::new(),
        }
    }

    fn reset(&mut self) {
        *self = Self::empty();
    }
}

struct ProcessTable {
    slots: Box<[Process]>,
    /// Running slot index, or -1 for the idle (post-boot kernel) context.
    current: i32,
    next_pid: i32,
    idle_saved_rsp: u64,
}

static TABLE: Mutex<Option<ProcessTable>> = Mutex::new(None);

/// Initialize the process table. Requires a live heap.
pub fn init() {
    let slots = (0..MAX_PROCESSES)
        .map(|_| Process::empty())
        .collect::<alloc::vec::Vec<_>>()
        .into_boxed_slice();
    *TABLE.lock() = Some(ProcessTable {
        slots,
        current: -1,
        next_pid: 0,
        idle_saved_rsp: 0,
    });
    log::info!(target: "sched",
        "initialized ({} process slots, {} ms time slice)",
        MAX_PROCESSES, TIME_SLICE_MS);
}

/// Run `f` with the table locked and interrupts masked, so the timer tick
/// can never deadlock against a table holder.
fn with_table<R>(f: impl FnOnce(&mut ProcessTable) -> R) -> R {
    #[cfg(target_os = "none")]
    {
        x86_64::instructions::interrupts::without_interrupts(|| {
            let mut guard = TABLE.lock();
            f(guard.as_mut().expect("scheduler not initialized"))
        })
    }
    #[cfg(not(target_os = "none"))]
    {
        let mut guard = TABLE.lock();
        f(guard.as_mut().expect("scheduler not initialized"))
    }
}

/// Pick the next Ready slot at or after `start`, wrapping once around.
fn find_next_ready(states: &[ProcessState], start: usize) -> Option<usize> {
    let n = states.len();
    (0..n)
        .map(|i| (start + i) % n)
        .find(|&idx| states[idx] == ProcessState::Ready)
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// Pid of the running process, or -1 when idle.
pub fn current_pid() -> i32 {
    with_table(|t| {
        if t.current < 0 {
            -1
        } else {
            t.slots[t.current as usize].pid
        }
    })
}

/// True while the pid names a Ready or Running process.
pub fn is_alive(pid: i32) -> bool {
    with_table(|t| {
        t.slots.iter().any(|p| {
            p.pid == pid && matches!(p.state, ProcessState::Ready | ProcessState::Running)
        })
    })
}

/// Run `f` against the running process, if any.
pub fn with_current<R>(f: impl FnOnce(&mut Process) -> R) -> Option<R> {
    with_table(|t| {
        if t.current < 0 {
            None
        } else {
            let idx = t.current as usize;
            Some(f(&mut t.slots[idx]))
        }
    })
}

/// Run `f` against the live process with the given pid.
pub fn with_process<R>(pid: i32, f: impl FnOnce(&mut Process) -> R) -> Option<R> {
    with_table(|t| {
        t.slots
            .iter_mut()
            .find(|p| p.state != ProcessState::Free && p.pid == pid)
            .map(f)
    })
}

/// Run `f` against the buffer-owner of a redirected process: the process
/// itself when it owns rings, else the slot its `parent_pid` names.
pub fn with_redir_target<R>(f: impl FnOnce(&mut Process) -> R) -> Option<R> {
    with_table(|t| {
        if t.current < 0 {
            return None;
        }
        let cur = t.current as usize;
        if !t.slots[cur].redirected {
            return None;
        }
        let owner = if t.slots[cur].out_ring.is_some() {
            cur
        } else {
            let ppid = t.slots[cur].parent_pid;
            t.slots
                .iter()
                .position(|p| p.state != ProcessState::Free && p.pid == ppid)?
        };
        Some(f(&mut t.slots[owner]))
    })
}

/// Snapshot every non-Free slot for `proclist`.
pub fn for_each_live(mut f: impl FnMut(&Process)) {
    with_table(|t| {
        for p in t.slots.iter().filter(|p| p.state != ProcessState::Free) {
            f(p);
        }
    })
}

// ---------------------------------------------------------------------------
// Scheduling
// ---------------------------------------------------------------------------

struct SwitchPlan {
    old_rsp_slot: *mut u64,
    old_fpu: *mut u8,
    new_rsp: u64,
    new_cr3: u64,
    my_fpu: *mut u8,
}

/// Rotate to the next Ready process, if any. Returns after this context is
/// scheduled again.
///
/// Interrupts are masked from planning through the switch: a tick landing
/// between the two would otherwise re-enter the scheduler against a stale
/// plan. The caller's IF state is restored once this context resumes.
pub fn schedule() {
    #[cfg(target_os = "none")]
    let reenable = {
        let was_enabled = x86_64::instructions::interrupts::are_enabled();
        x86_64::instructions::interrupts::disable();
        was_enabled
    };

    let plan = with_table(|t| {
        let start = if t.current >= 0 {
            (t.current as usize + 1) % MAX_PROCESSES
        } else {
            0
        };
        // No heap use here: this path runs from the timer interrupt.
        let mut states = [ProcessState::Free; MAX_PROCESSES];
        for (i, p) in t.slots.iter().enumerate() {
            states[i] = p.state;
        }
        let next = find_next_ready(&states, start)?;
        if t.current >= 0 && next == t.current as usize {
            return None;
        }

        let (old_rsp_slot, old_fpu) = if t.current >= 0 {
            let cur = t.current as usize;
            if t.slots[cur].state == ProcessState::Running {
                t.slots[cur].state = ProcessState::Ready;
            }
            (
                &mut t.slots[cur].saved_rsp as *mut u64,
                t.slots[cur].fpu.0.as_mut_ptr(),
            )
        } else {
            (&mut t.idle_saved_rsp as *mut u64, core::ptr::null_mut())
        };

        t.current = next as i32;
        let p = &mut t.slots[next];
        p.state = ProcessState::Running;
        p.slice_remaining = SLICE_TICKS;
        arch_syscall::set_kernel_rsp(p.kernel_stack_top);
        gdt::set_kernel_stack(p.kernel_stack_top);

        Some(SwitchPlan {
            old_rsp_slot,
            old_fpu,
            new_rsp: p.saved_rsp,
            new_cr3: p.pml4_phys,
            my_fpu: old_fpu,
        })
    });

    if let Some(plan) = plan {
        // SAFETY: the plan's pointers reference pinned slots in the boxed
        // table; the target context was saved by this same mechanism (or
        // primed by spawn).
        unsafe {
            if !plan.old_fpu.is_null() {
                context::fxsave(plan.old_fpu);
            }
            context::context_switch(plan.old_rsp_slot, plan.new_rsp, plan.new_cr3);
            // Control returns here once this context is scheduled again.
            if !plan.my_fpu.is_null() {
                context::fxrstor(plan.my_fpu);
            }
        }
    }

    #[cfg(target_os = "none")]
    if reenable {
        x86_64::instructions::interrupts::enable();
    }
}

/// Cooperative yield from kernel context.
pub fn yield_now() {
    schedule();
}

/// Timer-tick entry: decrement the running slice and rotate on expiry.
pub fn tick() {
    let expired = with_table(|t| {
        if t.current < 0 {
            return true; // idle: look for work
        }
        let cur = t.current as usize;
        if t.slots[cur].slice_remaining > 0 {
            t.slots[cur].slice_remaining -= 1;
        }
        t.slots[cur].slice_remaining == 0
    });
    if expired {
        schedule();
    }
}

// ---------------------------------------------------------------------------
// Spawn
// ---------------------------------------------------------------------------

/// First code a fresh process context runs: publish the kernel stack for
/// traps, then drop to ring 3 at the ELF entry point.
extern "C" fn process_startup() -> ! {
    let target = with_table(|t| {
        if t.current < 0 {
            return None;
        }
        let p = &t.slots[t.current as usize];
        arch_syscall::set_kernel_rsp(p.kernel_stack_top);
        gdt::set_kernel_stack(p.kernel_stack_top);
        Some((p.entry_point, p.user_stack_top))
    });

    match target {
        // SAFETY: entry and stack were mapped user-accessible by spawn and
        // CR3 already holds this process's PML4.
        Some((entry, user_rsp)) => unsafe { context::enter_user(entry, user_rsp) },
        None => exit_current(),
    }
}

/// Create a process from an ELF image on the VFS. Returns the new pid.
/// All partially acquired resources are released on any failure.
pub fn spawn(path: &str, args: &str) -> KernelResult<i32> {
    let slot = with_table(|t| {
        t.slots
            .iter()
            .position(|p| p.state == ProcessState::Free)
    })
    .ok_or(KernelError::NoFreeSlot {
        resource: "process",
    })?;

    let pml4_phys = page_table::create_user_pml4()?;

    let cleanup_pml4 = |pml4: u64| {
        page_table::free_user_half(pml4);
        frame_allocator::free(pml4, 1);
    };

    let entry = match elf::load(path, pml4_phys) {
        Ok(e) => e,
        Err(e) => {
            cleanup_pml4(pml4_phys);
            return Err(e);
        }
    };

    let kernel_stack_phys = match frame_allocator::allocate_contiguous(STACK_PAGES) {
        Ok(p) => p,
        Err(e) => {
            cleanup_pml4(pml4_phys);
            return Err(e);
        }
    };
    let kernel_stack_top = hhdm::phys_to_virt(kernel_stack_phys) + STACK_SIZE;

    let cleanup_all = |pml4: u64| {
        frame_allocator::free(kernel_stack_phys, STACK_PAGES);
        cleanup_pml4(pml4);
    };

    // User stack, mapped just below USER_STACK_TOP.
    let user_stack_base = USER_STACK_TOP - USER_STACK_SIZE;
    let mut top_stack_page_phys = 0;
    for i in 0..USER_STACK_PAGES {
        let page = match frame_allocator::allocate_zeroed() {
            Ok(p) => p,
            Err(e) => {
                cleanup_all(pml4_phys);
                return Err(e);
            }
        };
        if let Err(e) =
            page_table::map_user(pml4_phys, page, user_stack_base + (i * FRAME_SIZE) as u64)
        {
            frame_allocator::free(page, 1);
            cleanup_all(pml4_phys);
            return Err(e);
        }
        if i == USER_STACK_PAGES - 1 {
            top_stack_page_phys = page;
        }
    }

    // Exit stub: xor edi, edi; xor eax, eax; syscall — a bare return from
    // _start becomes exit(0).
    {
        let stub_page = match frame_allocator::allocate_zeroed() {
            Ok(p) => p,
            Err(e) => {
                cleanup_all(pml4_phys);
                return Err(e);
            }
        };
        if let Err(e) = page_table::map_user(pml4_phys, stub_page, EXIT_STUB_ADDR) {
            frame_allocator::free(stub_page, 1);
            cleanup_all(pml4_phys);
            return Err(e);
        }
        let stub = hhdm::phys_to_virt(stub_page) as *mut u8;
        // SAFETY: freshly allocated frame, direct-map alias, exclusive.
        unsafe {
            stub.copy_from_nonoverlapping([0x31, 0xFF, 0x31, 0xC0, 0x0F, 0x05].as_ptr(), 6);
        }
    }

    // The word at the top of the user stack is the return address _start
    // sees: the exit stub.
    // SAFETY: top_stack_page_phys was just allocated and mapped.
    unsafe {
        let top_page = hhdm::phys_to_virt(top_stack_page_phys) as *mut u8;
        *(top_page.add(FRAME_SIZE - 8) as *mut u64) = EXIT_STUB_ADDR;
    }

    // Prime the kernel stack so the first context switch "returns" into
    // process_startup with zeroed callee-saved registers.
    // SAFETY: the kernel stack run is exclusively owned and direct-mapped.
    let primed_rsp = unsafe {
        let mut sp = kernel_stack_top as *mut u64;
        sp = sp.sub(1);
        *sp = process_startup as usize as u64;
        for _ in 0..6 {
            sp = sp.sub(1);
            *sp = 0;
        }
        sp as u64
    };

    let pid = with_table(|t| {
        let p = &mut t.slots[slot];
        p.reset();
        p.pid = t.next_pid;
        t.next_pid += 1;
        p.state = ProcessState::Ready;
        p.name = String::from(path);
        p.args = String::from(args);
        p.saved_rsp = primed_rsp;
        p.kernel_stack_phys = kernel_stack_phys;
        p.kernel_stack_top = kernel_stack_top;
        p.entry_point = entry;
        p.slice_remaining = SLICE_TICKS;
        p.pml4_phys = pml4_phys;
        p.user_stack_top = USER_STACK_TOP - 8;
        p.heap_next = USER_HEAP_BASE;
        p.pid
    });

    log::info!(target: "sched",
        "spawned pid {} ({}) entry={:#x} pml4={:#x}",
        pid, path, entry, pml4_phys);
    Ok(pid)
}

// ---------------------------------------------------------------------------
// Exit / kill
// ---------------------------------------------------------------------------

/// Release everything a dead process owns: redirection rings, the user
/// half of its address space, kernel stack and PML4. Spawn followed by
/// exit or kill is frame-balanced. The caller must have already detached
/// the pid from the window server.
fn release_slot_resources(t: &mut ProcessTable, slot: usize) {
    let p = &mut t.slots[slot];
    p.state = ProcessState::Terminated;

    if let Some(ring) = p.out_ring.take() {
        frame_allocator::free(hhdm::virt_to_phys(ring.buffer_addr()), 1);
    }
    if let Some(ring) = p.in_ring.take() {
        frame_allocator::free(hhdm::virt_to_phys(ring.buffer_addr()), 1);
    }

    if p.pml4_phys != 0 {
        page_table::free_user_half(p.pml4_phys);
    }
    if p.kernel_stack_phys != 0 {
        frame_allocator::free(p.kernel_stack_phys, STACK_PAGES);
        p.kernel_stack_phys = 0;
    }
    if p.pml4_phys != 0 {
        frame_allocator::free(p.pml4_phys, 1);
        p.pml4_phys = 0;
    }
    p.reset();
}

/// Terminate the running process and switch away. Never returns.
pub fn exit_current() -> ! {
    let pid = current_pid();
    // No tick may observe the half-torn-down slot.
    #[cfg(target_os = "none")]
    x86_64::instructions::interrupts::disable();
    if pid >= 0 {
        // Detach windows first: the window server needs the table unlocked
        // to resolve compositor mappings. Sockets go with the process too.
        win::cleanup_process(pid);
        crate::net::socket::cleanup_process(pid);
    }

    loop {
        let plan = with_table(|t| {
            if t.current < 0 {
                return None;
            }
            let old = t.current as usize;
            log::info!(target: "sched", "pid {} terminated", t.slots[old].pid);
            release_slot_resources(t, old);

            // The freed kernel stack stays intact until the next allocation;
            // nothing allocates between here and the switch on one core.
            let mut states = [ProcessState::Free; MAX_PROCESSES];
            for (i, p) in t.slots.iter().enumerate() {
                states[i] = p.state;
            }
            let next = find_next_ready(&states, 0);
            let old_rsp_slot = &mut t.slots[old].saved_rsp as *mut u64;

            match next {
                Some(n) => {
                    t.current = n as i32;
                    let p = &mut t.slots[n];
                    p.state = ProcessState::Running;
                    p.slice_remaining = SLICE_TICKS;
                    arch_syscall::set_kernel_rsp(p.kernel_stack_top);
                    gdt::set_kernel_stack(p.kernel_stack_top);
                    Some((old_rsp_slot, p.saved_rsp, p.pml4_phys))
                }
                None => {
                    t.current = -1;
                    Some((old_rsp_slot, t.idle_saved_rsp, page_table::master_pml4()))
                }
            }
        });

        if let Some((old_rsp_slot, new_rsp, new_cr3)) = plan {
            // SAFETY: switching away from a context that never resumes; the
            // target context was saved by schedule()/exit paths.
            unsafe {
                context::context_switch(old_rsp_slot, new_rsp, new_cr3);
            }
        }
        // Unreachable in practice; parked defensively.
        crate::arch::halt();
    }
}

/// Kill another process. Refuses pid 0 and the caller itself. On return
/// the target is gone and all its resources are back in the pools.
pub fn kill(pid: i32) -> KernelResult<()> {
    if pid == 0 {
        return Err(KernelError::InvalidArgument { name: "pid" });
    }
    if pid == current_pid() {
        return Err(KernelError::InvalidArgument { name: "pid" });
    }

    // Unmap any of its windows from the compositor before the pages go back
    // to the pool.
    win::cleanup_process(pid);

    with_table(|t| {
        let slot = t
            .slots
            .iter()
            .position(|p| p.state != ProcessState::Free && p.pid == pid)
            .ok_or(KernelError::NotFound { resource: "pid" })?;
        release_slot_resources(t, slot);
        log::info!(target: "sched", "pid {} killed", pid);
        Ok(())
    })
}

/// Idle loop entered by boot after init. Runs in the kernel address space
/// with interrupts on; the tick pulls work off this context.
pub fn idle_loop() -> ! {
    #[cfg(target_os = "none")]
    x86_64::instructions::interrupts::enable();
    loop {
        #[cfg(target_os = "none")]
        x86_64::instructions::hlt();
        #[cfg(not(target_os = "none"))]
        core::hint::spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use ProcessState::{Free, Ready, Running, Terminated};

    #[test]
    fn rotation_starts_at_requested_slot_and_wraps() {
        let states = [Free, Ready, Free, Ready];
        assert_eq!(find_next_ready(&states, 2), Some(3));
        assert_eq!(find_next_ready(&states, 0), Some(1));
        // Wrap past the end.
        let states = [Ready, Free, Free, Free];
        assert_eq!(find_next_ready(&states, 1), Some(0));
    }

    #[test]
    fn no_ready_slot_yields_none() {
        let states = [Free, Running, Terminated, Free];
        assert_eq!(find_next_ready(&states, 0), None);
        assert_eq!(find_next_ready(&[], 0), None);
    }

    #[test]
    fn round_robin_is_fair_over_a_full_cycle() {
        // Three ready slots: repeatedly asking "next after current" must
        // visit each exactly once per cycle.
        let states = [Ready, Ready, Ready];
        let mut current = 0;
        let mut visits = [0u32; 3];
        for _ in 0..30 {
            let next = find_next_ready(&states, (current + 1) % 3).unwrap();
            visits[next] += 1;
            current = next;
        }
        assert_eq!(visits, [10, 10, 10]);
    }
}
