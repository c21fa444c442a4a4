//! Process syscalls: exit, spawn, waitpid, args, listing, kill.

use crate::{
    error::{KernelError, KernelResult},
    sched,
    syscall::abi::ProcInfo,
};

use super::{user_bytes_mut, user_cstr};

pub fn sys_exit(_code: i32) -> i64 {
    // Exit code is accepted for ABI compatibility but not stored; nothing
    // reads it back (waitpid has no status out-parameter).
    sched::exit_current();
}

/// Spawn a child. A redirected parent passes the flag on: the child never
/// gets its own rings, it records the pid of the ring owner (one hop at
/// most, collapsing chains at spawn time).
pub fn sys_spawn(path_ptr: u64, args_ptr: u64) -> KernelResult<i64> {
    let path = user_cstr(path_ptr).ok_or(KernelError::InvalidArgument { name: "path" })?;
    let args = user_cstr(args_ptr).unwrap_or("");

    let inherit = sched::with_current(|p| {
        if !p.redirected {
            return None;
        }
        Some(if p.out_ring.is_some() {
            p.pid
        } else {
            p.parent_pid
        })
    })
    .flatten();

    let child_pid = sched::spawn(path, args)?;

    if let Some(owner_pid) = inherit {
        sched::with_process(child_pid, |child| {
            child.redirected = true;
            child.parent_pid = owner_pid;
        });
    }

    Ok(child_pid as i64)
}

/// Block until the target pid is no longer alive. The wait enables
/// interrupts so the tick keeps scheduling the target.
pub fn sys_wait_pid(pid: i32) -> i64 {
    #[cfg(target_os = "none")]
    x86_64::instructions::interrupts::enable();
    while sched::is_alive(pid) {
        sched::yield_now();
    }
    0
}

pub fn sys_get_args(buf_ptr: u64, max_len: u64) -> i64 {
    if buf_ptr == 0 || max_len == 0 {
        return -1;
    }
    let copied = sched::with_current(|p| {
        let out = match user_bytes_mut(buf_ptr, max_len) {
            Some(b) => b,
            None => return -1i64,
        };
        let n = p.args.len().min(out.len() - 1);
        out[..n].copy_from_slice(&p.args.as_bytes()[..n]);
        out[n] = 0;
        n as i64
    });
    copied.unwrap_or(-1)
}

pub fn sys_proc_list(buf_ptr: u64, max_count: i32) -> i64 {
    if buf_ptr == 0 || max_count <= 0 {
        return 0;
    }
    let mut count = 0i64;
    sched::for_each_live(|p| {
        if count >= max_count as i64 {
            return;
        }
        let mut info = ProcInfo {
            pid: p.pid,
            parent_pid: p.parent_pid,
            state: p.state as u8,
            _pad: [0; 3],
            name: [0; 64],
            heap_used: p.heap_next.saturating_sub(sched::USER_HEAP_BASE),
        };
        crate::syscall::abi::copy_cstr(&mut info.name, &p.name);
        super::user_write(buf_ptr + count as u64 * core::mem::size_of::<ProcInfo>() as u64, info);
        count += 1;
    });
    count
}

pub fn sys_kill(pid: i32) -> KernelResult<i64> {
    sched::kill(pid)?;
    crate::net::socket::cleanup_process(pid);
    Ok(0)
}
