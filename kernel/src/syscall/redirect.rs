//! I/O redirection syscalls: spawn_redir and the parent-side childio ops.
//!
//! The rings live in two physical pages owned by the child slot (freed on
//! its death); the parent reads the out ring and feeds the in ring and
//! key queue. Descendants spawned by a redirected child inherit the flag
//! and the owner pid only — never their own rings.

use crate::{
    error::{KernelError, KernelResult},
    ipc::ring::{ByteRing, IO_BUF_SIZE},
    mm::{frame_allocator, hhdm},
    sched,
    syscall::abi::KeyEvent,
};

use super::{user_bytes, user_bytes_mut, user_cstr, user_read};

/// Spawn a child with fresh I/O rings owned by its slot; the caller
/// becomes the consumer of its console output.
pub fn sys_spawn_redir(path_ptr: u64, args_ptr: u64) -> KernelResult<i64> {
    let path = user_cstr(path_ptr).ok_or(KernelError::InvalidArgument { name: "path" })?;
    let args = user_cstr(args_ptr).unwrap_or("");
    let caller = sched::current_pid();

    let child_pid = sched::spawn(path, args)?;

    let out_page = frame_allocator::allocate_zeroed()?;
    let in_page = match frame_allocator::allocate_zeroed() {
        Ok(p) => p,
        Err(e) => {
            frame_allocator::free(out_page, 1);
            return Err(e);
        }
    };

    sched::with_process(child_pid, |child| {
        // SAFETY: both pages were just allocated for these rings and stay
        // owned by the child slot until process teardown frees them.
        unsafe {
            child.out_ring = Some(ByteRing::from_raw(hhdm::phys_to_virt(out_page), IO_BUF_SIZE));
            child.in_ring = Some(ByteRing::from_raw(hhdm::phys_to_virt(in_page), IO_BUF_SIZE));
        }
        child.redirected = true;
        child.parent_pid = caller;
    })
    .ok_or(KernelError::NotFound { resource: "pid" })?;

    Ok(child_pid as i64)
}

/// Drain bytes the child printed.
pub fn sys_childio_read(child_pid: i32, buf_ptr: u64, max_len: u64) -> KernelResult<i64> {
    let buf = user_bytes_mut(buf_ptr, max_len)
        .ok_or(KernelError::InvalidArgument { name: "buf" })?;
    sched::with_process(child_pid, |child| {
        child
            .out_ring
            .as_mut()
            .map(|ring| ring.read(buf) as i64)
            .ok_or(KernelError::InvalidState {
                expected: "redirected child",
                actual: "plain process",
            })
    })
    .ok_or(KernelError::NotFound { resource: "pid" })?
}

/// Feed bytes the child's getchar will see.
pub fn sys_childio_write(child_pid: i32, data_ptr: u64, len: u64) -> KernelResult<i64> {
    let data =
        user_bytes(data_ptr, len).ok_or(KernelError::InvalidArgument { name: "data" })?;
    sched::with_process(child_pid, |child| {
        child
            .in_ring
            .as_mut()
            .map(|ring| {
                for &b in data {
                    ring.write(b);
                }
                data.len() as i64
            })
            .ok_or(KernelError::InvalidState {
                expected: "redirected child",
                actual: "plain process",
            })
    })
    .ok_or(KernelError::NotFound { resource: "pid" })?
}

/// Inject a structured key event for the child's getkey.
pub fn sys_childio_writekey(child_pid: i32, key_ptr: u64) -> KernelResult<i64> {
    let event: KeyEvent =
        user_read(key_ptr).ok_or(KernelError::InvalidArgument { name: "key" })?;
    sched::with_process(child_pid, |child| {
        if !child.redirected {
            return Err(KernelError::InvalidState {
                expected: "redirected child",
                actual: "plain process",
            });
        }
        child.key_queue.push(event);
        Ok(0)
    })
    .ok_or(KernelError::NotFound { resource: "pid" })?
}

/// Record the terminal geometry the child's term_size reports.
pub fn sys_childio_set_termsz(child_pid: i32, cols: i32, rows: i32) -> KernelResult<i64> {
    sched::with_process(child_pid, |child| {
        if !child.redirected {
            return Err(KernelError::InvalidState {
                expected: "redirected child",
                actual: "plain process",
            });
        }
        child.term_cols = cols;
        child.term_rows = rows;
        Ok(0)
    })
    .ok_or(KernelError::NotFound { resource: "pid" })?
}
