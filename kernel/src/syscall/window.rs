//! Window server syscalls. Each handler snapshots the calling process's
//! identity (pid, PML4, heap bump) first, calls into the server, then
//! commits the heap advance — the process table lock and the window
//! server lock are never held together in that order.

use crate::{
    error::{KernelError, KernelResult},
    sched,
    syscall::abi::{WinCreateResult, WinEvent, WinInfo},
    win,
};

use super::{user_cstr, user_read, user_write};

fn current_identity() -> KernelResult<(i32, u64, u64)> {
    sched::with_current(|p| (p.pid, p.pml4_phys, p.heap_next)).ok_or(KernelError::InvalidState {
        expected: "process context",
        actual: "idle",
    })
}

fn advance_heap(bytes: u64) {
    if bytes > 0 {
        sched::with_current(|p| p.heap_next += bytes);
    }
}

pub fn sys_win_create(title_ptr: u64, w: i32, h: i32, result_ptr: u64) -> KernelResult<i64> {
    let title = user_cstr(title_ptr).ok_or(KernelError::InvalidArgument { name: "title" })?;
    if result_ptr == 0 {
        return Err(KernelError::InvalidArgument { name: "result" });
    }
    let (pid, pml4, heap_next) = current_identity()?;

    match win::create(pid, pml4, title, w, h, heap_next) {
        Ok((id, pixel_va, advance)) => {
            advance_heap(advance);
            user_write(
                result_ptr,
                WinCreateResult {
                    id: id as i64,
                    pixel_va,
                },
            );
            Ok(0)
        }
        Err(e) => {
            user_write(result_ptr, WinCreateResult { id: -1, pixel_va: 0 });
            Err(e)
        }
    }
}

pub fn sys_win_destroy(window_id: i32) -> KernelResult<i64> {
    win::destroy(window_id, sched::current_pid())?;
    Ok(0)
}

pub fn sys_win_present(window_id: i32) -> KernelResult<i64> {
    win::present(window_id, sched::current_pid())?;
    Ok(0)
}

/// Returns 1 with the event written, 0 when the queue is empty.
pub fn sys_win_poll(window_id: i32, event_ptr: u64) -> KernelResult<i64> {
    if event_ptr == 0 {
        return Err(KernelError::InvalidArgument { name: "event" });
    }
    match win::poll(window_id, sched::current_pid())? {
        Some(event) => {
            user_write(event_ptr, event);
            Ok(1)
        }
        None => Ok(0),
    }
}

pub fn sys_win_enum(out_ptr: u64, max_count: i32) -> KernelResult<i64> {
    if out_ptr == 0 || max_count <= 0 {
        return Ok(0);
    }
    let mut snapshot = [WinInfo::default(); win::MAX_WINDOWS];
    let take = (max_count as usize).min(win::MAX_WINDOWS);
    let count = win::enumerate(&mut snapshot[..take]);
    for (i, info) in snapshot[..count].iter().enumerate() {
        user_write(out_ptr + (i * core::mem::size_of::<WinInfo>()) as u64, *info);
    }
    Ok(count as i64)
}

/// Compositor mapping; returns the pixel VA in the caller's space.
pub fn sys_win_map(window_id: i32) -> KernelResult<i64> {
    let (pid, pml4, heap_next) = current_identity()?;
    let (va, advance) = win::map(window_id, pid, pml4, heap_next)?;
    advance_heap(advance);
    Ok(va as i64)
}

pub fn sys_win_send_event(window_id: i32, event_ptr: u64) -> KernelResult<i64> {
    let event: WinEvent =
        user_read(event_ptr).ok_or(KernelError::InvalidArgument { name: "event" })?;
    win::send_event(window_id, event)?;
    Ok(0)
}

/// Owner resize; returns the new pixel VA.
pub fn sys_win_resize(window_id: i32, new_w: i32, new_h: i32) -> KernelResult<i64> {
    let (pid, pml4, heap_next) = current_identity()?;
    let (va, advance) = win::resize(window_id, pid, pml4, new_w, new_h, heap_next)?;
    advance_heap(advance);
    Ok(va as i64)
}
