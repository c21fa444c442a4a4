//! VFS syscalls.

use crate::{
    error::{KernelError, KernelResult},
    fs,
    mm::{frame_allocator, hhdm, page_table, FRAME_SIZE},
    sched,
};

use super::{user_bytes, user_bytes_mut, user_cstr};

pub fn sys_open(path_ptr: u64) -> KernelResult<i64> {
    let path = user_cstr(path_ptr).ok_or(KernelError::InvalidArgument { name: "path" })?;
    Ok(fs::open(path)? as i64)
}

pub fn sys_read(handle: i32, buf_ptr: u64, offset: u64, size: u64) -> KernelResult<i64> {
    let buf = user_bytes_mut(buf_ptr, size).ok_or(KernelError::InvalidArgument { name: "buf" })?;
    Ok(fs::read(handle, buf, offset)? as i64)
}

pub fn sys_get_size(handle: i32) -> KernelResult<i64> {
    Ok(fs::get_size(handle)? as i64)
}

/// Directory listing with the string handoff: names are packed into one
/// freshly mapped user page at the caller's heap bump, and the caller's
/// pointer array receives user-space pointers into it.
pub fn sys_read_dir(path_ptr: u64, names_ptr: u64, max_entries: i32) -> KernelResult<i64> {
    let path = user_cstr(path_ptr).ok_or(KernelError::InvalidArgument { name: "path" })?;
    if names_ptr == 0 || max_entries <= 0 {
        return Err(KernelError::InvalidArgument { name: "names" });
    }
    let names = fs::read_dir(path, max_entries.min(64) as usize)?;
    if names.is_empty() {
        return Ok(0);
    }

    let target =
        sched::with_current(|p| (p.pml4_phys, p.heap_next)).ok_or(KernelError::InvalidState {
            expected: "process context",
            actual: "idle",
        })?;
    let (pml4, user_va) = target;

    let page_phys = frame_allocator::allocate_zeroed()?;
    page_table::map_user(pml4, page_phys, user_va)?;
    sched::with_current(|p| p.heap_next += FRAME_SIZE as u64);

    let page = hhdm::phys_to_virt(page_phys);
    let mut offset = 0usize;
    let mut copied = 0i64;
    for name in &names {
        let needed = name.len() + 1;
        if offset + needed > FRAME_SIZE {
            break;
        }
        // SAFETY: kernel alias of the page just mapped for the caller.
        unsafe {
            core::ptr::copy_nonoverlapping(
                name.as_ptr(),
                (page + offset as u64) as *mut u8,
                name.len(),
            );
            *((page + (offset + name.len()) as u64) as *mut u8) = 0;
        }
        super::user_write(
            names_ptr + copied as u64 * 8,
            user_va + offset as u64,
        );
        offset += needed;
        copied += 1;
    }
    Ok(copied)
}

pub fn sys_fwrite(handle: i32, data_ptr: u64, offset: u64, size: u64) -> KernelResult<i64> {
    let data = user_bytes(data_ptr, size).ok_or(KernelError::InvalidArgument { name: "data" })?;
    Ok(fs::write(handle, data, offset)? as i64)
}

pub fn sys_fcreate(path_ptr: u64) -> KernelResult<i64> {
    let path = user_cstr(path_ptr).ok_or(KernelError::InvalidArgument { name: "path" })?;
    Ok(fs::create(path)? as i64)
}
