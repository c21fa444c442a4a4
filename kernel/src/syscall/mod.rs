//! System call dispatch.
//!
//! Number-indexed dispatch over the frame the trampoline builds. Handlers
//! receive raw argument registers and marshal them; results return as a
//! single i64, with every error collapsed to the ABI's negative sentinel.
//!
//! Userland pointers are trusted as to length and mapping (the calling
//! process's address space is live during the syscall). A hardened build
//! would verify each range lies in the mapped user half; this research
//! kernel documents the gap instead.

pub mod abi;
mod filesystem;
mod info;
mod io;
mod memory;
mod net;
mod process;
mod redirect;
mod window;

pub use crate::arch::x86_64::syscall::SyscallFrame;

// Stable numbered entry points.
pub const SYS_EXIT: u64 = 0;
pub const SYS_YIELD: u64 = 1;
pub const SYS_SLEEP_MS: u64 = 2;
pub const SYS_GETPID: u64 = 3;
pub const SYS_PRINT: u64 = 4;
pub const SYS_PUTCHAR: u64 = 5;
pub const SYS_OPEN: u64 = 6;
pub const SYS_READ: u64 = 7;
pub const SYS_GETSIZE: u64 = 8;
pub const SYS_CLOSE: u64 = 9;
pub const SYS_READDIR: u64 = 10;
pub const SYS_ALLOC: u64 = 11;
pub const SYS_FREE: u64 = 12;
pub const SYS_GETTICKS: u64 = 13;
pub const SYS_GETMILLISECONDS: u64 = 14;
pub const SYS_GETINFO: u64 = 15;
pub const SYS_ISKEYAVAILABLE: u64 = 16;
pub const SYS_GETKEY: u64 = 17;
pub const SYS_GETCHAR: u64 = 18;
pub const SYS_PING: u64 = 19;
pub const SYS_SPAWN: u64 = 20;
pub const SYS_FBINFO: u64 = 21;
pub const SYS_FBMAP: u64 = 22;
pub const SYS_WAITPID: u64 = 23;
pub const SYS_TERMSIZE: u64 = 24;
pub const SYS_GETARGS: u64 = 25;
pub const SYS_RESET: u64 = 26;
pub const SYS_SHUTDOWN: u64 = 27;
pub const SYS_GETTIME: u64 = 28;
pub const SYS_SOCKET: u64 = 29;
pub const SYS_CONNECT: u64 = 30;
pub const SYS_BIND: u64 = 31;
pub const SYS_LISTEN: u64 = 32;
pub const SYS_ACCEPT: u64 = 33;
pub const SYS_SEND: u64 = 34;
pub const SYS_RECV: u64 = 35;
pub const SYS_CLOSESOCK: u64 = 36;
pub const SYS_GETNETCFG: u64 = 37;
pub const SYS_SETNETCFG: u64 = 38;
pub const SYS_SENDTO: u64 = 39;
pub const SYS_RECVFROM: u64 = 40;
pub const SYS_FWRITE: u64 = 41;
pub const SYS_FCREATE: u64 = 42;
pub const SYS_TERMSCALE: u64 = 43;
pub const SYS_RESOLVE: u64 = 44;
pub const SYS_GETRANDOM: u64 = 45;
pub const SYS_KLOG: u64 = 46;
pub const SYS_MOUSESTATE: u64 = 47;
pub const SYS_SETMOUSEBOUNDS: u64 = 48;
pub const SYS_SPAWN_REDIR: u64 = 49;
pub const SYS_CHILDIO_READ: u64 = 50;
pub const SYS_CHILDIO_WRITE: u64 = 51;
pub const SYS_CHILDIO_WRITEKEY: u64 = 52;
pub const SYS_CHILDIO_SETTERMSZ: u64 = 53;
pub const SYS_WINCREATE: u64 = 54;
pub const SYS_WINDESTROY: u64 = 55;
pub const SYS_WINPRESENT: u64 = 56;
pub const SYS_WINPOLL: u64 = 57;
pub const SYS_WINENUM: u64 = 58;
pub const SYS_WINMAP: u64 = 59;
pub const SYS_WINSENDEVENT: u64 = 60;
pub const SYS_PROCLIST: u64 = 61;
pub const SYS_KILL: u64 = 62;
pub const SYS_DEVLIST: u64 = 63;
pub const SYS_WINRESIZE: u64 = 64;
pub const SYS_WINSETSCALE: u64 = 65;
pub const SYS_WINGETSCALE: u64 = 66;

// ---------------------------------------------------------------------------
// Userland pointer access (trusted; see module docs)
// ---------------------------------------------------------------------------

/// Borrow `len` bytes of user memory. Null or zero-length yields None.
pub(crate) fn user_bytes<'a>(ptr: u64, len: u64) -> Option<&'a [u8]> {
    if ptr == 0 || len == 0 {
        return None;
    }
    // SAFETY: trusted user pointer in the live address space.
    Some(unsafe { core::slice::from_raw_parts(ptr as *const u8, len as usize) })
}

/// Borrow `len` bytes of user memory mutably.
pub(crate) fn user_bytes_mut<'a>(ptr: u64, len: u64) -> Option<&'a mut [u8]> {
    if ptr == 0 || len == 0 {
        return None;
    }
    // SAFETY: trusted user pointer in the live address space.
    Some(unsafe { core::slice::from_raw_parts_mut(ptr as *mut u8, len as usize) })
}

/// Borrow a NUL-terminated user string (capped at 4 KiB).
pub(crate) fn user_cstr<'a>(ptr: u64) -> Option<&'a str> {
    if ptr == 0 {
        return None;
    }
    let mut len = 0u64;
    // SAFETY: trusted user pointer; the scan is bounded.
    unsafe {
        while len < 4096 && *((ptr + len) as *const u8) != 0 {
            len += 1;
        }
        core::str::from_utf8(core::slice::from_raw_parts(ptr as *const u8, len as usize)).ok()
    }
}

/// Copy a value out of user memory.
pub(crate) fn user_read<T: Copy>(ptr: u64) -> Option<T> {
    if ptr == 0 {
        return None;
    }
    // SAFETY: trusted user pointer, unaligned-safe read.
    Some(unsafe { core::ptr::read_unaligned(ptr as *const T) })
}

/// Copy a value into user memory.
pub(crate) fn user_write<T: Copy>(ptr: u64, value: T) -> bool {
    if ptr == 0 {
        return false;
    }
    // SAFETY: trusted user pointer, unaligned-safe write.
    unsafe {
        core::ptr::write_unaligned(ptr as *mut T, value);
    }
    true
}

/// Map a handler result onto the ABI's i64.
fn ret(result: crate::error::KernelResult<i64>) -> i64 {
    match result {
        Ok(v) => v,
        Err(e) => e.as_sysret(),
    }
}

/// Dispatcher called by the trampoline. The frame lives on the calling
/// process's kernel stack.
pub extern "C" fn dispatch(frame: &mut SyscallFrame) -> i64 {
    let (a1, a2, a3, a4, a5) = (frame.arg1, frame.arg2, frame.arg3, frame.arg4, frame.arg5);

    match frame.syscall_nr {
        SYS_EXIT => process::sys_exit(a1 as i32),
        SYS_YIELD => {
            crate::sched::yield_now();
            0
        }
        SYS_SLEEP_MS => {
            crate::timer::sleep_ms(a1);
            0
        }
        SYS_GETPID => crate::sched::current_pid() as i64,
        SYS_PRINT => io::sys_print(a1),
        SYS_PUTCHAR => io::sys_putchar(a1 as u8),
        SYS_OPEN => ret(filesystem::sys_open(a1)),
        SYS_READ => ret(filesystem::sys_read(a1 as i32, a2, a3, a4)),
        SYS_GETSIZE => ret(filesystem::sys_get_size(a1 as i32)),
        SYS_CLOSE => {
            crate::fs::close(a1 as i32);
            0
        }
        SYS_READDIR => ret(filesystem::sys_read_dir(a1, a2, a3 as i32)),
        SYS_ALLOC => memory::sys_alloc(a1),
        SYS_FREE => memory::sys_free(a1),
        SYS_GETTICKS => crate::timer::ticks() as i64,
        SYS_GETMILLISECONDS => crate::timer::now_ms() as i64,
        SYS_GETINFO => info::sys_get_info(a1),
        SYS_ISKEYAVAILABLE => io::sys_is_key_available(),
        SYS_GETKEY => io::sys_get_key(a1),
        SYS_GETCHAR => io::sys_get_char(),
        SYS_PING => net::sys_ping(a1 as u32, a2 as u32),
        SYS_SPAWN => ret(process::sys_spawn(a1, a2)),
        SYS_FBINFO => info::sys_fb_info(a1),
        SYS_FBMAP => ret(info::sys_fb_map()),
        SYS_WAITPID => process::sys_wait_pid(a1 as i32),
        SYS_TERMSIZE => info::sys_term_size(),
        SYS_GETARGS => process::sys_get_args(a1, a2),
        SYS_RESET => info::sys_reset(),
        SYS_SHUTDOWN => -1, // unimplemented
        SYS_GETTIME => info::sys_get_time(a1),
        SYS_SOCKET => ret(net::sys_socket(a1 as i32)),
        SYS_CONNECT => ret(net::sys_connect(a1 as i32, a2 as u32, a3 as u16)),
        SYS_BIND => ret(net::sys_bind(a1 as i32, a2 as u16)),
        SYS_LISTEN => ret(net::sys_listen(a1 as i32)),
        SYS_ACCEPT => ret(net::sys_accept(a1 as i32)),
        SYS_SEND => ret(net::sys_send(a1 as i32, a2, a3)),
        SYS_RECV => ret(net::sys_recv(a1 as i32, a2, a3)),
        SYS_CLOSESOCK => net::sys_close_sock(a1 as i32),
        SYS_GETNETCFG => net::sys_get_netcfg(a1),
        SYS_SETNETCFG => net::sys_set_netcfg(a1),
        SYS_SENDTO => ret(net::sys_send_to(a1 as i32, a2, a3, a4 as u32, a5 as u16)),
        SYS_RECVFROM => ret(net::sys_recv_from(a1 as i32, a2, a3, a4, a5)),
        SYS_FWRITE => ret(filesystem::sys_fwrite(a1 as i32, a2, a3, a4)),
        SYS_FCREATE => ret(filesystem::sys_fcreate(a1)),
        SYS_TERMSCALE => info::sys_term_scale(a1, a2),
        SYS_RESOLVE => net::sys_resolve(a1),
        SYS_GETRANDOM => info::sys_get_random(a1, a2),
        SYS_KLOG => io::sys_klog(a1, a2),
        SYS_MOUSESTATE => info::sys_mouse_state(a1),
        SYS_SETMOUSEBOUNDS => {
            crate::drivers::input::set_mouse_bounds(a1 as i32, a2 as i32);
            0
        }
        SYS_SPAWN_REDIR => ret(redirect::sys_spawn_redir(a1, a2)),
        SYS_CHILDIO_READ => ret(redirect::sys_childio_read(a1 as i32, a2, a3)),
        SYS_CHILDIO_WRITE => ret(redirect::sys_childio_write(a1 as i32, a2, a3)),
        SYS_CHILDIO_WRITEKEY => ret(redirect::sys_childio_writekey(a1 as i32, a2)),
        SYS_CHILDIO_SETTERMSZ => {
            ret(redirect::sys_childio_set_termsz(a1 as i32, a2 as i32, a3 as i32))
        }
        SYS_WINCREATE => ret(window::sys_win_create(a1, a2 as i32, a3 as i32, a4)),
        SYS_WINDESTROY => ret(window::sys_win_destroy(a1 as i32)),
        SYS_WINPRESENT => ret(window::sys_win_present(a1 as i32)),
        SYS_WINPOLL => ret(window::sys_win_poll(a1 as i32, a2)),
        SYS_WINENUM => ret(window::sys_win_enum(a1, a2 as i32)),
        SYS_WINMAP => ret(window::sys_win_map(a1 as i32)),
        SYS_WINSENDEVENT => ret(window::sys_win_send_event(a1 as i32, a2)),
        SYS_PROCLIST => process::sys_proc_list(a1, a2 as i32),
        SYS_KILL => ret(process::sys_kill(a1 as i32)),
        SYS_DEVLIST => info::sys_dev_list(a1, a2 as i32),
        SYS_WINRESIZE => ret(window::sys_win_resize(a1 as i32, a2 as i32, a3 as i32)),
        SYS_WINSETSCALE => crate::win::set_scale(a1 as i32) as i64,
        SYS_WINGETSCALE => crate::win::get_scale() as i64,
        _ => -1,
    }
}
