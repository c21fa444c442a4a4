//! Console and key input syscalls, including the redirected paths.
//!
//! A redirected process resolves "where do my bytes go / come from" to
//! the ring-owning ancestor (at most one pid hop) on every call; the
//! non-redirected fallback is the kernel console and the central key
//! queue.

use crate::{drivers::input, klog, sched, syscall::abi::KeyEvent};

use super::{user_bytes_mut, user_cstr, user_write};

fn enable_interrupts_for_wait() {
    #[cfg(target_os = "none")]
    x86_64::instructions::interrupts::enable();
}

pub fn sys_print(text_ptr: u64) -> i64 {
    let Some(text) = user_cstr(text_ptr) else {
        return -1;
    };
    let redirected = sched::with_redir_target(|owner| {
        if let Some(ring) = owner.out_ring.as_mut() {
            for &b in text.as_bytes() {
                ring.write(b);
            }
            true
        } else {
            false
        }
    });
    if redirected != Some(true) {
        crate::print!("{}", text);
    }
    0
}

pub fn sys_putchar(byte: u8) -> i64 {
    let redirected = sched::with_redir_target(|owner| {
        if let Some(ring) = owner.out_ring.as_mut() {
            ring.write(byte);
            true
        } else {
            false
        }
    });
    if redirected != Some(true) {
        crate::print!("{}", byte as char);
    }
    0
}

pub fn sys_is_key_available() -> i64 {
    let redirected = sched::with_redir_target(|owner| !owner.key_queue.is_empty());
    match redirected {
        Some(available) => available as i64,
        None => input::is_key_available() as i64,
    }
}

/// Blocking: wait for a key event from the redirect owner's queue or the
/// hardware queue.
pub fn sys_get_key(out_ptr: u64) -> i64 {
    if out_ptr == 0 {
        return -1;
    }
    enable_interrupts_for_wait();
    loop {
        let from_redirect = sched::with_redir_target(|owner| owner.key_queue.pop());
        match from_redirect {
            Some(Some(ev)) => {
                user_write(out_ptr, ev);
                return 0;
            }
            Some(None) => {} // redirected, queue empty: wait
            None => {
                if let Some(ev) = input::pop_key() {
                    user_write(out_ptr, ev);
                    return 0;
                }
            }
        }
        sched::yield_now();
    }
}

/// Blocking: next byte from the redirect input ring, or the next
/// printable press from the hardware queue.
pub fn sys_get_char() -> i64 {
    enable_interrupts_for_wait();
    loop {
        let from_redirect =
            sched::with_redir_target(|owner| owner.in_ring.as_mut().and_then(|r| r.read_byte()));
        match from_redirect {
            Some(Some(byte)) => return byte as i64,
            Some(None) => {} // redirected: wait for the parent to write
            None => {
                if let Some(ev) = input::pop_key() {
                    let KeyEvent { ascii, pressed, .. } = ev;
                    if pressed != 0 && ascii != 0 {
                        return ascii as i64;
                    }
                }
            }
        }
        sched::yield_now();
    }
}

/// Copy the retained kernel log into a user buffer.
pub fn sys_klog(buf_ptr: u64, max_len: u64) -> i64 {
    let Some(buf) = user_bytes_mut(buf_ptr, max_len) else {
        return -1;
    };
    klog::read_kernel_log(buf) as i64
}
