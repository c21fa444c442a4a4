//! Single-producer single-consumer rings.
//!
//! The byte ring's storage is a whole physical page owned by the process
//! that created the redirection; the ring itself carries only the page's
//! direct-map address plus cursors, so the process table stays free of
//! pointers (the kill path frees the page by address). Producer and
//! consumer are distinct processes, but the kernel is single-core and every
//! access happens in syscall context, so cursor updates need no atomics.

use crate::syscall::abi::KeyEvent;

/// Byte capacity of an I/O redirection ring (one page).
pub const IO_BUF_SIZE: u32 = 4096;

/// Capacity of the key-event queue per redirected subtree.
pub const MAX_KEY_EVENTS: u32 = 64;

/// A circular byte ring over a borrowed buffer identified by address.
#[derive(Debug, Clone, Copy)]
pub struct ByteRing {
    /// Kernel-virtual (direct-map) address of the backing page.
    buf: u64,
    cap: u32,
    /// Producer cursor.
    head: u32,
    /// Consumer cursor.
    tail: u32,
}

impl ByteRing {
    /// Wrap a buffer by address.
    ///
    /// # Safety
    /// `buf` must point at `cap` bytes that stay valid and exclusively
    /// owned by this ring (and its clones in the same process slot) until
    /// the page is freed.
    pub unsafe fn from_raw(buf: u64, cap: u32) -> Self {
        Self {
            buf,
            cap,
            head: 0,
            tail: 0,
        }
    }

    /// Kernel-virtual address of the backing buffer (used to free it).
    pub fn buffer_addr(&self) -> u64 {
        self.buf
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// Append one byte. The producer never blocks: a full ring overwrites
    /// the oldest unread byte, which bounds writer latency at the cost of
    /// dropped output under sustained overflow.
    pub fn write(&mut self, byte: u8) {
        // SAFETY: from_raw's contract guarantees buf covers cap bytes.
        unsafe {
            *((self.buf + self.head as u64) as *mut u8) = byte;
        }
        self.head = (self.head + 1) % self.cap;
    }

    /// Drain up to `out.len()` bytes in FIFO order; returns the count.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let mut count = 0;
        while self.tail != self.head && count < out.len() {
            // SAFETY: same as write.
            out[count] = unsafe { *((self.buf + self.tail as u64) as *const u8) };
            self.tail = (self.tail + 1) % self.cap;
            count += 1;
        }
        count
    }

    /// Pop a single byte.
    pub fn read_byte(&mut self) -> Option<u8> {
        let mut b = [0u8; 1];
        if self.read(&mut b) == 1 {
            Some(b[0])
        } else {
            None
        }
    }
}

/// Fixed-capacity queue of structured key events, stored by value inside
/// the owning process slot.
#[derive(Debug, Clone, Copy)]
pub struct KeyQueue {
    events: [KeyEvent; MAX_KEY_EVENTS as usize],
    head: u32,
    tail: u32,
}

impl KeyQueue {
    pub const fn new() -> Self {
        Self {
            events: [KeyEvent::ZERO; MAX_KEY_EVENTS as usize],
            head: 0,
            tail: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    pub fn push(&mut self, event: KeyEvent) {
        self.events[self.head as usize] = event;
        self.head = (self.head + 1) % MAX_KEY_EVENTS;
    }

    pub fn pop(&mut self) -> Option<KeyEvent> {
        if self.is_empty() {
            return None;
        }
        let ev = self.events[self.tail as usize];
        self.tail = (self.tail + 1) % MAX_KEY_EVENTS;
        Some(ev)
    }
}

impl Default for KeyQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    extern crate alloc;

    use alloc::{boxed::Box, vec};

    use super::*;

    fn ring(cap: u32) -> ByteRing {
        let buf = Box::leak(vec![0u8; cap as usize].into_boxed_slice());
        // SAFETY: leaked buffer lives for the test's duration and beyond.
        unsafe { ByteRing::from_raw(buf.as_ptr() as u64, cap) }
    }

    #[test]
    fn fifo_order_is_preserved() {
        let mut r = ring(16);
        for b in b"hello, ring" {
            r.write(*b);
        }
        let mut out = [0u8; 32];
        let n = r.read(&mut out);
        assert_eq!(&out[..n], b"hello, ring");
    }

    #[test]
    fn wraparound_keeps_fifo_order() {
        let mut r = ring(8);
        // Fill-and-drain repeatedly so the cursors wrap several times.
        for round in 0u8..10 {
            for i in 0..5 {
                r.write(round * 10 + i);
            }
            let mut out = [0u8; 8];
            let n = r.read(&mut out);
            assert_eq!(n, 5);
            for i in 0..5u8 {
                assert_eq!(out[i as usize], round * 10 + i);
            }
        }
        assert!(r.is_empty());
    }

    #[test]
    fn partial_reads_resume_where_they_left_off() {
        let mut r = ring(16);
        for b in b"abcdef" {
            r.write(*b);
        }
        let mut first = [0u8; 3];
        assert_eq!(r.read(&mut first), 3);
        assert_eq!(&first, b"abc");
        let mut rest = [0u8; 8];
        let n = r.read(&mut rest);
        assert_eq!(&rest[..n], b"def");
    }

    #[test]
    fn key_queue_drops_nothing_within_capacity() {
        let mut q = KeyQueue::new();
        assert!(q.pop().is_none());
        for i in 0..10u8 {
            q.push(KeyEvent {
                scancode: i,
                ascii: b'a' + i,
                pressed: 1,
                shift: 0,
                ctrl: 0,
                alt: 0,
            });
        }
        for i in 0..10u8 {
            let ev = q.pop().unwrap();
            assert_eq!(ev.scancode, i);
            assert_eq!(ev.ascii, b'a' + i);
        }
        assert!(q.is_empty());
    }
}
