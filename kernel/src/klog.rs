//! Kernel log service.
//!
//! Backend for the `log` crate facade: every record is written to the serial
//! console and appended to a fixed-size in-memory ring, which userland can
//! drain through the `klog` syscall. The ring overwrites its oldest bytes on
//! overflow, so the tail of the boot log is always retained.

use core::fmt::{self, Write};

use log::{Level, LevelFilter, Metadata, Record};
use spin::Mutex;

/// Bytes of kernel log retained in memory (16 KiB).
const LOG_RING_SIZE: usize = 16 * 1024;

struct LogRing {
    buf: [u8; LOG_RING_SIZE],
    /// Next write position.
    head: usize,
    /// Total bytes ever written; `min(len, LOG_RING_SIZE)` are retained.
    len: usize,
}

impl LogRing {
    const fn new() -> Self {
        Self {
            buf: [0; LOG_RING_SIZE],
            head: 0,
            len: 0,
        }
    }

    fn push(&mut self, byte: u8) {
        self.buf[self.head] = byte;
        self.head = (self.head + 1) % LOG_RING_SIZE;
        self.len += 1;
    }

    /// Copy up to `out.len()` bytes starting at the oldest retained byte.
    fn snapshot(&self, out: &mut [u8]) -> usize {
        let retained = self.len.min(LOG_RING_SIZE);
        let count = retained.min(out.len());
        // Oldest retained byte sits at `head - retained` (mod ring size).
        let start = (self.head + LOG_RING_SIZE - retained) % LOG_RING_SIZE;
        for (i, slot) in out.iter_mut().enumerate().take(count) {
            *slot = self.buf[(start + i) % LOG_RING_SIZE];
        }
        count
    }
}

static LOG_RING: Mutex<LogRing> = Mutex::new(LogRing::new());

impl Write for LogRing {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for &b in s.as_bytes() {
            self.push(b);
        }
        Ok(())
    }
}

struct KernelLogger;

impl log::Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Info
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let tag = match record.level() {
            Level::Error => "FAIL",
            Level::Warn => "WARN",
            _ => " OK ",
        };
        crate::println!("[{}] {}: {}", tag, record.target(), record.args());
        // The ring is also written from interrupt context (hot-plug logs);
        // keep the lock interrupt-free.
        #[cfg(target_os = "none")]
        x86_64::instructions::interrupts::without_interrupts(|| {
            let mut ring = LOG_RING.lock();
            writeln!(ring, "[{}] {}: {}", tag, record.target(), record.args()).ok();
        });
        #[cfg(not(target_os = "none"))]
        {
            let mut ring = LOG_RING.lock();
            writeln!(ring, "[{}] {}: {}", tag, record.target(), record.args()).ok();
        }
    }

    fn flush(&self) {}
}

static LOGGER: KernelLogger = KernelLogger;

/// Install the kernel logger. Called once during boot, after serial init.
pub fn init() {
    log::set_logger(&LOGGER).ok();
    log::set_max_level(LevelFilter::Info);
}

/// Drain a snapshot of the retained kernel log into `out`; returns the byte
/// count. Backs the `klog` syscall.
pub fn read_kernel_log(out: &mut [u8]) -> usize {
    LOG_RING.lock().snapshot(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_retains_most_recent_bytes() {
        let mut ring = LogRing::new();
        for _ in 0..2 {
            for b in 0..=255u8 {
                ring.push(b);
            }
        }
        // Overfill well past capacity.
        for _ in 0..LOG_RING_SIZE {
            ring.push(b'z');
        }
        let mut out = [0u8; 8];
        let n = ring.snapshot(&mut out);
        assert_eq!(n, 8);
        assert_eq!(&out, b"zzzzzzzz");
    }

    #[test]
    fn snapshot_of_short_log_is_exact() {
        let mut ring = LogRing::new();
        for &b in b"hello" {
            ring.push(b);
        }
        let mut out = [0u8; 32];
        let n = ring.snapshot(&mut out);
        assert_eq!(&out[..n], b"hello");
    }
}
