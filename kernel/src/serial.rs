//! COM1 serial port used for the kernel console and the logger backend.

use core::fmt::{self, Write};

use spin::Mutex;

/// COM1 base port.
const COM1: u16 = 0x3F8;

pub struct SerialPort {
    inner: uart_16550::SerialPort,
}

impl SerialPort {
    /// # Safety
    /// `COM1` must be a real 16550-compatible UART; on anything that boots
    /// this kernel (QEMU, physical x86) it is.
    const unsafe fn new() -> Self {
        Self {
            // SAFETY: standard COM1 I/O port on x86.
            inner: unsafe { uart_16550::SerialPort::new(COM1) },
        }
    }

    pub fn init(&mut self) {
        self.inner.init();
    }
}

impl fmt::Write for SerialPort {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.inner.write_str(s)
    }
}

// SAFETY: all access goes through the global mutex below.
static SERIAL1: Mutex<SerialPort> = Mutex::new(unsafe { SerialPort::new() });

/// Initialize the UART. Called once, early in boot, before logging starts.
pub fn init() {
    SERIAL1.lock().init();
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    // Interrupt handlers log too; disable interrupts while the lock is held
    // so a tick cannot deadlock against a half-finished line.
    #[cfg(target_os = "none")]
    x86_64::instructions::interrupts::without_interrupts(|| {
        SERIAL1.lock().write_fmt(args).ok();
    });
    #[cfg(not(target_os = "none"))]
    {
        SERIAL1.lock().write_fmt(args).ok();
    }
}
