//! Kernel error types.
//!
//! A single error currency for all subsystems. Internal APIs return
//! [`KernelResult`] and propagate with `?`; the syscall dispatcher converts
//! every error into the negative sentinel the ABI demands, so nothing ever
//! unwinds across the ring-3 boundary.

use core::fmt;

/// Main kernel error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Physical frame or heap allocation failed.
    OutOfMemory,
    /// A fixed-size table (processes, windows, connections, handles, ...)
    /// has no free slot.
    NoFreeSlot {
        resource: &'static str,
    },
    InvalidArgument {
        name: &'static str,
    },
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },
    NotFound {
        resource: &'static str,
    },
    /// A bounded spin or poll expired before the condition held.
    Timeout {
        operation: &'static str,
    },
    /// A device reported a non-success status.
    HardwareError {
        device: &'static str,
        code: u32,
    },
    /// Operation would block and the caller asked not to.
    WouldBlock,
    /// A binary image (ELF, TAR, descriptor blob) failed validation.
    MalformedImage {
        reason: &'static str,
    },
}

/// Convenient result alias used throughout the kernel
pub type KernelResult<T> = Result<T, KernelError>;

impl KernelError {
    /// Map an error to the syscall-boundary sentinel. Every kind collapses
    /// to -1 except where a distinct value is load-bearing for userland.
    pub fn as_sysret(&self) -> i64 {
        -1
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::OutOfMemory => write!(f, "out of memory"),
            KernelError::NoFreeSlot { resource } => {
                write!(f, "no free slot in {} table", resource)
            }
            KernelError::InvalidArgument { name } => write!(f, "invalid argument: {}", name),
            KernelError::InvalidState { expected, actual } => {
                write!(f, "invalid state: expected {}, was {}", expected, actual)
            }
            KernelError::NotFound { resource } => write!(f, "{} not found", resource),
            KernelError::Timeout { operation } => write!(f, "{} timed out", operation),
            KernelError::HardwareError { device, code } => {
                write!(f, "{} error, code {:#x}", device, code)
            }
            KernelError::WouldBlock => write!(f, "operation would block"),
            KernelError::MalformedImage { reason } => write!(f, "malformed image: {}", reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sysret_is_negative() {
        assert!(KernelError::OutOfMemory.as_sysret() < 0);
        assert!(
            KernelError::NoFreeSlot {
                resource: "process"
            }
            .as_sysret()
                < 0
        );
    }

    #[test]
    fn display_names_the_resource() {
        extern crate alloc;
        use alloc::format;
        let msg = format!(
            "{}",
            KernelError::NoFreeSlot {
                resource: "window"
            }
        );
        assert!(msg.contains("window"));
    }
}
