//! Architecture support. ZenithOS targets x86_64 only.

pub mod x86_64;

/// Halt the CPU forever.
pub fn halt() -> ! {
    loop {
        #[cfg(target_os = "none")]
        ::x86_64::instructions::hlt();
        #[cfg(not(target_os = "none"))]
        core::hint::spin_loop();
    }
}
