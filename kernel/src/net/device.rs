//! NIC contract.
//!
//! The E1000/E1000E driver internals are outside the kernel core; a driver
//! registers itself here and feeds received frames back through
//! [`on_frame_received`]. Tests register a frame-capturing device and
//! drive the stack directly.

use spin::Mutex;

use crate::error::{KernelError, KernelResult};

pub trait NetDevice: Send + Sync {
    fn mac(&self) -> [u8; 6];
    fn transmit(&self, frame: &[u8]) -> KernelResult<()>;
}

static DEVICE: Mutex<Option<&'static dyn NetDevice>> = Mutex::new(None);

pub fn register(device: &'static dyn NetDevice) {
    *DEVICE.lock() = Some(device);
    let mac = device.mac();
    log::info!(target: "net",
        "device registered, mac={:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]);
}

pub fn is_registered() -> bool {
    DEVICE.lock().is_some()
}

pub fn mac() -> [u8; 6] {
    DEVICE.lock().map(|d| d.mac()).unwrap_or([0; 6])
}

pub fn transmit(frame: &[u8]) -> KernelResult<()> {
    let device = *DEVICE.lock();
    match device {
        Some(d) => d.transmit(frame),
        None => Err(KernelError::NotFound { resource: "nic" }),
    }
}

/// Receive upcall invoked by the NIC driver for each inbound frame.
pub fn on_frame_received(frame: &[u8]) {
    super::ethernet::on_frame(frame);
}

#[cfg(test)]
pub mod testutil {
    //! Shared scaffolding for net-layer tests: a frame-capturing device
    //! plus a global lock serializing tests that touch the net statics.

    extern crate alloc;

    use alloc::{boxed::Box, vec::Vec};

    use spin::{Mutex, MutexGuard};

    use super::*;

    static NET_TEST_LOCK: Mutex<()> = Mutex::new(());

    pub struct CaptureDevice {
        pub frames: Mutex<Vec<Vec<u8>>>,
    }

    impl NetDevice for CaptureDevice {
        fn mac(&self) -> [u8; 6] {
            [0x52, 0x54, 0x00, 0x12, 0x34, 0x56]
        }

        fn transmit(&self, frame: &[u8]) -> KernelResult<()> {
            self.frames.lock().push(frame.to_vec());
            Ok(())
        }
    }

    /// Serialize net tests and install a fresh capture device; returns
    /// (guard, device).
    pub fn setup() -> (MutexGuard<'static, ()>, &'static CaptureDevice) {
        let guard = NET_TEST_LOCK.lock();
        let dev: &'static CaptureDevice = Box::leak(Box::new(CaptureDevice {
            frames: Mutex::new(Vec::new()),
        }));
        register(dev);
        crate::net::arp::clear_cache();
        // Every test resolves next hops from a warm cache; nothing blocks.
        crate::net::arp::cache_insert(
            crate::net::config().gateway,
            [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF],
        );
        (guard, dev)
    }

    /// Strip the Ethernet and IPv4 headers off a captured frame, returning
    /// the L4 payload.
    pub fn l4_payload(frame: &[u8]) -> &[u8] {
        let ihl = ((frame[14] & 0x0F) as usize) * 4;
        let total = u16::from_be_bytes([frame[16], frame[17]]) as usize;
        &frame[14 + ihl..14 + total]
    }
}
