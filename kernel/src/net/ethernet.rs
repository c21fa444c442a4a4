//! Ethernet framing and inbound dispatch.

use super::device;

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;

pub const HEADER_SIZE: usize = 14;
/// Minimum frame size on the wire (without FCS).
const MIN_FRAME: usize = 60;
/// MTU-bounded maximum payload.
pub const MAX_PAYLOAD: usize = 1500;

pub const BROADCAST_MAC: [u8; 6] = [0xFF; 6];

/// Build and transmit one frame, padding short payloads to the minimum.
pub fn send(dst_mac: [u8; 6], ethertype: u16, payload: &[u8]) -> crate::error::KernelResult<()> {
    let mut frame = [0u8; HEADER_SIZE + MAX_PAYLOAD];
    let len = payload.len().min(MAX_PAYLOAD);

    frame[0..6].copy_from_slice(&dst_mac);
    frame[6..12].copy_from_slice(&device::mac());
    frame[12..14].copy_from_slice(&ethertype.to_be_bytes());
    frame[HEADER_SIZE..HEADER_SIZE + len].copy_from_slice(&payload[..len]);

    let total = (HEADER_SIZE + len).max(MIN_FRAME);
    device::transmit(&frame[..total])
}

/// Inbound dispatch by EtherType.
pub fn on_frame(frame: &[u8]) {
    if frame.len() < HEADER_SIZE {
        return;
    }
    let ethertype = u16::from_be_bytes([frame[12], frame[13]]);
    let payload = &frame[HEADER_SIZE..];
    match ethertype {
        ETHERTYPE_ARP => super::arp::on_packet(payload),
        ETHERTYPE_IPV4 => super::ip::on_packet(payload),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::device::testutil;
    use crate::net::device::NetDevice;

    #[test]
    fn frames_carry_macs_ethertype_and_padding() {
        let (_guard, dev) = testutil::setup();
        send([1, 2, 3, 4, 5, 6], 0x1234, b"hi").unwrap();
        let frames = dev.frames.lock();
        let f = &frames[0];
        assert_eq!(f.len(), 60); // padded
        assert_eq!(&f[0..6], &[1, 2, 3, 4, 5, 6]);
        assert_eq!(&f[6..12], &dev.mac());
        assert_eq!(&f[12..14], &[0x12, 0x34]);
        assert_eq!(&f[14..16], b"hi");
    }
}
