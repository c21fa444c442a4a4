//! UDP: header framing and inbound dispatch to the DNS resolver and the
//! socket layer.

use super::{ip, Ipv4Address};
use crate::error::KernelResult;

pub const HEADER_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub length: u16,
    pub checksum: u16,
}

impl UdpHeader {
    pub fn new(src_port: u16, dst_port: u16, payload_len: u16) -> Self {
        Self {
            src_port,
            dst_port,
            length: HEADER_SIZE as u16 + payload_len,
            checksum: 0,
        }
    }

    pub fn to_bytes(self) -> [u8; HEADER_SIZE] {
        let mut b = [0u8; HEADER_SIZE];
        b[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        b[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        b[4..6].copy_from_slice(&self.length.to_be_bytes());
        b[6..8].copy_from_slice(&self.checksum.to_be_bytes());
        b
    }

    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        if b.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            src_port: u16::from_be_bytes([b[0], b[1]]),
            dst_port: u16::from_be_bytes([b[2], b[3]]),
            length: u16::from_be_bytes([b[4], b[5]]),
            checksum: u16::from_be_bytes([b[6], b[7]]),
        })
    }
}

/// Send one datagram.
pub fn send(dst: Ipv4Address, src_port: u16, dst_port: u16, payload: &[u8]) -> KernelResult<()> {
    let mut segment = [0u8; ip::MAX_PAYLOAD];
    let len = HEADER_SIZE + payload.len().min(ip::MAX_PAYLOAD - HEADER_SIZE);

    let header = UdpHeader::new(src_port, dst_port, (len - HEADER_SIZE) as u16);
    segment[..HEADER_SIZE].copy_from_slice(&header.to_bytes());
    segment[HEADER_SIZE..len].copy_from_slice(&payload[..len - HEADER_SIZE]);

    let csum = ip::pseudo_header_checksum(super::ip_address(), dst, ip::PROTO_UDP, &segment[..len]);
    segment[6..8].copy_from_slice(&csum.to_be_bytes());

    ip::send(dst, ip::PROTO_UDP, &segment[..len])
}

/// Inbound UDP: DNS replies are intercepted by the resolver; everything
/// else lands in socket receive queues.
pub fn on_packet(src: Ipv4Address, _dst: Ipv4Address, segment: &[u8]) {
    let Some(header) = UdpHeader::from_bytes(segment) else {
        return;
    };
    let len = (header.length as usize).min(segment.len());
    if len < HEADER_SIZE {
        return;
    }
    let payload = &segment[HEADER_SIZE..len];

    if super::dns::on_datagram(src, header.src_port, header.dst_port, payload) {
        return;
    }
    super::socket::on_udp_datagram(src, header.src_port, header.dst_port, payload);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let h = UdpHeader::new(1234, 5678, 50);
        assert_eq!(h.length, 58);
        let parsed = UdpHeader::from_bytes(&h.to_bytes()).unwrap();
        assert_eq!(parsed, h);
        assert!(UdpHeader::from_bytes(&[0u8; 4]).is_none());
    }

    #[test]
    fn datagrams_checksum_over_the_pseudo_header() {
        let (_guard, dev) = crate::net::device::testutil::setup();
        let peer = Ipv4Address::new(10, 0, 2, 42);
        crate::net::arp::cache_insert(peer, [7; 6]);
        send(peer, 40000, 53, b"query").unwrap();

        let frames = dev.frames.lock();
        let udp = crate::net::device::testutil::l4_payload(&frames[0]);
        assert_eq!(u16::from_be_bytes([udp[2], udp[3]]), 53);
        assert_eq!(
            ip::pseudo_header_checksum(super::super::ip_address(), peer, ip::PROTO_UDP, udp),
            0
        );
        assert_eq!(&udp[8..], b"query");
    }
}
