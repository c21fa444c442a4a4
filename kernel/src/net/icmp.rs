//! ICMP echo: replies to inbound pings, tracks the one outstanding
//! outbound echo for the `ping` syscall.

use spin::Mutex;

use super::{ip, Ipv4Address};
use crate::error::KernelResult;

const TYPE_ECHO_REPLY: u8 = 0;
const TYPE_ECHO_REQUEST: u8 = 8;
const HEADER_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, Default)]
struct ReplyState {
    seen: bool,
    ident: u16,
    seq: u16,
}

static REPLY: Mutex<ReplyState> = Mutex::new(ReplyState {
    seen: false,
    ident: 0,
    seq: 0,
});

/// Forget any recorded reply before sending a new request.
pub fn reset_reply() {
    REPLY.lock().seen = false;
}

/// True once a reply matching (ident, seq) has arrived.
pub fn has_reply(ident: u16, seq: u16) -> bool {
    let r = *REPLY.lock();
    r.seen && r.ident == ident && r.seq == seq
}

fn build(icmp_type: u8, ident: u16, seq: u16, payload: &[u8]) -> ([u8; 64], usize) {
    let mut packet = [0u8; 64];
    let len = HEADER_SIZE + payload.len().min(64 - HEADER_SIZE);
    packet[0] = icmp_type;
    packet[4..6].copy_from_slice(&ident.to_be_bytes());
    packet[6..8].copy_from_slice(&seq.to_be_bytes());
    packet[HEADER_SIZE..len].copy_from_slice(&payload[..len - HEADER_SIZE]);
    let csum = ip::header_checksum(&packet[..len]);
    packet[2..4].copy_from_slice(&csum.to_be_bytes());
    (packet, len)
}

pub fn send_echo_request(dst: Ipv4Address, ident: u16, seq: u16) -> KernelResult<()> {
    let (packet, len) = build(TYPE_ECHO_REQUEST, ident, seq, b"zenith-ping-data");
    ip::send(dst, ip::PROTO_ICMP, &packet[..len])
}

/// Inbound ICMP: answer echo requests, record echo replies.
pub fn on_packet(src: Ipv4Address, packet: &[u8]) {
    if packet.len() < HEADER_SIZE {
        return;
    }
    if ip::header_checksum(packet) != 0 {
        return;
    }
    let ident = u16::from_be_bytes([packet[4], packet[5]]);
    let seq = u16::from_be_bytes([packet[6], packet[7]]);

    match packet[0] {
        TYPE_ECHO_REQUEST => {
            let (reply, len) = build(TYPE_ECHO_REPLY, ident, seq, &packet[HEADER_SIZE..]);
            ip::send(src, ip::PROTO_ICMP, &reply[..len]).ok();
        }
        TYPE_ECHO_REPLY => {
            *REPLY.lock() = ReplyState {
                seen: true,
                ident,
                seq,
            };
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::device::testutil;

    #[test]
    fn echo_requests_are_answered_and_replies_recorded() {
        let (_guard, dev) = testutil::setup();
        let peer = Ipv4Address::new(10, 0, 2, 60);
        crate::net::arp::cache_insert(peer, [6; 6]);

        // Inbound request → we transmit a reply with matching ident/seq.
        let (req, len) = build(TYPE_ECHO_REQUEST, 0x2E01, 7, b"abc");
        on_packet(peer, &req[..len]);
        {
            let frames = dev.frames.lock();
            let icmp = testutil::l4_payload(&frames[0]);
            assert_eq!(icmp[0], TYPE_ECHO_REPLY);
            assert_eq!(u16::from_be_bytes([icmp[4], icmp[5]]), 0x2E01);
            assert_eq!(u16::from_be_bytes([icmp[6], icmp[7]]), 7);
            assert_eq!(ip::header_checksum(icmp), 0);
        }

        // Inbound reply → has_reply flips for exactly that (id, seq).
        reset_reply();
        assert!(!has_reply(0x2E01, 9));
        let (rep, rlen) = build(TYPE_ECHO_REPLY, 0x2E01, 9, b"");
        on_packet(peer, &rep[..rlen]);
        assert!(has_reply(0x2E01, 9));
        assert!(!has_reply(0x2E01, 10));
    }
}
