//! ARP: a small cache plus request/reply handling.

use spin::Mutex;

use super::{device, ethernet, Ipv4Address};
use crate::error::{KernelError, KernelResult};

const CACHE_SIZE: usize = 16;
const PACKET_SIZE: usize = 28;

const OP_REQUEST: u16 = 1;
const OP_REPLY: u16 = 2;

/// Bounded resolve wait: ~1 s of 10 ms yields.
const RESOLVE_ATTEMPTS: u32 = 100;

#[derive(Debug, Clone, Copy, Default)]
struct CacheEntry {
    ip: Ipv4Address,
    mac: [u8; 6],
    valid: bool,
}

static CACHE: Mutex<[CacheEntry; CACHE_SIZE]> =
    Mutex::new([CacheEntry {
        ip: Ipv4Address([0; 4]),
        mac: [0; 6],
        valid: false,
    }; CACHE_SIZE]);

static NEXT_SLOT: Mutex<usize> = Mutex::new(0);

pub fn cache_insert(ip: Ipv4Address, mac: [u8; 6]) {
    let mut cache = CACHE.lock();
    if let Some(entry) = cache.iter_mut().find(|e| e.valid && e.ip == ip) {
        entry.mac = mac;
        return;
    }
    let mut next = NEXT_SLOT.lock();
    cache[*next] = CacheEntry {
        ip,
        mac,
        valid: true,
    };
    *next = (*next + 1) % CACHE_SIZE;
}

pub fn cache_lookup(ip: Ipv4Address) -> Option<[u8; 6]> {
    CACHE
        .lock()
        .iter()
        .find(|e| e.valid && e.ip == ip)
        .map(|e| e.mac)
}

#[cfg(test)]
pub fn clear_cache() {
    for e in CACHE.lock().iter_mut() {
        e.valid = false;
    }
    *NEXT_SLOT.lock() = 0;
}

fn build(op: u16, target_mac: [u8; 6], target_ip: Ipv4Address) -> [u8; PACKET_SIZE] {
    let our_ip = super::ip_address();
    let mut p = [0u8; PACKET_SIZE];
    p[0..2].copy_from_slice(&1u16.to_be_bytes()); // HTYPE ethernet
    p[2..4].copy_from_slice(&ethernet::ETHERTYPE_IPV4.to_be_bytes());
    p[4] = 6; // HLEN
    p[5] = 4; // PLEN
    p[6..8].copy_from_slice(&op.to_be_bytes());
    p[8..14].copy_from_slice(&device::mac());
    p[14..18].copy_from_slice(&our_ip.0);
    p[18..24].copy_from_slice(&target_mac);
    p[24..28].copy_from_slice(&target_ip.0);
    p
}

fn send_request(ip: Ipv4Address) -> KernelResult<()> {
    let packet = build(OP_REQUEST, [0; 6], ip);
    ethernet::send(ethernet::BROADCAST_MAC, ethernet::ETHERTYPE_ARP, &packet)
}

/// Resolve a next-hop IP to a MAC, asking the wire and yielding while the
/// reply is outstanding.
pub fn resolve(ip: Ipv4Address) -> KernelResult<[u8; 6]> {
    if ip.is_broadcast() {
        return Ok(ethernet::BROADCAST_MAC);
    }
    if let Some(mac) = cache_lookup(ip) {
        return Ok(mac);
    }
    send_request(ip)?;
    for _ in 0..RESOLVE_ATTEMPTS {
        crate::timer::sleep_ms(10);
        if let Some(mac) = cache_lookup(ip) {
            return Ok(mac);
        }
    }
    Err(KernelError::Timeout {
        operation: "arp resolve",
    })
}

/// Inbound ARP: learn sender mappings, answer requests for our address.
pub fn on_packet(packet: &[u8]) {
    if packet.len() < PACKET_SIZE {
        return;
    }
    let op = u16::from_be_bytes([packet[6], packet[7]]);
    let mut sender_mac = [0u8; 6];
    sender_mac.copy_from_slice(&packet[8..14]);
    let sender_ip = Ipv4Address([packet[14], packet[15], packet[16], packet[17]]);
    let target_ip = Ipv4Address([packet[24], packet[25], packet[26], packet[27]]);

    cache_insert(sender_ip, sender_mac);

    if op == OP_REQUEST && target_ip == super::ip_address() {
        let reply = build(OP_REPLY, sender_mac, sender_ip);
        ethernet::send(sender_mac, ethernet::ETHERTYPE_ARP, &reply).ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::device::testutil;

    #[test]
    fn requests_for_our_ip_are_answered_and_senders_learned() {
        let (_guard, dev) = testutil::setup();
        let peer_mac = [2, 2, 2, 2, 2, 2];
        let peer_ip = Ipv4Address::new(10, 0, 2, 9);

        let request = {
            let mut p = build(OP_REQUEST, [0; 6], super::super::ip_address());
            p[8..14].copy_from_slice(&peer_mac);
            p[14..18].copy_from_slice(&peer_ip.0);
            p
        };
        on_packet(&request);

        assert_eq!(cache_lookup(peer_ip), Some(peer_mac));
        let frames = dev.frames.lock();
        let reply = &frames[0];
        assert_eq!(&reply[0..6], &peer_mac); // unicast back
        let op = u16::from_be_bytes([reply[14 + 6], reply[14 + 7]]);
        assert_eq!(op, OP_REPLY);
    }

    #[test]
    fn cached_entries_resolve_without_traffic() {
        let (_guard, dev) = testutil::setup();
        let ip = Ipv4Address::new(10, 0, 2, 77);
        cache_insert(ip, [9; 6]);
        assert_eq!(resolve(ip).unwrap(), [9; 6]);
        assert!(dev.frames.lock().is_empty());
        assert_eq!(resolve(Ipv4Address::BROADCAST).unwrap(), ethernet::BROADCAST_MAC);
    }
}
