//! DNS resolver: single-question A query to the configured server over
//! UDP 53, first A record wins. Backs the `resolve` syscall.

use core::sync::atomic::{AtomicU16, Ordering};

use spin::Mutex;

use super::{udp, Ipv4Address};
use crate::error::{KernelError, KernelResult};

const DNS_PORT: u16 = 53;
/// Ephemeral source ports for queries.
const EPHEMERAL_BASE: u16 = 0xC000;
/// Total resolve timeout: ~2 s of 10 ms polls.
const RESOLVE_ATTEMPTS: u32 = 200;

static NEXT_QUERY: AtomicU16 = AtomicU16::new(1);

#[derive(Debug, Clone, Copy, Default)]
struct PendingQuery {
    active: bool,
    port: u16,
    ident: u16,
    answer: Option<Ipv4Address>,
}

static PENDING: Mutex<PendingQuery> = Mutex::new(PendingQuery {
    active: false,
    port: 0,
    ident: 0,
    answer: None,
});

/// Encode a hostname into DNS label format; returns the encoded length.
fn encode_name(hostname: &str, out: &mut [u8]) -> Option<usize> {
    let mut pos = 0;
    for label in hostname.split('.') {
        if label.is_empty() || label.len() > 63 || pos + 1 + label.len() + 1 > out.len() {
            return None;
        }
        out[pos] = label.len() as u8;
        pos += 1;
        out[pos..pos + label.len()].copy_from_slice(label.as_bytes());
        pos += label.len();
    }
    out[pos] = 0;
    Some(pos + 1)
}

/// Skip a (possibly compressed) name at `pos`; returns the next offset.
fn skip_name(packet: &[u8], mut pos: usize) -> Option<usize> {
    loop {
        let len = *packet.get(pos)?;
        if len == 0 {
            return Some(pos + 1);
        }
        if len & 0xC0 == 0xC0 {
            return Some(pos + 2); // compression pointer ends the name
        }
        pos += 1 + len as usize;
    }
}

/// Parse the first A record out of a response; `ident` must match.
fn parse_answer(packet: &[u8], ident: u16) -> Option<Ipv4Address> {
    if packet.len() < 12 {
        return None;
    }
    if u16::from_be_bytes([packet[0], packet[1]]) != ident {
        return None;
    }
    let flags = u16::from_be_bytes([packet[2], packet[3]]);
    if flags & 0x8000 == 0 || flags & 0x000F != 0 {
        return None; // not a response, or RCODE != 0
    }
    let qdcount = u16::from_be_bytes([packet[4], packet[5]]);
    let ancount = u16::from_be_bytes([packet[6], packet[7]]);

    let mut pos = 12;
    for _ in 0..qdcount {
        pos = skip_name(packet, pos)?;
        pos += 4; // qtype + qclass
    }
    for _ in 0..ancount {
        pos = skip_name(packet, pos)?;
        let rtype = u16::from_be_bytes([*packet.get(pos)?, *packet.get(pos + 1)?]);
        let rdlength = u16::from_be_bytes([*packet.get(pos + 8)?, *packet.get(pos + 9)?]) as usize;
        pos += 10;
        if rtype == 1 && rdlength == 4 {
            return Some(Ipv4Address([
                *packet.get(pos)?,
                *packet.get(pos + 1)?,
                *packet.get(pos + 2)?,
                *packet.get(pos + 3)?,
            ]));
        }
        pos += rdlength;
    }
    None
}

/// UDP upcall hook. Returns true when the datagram was a pending reply.
pub fn on_datagram(_src: Ipv4Address, src_port: u16, dst_port: u16, payload: &[u8]) -> bool {
    let mut pending = PENDING.lock();
    if !pending.active || src_port != DNS_PORT || dst_port != pending.port {
        return false;
    }
    if let Some(addr) = parse_answer(payload, pending.ident) {
        pending.answer = Some(addr);
    }
    true
}

/// Resolve a hostname to an IPv4 address. Blocking; returns on the first
/// A record or after the timeout.
pub fn resolve(hostname: &str) -> KernelResult<Ipv4Address> {
    // Dotted-quad literals resolve locally.
    if let Some(addr) = parse_literal(hostname) {
        return Ok(addr);
    }

    let ident = NEXT_QUERY.fetch_add(1, Ordering::Relaxed);
    let port = EPHEMERAL_BASE.wrapping_add(ident % 0x3FFF);

    let mut query = [0u8; 288];
    query[0..2].copy_from_slice(&ident.to_be_bytes());
    query[2] = 0x01; // RD
    query[4..6].copy_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    let name_len = encode_name(hostname, &mut query[12..268]).ok_or(
        KernelError::InvalidArgument { name: "hostname" },
    )?;
    let mut pos = 12 + name_len;
    query[pos..pos + 2].copy_from_slice(&1u16.to_be_bytes()); // QTYPE A
    pos += 2;
    query[pos..pos + 2].copy_from_slice(&1u16.to_be_bytes()); // QCLASS IN
    pos += 2;

    {
        let mut pending = PENDING.lock();
        *pending = PendingQuery {
            active: true,
            port,
            ident,
            answer: None,
        };
    }

    let server = super::config().dns_server;
    udp::send(server, port, DNS_PORT, &query[..pos])?;

    for _ in 0..RESOLVE_ATTEMPTS {
        crate::timer::sleep_ms(10);
        let mut pending = PENDING.lock();
        if let Some(addr) = pending.answer {
            pending.active = false;
            return Ok(addr);
        }
    }
    PENDING.lock().active = false;
    Err(KernelError::Timeout {
        operation: "dns resolve",
    })
}

fn parse_literal(hostname: &str) -> Option<Ipv4Address> {
    let mut octets = [0u8; 4];
    let mut count = 0;
    for part in hostname.split('.') {
        if count >= 4 {
            return None;
        }
        octets[count] = part.parse::<u8>().ok()?;
        count += 1;
    }
    (count == 4).then_some(Ipv4Address(octets))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_encoding_uses_length_prefixed_labels() {
        let mut buf = [0u8; 64];
        let n = encode_name("example.com", &mut buf).unwrap();
        assert_eq!(&buf[..n], b"\x07example\x03com\0");
        assert!(encode_name("", &mut buf).is_none());
    }

    #[test]
    fn first_a_record_wins_and_cnames_are_skipped() {
        // Response: ident 7, 1 question, 2 answers (CNAME then A).
        let mut p = alloc::vec::Vec::new();
        extern crate alloc;
        p.extend_from_slice(&7u16.to_be_bytes());
        p.extend_from_slice(&0x8180u16.to_be_bytes());
        p.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
        p.extend_from_slice(&2u16.to_be_bytes()); // ANCOUNT
        p.extend_from_slice(&[0; 4]); // NS/AR
        p.extend_from_slice(b"\x03foo\x02io\0");
        p.extend_from_slice(&[0, 1, 0, 1]); // A IN
        // CNAME answer, compressed name, rdlength 6.
        p.extend_from_slice(&[0xC0, 12, 0, 5, 0, 1, 0, 0, 0, 60, 0, 6]);
        p.extend_from_slice(b"\x03bar\x00\x00");
        // A answer.
        p.extend_from_slice(&[0xC0, 12, 0, 1, 0, 1, 0, 0, 0, 60, 0, 4]);
        p.extend_from_slice(&[93, 184, 216, 34]);

        assert_eq!(
            parse_answer(&p, 7),
            Some(Ipv4Address::new(93, 184, 216, 34))
        );
        // Wrong ident is rejected.
        assert_eq!(parse_answer(&p, 8), None);
    }

    #[test]
    fn dotted_quads_short_circuit() {
        assert_eq!(
            parse_literal("192.168.0.7"),
            Some(Ipv4Address::new(192, 168, 0, 7))
        );
        assert_eq!(parse_literal("not.a.host.name"), None);
        assert_eq!(parse_literal("1.2.3"), None);
    }
}
