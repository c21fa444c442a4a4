//! TCP engine.
//!
//! Sixteen connection slots, each guarded by its own spinlock (nominal on
//! one core, kept for SMP portability). The receive path delivers only
//! in-order segments (`seq == recv_next`); out-of-order segments drop, so
//! data is never reordered. Retransmission tracks a single segment — the
//! most recent one — so a multi-segment send can under-retransmit; this
//! mirrors the engine's bounded-memory design and is a known limitation.
//! No window management beyond the fixed advertised window, no congestion
//! control, no SACK.
//!
//! Blocking entry points (connect/accept/send/recv/close) sleep between
//! polls and never hold a connection lock across a yield.

use bitflags::bitflags;
use spin::Mutex;

use super::{ip, Ipv4Address};
use crate::error::{KernelError, KernelResult};

pub const MAX_CONNECTIONS: usize = 16;
pub const HEADER_SIZE: usize = 20;
pub const MSS: usize = 1460;

const RECV_BUFFER_SIZE: usize = 4096;
const WINDOW_SIZE: u16 = 4096;
const RETRANSMIT_BUFFER_SIZE: usize = 1500;
const RETRANSMIT_TIMEOUT_MS: u64 = 1000;
const MAX_RETRANSMITS: u32 = 5;
const TIME_WAIT_MS: u64 = 2000;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TcpFlags: u8 {
        const FIN = 0x01;
        const SYN = 0x02;
        const RST = 0x04;
        const PSH = 0x08;
        const ACK = 0x10;
        const URG = 0x20;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    LastAck,
    TimeWait,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub data_offset: u8,
    pub flags: TcpFlags,
    pub window: u16,
    pub checksum: u16,
    pub urgent: u16,
}

impl TcpHeader {
    pub fn to_bytes(self) -> [u8; HEADER_SIZE] {
        let mut b = [0u8; HEADER_SIZE];
        b[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        b[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        b[4..8].copy_from_slice(&self.seq.to_be_bytes());
        b[8..12].copy_from_slice(&self.ack.to_be_bytes());
        b[12] = (self.data_offset / 4) << 4;
        b[13] = self.flags.bits();
        b[14..16].copy_from_slice(&self.window.to_be_bytes());
        b[16..18].copy_from_slice(&self.checksum.to_be_bytes());
        b[18..20].copy_from_slice(&self.urgent.to_be_bytes());
        b
    }

    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        if b.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            src_port: u16::from_be_bytes([b[0], b[1]]),
            dst_port: u16::from_be_bytes([b[2], b[3]]),
            seq: u32::from_be_bytes([b[4], b[5], b[6], b[7]]),
            ack: u32::from_be_bytes([b[8], b[9], b[10], b[11]]),
            data_offset: (b[12] >> 4) * 4,
            flags: TcpFlags::from_bits_truncate(b[13]),
            window: u16::from_be_bytes([b[14], b[15]]),
            checksum: u16::from_be_bytes([b[16], b[17]]),
            urgent: u16::from_be_bytes([b[18], b[19]]),
        })
    }
}

struct Connection {
    active: bool,
    state: State,
    local_ip: Ipv4Address,
    local_port: u16,
    remote_ip: Ipv4Address,
    remote_port: u16,

    // Sequence space (mod 2^32).
    send_next: u32,
    send_unack: u32,
    recv_next: u32,

    recv_buf: [u8; RECV_BUFFER_SIZE],
    recv_head: u16,
    recv_tail: u16,
    recv_count: u16,

    rtx_buf: [u8; RETRANSMIT_BUFFER_SIZE],
    rtx_len: u16,
    rtx_time: u64,
    rtx_count: u32,

    pending_accept: bool,
    pending_remote_ip: Ipv4Address,
    pending_remote_port: u16,
    pending_seq: u32,

    time_wait_since: u64,
}

impl Connection {
    const fn new() -> Self {
        Self {
            active: false,
            state: State::Closed,
            local_ip: Ipv4Address([0; 4]),
            local_port: 0,
            remote_ip: Ipv4Address([0; 4]),
            remote_port: 0,
            send_next: 0,
            send_unack: 0,
            recv_next: 0,
            recv_buf: [0; RECV_BUFFER_SIZE],
            recv_head: 0,
            recv_tail: 0,
            recv_count: 0,
            rtx_buf: [0; RETRANSMIT_BUFFER_SIZE],
            rtx_len: 0,
            rtx_time: 0,
            rtx_count: 0,
            pending_accept: false,
            pending_remote_ip: Ipv4Address([0; 4]),
            pending_remote_port: 0,
            pending_seq: 0,
            time_wait_since: 0,
        }
    }

    fn reset(&mut self) {
        *self = Self::new();
    }

    fn recv_buffer_write(&mut self, data: &[u8]) {
        for &b in data {
            if self.recv_count as usize >= RECV_BUFFER_SIZE {
                break;
            }
            self.recv_buf[self.recv_tail as usize] = b;
            self.recv_tail = (self.recv_tail + 1) % RECV_BUFFER_SIZE as u16;
            self.recv_count += 1;
        }
    }
}

#[allow(clippy::declare_interior_mutable_const)]
const EMPTY_CONNECTION: Mutex<Connection> = Mutex::new(Connection::new());
static CONNECTIONS: [Mutex<Connection>; MAX_CONNECTIONS] = [EMPTY_CONNECTION; MAX_CONNECTIONS];
static ALLOC_LOCK: Mutex<()> = Mutex::new(());

pub fn init() {
    log::info!(target: "net", "TCP initialized ({} connection slots)", MAX_CONNECTIONS);
}

#[cfg(test)]
pub fn reset_for_test() {
    for slot in CONNECTIONS.iter() {
        slot.lock().reset();
    }
}

/// ISN per the engine's clock-mixing scheme.
fn generate_isn() -> u32 {
    (crate::timer::now_ms() as u32).wrapping_mul(2654435761)
}

fn find_connection(remote_ip: Ipv4Address, remote_port: u16, local_port: u16) -> Option<usize> {
    (0..MAX_CONNECTIONS).find(|&i| {
        let c = CONNECTIONS[i].lock();
        c.active
            && c.local_port == local_port
            && c.remote_ip == remote_ip
            && c.remote_port == remote_port
            && c.state != State::Listen
    })
}

fn find_listener(local_port: u16) -> Option<usize> {
    (0..MAX_CONNECTIONS).find(|&i| {
        let c = CONNECTIONS[i].lock();
        c.active && c.local_port == local_port && c.state == State::Listen
    })
}

/// Claim a free slot. TimeWait slots past their quarantine are recycled
/// here, bounding how long a dead connection pins its slot.
fn allocate_connection() -> KernelResult<usize> {
    let _guard = ALLOC_LOCK.lock();
    let now = crate::timer::now_ms();
    for (i, slot) in CONNECTIONS.iter().enumerate() {
        let mut c = slot.lock();
        let expired_time_wait = c.active
            && c.state == State::TimeWait
            && now.saturating_sub(c.time_wait_since) >= TIME_WAIT_MS;
        if !c.active || expired_time_wait {
            c.reset();
            c.active = true;
            return Ok(i);
        }
    }
    Err(KernelError::NoFreeSlot {
        resource: "connection",
    })
}

/// Build and transmit one segment with a pseudo-header checksum.
fn transmit_segment(
    local_ip: Ipv4Address,
    local_port: u16,
    remote_ip: Ipv4Address,
    remote_port: u16,
    seq: u32,
    ack: u32,
    flags: TcpFlags,
    window: u16,
    payload: &[u8],
) -> KernelResult<()> {
    let mut segment = [0u8; HEADER_SIZE + MSS];
    let len = HEADER_SIZE + payload.len().min(MSS);

    let header = TcpHeader {
        src_port: local_port,
        dst_port: remote_port,
        seq,
        ack,
        data_offset: HEADER_SIZE as u8,
        flags,
        window,
        checksum: 0,
        urgent: 0,
    };
    segment[..HEADER_SIZE].copy_from_slice(&header.to_bytes());
    segment[HEADER_SIZE..len].copy_from_slice(&payload[..len - HEADER_SIZE]);

    let csum = ip::pseudo_header_checksum(local_ip, remote_ip, ip::PROTO_TCP, &segment[..len]);
    segment[16..18].copy_from_slice(&csum.to_be_bytes());

    ip::send(remote_ip, ip::PROTO_TCP, &segment[..len])
}

/// Segment emission using a connection's current send/receive state.
fn send_segment(c: &Connection, flags: TcpFlags, payload: &[u8]) -> KernelResult<()> {
    transmit_segment(
        c.local_ip,
        c.local_port,
        c.remote_ip,
        c.remote_port,
        c.send_next,
        c.recv_next,
        flags,
        WINDOW_SIZE,
        payload,
    )
}

/// RST for a segment that matches no connection, with seq/ack mirrored per
/// RFC 793: ACKed segments get seq = their ack; everything else gets
/// ack = seq + len (+1 for SYN/FIN).
fn send_reset(dst: Ipv4Address, dst_port: u16, src_port: u16, seq: u32, ack: u32) {
    let local_ip = super::ip_address();
    transmit_segment(
        local_ip,
        src_port,
        dst,
        dst_port,
        seq,
        ack,
        TcpFlags::RST | TcpFlags::ACK,
        0,
        &[],
    )
    .ok();
}

/// Segment dispatch: checksum, demux, then the per-state transition table.
pub fn on_packet(src_ip: Ipv4Address, dst_ip: Ipv4Address, segment: &[u8]) {
    if segment.len() < HEADER_SIZE {
        return;
    }
    if ip::pseudo_header_checksum(src_ip, dst_ip, ip::PROTO_TCP, segment) != 0 {
        return;
    }
    let Some(header) = TcpHeader::from_bytes(segment) else {
        return;
    };
    let data_off = header.data_offset as usize;
    if data_off < HEADER_SIZE || data_off > segment.len() {
        return;
    }
    let payload = &segment[data_off..];
    let flags = header.flags;

    let conn_idx = find_connection(src_ip, header.src_port, header.dst_port);

    let Some(idx) = conn_idx else {
        // A SYN may be destined for a listener.
        if flags.contains(TcpFlags::SYN) {
            if let Some(listener) = find_listener(header.dst_port) {
                let mut l = CONNECTIONS[listener].lock();
                l.pending_accept = true;
                l.pending_remote_ip = src_ip;
                l.pending_remote_port = header.src_port;
                l.pending_seq = header.seq;
                return;
            }
        }
        // No connection, no listener: answer with RST (but never RST a RST).
        if !flags.contains(TcpFlags::RST) {
            if flags.contains(TcpFlags::ACK) {
                send_reset(src_ip, header.src_port, header.dst_port, header.ack, 0);
            } else {
                let mut rst_ack = header.seq.wrapping_add(payload.len() as u32);
                if flags.contains(TcpFlags::SYN) {
                    rst_ack = rst_ack.wrapping_add(1);
                }
                if flags.contains(TcpFlags::FIN) {
                    rst_ack = rst_ack.wrapping_add(1);
                }
                send_reset(src_ip, header.src_port, header.dst_port, 0, rst_ack);
            }
        }
        return;
    };

    let mut c = CONNECTIONS[idx].lock();

    if flags.contains(TcpFlags::RST) {
        c.state = State::Closed;
        c.active = false;
        return;
    }

    match c.state {
        State::SynSent => {
            if flags.contains(TcpFlags::SYN | TcpFlags::ACK) && header.ack == c.send_next {
                c.recv_next = header.seq.wrapping_add(1);
                c.send_unack = header.ack;
                c.state = State::Established;
                send_segment(&c, TcpFlags::ACK, &[]).ok();
                log::info!(target: "net",
                    "TCP connection established to {}:{}", c.remote_ip, c.remote_port);
            }
        }

        State::SynReceived => {
            if flags.contains(TcpFlags::ACK) && header.ack == c.send_next {
                c.send_unack = header.ack;
                c.state = State::Established;
            }
        }

        State::Established => {
            if flags.contains(TcpFlags::ACK) {
                c.send_unack = header.ack;
            }
            if !payload.is_empty() && header.seq == c.recv_next {
                c.recv_buffer_write(payload);
                c.recv_next = c.recv_next.wrapping_add(payload.len() as u32);
                send_segment(&c, TcpFlags::ACK, &[]).ok();
            }
            if flags.contains(TcpFlags::FIN) {
                c.recv_next = header
                    .seq
                    .wrapping_add(payload.len() as u32)
                    .wrapping_add(1);
                c.state = State::CloseWait;
                send_segment(&c, TcpFlags::ACK, &[]).ok();
            }
        }

        State::FinWait1 => {
            if flags.contains(TcpFlags::ACK) {
                c.send_unack = header.ack;
                if flags.contains(TcpFlags::FIN) {
                    c.recv_next = header.seq.wrapping_add(1);
                    c.state = State::TimeWait;
                    c.time_wait_since = crate::timer::now_ms();
                    send_segment(&c, TcpFlags::ACK, &[]).ok();
                } else {
                    c.state = State::FinWait2;
                }
            } else if flags.contains(TcpFlags::FIN) {
                c.recv_next = header.seq.wrapping_add(1);
                c.state = State::TimeWait;
                c.time_wait_since = crate::timer::now_ms();
                send_segment(&c, TcpFlags::ACK, &[]).ok();
            }
        }

        State::FinWait2 => {
            if flags.contains(TcpFlags::FIN) {
                c.recv_next = header.seq.wrapping_add(1);
                c.state = State::TimeWait;
                c.time_wait_since = crate::timer::now_ms();
                send_segment(&c, TcpFlags::ACK, &[]).ok();
            }
        }

        State::LastAck => {
            if flags.contains(TcpFlags::ACK) {
                c.state = State::Closed;
                c.active = false;
            }
        }

        // Listen is handled through the demux path; TimeWait ignores
        // everything until its slot is recycled.
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// Passive open
// ---------------------------------------------------------------------------

/// Open a listener on `port`. Returns the listener's slot.
pub fn listen(port: u16) -> KernelResult<usize> {
    let idx = allocate_connection()?;
    {
        let mut c = CONNECTIONS[idx].lock();
        c.local_ip = super::ip_address();
        c.local_port = port;
        c.state = State::Listen;
        c.pending_accept = false;
    }
    log::info!(target: "net", "TCP listening on port {}", port);
    Ok(idx)
}

/// One non-blocking accept step: if a SYN is pending on the listener,
/// allocate the child connection and answer SYN|ACK. The child is in
/// SynReceived until the handshake ACK arrives.
pub fn try_accept(listener: usize) -> KernelResult<Option<usize>> {
    let (remote_ip, remote_port, remote_seq, local_port) = {
        let mut l = CONNECTIONS[listener].lock();
        if !l.active || l.state != State::Listen {
            return Err(KernelError::InvalidState {
                expected: "Listen",
                actual: "other",
            });
        }
        if !l.pending_accept {
            return Ok(None);
        }
        l.pending_accept = false;
        (
            l.pending_remote_ip,
            l.pending_remote_port,
            l.pending_seq,
            l.local_port,
        )
    };

    let idx = allocate_connection()?;
    let mut c = CONNECTIONS[idx].lock();
    c.local_ip = super::ip_address();
    c.local_port = local_port;
    c.remote_ip = remote_ip;
    c.remote_port = remote_port;
    c.recv_next = remote_seq.wrapping_add(1);

    let isn = generate_isn();
    c.send_unack = isn;
    c.send_next = isn.wrapping_add(1);
    c.state = State::SynReceived;

    transmit_segment(
        c.local_ip,
        c.local_port,
        c.remote_ip,
        c.remote_port,
        isn,
        c.recv_next,
        TcpFlags::SYN | TcpFlags::ACK,
        WINDOW_SIZE,
        &[],
    )?;
    Ok(Some(idx))
}

/// Blocking accept: wait for a SYN, answer it, then wait for the
/// handshake to complete.
pub fn accept(listener: usize) -> KernelResult<usize> {
    loop {
        let child = loop {
            if let Some(idx) = try_accept(listener)? {
                break idx;
            }
            crate::timer::sleep_ms(10);
        };

        // Handshake ACK, bounded wait.
        for _ in 0..100 {
            if CONNECTIONS[child].lock().state == State::Established {
                return Ok(child);
            }
            crate::timer::sleep_ms(50);
        }
        CONNECTIONS[child].lock().active = false;
        // Timed-out half-open handshake: go back to waiting for a SYN.
    }
}

// ---------------------------------------------------------------------------
// Active open
// ---------------------------------------------------------------------------

/// Allocate a connection and fire the SYN; the caller polls for
/// Established. Returns the slot.
pub fn start_connect(dst_ip: Ipv4Address, dst_port: u16, src_port: u16) -> KernelResult<usize> {
    let idx = allocate_connection()?;
    let mut c = CONNECTIONS[idx].lock();
    c.local_ip = super::ip_address();
    c.local_port = src_port;
    c.remote_ip = dst_ip;
    c.remote_port = dst_port;

    let isn = generate_isn();
    c.send_next = isn.wrapping_add(1);
    c.send_unack = isn;
    c.state = State::SynSent;

    transmit_segment(
        c.local_ip,
        c.local_port,
        c.remote_ip,
        c.remote_port,
        isn,
        0,
        TcpFlags::SYN,
        WINDOW_SIZE,
        &[],
    )?;
    Ok(idx)
}

/// Blocking active open with SYN retransmission (up to the retransmit
/// budget, one RTO apart).
pub fn connect(dst_ip: Ipv4Address, dst_port: u16, src_port: u16) -> KernelResult<usize> {
    let idx = start_connect(dst_ip, dst_port, src_port)?;
    let isn = CONNECTIONS[idx].lock().send_unack;

    for _attempt in 0..MAX_RETRANSMITS {
        for _ in 0..20 {
            if CONNECTIONS[idx].lock().state == State::Established {
                return Ok(idx);
            }
            crate::timer::sleep_ms(50);
        }
        let retransmit = {
            let c = CONNECTIONS[idx].lock();
            if c.state == State::SynSent {
                Some((c.local_ip, c.local_port, c.remote_ip, c.remote_port))
            } else {
                None
            }
        };
        if let Some((lip, lport, rip, rport)) = retransmit {
            transmit_segment(
                lip,
                lport,
                rip,
                rport,
                isn,
                0,
                TcpFlags::SYN,
                WINDOW_SIZE,
                &[],
            )
            .ok();
        }
    }

    CONNECTIONS[idx].lock().active = false;
    Err(KernelError::Timeout {
        operation: "tcp connect",
    })
}

// ---------------------------------------------------------------------------
// Data path
// ---------------------------------------------------------------------------

/// Segment and transmit `data` without waiting for acknowledgement.
/// Advances `send_next` per segment; the latest segment lands in the
/// single-slot retransmit buffer. Returns bytes queued onto the wire.
pub fn transmit_data(idx: usize, data: &[u8]) -> KernelResult<usize> {
    if data.is_empty() {
        return Ok(0);
    }
    let mut c = CONNECTIONS[idx].lock();
    if !c.active || c.state != State::Established {
        return Err(KernelError::InvalidState {
            expected: "Established",
            actual: "other",
        });
    }

    let mut sent = 0;
    while sent < data.len() {
        let seg_len = (data.len() - sent).min(MSS);
        let chunk = &data[sent..sent + seg_len];

        if send_segment(&c, TcpFlags::ACK | TcpFlags::PSH, chunk).is_err() {
            return if sent > 0 {
                Ok(sent)
            } else {
                Err(KernelError::HardwareError {
                    device: "nic",
                    code: 0,
                })
            };
        }

        c.send_next = c.send_next.wrapping_add(seg_len as u32);

        if seg_len <= RETRANSMIT_BUFFER_SIZE {
            c.rtx_buf[..seg_len].copy_from_slice(chunk);
            c.rtx_len = seg_len as u16;
            c.rtx_time = crate::timer::now_ms();
            c.rtx_count = 0;
        }
        sent += seg_len;
    }
    Ok(sent)
}

/// Blocking send: transmit, then wait for everything to be acknowledged,
/// retransmitting the tracked segment on RTO expiry. Gives up after the
/// retransmit budget and returns the bytes handed to the wire.
pub fn send(idx: usize, data: &[u8]) -> KernelResult<usize> {
    let sent = transmit_data(idx, data)?;
    if sent == 0 {
        return Ok(0);
    }

    let start = crate::timer::now_ms();
    loop {
        let rtx = {
            let mut c = CONNECTIONS[idx].lock();
            if c.send_unack == c.send_next {
                break;
            }
            let now = crate::timer::now_ms();
            if now.saturating_sub(start) > RETRANSMIT_TIMEOUT_MS * MAX_RETRANSMITS as u64 {
                break; // give up; the peer may still catch up later
            }
            if now.saturating_sub(c.rtx_time) > RETRANSMIT_TIMEOUT_MS && c.rtx_len > 0 {
                c.rtx_count += 1;
                if c.rtx_count > MAX_RETRANSMITS {
                    break;
                }
                c.rtx_time = now;
                // Replay the tracked segment from the unacknowledged point.
                let seq = c.send_unack;
                let mut payload = [0u8; RETRANSMIT_BUFFER_SIZE];
                let len = c.rtx_len as usize;
                payload[..len].copy_from_slice(&c.rtx_buf[..len]);
                Some((
                    c.local_ip,
                    c.local_port,
                    c.remote_ip,
                    c.remote_port,
                    seq,
                    c.recv_next,
                    payload,
                    len,
                ))
            } else {
                None
            }
        };

        if let Some((lip, lport, rip, rport, seq, ack, payload, len)) = rtx {
            transmit_segment(
                lip,
                lport,
                rip,
                rport,
                seq,
                ack,
                TcpFlags::ACK | TcpFlags::PSH,
                WINDOW_SIZE,
                &payload[..len],
            )
            .ok();
        }
        crate::timer::sleep_ms(10);
    }
    Ok(sent)
}

/// Non-blocking receive step: Some(n) when bytes were drained, Some(0)
/// when the peer has closed, None when the caller should wait.
pub fn try_recv(idx: usize, buf: &mut [u8]) -> KernelResult<Option<usize>> {
    let mut c = CONNECTIONS[idx].lock();
    if !c.active {
        return Ok(Some(0));
    }
    if c.recv_count > 0 {
        let to_read = (c.recv_count as usize).min(buf.len());
        for slot in buf.iter_mut().take(to_read) {
            *slot = c.recv_buf[c.recv_head as usize];
            c.recv_head = (c.recv_head + 1) % RECV_BUFFER_SIZE as u16;
            c.recv_count -= 1;
        }
        return Ok(Some(to_read));
    }
    match c.state {
        State::CloseWait | State::Closed | State::TimeWait => Ok(Some(0)),
        _ => Ok(None),
    }
}

/// Blocking receive: returns drained bytes, or 0 once the connection is
/// closing and the buffer has been emptied.
pub fn recv(idx: usize, buf: &mut [u8]) -> KernelResult<usize> {
    loop {
        if let Some(n) = try_recv(idx, buf)? {
            return Ok(n);
        }
        crate::timer::sleep_ms(10);
    }
}

/// Graceful close from either side of the connection. Best-effort: if the
/// peer never completes the sequence the slot is released after a bounded
/// wait anyway.
pub fn close(idx: usize) {
    enum CloseWaitKind {
        ActiveClose,
        PassiveClose,
        Done,
    }

    let kind = {
        let mut c = CONNECTIONS[idx].lock();
        if !c.active {
            return;
        }
        match c.state {
            State::Established => {
                c.state = State::FinWait1;
                send_segment(&c, TcpFlags::FIN | TcpFlags::ACK, &[]).ok();
                c.send_next = c.send_next.wrapping_add(1);
                CloseWaitKind::ActiveClose
            }
            State::CloseWait => {
                c.state = State::LastAck;
                send_segment(&c, TcpFlags::FIN | TcpFlags::ACK, &[]).ok();
                c.send_next = c.send_next.wrapping_add(1);
                CloseWaitKind::PassiveClose
            }
            State::Listen | State::SynSent => {
                c.state = State::Closed;
                c.active = false;
                CloseWaitKind::Done
            }
            _ => {
                c.active = false;
                CloseWaitKind::Done
            }
        }
    };

    match kind {
        CloseWaitKind::ActiveClose => {
            for _ in 0..100 {
                let state = CONNECTIONS[idx].lock().state;
                if state == State::TimeWait || state == State::Closed {
                    break;
                }
                crate::timer::sleep_ms(50);
            }
            // TimeWait slots quarantine for TIME_WAIT_MS and are recycled
            // by allocate_connection; anything else is done now.
            let mut c = CONNECTIONS[idx].lock();
            if c.state != State::TimeWait {
                c.active = false;
            }
        }
        CloseWaitKind::PassiveClose => {
            for _ in 0..100 {
                if CONNECTIONS[idx].lock().state == State::Closed {
                    break;
                }
                crate::timer::sleep_ms(50);
            }
            CONNECTIONS[idx].lock().active = false;
        }
        CloseWaitKind::Done => {}
    }
}

pub fn state(idx: usize) -> State {
    CONNECTIONS[idx].lock().state
}

#[cfg(test)]
pub fn connection_tuple(idx: usize) -> (Ipv4Address, u16, Ipv4Address, u16, u32, u32) {
    let c = CONNECTIONS[idx].lock();
    (
        c.local_ip,
        c.local_port,
        c.remote_ip,
        c.remote_port,
        c.send_next,
        c.recv_next,
    )
}

#[cfg(test)]
mod tests {
    extern crate alloc;

    use alloc::vec::Vec;

    use super::*;
    use crate::net::device::testutil;

    fn build_segment(
        src: Ipv4Address,
        dst: Ipv4Address,
        src_port: u16,
        dst_port: u16,
        seq: u32,
        ack: u32,
        flags: TcpFlags,
        payload: &[u8],
    ) -> Vec<u8> {
        let header = TcpHeader {
            src_port,
            dst_port,
            seq,
            ack,
            data_offset: HEADER_SIZE as u8,
            flags,
            window: 1024,
            checksum: 0,
            urgent: 0,
        };
        let mut seg = Vec::new();
        seg.extend_from_slice(&header.to_bytes());
        seg.extend_from_slice(payload);
        let csum = ip::pseudo_header_checksum(src, dst, ip::PROTO_TCP, &seg);
        seg[16..18].copy_from_slice(&csum.to_be_bytes());
        seg
    }

    fn captured_tcp_headers(dev: &testutil::CaptureDevice) -> Vec<(TcpHeader, Vec<u8>)> {
        dev.frames
            .lock()
            .iter()
            .map(|f| {
                let seg = testutil::l4_payload(f);
                let h = TcpHeader::from_bytes(seg).unwrap();
                (h, seg[h.data_offset as usize..].to_vec())
            })
            .collect()
    }

    fn peer() -> Ipv4Address {
        Ipv4Address::new(10, 0, 2, 99)
    }

    fn setup() -> (
        spin::MutexGuard<'static, ()>,
        &'static testutil::CaptureDevice,
    ) {
        let (guard, dev) = testutil::setup();
        reset_for_test();
        crate::net::arp::cache_insert(peer(), [1; 6]);
        (guard, dev)
    }

    #[test]
    fn header_roundtrip_preserves_every_field() {
        let h = TcpHeader {
            src_port: 443,
            dst_port: 51000,
            seq: 0xDEADBEEF,
            ack: 0x12345678,
            data_offset: 20,
            flags: TcpFlags::SYN | TcpFlags::ACK,
            window: 4096,
            checksum: 0xABCD,
            urgent: 0,
        };
        assert_eq!(TcpHeader::from_bytes(&h.to_bytes()).unwrap(), h);
    }

    #[test]
    fn passive_open_completes_the_three_way_handshake() {
        let (_guard, dev) = setup();
        let our_ip = crate::net::ip_address();

        let listener = listen(7).unwrap();
        assert_eq!(state(listener), State::Listen);

        // SYN lands on the listener as a pending accept.
        let syn = build_segment(peer(), our_ip, 50000, 7, 1000, 0, TcpFlags::SYN, &[]);
        on_packet(peer(), our_ip, &syn);
        let child = try_accept(listener).unwrap().expect("pending SYN");
        assert_eq!(state(child), State::SynReceived);

        // We answered SYN|ACK acknowledging their ISN + 1.
        let frames = captured_tcp_headers(dev);
        let (synack, _) = &frames[0];
        assert!(synack.flags.contains(TcpFlags::SYN | TcpFlags::ACK));
        assert_eq!(synack.ack, 1001);

        // Handshake ACK moves the child to Established.
        let (_, _, _, _, send_next, _) = connection_tuple(child);
        let ack = build_segment(peer(), our_ip, 50000, 7, 1001, send_next, TcpFlags::ACK, &[]);
        on_packet(peer(), our_ip, &ack);
        assert_eq!(state(child), State::Established);

        // A second try_accept is empty.
        assert!(try_accept(listener).unwrap().is_none());
    }

    #[test]
    fn active_open_acks_the_synack() {
        let (_guard, dev) = setup();
        let our_ip = crate::net::ip_address();

        let idx = start_connect(peer(), 80, 49152).unwrap();
        assert_eq!(state(idx), State::SynSent);
        let (_, _, _, _, send_next, _) = connection_tuple(idx);

        let synack = build_segment(
            peer(),
            our_ip,
            80,
            49152,
            7000,
            send_next,
            TcpFlags::SYN | TcpFlags::ACK,
            &[],
        );
        on_packet(peer(), our_ip, &synack);
        assert_eq!(state(idx), State::Established);

        let frames = captured_tcp_headers(dev);
        // frame 0 = SYN, frame 1 = handshake ACK.
        assert!(frames[0].0.flags.contains(TcpFlags::SYN));
        assert!(!frames[0].0.flags.contains(TcpFlags::ACK));
        let (ack, _) = &frames[1];
        assert!(ack.flags.contains(TcpFlags::ACK));
        assert_eq!(ack.ack, 7001); // their ISN + 1
    }

    fn established_pair() -> (usize, u32, u32) {
        // Returns (conn idx, our send_next, peer seq to use next).
        let our_ip = crate::net::ip_address();
        let idx = start_connect(peer(), 80, 49200).unwrap();
        let (_, _, _, _, send_next, _) = connection_tuple(idx);
        let synack = build_segment(
            peer(),
            our_ip,
            80,
            49200,
            9000,
            send_next,
            TcpFlags::SYN | TcpFlags::ACK,
            &[],
        );
        on_packet(peer(), our_ip, &synack);
        assert_eq!(state(idx), State::Established);
        (idx, send_next, 9001)
    }

    #[test]
    fn in_order_data_is_delivered_and_acked_out_of_order_drops() {
        let (_guard, dev) = setup();
        let our_ip = crate::net::ip_address();
        let (idx, _snd, peer_seq) = established_pair();
        dev.frames.lock().clear();

        // In-order payload.
        let seg = build_segment(peer(), our_ip, 80, 49200, peer_seq, 0, TcpFlags::ACK, b"hello");
        on_packet(peer(), our_ip, &seg);
        let mut buf = [0u8; 16];
        assert_eq!(try_recv(idx, &mut buf).unwrap(), Some(5));
        assert_eq!(&buf[..5], b"hello");

        // The pure ACK advanced recv_next past the payload.
        let frames = captured_tcp_headers(dev);
        assert_eq!(frames[0].0.ack, peer_seq.wrapping_add(5));

        // Out-of-order payload (gap) is dropped, no delivery, recv_next
        // unchanged.
        dev.frames.lock().clear();
        let ooo = build_segment(
            peer(),
            our_ip,
            80,
            49200,
            peer_seq.wrapping_add(100),
            0,
            TcpFlags::ACK,
            b"later",
        );
        on_packet(peer(), our_ip, &ooo);
        assert_eq!(try_recv(idx, &mut buf).unwrap(), None);
        let (_, _, _, _, _, recv_next) = connection_tuple(idx);
        assert_eq!(recv_next, peer_seq.wrapping_add(5));
    }

    #[test]
    fn fin_moves_established_to_close_wait_and_acks_it() {
        let (_guard, dev) = setup();
        let our_ip = crate::net::ip_address();
        let (idx, _snd, peer_seq) = established_pair();
        dev.frames.lock().clear();

        let fin = build_segment(
            peer(),
            our_ip,
            80,
            49200,
            peer_seq,
            0,
            TcpFlags::FIN | TcpFlags::ACK,
            &[],
        );
        on_packet(peer(), our_ip, &fin);
        assert_eq!(state(idx), State::CloseWait);

        let frames = captured_tcp_headers(dev);
        assert!(frames[0].0.flags.contains(TcpFlags::ACK));
        assert_eq!(frames[0].0.ack, peer_seq.wrapping_add(1));

        // recv on a closing connection reports 0 (clean EOF).
        let mut buf = [0u8; 4];
        assert_eq!(try_recv(idx, &mut buf).unwrap(), Some(0));
    }

    #[test]
    fn transmit_data_segments_at_mss_and_tracks_the_last_segment() {
        let (_guard, dev) = setup();
        let (idx, send_next_before, _) = established_pair();
        dev.frames.lock().clear();

        let data = [0x5Au8; 3000];
        assert_eq!(transmit_data(idx, &data).unwrap(), 3000);

        let frames = captured_tcp_headers(dev);
        assert_eq!(frames.len(), 3); // 1460 + 1460 + 80
        assert_eq!(frames[0].1.len(), MSS);
        assert_eq!(frames[1].1.len(), MSS);
        assert_eq!(frames[2].1.len(), 80);
        for (h, _) in &frames {
            assert!(h.flags.contains(TcpFlags::ACK | TcpFlags::PSH));
        }
        assert_eq!(frames[0].0.seq, send_next_before);
        assert_eq!(frames[1].0.seq, send_next_before.wrapping_add(MSS as u32));

        let (_, _, _, _, send_next_after, _) = connection_tuple(idx);
        assert_eq!(send_next_after, send_next_before.wrapping_add(3000));

        // Zero-byte send emits nothing.
        dev.frames.lock().clear();
        assert_eq!(transmit_data(idx, &[]).unwrap(), 0);
        assert!(dev.frames.lock().is_empty());
    }

    #[test]
    fn rst_tears_down_and_strays_get_reset() {
        let (_guard, dev) = setup();
        let our_ip = crate::net::ip_address();
        let (idx, _, peer_seq) = established_pair();

        // Stray segment to a port nobody owns: mirrored RST.
        dev.frames.lock().clear();
        let stray = build_segment(peer(), our_ip, 1234, 999, 555, 0, TcpFlags::SYN, &[]);
        on_packet(peer(), our_ip, &stray);
        let frames = captured_tcp_headers(dev);
        assert!(frames[0].0.flags.contains(TcpFlags::RST));
        assert_eq!(frames[0].0.ack, 556); // seq + 1 for the SYN

        // A stray RST is never answered.
        dev.frames.lock().clear();
        let stray_rst = build_segment(peer(), our_ip, 1234, 999, 1, 0, TcpFlags::RST, &[]);
        on_packet(peer(), our_ip, &stray_rst);
        assert!(dev.frames.lock().is_empty());

        // RST against the live connection kills it.
        let rst = build_segment(peer(), our_ip, 80, 49200, peer_seq, 0, TcpFlags::RST, &[]);
        on_packet(peer(), our_ip, &rst);
        assert_eq!(state(idx), State::Closed);
    }

    #[test]
    fn established_send_unack_never_exceeds_send_next() {
        let (_guard, dev) = setup();
        let our_ip = crate::net::ip_address();
        let (idx, _, _) = established_pair();
        let _ = dev;

        let data = [1u8; 100];
        transmit_data(idx, &data).unwrap();
        let (_, _, _, _, send_next, _) = connection_tuple(idx);

        // Peer acknowledges everything sent so far.
        let ack = build_segment(peer(), our_ip, 80, 49200, 9001, send_next, TcpFlags::ACK, &[]);
        on_packet(peer(), our_ip, &ack);

        let c = CONNECTIONS[idx].lock();
        let distance = c.send_next.wrapping_sub(c.send_unack);
        assert!(distance < 1 << 31);
        assert_eq!(c.send_unack, c.send_next);
    }

    #[test]
    fn bad_checksum_segments_are_ignored() {
        let (_guard, dev) = setup();
        let our_ip = crate::net::ip_address();
        let (idx, _, peer_seq) = established_pair();
        dev.frames.lock().clear();

        let mut seg = build_segment(peer(), our_ip, 80, 49200, peer_seq, 0, TcpFlags::ACK, b"data");
        seg[17] ^= 0xFF; // corrupt
        on_packet(peer(), our_ip, &seg);

        let mut buf = [0u8; 8];
        assert_eq!(try_recv(idx, &mut buf).unwrap(), None);
        assert!(dev.frames.lock().is_empty());
    }
}
