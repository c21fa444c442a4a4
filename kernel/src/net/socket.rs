//! Socket layer: the fd table bridging the socket syscalls to TCP and UDP.

extern crate alloc;

use alloc::{collections::VecDeque, vec::Vec};
use core::sync::atomic::{AtomicU16, Ordering};

use spin::Mutex;

use super::{tcp, udp, Ipv4Address};
use crate::error::{KernelError, KernelResult};

pub const SOCK_TCP: i32 = 1;
pub const SOCK_UDP: i32 = 2;

const MAX_SOCKETS: usize = 32;
/// Datagrams queued per UDP socket before the oldest drops.
const UDP_QUEUE_DEPTH: usize = 16;

static NEXT_EPHEMERAL: AtomicU16 = AtomicU16::new(49152);

fn ephemeral_port() -> u16 {
    let p = NEXT_EPHEMERAL.fetch_add(1, Ordering::Relaxed);
    if p < 49152 {
        NEXT_EPHEMERAL.store(49153, Ordering::Relaxed);
        49152
    } else {
        p
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Tcp,
    Udp,
}

struct Socket {
    kind: Kind,
    owner_pid: i32,
    /// TCP connection slot, once connected/accepted/listening.
    conn: Option<usize>,
    /// Bound local port (0 = unbound).
    local_port: u16,
    /// Datagram queue: (source ip, source port, payload).
    udp_rx: VecDeque<(Ipv4Address, u16, Vec<u8>)>,
}

static SOCKETS: Mutex<[Option<Socket>; MAX_SOCKETS]> = Mutex::new([const { None }; MAX_SOCKETS]);

fn with_socket<R>(
    fd: i32,
    pid: i32,
    f: impl FnOnce(&mut Socket) -> KernelResult<R>,
) -> KernelResult<R> {
    if fd < 0 || fd as usize >= MAX_SOCKETS {
        return Err(KernelError::InvalidArgument { name: "fd" });
    }
    let mut sockets = SOCKETS.lock();
    let sock = sockets[fd as usize]
        .as_mut()
        .ok_or(KernelError::InvalidArgument { name: "fd" })?;
    if sock.owner_pid != pid {
        return Err(KernelError::InvalidArgument { name: "fd" });
    }
    f(sock)
}

/// `socket` syscall: allocate an fd of the given type.
pub fn create(sock_type: i32, pid: i32) -> KernelResult<i32> {
    let kind = match sock_type {
        SOCK_TCP => Kind::Tcp,
        SOCK_UDP => Kind::Udp,
        _ => return Err(KernelError::InvalidArgument { name: "type" }),
    };
    let mut sockets = SOCKETS.lock();
    let fd = sockets
        .iter()
        .position(|s| s.is_none())
        .ok_or(KernelError::NoFreeSlot { resource: "socket" })?;
    sockets[fd] = Some(Socket {
        kind,
        owner_pid: pid,
        conn: None,
        local_port: 0,
        udp_rx: VecDeque::new(),
    });
    Ok(fd as i32)
}

/// `bind` syscall: claim a local port.
pub fn bind(fd: i32, port: u16, pid: i32) -> KernelResult<()> {
    with_socket(fd, pid, |s| {
        s.local_port = port;
        Ok(())
    })
}

/// `connect` syscall (TCP only): blocking active open.
pub fn connect(fd: i32, ip: Ipv4Address, port: u16, pid: i32) -> KernelResult<()> {
    let (kind, local_port) = with_socket(fd, pid, |s| Ok((s.kind, s.local_port)))?;
    if kind != Kind::Tcp {
        return Err(KernelError::InvalidArgument { name: "fd" });
    }
    let src_port = if local_port != 0 {
        local_port
    } else {
        ephemeral_port()
    };
    let conn = tcp::connect(ip, port, src_port)?;
    with_socket(fd, pid, |s| {
        s.conn = Some(conn);
        s.local_port = src_port;
        Ok(())
    })
}

/// `listen` syscall (TCP only): passive open on the bound port.
pub fn listen(fd: i32, pid: i32) -> KernelResult<()> {
    let (kind, local_port, existing) =
        with_socket(fd, pid, |s| Ok((s.kind, s.local_port, s.conn)))?;
    if kind != Kind::Tcp || local_port == 0 || existing.is_some() {
        return Err(KernelError::InvalidState {
            expected: "bound TCP socket",
            actual: "other",
        });
    }
    let conn = tcp::listen(local_port)?;
    with_socket(fd, pid, |s| {
        s.conn = Some(conn);
        Ok(())
    })
}

/// `accept` syscall: blocking; returns a fresh fd for the new connection.
pub fn accept(fd: i32, pid: i32) -> KernelResult<i32> {
    let (kind, listener) = with_socket(fd, pid, |s| Ok((s.kind, s.conn)))?;
    let listener = match (kind, listener) {
        (Kind::Tcp, Some(idx)) => idx,
        _ => {
            return Err(KernelError::InvalidState {
                expected: "listening socket",
                actual: "other",
            })
        }
    };

    let child_conn = tcp::accept(listener)?;

    let mut sockets = SOCKETS.lock();
    let new_fd = sockets
        .iter()
        .position(|s| s.is_none())
        .ok_or(KernelError::NoFreeSlot { resource: "socket" })?;
    sockets[new_fd] = Some(Socket {
        kind: Kind::Tcp,
        owner_pid: pid,
        conn: Some(child_conn),
        local_port: 0,
        udp_rx: VecDeque::new(),
    });
    Ok(new_fd as i32)
}

/// `send` syscall (TCP): blocking send with retransmission.
pub fn send(fd: i32, data: &[u8], pid: i32) -> KernelResult<usize> {
    let conn = with_socket(fd, pid, |s| match (s.kind, s.conn) {
        (Kind::Tcp, Some(idx)) => Ok(idx),
        _ => Err(KernelError::InvalidState {
            expected: "connected TCP socket",
            actual: "other",
        }),
    })?;
    tcp::send(conn, data)
}

/// `recv` syscall (TCP): blocking; 0 means peer closed.
pub fn recv(fd: i32, buf: &mut [u8], pid: i32) -> KernelResult<usize> {
    let conn = with_socket(fd, pid, |s| match (s.kind, s.conn) {
        (Kind::Tcp, Some(idx)) => Ok(idx),
        _ => Err(KernelError::InvalidState {
            expected: "connected TCP socket",
            actual: "other",
        }),
    })?;
    tcp::recv(conn, buf)
}

/// `close_sock` syscall: graceful TCP close, then free the fd.
pub fn close(fd: i32, pid: i32) {
    let conn = with_socket(fd, pid, |s| Ok(s.conn)).ok().flatten();
    if let Some(idx) = conn {
        tcp::close(idx);
    }
    if fd >= 0 && (fd as usize) < MAX_SOCKETS {
        let mut sockets = SOCKETS.lock();
        if sockets[fd as usize]
            .as_ref()
            .is_some_and(|s| s.owner_pid == pid)
        {
            sockets[fd as usize] = None;
        }
    }
}

/// `sendto` syscall (UDP).
pub fn send_to(
    fd: i32,
    data: &[u8],
    dst_ip: Ipv4Address,
    dst_port: u16,
    pid: i32,
) -> KernelResult<usize> {
    let src_port = with_socket(fd, pid, |s| {
        if s.kind != Kind::Udp {
            return Err(KernelError::InvalidArgument { name: "fd" });
        }
        if s.local_port == 0 {
            s.local_port = ephemeral_port();
        }
        Ok(s.local_port)
    })?;
    udp::send(dst_ip, src_port, dst_port, data)?;
    Ok(data.len())
}

/// `recvfrom` syscall (UDP): blocking dequeue.
pub fn recv_from(
    fd: i32,
    buf: &mut [u8],
    pid: i32,
) -> KernelResult<(usize, Ipv4Address, u16)> {
    loop {
        let popped = with_socket(fd, pid, |s| {
            if s.kind != Kind::Udp {
                return Err(KernelError::InvalidArgument { name: "fd" });
            }
            Ok(s.udp_rx.pop_front())
        })?;
        if let Some((src_ip, src_port, data)) = popped {
            let n = data.len().min(buf.len());
            buf[..n].copy_from_slice(&data[..n]);
            return Ok((n, src_ip, src_port));
        }
        crate::timer::sleep_ms(10);
    }
}

/// UDP inbound upcall: queue the datagram on the socket bound to the
/// destination port. Oldest datagram drops when the queue is full.
pub fn on_udp_datagram(src_ip: Ipv4Address, src_port: u16, dst_port: u16, payload: &[u8]) {
    let mut sockets = SOCKETS.lock();
    let Some(sock) = sockets
        .iter_mut()
        .flatten()
        .find(|s| s.kind == Kind::Udp && s.local_port == dst_port)
    else {
        return;
    };
    if sock.udp_rx.len() >= UDP_QUEUE_DEPTH {
        sock.udp_rx.pop_front();
    }
    sock.udp_rx.push_back((src_ip, src_port, payload.to_vec()));
}

/// Process-death hook: free every socket the pid owned. Abortive for the
/// underlying connections — with the owner gone nobody can wait out a
/// graceful close, and the connection slots recycle on their own.
pub fn cleanup_process(pid: i32) {
    let mut sockets = SOCKETS.lock();
    for slot in sockets.iter_mut() {
        if slot.as_ref().is_some_and(|s| s.owner_pid == pid) {
            *slot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::device::testutil;

    #[test]
    fn socket_table_lifecycle_and_udp_queueing() {
        let (_guard, _dev) = testutil::setup();
        tcp::reset_for_test();

        let fd = create(SOCK_UDP, 5).unwrap();
        bind(fd, 8888, 5).unwrap();

        // Wrong owner is rejected.
        assert!(bind(fd, 1, 6).is_err());

        // Queue a datagram and read it back non-blockingly (queue is hot).
        on_udp_datagram(Ipv4Address::new(10, 0, 2, 3), 53, 8888, b"answer");
        let mut buf = [0u8; 16];
        let (n, src, sport) = recv_from(fd, &mut buf, 5).unwrap();
        assert_eq!(&buf[..n], b"answer");
        assert_eq!(src, Ipv4Address::new(10, 0, 2, 3));
        assert_eq!(sport, 53);

        // Unbound port datagrams vanish quietly.
        on_udp_datagram(Ipv4Address::new(10, 0, 2, 3), 53, 9999, b"stray");

        // Overflow drops the oldest.
        for i in 0..(UDP_QUEUE_DEPTH + 2) {
            on_udp_datagram(Ipv4Address::new(10, 0, 2, 3), 53, 8888, &[i as u8]);
        }
        let (n, _, _) = recv_from(fd, &mut buf, 5).unwrap();
        assert_eq!(n, 1);
        assert_eq!(buf[0], 2); // 0 and 1 were dropped

        close(fd, 5);
        assert!(bind(fd, 1, 5).is_err());

        // TCP socket needs bind before listen.
        let t = create(SOCK_TCP, 5).unwrap();
        assert!(listen(t, 5).is_err());
        bind(t, 7, 5).unwrap();
        listen(t, 5).unwrap();
        assert_eq!(tcp::state(0), tcp::State::Listen);
        close(t, 5);
    }
}
