//! Network syscalls: ICMP ping, the socket family, configuration, DNS.

use core::sync::atomic::{AtomicU16, Ordering};

use crate::{
    error::{KernelError, KernelResult},
    net::{self, device, icmp, socket, Ipv4Address},
    sched, timer,
};

use super::{user_bytes, user_bytes_mut, user_cstr, user_read, user_write};
use crate::syscall::abi::NetCfg;

/// ICMP echo identifier ("ZE").
const PING_ID: u16 = 0x2E01;

static PING_SEQ: AtomicU16 = AtomicU16::new(0);

/// Blocking echo round-trip; returns elapsed milliseconds or -1.
pub fn sys_ping(ip_be: u32, timeout_ms: u32) -> i64 {
    let dst = Ipv4Address::from_be_u32(ip_be);
    let seq = PING_SEQ.fetch_add(1, Ordering::Relaxed);

    icmp::reset_reply();
    if icmp::send_echo_request(dst, PING_ID, seq).is_err() {
        return -1;
    }

    #[cfg(target_os = "none")]
    x86_64::instructions::interrupts::enable();
    let start = timer::now_ms();
    while !icmp::has_reply(PING_ID, seq) {
        if timer::now_ms() - start >= timeout_ms as u64 {
            return -1;
        }
        sched::yield_now();
    }
    (timer::now_ms() - start) as i64
}

pub fn sys_socket(sock_type: i32) -> KernelResult<i64> {
    Ok(socket::create(sock_type, sched::current_pid())? as i64)
}

pub fn sys_connect(fd: i32, ip_be: u32, port: u16) -> KernelResult<i64> {
    socket::connect(
        fd,
        Ipv4Address::from_be_u32(ip_be),
        port,
        sched::current_pid(),
    )?;
    Ok(0)
}

pub fn sys_bind(fd: i32, port: u16) -> KernelResult<i64> {
    socket::bind(fd, port, sched::current_pid())?;
    Ok(0)
}

pub fn sys_listen(fd: i32) -> KernelResult<i64> {
    socket::listen(fd, sched::current_pid())?;
    Ok(0)
}

pub fn sys_accept(fd: i32) -> KernelResult<i64> {
    Ok(socket::accept(fd, sched::current_pid())? as i64)
}

pub fn sys_send(fd: i32, data_ptr: u64, len: u64) -> KernelResult<i64> {
    if len == 0 {
        return Ok(0);
    }
    let data = user_bytes(data_ptr, len).ok_or(KernelError::InvalidArgument { name: "data" })?;
    Ok(socket::send(fd, data, sched::current_pid())? as i64)
}

pub fn sys_recv(fd: i32, buf_ptr: u64, max_len: u64) -> KernelResult<i64> {
    let buf =
        user_bytes_mut(buf_ptr, max_len).ok_or(KernelError::InvalidArgument { name: "buf" })?;
    Ok(socket::recv(fd, buf, sched::current_pid())? as i64)
}

pub fn sys_close_sock(fd: i32) -> i64 {
    socket::close(fd, sched::current_pid());
    0
}

pub fn sys_send_to(
    fd: i32,
    data_ptr: u64,
    len: u64,
    dst_ip_be: u32,
    dst_port: u16,
) -> KernelResult<i64> {
    let data = user_bytes(data_ptr, len).ok_or(KernelError::InvalidArgument { name: "data" })?;
    Ok(socket::send_to(
        fd,
        data,
        Ipv4Address::from_be_u32(dst_ip_be),
        dst_port,
        sched::current_pid(),
    )? as i64)
}

pub fn sys_recv_from(
    fd: i32,
    buf_ptr: u64,
    max_len: u64,
    src_ip_ptr: u64,
    src_port_ptr: u64,
) -> KernelResult<i64> {
    let buf =
        user_bytes_mut(buf_ptr, max_len).ok_or(KernelError::InvalidArgument { name: "buf" })?;
    let (n, src_ip, src_port) = socket::recv_from(fd, buf, sched::current_pid())?;
    if src_ip_ptr != 0 {
        user_write(src_ip_ptr, src_ip.to_be_u32());
    }
    if src_port_ptr != 0 {
        user_write(src_port_ptr, src_port);
    }
    Ok(n as i64)
}

pub fn sys_get_netcfg(out_ptr: u64) -> i64 {
    if out_ptr == 0 {
        return -1;
    }
    let cfg = net::config();
    user_write(
        out_ptr,
        NetCfg {
            ip_address: cfg.ip.to_be_u32(),
            subnet_mask: cfg.subnet_mask.to_be_u32(),
            gateway: cfg.gateway.to_be_u32(),
            mac_address: device::mac(),
            _pad: [0; 2],
            dns_server: cfg.dns_server.to_be_u32(),
        },
    );
    0
}

pub fn sys_set_netcfg(in_ptr: u64) -> i64 {
    let Some(cfg): Option<NetCfg> = user_read(in_ptr) else {
        return -1;
    };
    net::set_config(net::NetConfig {
        ip: Ipv4Address::from_be_u32(cfg.ip_address),
        subnet_mask: Ipv4Address::from_be_u32(cfg.subnet_mask),
        gateway: Ipv4Address::from_be_u32(cfg.gateway),
        dns_server: Ipv4Address::from_be_u32(cfg.dns_server),
    });
    0
}

/// DNS A-record lookup; returns the address in network order, 0 on
/// failure.
pub fn sys_resolve(hostname_ptr: u64) -> i64 {
    let Some(hostname) = user_cstr(hostname_ptr) else {
        return 0;
    };
    match crate::net::dns::resolve(hostname) {
        Ok(addr) => addr.to_be_u32() as i64,
        Err(_) => 0,
    }
}
