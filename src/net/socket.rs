//! Raw IPv4 socket plumbing shared by the acceptor and connections.
//!
//! Everything here is a thin `io::Result` wrapper over the libc call it
//! names; callers triage `raw_os_error` where errno matters.

use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::unix::io::RawFd;

/// Creates a nonblocking, close-on-exec IPv4 stream socket.
pub(crate) fn create_listen_socket() -> io::Result<RawFd> {
    let fd = unsafe {
        libc::socket(
            libc::AF_INET,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            libc::IPPROTO_TCP,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

/// Enables address and port reuse so restarts bind immediately.
pub(crate) fn set_reuse(fd: RawFd) -> io::Result<()> {
    let opt: libc::c_int = 1;
    for name in [libc::SO_REUSEADDR, libc::SO_REUSEPORT] {
        let ret = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                name,
                (&opt as *const libc::c_int).cast(),
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn v4_to_sockaddr(ip: Ipv4Addr, port: u16) -> libc::sockaddr_in {
    let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_port = port.to_be();
    addr.sin_addr = libc::in_addr {
        s_addr: u32::from(ip).to_be(),
    };
    addr
}

fn sockaddr_to_v4(addr: &libc::sockaddr_in) -> SocketAddrV4 {
    SocketAddrV4::new(
        Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr)),
        u16::from_be(addr.sin_port),
    )
}

pub(crate) fn bind_v4(fd: RawFd, ip: Ipv4Addr, port: u16) -> io::Result<()> {
    let addr = v4_to_sockaddr(ip, port);
    let ret = unsafe {
        libc::bind(
            fd,
            (&addr as *const libc::sockaddr_in).cast(),
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub(crate) fn listen(fd: RawFd, backlog: libc::c_int) -> io::Result<()> {
    if unsafe { libc::listen(fd, backlog) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Accepts one connection, atomically nonblocking and close-on-exec.
pub(crate) fn accept4(listen_fd: RawFd) -> io::Result<(RawFd, SocketAddrV4)> {
    let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let fd = unsafe {
        libc::accept4(
            listen_fd,
            (&mut addr as *mut libc::sockaddr_in).cast(),
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((fd, sockaddr_to_v4(&addr)))
}

/// Accepts and immediately closes one pending connection. Used to clear
/// the backlog while recovering from descriptor exhaustion.
pub(crate) fn drain_one_connection(listen_fd: RawFd) {
    let fd = unsafe { libc::accept(listen_fd, std::ptr::null_mut(), std::ptr::null_mut()) };
    if fd >= 0 {
        close(fd);
    }
}

/// Opens the spare descriptor pointing at the null device.
pub(crate) fn open_idle_fd() -> io::Result<RawFd> {
    let fd = unsafe { libc::open(c"/dev/null".as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

/// One write attempt: interrupted calls retried, would-block reported
/// as `Ok(0)`.
pub(crate) fn write(fd: RawFd, data: &[u8]) -> io::Result<usize> {
    loop {
        let n = unsafe { libc::write(fd, data.as_ptr().cast(), data.len()) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(e) if e == libc::EAGAIN || e == libc::EWOULDBLOCK => return Ok(0),
            _ => return Err(err),
        }
    }
}

/// Half-closes the write side, letting queued peer reads finish.
pub(crate) fn shutdown_write(fd: RawFd) {
    unsafe {
        libc::shutdown(fd, libc::SHUT_WR);
    }
}

pub(crate) fn close(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}
