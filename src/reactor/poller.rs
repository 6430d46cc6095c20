use std::io;
use std::os::unix::io::RawFd;

use tracing::error;

use crate::reactor::channel::Channel;

/// Thin wrapper over the epoll facility. Each [`EventLoop`] owns one.
///
/// Readiness events carry the channel's fd in `epoll_event.u64`; the
/// loop resolves it through its channel registry before dispatch.
///
/// [`EventLoop`]: crate::reactor::EventLoop
pub struct Poller {
    epfd: RawFd,
}

impl Poller {
    pub fn new() -> io::Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { epfd })
    }

    pub fn add(&self, ch: &Channel) -> bool {
        self.ctl(libc::EPOLL_CTL_ADD, "ADD", ch)
    }

    pub fn modify(&self, ch: &Channel) -> bool {
        self.ctl(libc::EPOLL_CTL_MOD, "MOD", ch)
    }

    pub fn remove(&self, ch: &Channel) -> bool {
        let ret = unsafe {
            libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, ch.fd(), std::ptr::null_mut())
        };
        if ret == 0 {
            return true;
        }
        let err = io::Error::last_os_error();
        error!(fd = ch.fd(), ?err, "epoll_ctl DEL failed");
        false
    }

    fn ctl(&self, op: libc::c_int, op_name: &'static str, ch: &Channel) -> bool {
        let mut ev = libc::epoll_event {
            events: ch.events(),
            u64: ch.fd() as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epfd, op, ch.fd(), &mut ev) };
        if ret == 0 {
            return true;
        }
        let err = io::Error::last_os_error();
        error!(fd = ch.fd(), op = op_name, ?err, "epoll_ctl failed");
        false
    }

    /// Waits up to `timeout_ms` for readiness, filling `active` from
    /// the front. Interrupted waits are retried. The caller grows
    /// `active` when the return value fills it completely.
    pub fn poll(&self, timeout_ms: i32, active: &mut [libc::epoll_event]) -> io::Result<usize> {
        loop {
            let n = unsafe {
                libc::epoll_wait(
                    self.epfd,
                    active.as_mut_ptr(),
                    active.len() as libc::c_int,
                    timeout_ms,
                )
            };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(err);
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}
