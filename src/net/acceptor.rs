use std::net::Ipv4Addr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::net::connection::TcpConnection;
use crate::net::server::TcpServer;
use crate::net::socket;
use crate::reactor::channel::{Channel, ERROR_EVENTS, READABLE};
use crate::reactor::event_loop::EventLoop;

const BACKLOG: libc::c_int = 1024;

/// Owns the listening socket and feeds accepted connections to the IO
/// loops.
///
/// The accept loop runs on the base loop. A spare descriptor parked on
/// the null device is sacrificed to drain the backlog when the process
/// runs out of file descriptors, then reopened.
pub struct Acceptor {
    server: Weak<TcpServer>,
    base_loop: Arc<EventLoop>,
    listen_fd: RawFd,
    idle_fd: AtomicI32,
    channel: Mutex<Option<Arc<Channel>>>,
    listening: AtomicBool,
}

impl Acceptor {
    /// Creates the listening socket (nonblocking, close-on-exec,
    /// address/port reuse) and binds it. Fails fast on socket or bind
    /// errors without leaking the descriptor.
    pub(crate) fn new(
        server: Weak<TcpServer>,
        base_loop: Arc<EventLoop>,
        ip: Ipv4Addr,
        port: u16,
    ) -> Result<Arc<Self>> {
        let listen_fd = socket::create_listen_socket().map_err(|source| Error::Syscall {
            op: "socket",
            source,
        })?;

        if let Err(source) = socket::set_reuse(listen_fd) {
            socket::close(listen_fd);
            return Err(Error::Syscall {
                op: "setsockopt",
                source,
            });
        }

        let idle_fd = match socket::open_idle_fd() {
            Ok(fd) => fd,
            Err(err) => {
                warn!(?err, "spare descriptor unavailable");
                -1
            }
        };

        if let Err(source) = socket::bind_v4(listen_fd, ip, port) {
            socket::close(listen_fd);
            if idle_fd >= 0 {
                socket::close(idle_fd);
            }
            return Err(Error::Syscall {
                op: "bind",
                source,
            });
        }

        let acceptor = Arc::new(Self {
            server,
            base_loop: Arc::clone(&base_loop),
            listen_fd,
            idle_fd: AtomicI32::new(idle_fd),
            channel: Mutex::new(None),
            listening: AtomicBool::new(false),
        });

        let channel = Channel::new(&base_loop, listen_fd);
        let weak = Arc::downgrade(&acceptor);
        channel.set_callback(move |revents| {
            if revents & (READABLE | ERROR_EVENTS) != 0 {
                if let Some(acceptor) = weak.upgrade() {
                    acceptor.do_accept();
                }
            }
        });
        *acceptor.channel.lock() = Some(channel);

        info!(fd = listen_fd, %ip, port, "acceptor created");
        Ok(acceptor)
    }

    /// Starts listening and arms read interest on the base loop.
    pub(crate) fn listen(&self) -> Result<()> {
        if self.listening.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        socket::listen(self.listen_fd, BACKLOG).map_err(|source| Error::Syscall {
            op: "listen",
            source,
        })?;

        if let Some(channel) = self.channel.lock().clone() {
            self.base_loop.run_in_loop(move || channel.enable_read());
        }
        info!(fd = self.listen_fd, "listening");
        Ok(())
    }

    /// Accepts until the backlog is empty. Runs on the base loop when
    /// the listening descriptor is readable.
    fn do_accept(&self) {
        loop {
            match socket::accept4(self.listen_fd) {
                Ok((fd, peer)) => {
                    let Some(server) = self.server.upgrade() else {
                        socket::close(fd);
                        return;
                    };
                    let io_loop = server.get_next_loop();
                    let conn = TcpConnection::new(Arc::clone(&io_loop), fd, peer);
                    server.install_callbacks(&conn);

                    let established = Arc::clone(&conn);
                    io_loop.run_in_loop(move || established.connect_established());
                    server.add_new_conn(conn);
                }
                Err(err) => match err.raw_os_error() {
                    Some(libc::EINTR) => continue,
                    // Backlog drained; required exit for edge-triggered
                    // notification.
                    Some(e) if e == libc::EAGAIN || e == libc::EWOULDBLOCK => break,
                    Some(e) if e == libc::EMFILE || e == libc::ENFILE => {
                        error!("accept: descriptor limit reached, draining via spare fd");
                        let idle = self.idle_fd.swap(-1, Ordering::AcqRel);
                        if idle >= 0 {
                            socket::close(idle);
                        }
                        socket::drain_one_connection(self.listen_fd);
                        match socket::open_idle_fd() {
                            Ok(fd) => self.idle_fd.store(fd, Ordering::Release),
                            Err(err) => warn!(?err, "spare descriptor reopen failed"),
                        }
                        continue;
                    }
                    _ => {
                        error!(?err, "accept failed");
                        break;
                    }
                },
            }
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.lock().take() {
            if self.base_loop.is_in_loop_thread() {
                channel.disable_all();
            } else {
                self.base_loop.run_in_loop(move || channel.disable_all());
            }
        }
        socket::close(self.listen_fd);
        let idle = self.idle_fd.swap(-1, Ordering::AcqRel);
        if idle >= 0 {
            socket::close(idle);
        }
    }
}
