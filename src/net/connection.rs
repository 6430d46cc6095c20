//! Per-connection state machine and buffering.
//!
//! A connection lives on exactly one IO loop: every read, write, state
//! transition, and channel mutation happens on that loop's thread.
//! Other threads interact only through [`send`] and [`shutdown`], which
//! hop to the loop. Shared ownership (the server registry plus any
//! in-flight dispatch) keeps the value alive until `handle_close` has
//! run and the registry drops its reference.
//!
//! [`send`]: TcpConnection::send
//! [`shutdown`]: TcpConnection::shutdown

use std::net::SocketAddrV4;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::memory::{InputBuffer, OutputBuffer};
use crate::net::socket;
use crate::reactor::channel::{self, Channel};
use crate::reactor::event_loop::EventLoop;

pub type ConnectionCallback = Box<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;
pub type MessageCallback = Box<dyn Fn(&Arc<TcpConnection>, &mut InputBuffer) + Send + Sync>;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    Connecting = 0,
    Connected = 1,
    /// `shutdown` requested; the write side half-closes once the
    /// output buffer drains.
    Disconnecting = 2,
    Disconnected = 3,
}

impl State {
    fn from_u8(value: u8) -> State {
        match value {
            0 => State::Connecting,
            1 => State::Connected,
            2 => State::Disconnecting,
            _ => State::Disconnected,
        }
    }
}

pub struct TcpConnection {
    me: Weak<TcpConnection>,
    event_loop: Arc<EventLoop>,
    fd: AtomicI32,
    peer: SocketAddrV4,
    channel: Mutex<Option<Arc<Channel>>>,
    input: Mutex<InputBuffer>,
    output: Mutex<OutputBuffer>,
    state: AtomicU8,
    connected_cb: Mutex<Option<ConnectionCallback>>,
    message_cb: Mutex<Option<MessageCallback>>,
    close_cb: Mutex<Option<ConnectionCallback>>,
}

impl TcpConnection {
    pub(crate) fn new(event_loop: Arc<EventLoop>, fd: RawFd, peer: SocketAddrV4) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            event_loop,
            fd: AtomicI32::new(fd),
            peer,
            channel: Mutex::new(None),
            input: Mutex::new(InputBuffer::new()),
            output: Mutex::new(OutputBuffer::new()),
            state: AtomicU8::new(State::Connecting as u8),
            connected_cb: Mutex::new(None),
            message_cb: Mutex::new(None),
            close_cb: Mutex::new(None),
        })
    }

    pub(crate) fn set_connected_cb(&self, cb: ConnectionCallback) {
        *self.connected_cb.lock() = Some(cb);
    }

    pub(crate) fn set_message_cb(&self, cb: MessageCallback) {
        *self.message_cb.lock() = Some(cb);
    }

    pub(crate) fn set_close_cb(&self, cb: ConnectionCallback) {
        *self.close_cb.lock() = Some(cb);
    }

    pub fn fd(&self) -> RawFd {
        self.fd.load(Ordering::Acquire)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == State::Connected
    }

    /// The peer endpoint as `ip:port`.
    pub fn peer_ipport(&self) -> String {
        self.peer.to_string()
    }

    pub fn event_loop(&self) -> &Arc<EventLoop> {
        &self.event_loop
    }

    fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Finishes setup on the IO loop: creates and ties the channel,
    /// arms read interest, marks the connection live, and fires the
    /// connected callback.
    pub(crate) fn connect_established(&self) {
        let Some(this) = self.me.upgrade() else {
            return;
        };

        let channel = Channel::new(&self.event_loop, self.fd());
        let weak = self.me.clone();
        channel.set_callback(move |revents| {
            if let Some(conn) = weak.upgrade() {
                conn.handle_event(revents);
            }
        });
        // The tie keeps the connection alive for the duration of each
        // dispatch and drops events that race with destruction.
        channel.tie(&this);
        channel.enable_read();
        *self.channel.lock() = Some(channel);

        self.state.store(State::Connected as u8, Ordering::Release);

        let connected = self.connected_cb.lock();
        if let Some(cb) = connected.as_ref() {
            cb(&this);
        }
    }

    /// Queues `data` for delivery. Returns `false` when the connection
    /// is not in the `Connected` state; otherwise the bytes are either
    /// written now (on the IO thread) or copied and posted to it.
    pub fn send(&self, data: &[u8]) -> bool {
        if self.state() != State::Connected {
            return false;
        }
        if self.event_loop.is_in_loop_thread() {
            self.send_in_loop(data);
        } else if let Some(conn) = self.me.upgrade() {
            let owned = data.to_vec();
            self.event_loop
                .queue_in_loop(move || conn.send_in_loop(&owned));
        }
        true
    }

    /// Begins an orderly close: once the output buffer drains, the
    /// write side half-closes and the peer's EOF completes teardown.
    pub fn shutdown(&self) {
        if self.state() == State::Connected {
            if let Some(conn) = self.me.upgrade() {
                self.event_loop.run_in_loop(move || conn.shutdown_in_loop());
            }
        }
    }

    fn handle_event(&self, revents: u32) {
        if revents & channel::ERROR_EVENTS != 0 {
            self.handle_error();
            return;
        }
        if revents & channel::PEER_CLOSED != 0 {
            self.handle_close();
            return;
        }
        if revents & channel::READABLE != 0 {
            self.handle_read();
        }
        if revents & channel::WRITABLE != 0 {
            self.handle_write();
        }
    }

    fn handle_read(&self) {
        let mut input = self.input.lock();
        match input.read_from_fd(self.fd()) {
            Ok(0) => {
                // EOF.
                drop(input);
                self.handle_close();
            }
            Ok(_) => {
                let Some(this) = self.me.upgrade() else {
                    return;
                };
                let message = self.message_cb.lock();
                if let Some(cb) = message.as_ref() {
                    cb(&this, &mut input);
                }
            }
            Err(err) => {
                debug!(fd = self.fd(), ?err, "read failed");
                drop(input);
                self.handle_close();
            }
        }
    }

    fn handle_write(&self) {
        let mut output = self.output.lock();
        match output.write_to_fd(self.fd()) {
            Ok(_) => {
                if output.length() == 0 {
                    if let Some(channel) = self.channel.lock().as_ref() {
                        channel.disable_write();
                    }
                    if self.state() == State::Disconnecting {
                        socket::shutdown_write(self.fd());
                    }
                }
            }
            Err(err) => {
                debug!(fd = self.fd(), ?err, "write failed");
                drop(output);
                self.handle_close();
            }
        }
    }

    /// Tears the connection down exactly once: deregisters the channel,
    /// fires the close callback, then closes the descriptor.
    fn handle_close(&self) {
        let from_connected = self
            .state
            .compare_exchange(
                State::Connected as u8,
                State::Disconnected as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        let from_disconnecting = !from_connected
            && self
                .state
                .compare_exchange(
                    State::Disconnecting as u8,
                    State::Disconnected as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok();
        if !from_connected && !from_disconnecting {
            // Another path already closed this connection.
            return;
        }

        if let Some(channel) = self.channel.lock().take() {
            channel.disable_all();
        }

        if let Some(this) = self.me.upgrade() {
            let close = self.close_cb.lock();
            if let Some(cb) = close.as_ref() {
                cb(&this);
            }
        }

        let fd = self.fd.swap(-1, Ordering::AcqRel);
        if fd >= 0 {
            socket::close(fd);
        }
    }

    fn handle_error(&self) {
        self.handle_close();
    }

    /// Write path on the IO thread: try the descriptor directly while
    /// the output buffer is empty, queue the remainder, and arm write
    /// interest while anything is queued.
    fn send_in_loop(&self, data: &[u8]) {
        if self.state() != State::Connected {
            return;
        }
        let mut output = self.output.lock();

        let mut written = 0;
        if output.length() == 0 {
            match socket::write(self.fd(), data) {
                Ok(n) => written = n,
                Err(err) => {
                    warn!(fd = self.fd(), ?err, "send failed");
                    drop(output);
                    self.handle_error();
                    return;
                }
            }
        }

        if written < data.len() {
            if !output.write_to_buf(&data[written..]) {
                warn!(fd = self.fd(), "output buffer expansion failed");
                drop(output);
                self.handle_error();
                return;
            }
            if output.length() > 0 {
                if let Some(channel) = self.channel.lock().as_ref() {
                    channel.enable_write();
                }
            }
        }
    }

    fn shutdown_in_loop(&self) {
        if self
            .state
            .compare_exchange(
                State::Connected as u8,
                State::Disconnecting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }
        if self.output.lock().length() == 0 {
            socket::shutdown_write(self.fd());
        }
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        // Normally handle_close released the descriptor; cover the
        // teardown path where the loop exits with the connection still
        // open.
        let fd = self.fd.swap(-1, Ordering::AcqRel);
        if fd >= 0 {
            socket::close(fd);
        }
    }
}
