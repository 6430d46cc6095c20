//! Composition root: listener, IO loop pool, connection registry,
//! idle-timeout manager, and the user callback surface.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::os::unix::io::RawFd;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::memory::InputBuffer;
use crate::net::acceptor::Acceptor;
use crate::net::connection::TcpConnection;
use crate::reactor::event_loop::EventLoop;
use crate::reactor::loop_pool::{EventLoopThreadPool, ThreadInitCallback};
use crate::time::timeout::TimeoutManager;

type ConnectionCallback = Box<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;
type MessageCallback = Box<dyn Fn(&Arc<TcpConnection>, &mut InputBuffer) + Send + Sync>;
type DataCallback = Box<dyn Fn(&Arc<TcpConnection>, &[u8]) + Send + Sync>;

const DEFAULT_IDLE_TIMEOUT_MS: u64 = 300_000;
const MIN_IDLE_TIMEOUT_MS: u64 = 1000;

/// A multi-reactor TCP server.
///
/// Accepts on the base loop, shards connections round-robin across the
/// IO loop pool, and drives user callbacks from each connection's
/// assigned loop. User callbacks run behind a panic barrier: a panic is
/// logged and never tears down a loop or the server.
pub struct TcpServer {
    me: Weak<TcpServer>,
    name: String,
    ip: Ipv4Addr,
    port: u16,
    base_loop: Arc<EventLoop>,
    thread_pool: EventLoopThreadPool,
    acceptor: Mutex<Option<Arc<Acceptor>>>,
    idle_manager: Mutex<Option<Arc<TimeoutManager>>>,
    connections: Mutex<HashMap<RawFd, Arc<TcpConnection>>>,

    user_conn_cb: Mutex<Option<ConnectionCallback>>,
    user_msg_cb: Mutex<Option<MessageCallback>>,
    user_close_cb: Mutex<Option<ConnectionCallback>>,
    user_data_cb: Mutex<Option<DataCallback>>,
    thread_init_cb: Mutex<Option<ThreadInitCallback>>,

    idle_timeout_enabled: AtomicBool,
    idle_timeout_ms: AtomicU64,
    started: AtomicBool,
}

impl TcpServer {
    /// Validates the endpoint and builds the server. The IO loop pool
    /// is created but not started; `io_thread_count == 0` selects the
    /// machine's hardware concurrency.
    pub fn new(
        base_loop: Arc<EventLoop>,
        ip: &str,
        port: u16,
        io_thread_count: usize,
        name: &str,
    ) -> Result<Arc<Self>> {
        if port == 0 {
            return Err(Error::Configuration("port cannot be 0"));
        }
        let ip: Ipv4Addr = ip
            .parse()
            .map_err(|_| Error::Configuration("invalid IPv4 address"))?;

        let server = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            name: name.to_string(),
            ip,
            port,
            base_loop,
            thread_pool: EventLoopThreadPool::new(format!("{name}-pool"), io_thread_count),
            acceptor: Mutex::new(None),
            idle_manager: Mutex::new(None),
            connections: Mutex::new(HashMap::new()),
            user_conn_cb: Mutex::new(None),
            user_msg_cb: Mutex::new(None),
            user_close_cb: Mutex::new(None),
            user_data_cb: Mutex::new(None),
            thread_init_cb: Mutex::new(None),
            idle_timeout_enabled: AtomicBool::new(false),
            idle_timeout_ms: AtomicU64::new(DEFAULT_IDLE_TIMEOUT_MS),
            started: AtomicBool::new(false),
        });

        info!(name = %server.name, %ip, port, io_thread_count, "server created");
        Ok(server)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invoked on the IO loop when a connection is established and
    /// again when it closes; observe `conn.is_connected()` to tell the
    /// two apart.
    pub fn set_connection_callback(
        &self,
        cb: impl Fn(&Arc<TcpConnection>) + Send + Sync + 'static,
    ) {
        *self.user_conn_cb.lock() = Some(Box::new(cb));
    }

    /// Invoked with the input buffer whenever bytes arrive.
    pub fn set_message_callback(
        &self,
        cb: impl Fn(&Arc<TcpConnection>, &mut InputBuffer) + Send + Sync + 'static,
    ) {
        *self.user_msg_cb.lock() = Some(Box::new(cb));
    }

    pub fn set_close_callback(&self, cb: impl Fn(&Arc<TcpConnection>) + Send + Sync + 'static) {
        *self.user_close_cb.lock() = Some(Box::new(cb));
    }

    /// Sugar over the message callback: receives the buffered bytes as
    /// a slice, before the message callback runs.
    pub fn set_data_callback(
        &self,
        cb: impl Fn(&Arc<TcpConnection>, &[u8]) + Send + Sync + 'static,
    ) {
        *self.user_data_cb.lock() = Some(Box::new(cb));
    }

    /// Runs on each IO loop thread before its loop starts.
    pub fn set_thread_init_callback(&self, cb: impl Fn(&EventLoop) + Send + Sync + 'static) {
        *self.thread_init_cb.lock() = Some(Arc::new(cb));
    }

    /// Starts the idle-timeout manager (when enabled), the IO loop
    /// pool, and the listener, in that order. A failure rolls the
    /// earlier stages back without leaking descriptors.
    pub fn start(&self) -> Result<()> {
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!(name = %self.name, "start called but server already started");
            return Ok(());
        }

        if self.idle_timeout_enabled.load(Ordering::Acquire) {
            let mut manager = self.idle_manager.lock();
            let manager = manager.get_or_insert_with(|| self.make_idle_manager());
            manager.start();
            info!(name = %self.name, timeout_ms = self.idle_timeout_ms.load(Ordering::Acquire), "idle timeout enabled");
        }

        let init = self.thread_init_cb.lock().clone();
        if let Err(err) = self.thread_pool.start(init) {
            self.abort_start();
            return Err(err);
        }

        let acceptor = match Acceptor::new(
            self.me.clone(),
            Arc::clone(&self.base_loop),
            self.ip,
            self.port,
        ) {
            Ok(acceptor) => acceptor,
            Err(err) => {
                self.abort_start();
                return Err(err);
            }
        };
        if let Err(err) = acceptor.listen() {
            drop(acceptor);
            self.abort_start();
            return Err(err);
        }
        *self.acceptor.lock() = Some(acceptor);

        info!(name = %self.name, ip = %self.ip, port = self.port, "server started");
        Ok(())
    }

    fn abort_start(&self) {
        if let Some(manager) = self.idle_manager.lock().take() {
            manager.stop();
        }
        self.thread_pool.stop();
        self.started.store(false, Ordering::Release);
    }

    /// Stops the timeout manager, closes the listener, shuts every
    /// connection down, and joins the IO threads. Returns once all
    /// connection descriptors are closed.
    pub fn stop(&self) {
        if self
            .started
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        info!(name = %self.name, "server stopping");

        if let Some(manager) = self.idle_manager.lock().take() {
            manager.stop();
        }

        // Dropping the acceptor closes the listening descriptor.
        self.acceptor.lock().take();

        let to_close: Vec<_> = {
            let mut connections = self.connections.lock();
            connections.drain().map(|(_, conn)| conn).collect()
        };
        for conn in to_close {
            conn.shutdown();
        }

        self.thread_pool.stop();
        info!(name = %self.name, "server stopped");
    }

    /// The IO loop for the next accepted connection; the base loop when
    /// the pool has no workers.
    pub(crate) fn get_next_loop(&self) -> Arc<EventLoop> {
        self.thread_pool
            .get_next_loop()
            .unwrap_or_else(|| Arc::clone(&self.base_loop))
    }

    pub(crate) fn install_callbacks(&self, conn: &Arc<TcpConnection>) {
        let weak = self.me.clone();
        conn.set_connected_cb(Box::new(move |conn| {
            if let Some(server) = weak.upgrade() {
                server.ts_connected_cb(conn);
            }
        }));
        let weak = self.me.clone();
        conn.set_message_cb(Box::new(move |conn, buf| {
            if let Some(server) = weak.upgrade() {
                server.ts_message_cb(conn, buf);
            }
        }));
        let weak = self.me.clone();
        conn.set_close_cb(Box::new(move |conn| {
            if let Some(server) = weak.upgrade() {
                server.ts_close_cb(conn);
            }
        }));
    }

    pub(crate) fn add_new_conn(&self, conn: Arc<TcpConnection>) {
        let fd = conn.fd();
        if fd < 0 {
            warn!(name = %self.name, fd, "refusing connection with invalid fd");
            return;
        }
        {
            let mut connections = self.connections.lock();
            if connections.contains_key(&fd) {
                warn!(name = %self.name, fd, "connection already registered");
                return;
            }
            connections.insert(fd, Arc::clone(&conn));
        }
        if self.idle_timeout_enabled.load(Ordering::Acquire) {
            if let Some(manager) = self.idle_manager.lock().clone() {
                manager.add_connection(&conn);
            }
        }
        debug!(name = %self.name, fd, peer = %conn.peer_ipport(), total = self.connection_count(), "connection added");
    }

    fn remove_conn(&self, conn: &Arc<TcpConnection>) {
        let fd = conn.fd();
        if let Some(manager) = self.idle_manager.lock().clone() {
            manager.remove_connection(fd);
        }
        if self.connections.lock().remove(&fd).is_some() {
            debug!(name = %self.name, fd, "connection removed");
        }
    }

    fn ts_connected_cb(&self, conn: &Arc<TcpConnection>) {
        let user = self.user_conn_cb.lock();
        if let Some(cb) = user.as_ref() {
            if catch_unwind(AssertUnwindSafe(|| cb(conn))).is_err() {
                error!(name = %self.name, "user connection callback panicked");
            }
        }
    }

    fn ts_message_cb(&self, conn: &Arc<TcpConnection>, buf: &mut InputBuffer) {
        self.on_connection_active(conn);

        {
            let data = self.user_data_cb.lock();
            if let Some(cb) = data.as_ref() {
                if buf.length() > 0 && catch_unwind(AssertUnwindSafe(|| cb(conn, buf.get_from_buf()))).is_err() {
                    error!(name = %self.name, "user data callback panicked");
                }
            }
        }

        let message = self.user_msg_cb.lock();
        if let Some(cb) = message.as_ref() {
            if catch_unwind(AssertUnwindSafe(|| cb(conn, buf))).is_err() {
                error!(name = %self.name, "user message callback panicked");
            }
        }
    }

    /// Registry and wheel removal happen before any user callback, so
    /// by the time user code observes the close the connection is no
    /// longer tracked anywhere.
    fn ts_close_cb(&self, conn: &Arc<TcpConnection>) {
        self.remove_conn(conn);

        {
            let user = self.user_conn_cb.lock();
            if let Some(cb) = user.as_ref() {
                if catch_unwind(AssertUnwindSafe(|| cb(conn))).is_err() {
                    error!(name = %self.name, "user connection callback panicked");
                }
            }
        }

        let close = self.user_close_cb.lock();
        if let Some(cb) = close.as_ref() {
            if catch_unwind(AssertUnwindSafe(|| cb(conn))).is_err() {
                error!(name = %self.name, "user close callback panicked");
            }
        }
    }

    /// Enables or disables idle-connection eviction. Enabling after
    /// `start` brings the manager up immediately.
    pub fn enable_idle_timeout(&self, enable: bool) {
        if self.idle_timeout_enabled.swap(enable, Ordering::AcqRel) == enable {
            return;
        }
        if enable {
            let mut manager = self.idle_manager.lock();
            if manager.is_none() {
                let created = self.make_idle_manager();
                if self.started.load(Ordering::Acquire) {
                    created.start();
                }
                *manager = Some(created);
            }
        } else if let Some(manager) = self.idle_manager.lock().take() {
            manager.stop();
        }
        info!(name = %self.name, enable, "idle timeout toggled");
    }

    /// Sets the idle timeout, clamped to a 1000 ms minimum.
    pub fn set_idle_timeout(&self, timeout_ms: u64) {
        let timeout_ms = timeout_ms.max(MIN_IDLE_TIMEOUT_MS);
        self.idle_timeout_ms.store(timeout_ms, Ordering::Release);
        if let Some(manager) = self.idle_manager.lock().clone() {
            manager.set_idle_timeout(timeout_ms);
        }
        info!(name = %self.name, timeout_ms, "idle timeout set");
    }

    /// Marks `conn` active so the idle clock restarts. The message
    /// wrapper does this automatically; protocols that consider writes
    /// activity call it directly.
    pub fn update_connection_activity(&self, conn: &Arc<TcpConnection>) {
        self.on_connection_active(conn);
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn idle_connection_count(&self) -> usize {
        self.idle_manager
            .lock()
            .as_ref()
            .map_or(0, |manager| manager.connection_count())
    }

    fn on_connection_active(&self, conn: &Arc<TcpConnection>) {
        if !self.idle_timeout_enabled.load(Ordering::Acquire) {
            return;
        }
        if let Some(manager) = self.idle_manager.lock().clone() {
            manager.update_activity(conn.fd());
        }
    }

    fn make_idle_manager(&self) -> Arc<TimeoutManager> {
        let manager = TimeoutManager::new(self.idle_timeout_ms.load(Ordering::Acquire), 60, 1000);
        let weak = self.me.clone();
        manager.set_timeout_callback(Box::new(move |conn| {
            if let Some(server) = weak.upgrade() {
                server.on_idle_timeout(conn);
            }
        }));
        manager
    }

    fn on_idle_timeout(&self, conn: &Arc<TcpConnection>) {
        info!(name = %self.name, fd = conn.fd(), "closing idle connection");
        conn.shutdown();
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.stop();
    }
}
