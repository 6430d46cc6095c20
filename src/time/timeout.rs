//! Hashed-time-wheel idle connection manager.
//!
//! A wheel of `wheel_size` slots is advanced one slot per tick by a
//! dedicated thread. Each tracked connection owns an entry placed in
//! the slot where its idle deadline lands; touching the connection
//! moves the entry to a fresh slot in O(1); eviction cost amortizes
//! across ticks. Entries hold
//! weak references; a sweeper thread periodically collects entries
//! whose connection died or disconnected without being removed.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::net::connection::TcpConnection;

pub type TimeoutCallback = Box<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;

const DEFAULT_IDLE_TIMEOUT_MS: u64 = 300_000;
const DEFAULT_WHEEL_SIZE: usize = 60;
const DEFAULT_TICK_INTERVAL_MS: u64 = 1000;
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

struct IdleEntry {
    conn: Weak<TcpConnection>,
    fd: RawFd,
    slot: AtomicUsize,
    remaining_ticks: AtomicU32,
    last_activity: Mutex<Instant>,
}

#[derive(Default)]
struct WheelSlot {
    entries: Mutex<Vec<Arc<IdleEntry>>>,
}

pub struct TimeoutManager {
    me: Weak<TimeoutManager>,
    idle_timeout_ms: AtomicU64,
    wheel_size: usize,
    tick_interval_ms: u64,

    wheel: Vec<WheelSlot>,
    current_slot: AtomicUsize,
    connections: Mutex<HashMap<RawFd, Arc<IdleEntry>>>,
    timeout_cb: Mutex<Option<TimeoutCallback>>,

    running: AtomicBool,
    should_stop: AtomicBool,
    tick_thread: Mutex<Option<JoinHandle<()>>>,
    sweeper_thread: Mutex<Option<JoinHandle<()>>>,
    sweeper_lock: Mutex<()>,
    sweeper_cv: Condvar,
}

impl TimeoutManager {
    /// Builds a manager; zero arguments fall back to the defaults
    /// (5 min timeout, 60 slots, 1 s tick).
    pub fn new(idle_timeout_ms: u64, wheel_size: usize, tick_interval_ms: u64) -> Arc<Self> {
        let idle_timeout_ms = if idle_timeout_ms == 0 {
            DEFAULT_IDLE_TIMEOUT_MS
        } else {
            idle_timeout_ms
        };
        let wheel_size = if wheel_size == 0 {
            DEFAULT_WHEEL_SIZE
        } else {
            wheel_size
        };
        let tick_interval_ms = if tick_interval_ms == 0 {
            DEFAULT_TICK_INTERVAL_MS
        } else {
            tick_interval_ms
        };

        let mut wheel = Vec::with_capacity(wheel_size);
        wheel.resize_with(wheel_size, WheelSlot::default);

        info!(
            idle_timeout_ms,
            wheel_size, tick_interval_ms, "timeout manager created"
        );
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            idle_timeout_ms: AtomicU64::new(idle_timeout_ms),
            wheel_size,
            tick_interval_ms,
            wheel,
            current_slot: AtomicUsize::new(0),
            connections: Mutex::new(HashMap::new()),
            timeout_cb: Mutex::new(None),
            running: AtomicBool::new(false),
            should_stop: AtomicBool::new(false),
            tick_thread: Mutex::new(None),
            sweeper_thread: Mutex::new(None),
            sweeper_lock: Mutex::new(()),
            sweeper_cv: Condvar::new(),
        })
    }

    pub fn set_timeout_callback(&self, cb: TimeoutCallback) {
        *self.timeout_cb.lock() = Some(cb);
    }

    /// Spawns the tick thread and the sweeper thread.
    pub fn start(&self) {
        let Some(this) = self.me.upgrade() else {
            return;
        };
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        self.should_stop.store(false, Ordering::Release);

        let manager = Arc::clone(&this);
        let tick = thread::Builder::new()
            .name("idle-wheel".into())
            .spawn(move || manager.tick_loop());
        match tick {
            Ok(handle) => *self.tick_thread.lock() = Some(handle),
            Err(err) => error!(?err, "idle-wheel thread spawn failed"),
        }

        let manager = this;
        let sweeper = thread::Builder::new()
            .name("idle-sweeper".into())
            .spawn(move || manager.sweeper_loop());
        match sweeper {
            Ok(handle) => *self.sweeper_thread.lock() = Some(handle),
            Err(err) => error!(?err, "idle-sweeper thread spawn failed"),
        }

        info!("timeout manager started");
    }

    /// Joins both threads and forgets every tracked connection.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.should_stop.store(true, Ordering::Release);
        self.sweeper_cv.notify_all();

        if let Some(handle) = self.tick_thread.lock().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.sweeper_thread.lock().take() {
            let _ = handle.join();
        }

        self.connections.lock().clear();
        for slot in &self.wheel {
            slot.entries.lock().clear();
        }
        info!("timeout manager stopped");
    }

    /// Starts tracking `conn`, due one idle timeout from now.
    pub fn add_connection(&self, conn: &Arc<TcpConnection>) {
        let fd = conn.fd();
        if fd < 0 {
            warn!(fd, "refusing to track connection with invalid fd");
            return;
        }
        let now = Instant::now();
        let slot = self.calculate_slot(now);
        let entry = Arc::new(IdleEntry {
            conn: Arc::downgrade(conn),
            fd,
            slot: AtomicUsize::new(slot),
            remaining_ticks: AtomicU32::new(self.remaining_rounds(now)),
            last_activity: Mutex::new(now),
        });

        let mut connections = self.connections.lock();
        if connections.contains_key(&fd) {
            warn!(fd, "connection already tracked");
            return;
        }
        connections.insert(fd, Arc::clone(&entry));
        self.wheel[slot].entries.lock().push(entry);
        debug!(fd, slot, "connection tracked");
    }

    /// Re-stamps the connection's activity and moves its entry to the
    /// slot matching the new deadline.
    pub fn update_activity(&self, conn_id: RawFd) {
        let entry = {
            let connections = self.connections.lock();
            match connections.get(&conn_id) {
                Some(entry) => Arc::clone(entry),
                None => return,
            }
        };
        *entry.last_activity.lock() = Instant::now();
        self.move_to_new_slot(&entry);
    }

    /// Stops tracking `conn_id`. The wheel entry itself is collected
    /// lazily when its slot ticks.
    pub fn remove_connection(&self, conn_id: RawFd) {
        if self.connections.lock().remove(&conn_id).is_some() {
            debug!(fd = conn_id, "connection untracked");
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn set_idle_timeout(&self, idle_timeout_ms: u64) {
        if idle_timeout_ms == 0 {
            warn!("ignoring zero idle timeout");
            return;
        }
        self.idle_timeout_ms
            .store(idle_timeout_ms, Ordering::Release);
        info!(idle_timeout_ms, "idle timeout changed");
    }

    /// Treats every tracked connection as active right now.
    pub fn reset_all(&self) {
        let entries: Vec<_> = self.connections.lock().values().cloned().collect();
        let now = Instant::now();
        for entry in entries {
            *entry.last_activity.lock() = now;
            self.move_to_new_slot(&entry);
        }
        info!("all connections reset");
    }

    fn ticks_remaining(&self, last_activity: Instant) -> u64 {
        let elapsed_ms = Instant::now()
            .saturating_duration_since(last_activity)
            .as_millis() as u64;
        let timeout = self.idle_timeout_ms.load(Ordering::Acquire);
        timeout.saturating_sub(elapsed_ms) / self.tick_interval_ms
    }

    /// Full wheel revolutions an entry must sit out before its deadline
    /// slot visit is the real one.
    fn remaining_rounds(&self, last_activity: Instant) -> u32 {
        (self.ticks_remaining(last_activity) / self.wheel_size as u64) as u32
    }

    /// Slot where a connection last active at `last_activity` waits:
    /// `(current + remaining_ticks) mod wheel_size`.
    fn calculate_slot(&self, last_activity: Instant) -> usize {
        let ticks_remaining = self.ticks_remaining(last_activity) as usize;
        (self.current_slot.load(Ordering::Acquire) + ticks_remaining) % self.wheel_size
    }

    fn move_to_new_slot(&self, entry: &Arc<IdleEntry>) {
        let last_activity = *entry.last_activity.lock();
        let new_slot = self.calculate_slot(last_activity);
        let rounds = self.remaining_rounds(last_activity);
        let old_slot = entry.slot.load(Ordering::Acquire);
        if new_slot == old_slot {
            entry.remaining_ticks.store(rounds, Ordering::Release);
            return;
        }

        {
            let mut old = self.wheel[old_slot].entries.lock();
            old.retain(|e| !Arc::ptr_eq(e, entry));
        }
        entry.slot.store(new_slot, Ordering::Release);
        entry.remaining_ticks.store(rounds, Ordering::Release);
        self.wheel[new_slot].entries.lock().push(Arc::clone(entry));
    }

    fn tick_loop(&self) {
        debug!("time wheel loop started");
        while !self.should_stop.load(Ordering::Acquire) {
            let started = Instant::now();

            self.process_current_slot();

            let next = (self.current_slot.load(Ordering::Acquire) + 1) % self.wheel_size;
            self.current_slot.store(next, Ordering::Release);

            let elapsed = started.elapsed();
            let tick = Duration::from_millis(self.tick_interval_ms);
            if elapsed < tick {
                thread::sleep(tick - elapsed);
            }
        }
        debug!("time wheel loop stopped");
    }

    /// One tick over the current slot: entries still owing wheel
    /// revolutions are decremented; entries at zero are evicted when
    /// idle past the timeout and rescheduled to their real deadline
    /// slot otherwise.
    fn process_current_slot(&self) {
        let slot_index = self.current_slot.load(Ordering::Acquire);
        let timeout = self.idle_timeout_ms.load(Ordering::Acquire);
        let mut expired = Vec::new();
        let mut rescheduled = Vec::new();

        {
            let mut entries = self.wheel[slot_index].entries.lock();
            let now = Instant::now();
            entries.retain(|entry| {
                if entry.conn.upgrade().is_none() {
                    // Connection already destroyed; collect lazily.
                    return false;
                }
                let remaining = entry.remaining_ticks.load(Ordering::Acquire);
                if remaining > 0 {
                    entry
                        .remaining_ticks
                        .store(remaining - 1, Ordering::Release);
                    return true;
                }
                let idle_ms = now
                    .saturating_duration_since(*entry.last_activity.lock())
                    .as_millis() as u64;
                if idle_ms >= timeout {
                    expired.push(Arc::clone(entry));
                } else {
                    // Touched since this slot was assigned; wait out
                    // the remainder in a fresh slot.
                    rescheduled.push(Arc::clone(entry));
                }
                false
            });
        }

        for entry in rescheduled {
            // The entry is already out of this slot, so insert rather
            // than move; an almost-expired entry goes to the very next
            // slot instead of waiting out another revolution.
            let last_activity = *entry.last_activity.lock();
            let ticks = self.ticks_remaining(last_activity).max(1) as usize;
            let slot = (slot_index + ticks) % self.wheel_size;
            entry.slot.store(slot, Ordering::Release);
            entry
                .remaining_ticks
                .store((ticks / self.wheel_size) as u32, Ordering::Release);
            self.wheel[slot].entries.lock().push(entry);
        }

        for entry in expired {
            self.connections.lock().remove(&entry.fd);
            let Some(conn) = entry.conn.upgrade() else {
                continue;
            };
            info!(fd = entry.fd, timeout, "connection idle timeout");
            let callback = self.timeout_cb.lock();
            if let Some(cb) = callback.as_ref() {
                if catch_unwind(AssertUnwindSafe(|| cb(&conn))).is_err() {
                    error!(fd = entry.fd, "timeout callback panicked");
                }
            }
        }
    }

    fn sweeper_loop(&self) {
        debug!("sweeper loop started");
        loop {
            {
                let mut guard = self.sweeper_lock.lock();
                self.sweeper_cv.wait_for(&mut guard, SWEEP_INTERVAL);
            }
            if self.should_stop.load(Ordering::Acquire) {
                break;
            }
            self.cleanup_dead_connections();
        }
        debug!("sweeper loop stopped");
    }

    /// Drops entries whose connection was destroyed or left the
    /// connected state without an explicit removal.
    fn cleanup_dead_connections(&self) {
        let dead: Vec<RawFd> = {
            let connections = self.connections.lock();
            connections
                .iter()
                .filter(|(_, entry)| {
                    entry
                        .conn
                        .upgrade()
                        .map_or(true, |conn| !conn.is_connected())
                })
                .map(|(&fd, _)| fd)
                .collect()
        };

        for fd in &dead {
            self.connections.lock().remove(fd);
            for slot in &self.wheel {
                slot.entries.lock().retain(|entry| entry.fd != *fd);
            }
        }
        if !dead.is_empty() {
            debug!(count = dead.len(), "swept dead connections");
        }
    }
}

impl Drop for TimeoutManager {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::event_loop::EventLoop;
    use std::net::SocketAddrV4;

    fn test_conn() -> (Arc<TcpConnection>, RawFd) {
        let event_loop = EventLoop::new().expect("create loop");
        let mut fds = [0; 2];
        let ret =
            unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
        assert_eq!(ret, 0);
        let peer: SocketAddrV4 = "127.0.0.1:1".parse().expect("addr");
        // The connection owns fds[0]; the caller closes fds[1].
        (TcpConnection::new(event_loop, fds[0], peer), fds[1])
    }

    #[test]
    fn add_update_remove_track_the_map() {
        let manager = TimeoutManager::new(2000, 8, 100);
        let (conn, other) = test_conn();

        manager.add_connection(&conn);
        assert_eq!(manager.connection_count(), 1);

        // A second add of the same fd is rejected.
        manager.add_connection(&conn);
        assert_eq!(manager.connection_count(), 1);

        manager.update_activity(conn.fd());
        assert_eq!(manager.connection_count(), 1);

        manager.remove_connection(conn.fd());
        assert_eq!(manager.connection_count(), 0);

        unsafe { libc::close(other) };
    }

    #[test]
    fn slot_math_wraps_around_the_wheel() {
        let manager = TimeoutManager::new(500, 4, 100);
        // 500ms / 100ms = 5 ticks from slot 0 lands on slot 5 % 4 = 1,
        // after one full revolution.
        let now = Instant::now();
        assert_eq!(manager.calculate_slot(now), 1);
        assert_eq!(manager.remaining_rounds(now), 1);

        // A deadline within one revolution owes no extra rounds.
        let manager = TimeoutManager::new(300, 4, 100);
        assert_eq!(manager.calculate_slot(now), 3);
        assert_eq!(manager.remaining_rounds(now), 0);
    }

    #[test]
    fn expired_entry_fires_the_callback() {
        let manager = TimeoutManager::new(300, 4, 100);
        let fired = Arc::new(AtomicBool::new(false));
        let observed = fired.clone();
        manager.set_timeout_callback(Box::new(move |_conn| {
            observed.store(true, Ordering::SeqCst);
        }));

        let (conn, other) = test_conn();
        manager.add_connection(&conn);
        manager.start();

        // Deadline is 300ms out; give the wheel time to come around.
        thread::sleep(Duration::from_millis(1500));
        assert!(fired.load(Ordering::SeqCst));
        assert_eq!(manager.connection_count(), 0);

        manager.stop();
        unsafe { libc::close(other) };
    }

    #[test]
    fn activity_defers_eviction() {
        let manager = TimeoutManager::new(600, 8, 100);
        let fired = Arc::new(AtomicBool::new(false));
        let observed = fired.clone();
        manager.set_timeout_callback(Box::new(move |_conn| {
            observed.store(true, Ordering::SeqCst);
        }));

        let (conn, other) = test_conn();
        manager.add_connection(&conn);
        manager.start();

        // Keep touching the connection; no eviction may happen while
        // activity stays fresh.
        for _ in 0..10 {
            thread::sleep(Duration::from_millis(100));
            manager.update_activity(conn.fd());
        }
        assert!(!fired.load(Ordering::SeqCst));

        // Now go idle past the deadline.
        thread::sleep(Duration::from_millis(2000));
        assert!(fired.load(Ordering::SeqCst));

        manager.stop();
        unsafe { libc::close(other) };
    }
}
