//! Single-thread reactor: readiness polling, a cross-thread task
//! queue, and eventfd wakeup signaling.
//!
//! One OS thread owns each loop. All channel mutations and all event
//! handlers for descriptors registered on a loop execute on that
//! thread; other threads hand work over with [`run_in_loop`] /
//! [`queue_in_loop`], which wake the loop by writing a counter to its
//! wakeup descriptor.
//!
//! [`run_in_loop`]: EventLoop::run_in_loop
//! [`queue_in_loop`]: EventLoop::queue_in_loop

use std::collections::HashMap;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::{self, ThreadId};

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::reactor::channel::Channel;
use crate::reactor::poller::Poller;

/// Longest a loop sleeps in `epoll_wait` with nothing to do.
const POLL_TIMEOUT_MS: i32 = 10_000;

/// Initial size of the readiness event vector; doubled whenever a poll
/// fills it completely.
const INITIAL_EVENT_CAPACITY: usize = 1024;

type Task = Box<dyn FnOnce() + Send + 'static>;

pub struct EventLoop {
    poller: Poller,
    running: AtomicBool,
    quit: AtomicBool,
    thread_id: Mutex<Option<ThreadId>>,
    channels: Mutex<HashMap<RawFd, Weak<Channel>>>,
    pending: Mutex<Vec<Task>>,
    wakeup_fd: RawFd,
    wakeup_channel: OnceLock<Arc<Channel>>,
}

impl EventLoop {
    /// Creates a loop with its poller and wakeup descriptor. The loop
    /// does not run until [`run`] is called on the owning thread.
    ///
    /// [`run`]: EventLoop::run
    pub fn new() -> io::Result<Arc<Self>> {
        let poller = Poller::new()?;
        let wakeup_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wakeup_fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let event_loop = Arc::new(Self {
            poller,
            running: AtomicBool::new(false),
            quit: AtomicBool::new(false),
            thread_id: Mutex::new(None),
            channels: Mutex::new(HashMap::new()),
            pending: Mutex::new(Vec::new()),
            wakeup_fd,
            wakeup_channel: OnceLock::new(),
        });

        let channel = Channel::new(&event_loop, wakeup_fd);
        let weak = Arc::downgrade(&event_loop);
        channel.set_callback(move |_| {
            if let Some(event_loop) = weak.upgrade() {
                event_loop.handle_wakeup();
            }
        });
        channel.enable_read();
        let _ = event_loop.wakeup_channel.set(channel);

        Ok(event_loop)
    }

    pub fn is_in_loop_thread(&self) -> bool {
        *self.thread_id.lock() == Some(thread::current().id())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Runs the reactor on the calling thread until [`stop`] is called.
    ///
    /// Each cycle drains pending tasks, polls for readiness, dispatches
    /// events through the channel registry, and drains again, so tasks
    /// enqueued before `stop` always execute before the loop exits.
    ///
    /// [`stop`]: EventLoop::stop
    pub fn run(&self) {
        self.running.store(true, Ordering::Release);
        *self.thread_id.lock() = Some(thread::current().id());

        let empty = libc::epoll_event { events: 0, u64: 0 };
        let mut active = vec![empty; INITIAL_EVENT_CAPACITY];

        // The quit flag is sticky so a stop that lands before this
        // thread reaches the loop body is not lost.
        while !self.quit.load(Ordering::Acquire) {
            self.drain_pending();

            let n = match self.poller.poll(POLL_TIMEOUT_MS, &mut active) {
                Ok(n) => n,
                Err(err) => {
                    error!(?err, "poll failed");
                    0
                }
            };
            if n == active.len() {
                active.resize(active.len() * 2, empty);
            }

            for event in &active[..n] {
                let fd = event.u64 as RawFd;
                let channel = self.channels.lock().get(&fd).and_then(Weak::upgrade);
                match channel {
                    Some(channel) => channel.handle_event(event.events),
                    None => debug!(fd, "channel gone, dropping event"),
                }
            }

            self.drain_pending();
        }
        self.running.store(false, Ordering::Release);
    }

    /// Stops the loop after it finishes the current cycle, including
    /// any already-enqueued tasks.
    pub fn stop(&self) {
        self.quit.store(true, Ordering::Release);
        self.wakeup();
    }

    /// Runs `f` now when called on the owner thread, otherwise enqueues
    /// it and wakes the loop.
    pub fn run_in_loop(&self, f: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            f();
        } else {
            self.queue_in_loop(f);
        }
    }

    /// Enqueues `f` for the owner thread. Tasks posted by one thread
    /// execute in their enqueue order.
    pub fn queue_in_loop(&self, f: impl FnOnce() + Send + 'static) {
        self.pending.lock().push(Box::new(f));
        self.wakeup();
    }

    /// Synchronizes a channel's interest mask with the poller. Owner
    /// thread only; channels funnel off-thread calls through
    /// [`run_in_loop`].
    ///
    /// A zero mask removes the channel from the poller and the
    /// registry; a new descriptor is added, an existing one modified.
    ///
    /// [`run_in_loop`]: EventLoop::run_in_loop
    pub(crate) fn update_channel(&self, channel: &Arc<Channel>) {
        let fd = channel.fd();
        if channel.events() == 0 {
            self.poller.remove(channel);
            self.channels.lock().remove(&fd);
            return;
        }

        let mut channels = self.channels.lock();
        if channels.contains_key(&fd) {
            if self.poller.modify(channel) {
                channels.insert(fd, Arc::downgrade(channel));
            }
        } else if self.poller.add(channel) {
            channels.insert(fd, Arc::downgrade(channel));
        }
    }

    /// Unblocks `poll` by writing one count to the wakeup descriptor.
    fn wakeup(&self) {
        let one: u64 = 1;
        let n = unsafe {
            libc::write(
                self.wakeup_fd,
                (&one as *const u64).cast(),
                mem::size_of::<u64>(),
            )
        };
        if n != mem::size_of::<u64>() as isize {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EAGAIN) {
                error!(?err, "wakeup write failed");
            }
        }
    }

    /// Drains the wakeup counter until the descriptor would block.
    fn handle_wakeup(&self) {
        let mut count: u64 = 0;
        loop {
            let n = unsafe {
                libc::read(
                    self.wakeup_fd,
                    (&mut count as *mut u64).cast(),
                    mem::size_of::<u64>(),
                )
            };
            if n == 0 {
                break;
            }
            if n < 0 {
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EINTR) => continue,
                    Some(e) if e == libc::EAGAIN || e == libc::EWOULDBLOCK => break,
                    _ => {
                        error!(?err, "wakeup read failed");
                        break;
                    }
                }
            }
        }
    }

    /// Swaps the pending vector out under the lock and runs the tasks
    /// with it released, so tasks can enqueue further tasks.
    fn drain_pending(&self) {
        let tasks = mem::take(&mut *self.pending.lock());
        for task in tasks {
            task();
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        // Release the wakeup channel before its descriptor goes away.
        drop(self.wakeup_channel.take());
        unsafe {
            libc::close(self.wakeup_fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn tasks_run_on_the_loop_thread_in_order() {
        let event_loop = EventLoop::new().expect("create loop");
        let order = Arc::new(Mutex::new(Vec::new()));

        let handle = {
            let event_loop = event_loop.clone();
            thread::spawn(move || event_loop.run())
        };
        // Give the loop a moment to record its owner thread.
        thread::sleep(Duration::from_millis(50));

        for i in 0..10 {
            let order = order.clone();
            let loop_ref = event_loop.clone();
            event_loop.queue_in_loop(move || {
                assert!(loop_ref.is_in_loop_thread());
                order.lock().push(i);
            });
        }

        thread::sleep(Duration::from_millis(100));
        event_loop.stop();
        handle.join().expect("join loop thread");

        assert_eq!(*order.lock(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn stop_runs_previously_enqueued_tasks() {
        let event_loop = EventLoop::new().expect("create loop");
        let ran = Arc::new(AtomicUsize::new(0));

        let handle = {
            let event_loop = event_loop.clone();
            thread::spawn(move || event_loop.run())
        };
        thread::sleep(Duration::from_millis(50));

        for _ in 0..5 {
            let ran = ran.clone();
            event_loop.queue_in_loop(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            });
        }
        event_loop.stop();
        handle.join().expect("join loop thread");

        assert_eq!(ran.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn run_in_loop_is_synchronous_on_the_owner_thread() {
        let event_loop = EventLoop::new().expect("create loop");
        let observed = Arc::new(AtomicUsize::new(0));

        let handle = {
            let event_loop_outer = event_loop.clone();
            let observed = observed.clone();
            thread::spawn(move || {
                let event_loop = event_loop_outer.clone();
                let inner = observed.clone();
                event_loop_outer.queue_in_loop(move || {
                    // Already on the owner thread: runs inline.
                    event_loop.run_in_loop({
                        let inner = inner.clone();
                        move || {
                            inner.store(1, Ordering::SeqCst);
                        }
                    });
                    assert_eq!(inner.load(Ordering::SeqCst), 1);
                });
                event_loop_outer.run();
            })
        };

        thread::sleep(Duration::from_millis(100));
        event_loop.stop();
        handle.join().expect("join loop thread");
        assert_eq!(observed.load(Ordering::SeqCst), 1);
    }
}
