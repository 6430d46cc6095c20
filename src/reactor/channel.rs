use std::any::Any;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::reactor::event_loop::EventLoop;

/// Events observed when enabling the read side: readable plus
/// peer-closed.
pub const READ_EVENTS: u32 = (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
/// Events observed when enabling the write side.
pub const WRITE_EVENTS: u32 = libc::EPOLLOUT as u32;
/// Error and hangup bits, always reported by the OS regardless of the
/// registered mask.
pub const ERROR_EVENTS: u32 = (libc::EPOLLERR | libc::EPOLLHUP) as u32;
/// Peer closed its write side.
pub const PEER_CLOSED: u32 = libc::EPOLLRDHUP as u32;
/// Readable.
pub const READABLE: u32 = libc::EPOLLIN as u32;
/// Writable.
pub const WRITABLE: u32 = libc::EPOLLOUT as u32;

type EventCallback = Box<dyn Fn(u32) + Send + Sync>;

/// Binds one file descriptor, an interest mask, and an event callback
/// to a specific [`EventLoop`].
///
/// The loop's registry holds only a weak handle, so dispatch that races
/// with destruction silently drops the event. A channel may be *tied*
/// to its owner (typically a connection): the tie is a weak reference
/// promoted to a strong one for the duration of [`handle_event`], which
/// keeps the owner alive across its own callback.
///
/// A channel must not be destroyed until `disable_all` has run on the
/// owning loop; that removes it from the poller and the registry.
///
/// [`handle_event`]: Channel::handle_event
pub struct Channel {
    me: Weak<Channel>,
    owner: Weak<EventLoop>,
    fd: RawFd,
    events: AtomicU32,
    callback: Mutex<Option<EventCallback>>,
    tie: Mutex<Option<Weak<dyn Any + Send + Sync>>>,
}

impl Channel {
    pub fn new(owner: &Arc<EventLoop>, fd: RawFd) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            owner: Arc::downgrade(owner),
            fd,
            events: AtomicU32::new(0),
            callback: Mutex::new(None),
            tie: Mutex::new(None),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// The interest mask currently registered with the OS.
    pub fn events(&self) -> u32 {
        self.events.load(Ordering::Acquire)
    }

    pub fn set_callback(&self, cb: impl Fn(u32) + Send + Sync + 'static) {
        *self.callback.lock() = Some(Box::new(cb));
    }

    /// Ties this channel to its owner. `handle_event` promotes the tie
    /// before running the callback and drops the event if the owner is
    /// already gone.
    pub fn tie<T: Send + Sync + 'static>(&self, owner: &Arc<T>) {
        let weak: Weak<T> = Arc::downgrade(owner);
        let weak: Weak<dyn Any + Send + Sync> = weak;
        *self.tie.lock() = Some(weak);
    }

    /// Registers interest in readable and peer-closed events.
    pub fn enable_read(&self) {
        self.events.fetch_or(READ_EVENTS, Ordering::AcqRel);
        self.update();
    }

    pub fn enable_write(&self) {
        self.events.fetch_or(WRITE_EVENTS, Ordering::AcqRel);
        self.update();
    }

    pub fn disable_write(&self) {
        self.events.fetch_and(!WRITE_EVENTS, Ordering::AcqRel);
        self.update();
    }

    /// Clears the mask; with zero interest the loop removes the channel
    /// from the poller and from its registry.
    pub fn disable_all(&self) {
        self.events.store(0, Ordering::Release);
        self.update();
    }

    /// Runs the event callback for `revents` on the loop thread.
    pub fn handle_event(&self, revents: u32) {
        let tie = self.tie.lock().clone();
        let _owner_guard = match tie {
            Some(weak) => match weak.upgrade() {
                Some(strong) => Some(strong),
                // Owner destroyed between poll and dispatch.
                None => return,
            },
            None => None,
        };
        let callback = self.callback.lock();
        if let Some(cb) = callback.as_ref() {
            cb(revents);
        }
    }

    /// Synchronizes the interest mask with the owner loop. Off-thread
    /// calls hop to the loop with a strong reference captured so the
    /// channel outlives the hop.
    fn update(&self) {
        let Some(owner) = self.owner.upgrade() else {
            return;
        };
        let Some(channel) = self.me.upgrade() else {
            return;
        };
        if owner.is_in_loop_thread() {
            owner.update_channel(&channel);
        } else {
            owner.run_in_loop(move || {
                if let Some(owner) = channel.owner.upgrade() {
                    owner.update_channel(&channel);
                }
            });
        }
    }
}
