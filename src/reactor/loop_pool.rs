use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::reactor::event_loop::EventLoop;

/// Runs on each worker thread after its loop is created and before the
/// loop starts.
pub type ThreadInitCallback = Arc<dyn Fn(&EventLoop) + Send + Sync>;

/// A fixed set of [`EventLoop`]s, each owned by a dedicated worker
/// thread, handed out round-robin.
///
/// Asking for zero threads sizes the pool to the machine's hardware
/// concurrency. Callers receive shared handles; the pool keeps
/// ownership and joins every worker in [`stop`].
///
/// [`stop`]: EventLoopThreadPool::stop
pub struct EventLoopThreadPool {
    name: String,
    thread_count: usize,
    loops: Mutex<Vec<Arc<EventLoop>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    next: AtomicUsize,
    started: AtomicBool,
}

impl EventLoopThreadPool {
    pub fn new(name: impl Into<String>, thread_count: usize) -> Self {
        let thread_count = if thread_count == 0 {
            num_cpus::get()
        } else {
            thread_count
        };
        Self {
            name: name.into(),
            thread_count,
            loops: Mutex::new(Vec::new()),
            threads: Mutex::new(Vec::new()),
            next: AtomicUsize::new(0),
            started: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Number of loops currently owned by the pool.
    pub fn thread_count(&self) -> usize {
        self.loops.lock().len()
    }

    /// Spawns the worker threads. Each runs `init(loop)` when provided,
    /// then the loop itself until [`stop`].
    ///
    /// [`stop`]: EventLoopThreadPool::stop
    pub fn start(&self, init: Option<ThreadInitCallback>) -> Result<()> {
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!(name = %self.name, "thread pool already started");
            return Ok(());
        }

        let mut loops = self.loops.lock();
        let mut threads = self.threads.lock();
        for i in 0..self.thread_count {
            let event_loop = EventLoop::new().map_err(|source| Error::Syscall {
                op: "event loop create",
                source,
            })?;
            loops.push(Arc::clone(&event_loop));

            let init = init.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-{}", self.name, i))
                .spawn(move || {
                    if let Some(init) = init {
                        init(&event_loop);
                    }
                    event_loop.run();
                })
                .map_err(|source| Error::Syscall {
                    op: "worker thread spawn",
                    source,
                })?;
            threads.push(handle);
        }

        info!(name = %self.name, threads = loops.len(), "thread pool started");
        Ok(())
    }

    /// Signals every loop to stop, then joins every worker thread.
    pub fn stop(&self) {
        if self
            .started
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let loops: Vec<_> = self.loops.lock().drain(..).collect();
        for event_loop in &loops {
            event_loop.stop();
        }

        let threads: Vec<_> = self.threads.lock().drain(..).collect();
        for handle in threads {
            if let Err(err) = handle.join() {
                warn!(name = %self.name, ?err, "worker thread panicked");
            }
        }

        info!(name = %self.name, "thread pool stopped");
    }

    /// The next loop, round-robin. `None` before `start` and after
    /// `stop`; callers then fall back to their base loop.
    pub fn get_next_loop(&self) -> Option<Arc<EventLoop>> {
        let loops = self.loops.lock();
        if loops.is_empty() {
            return None;
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % loops.len();
        Some(Arc::clone(&loops[index]))
    }

    pub fn get_loop(&self, index: usize) -> Option<Arc<EventLoop>> {
        self.loops.lock().get(index).cloned()
    }
}

impl Drop for EventLoopThreadPool {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn round_robin_cycles_through_every_loop() {
        let pool = EventLoopThreadPool::new("rr-test", 3);
        pool.start(None).expect("start pool");

        let mut seen = HashSet::new();
        for _ in 0..6 {
            let event_loop = pool.get_next_loop().expect("loop available");
            seen.insert(Arc::as_ptr(&event_loop) as usize);
        }
        assert_eq!(seen.len(), 3);

        pool.stop();
        assert!(pool.get_next_loop().is_none());
    }

    #[test]
    fn init_callback_runs_once_per_thread() {
        let pool = EventLoopThreadPool::new("init-test", 2);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        pool.start(Some(Arc::new(move |_loop: &EventLoop| {
            counter.fetch_add(1, Ordering::SeqCst);
        })))
        .expect("start pool");

        thread::sleep(Duration::from_millis(100));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        pool.stop();
    }

    #[test]
    fn stop_joins_all_workers() {
        let pool = EventLoopThreadPool::new("join-test", 2);
        pool.start(None).expect("start pool");
        thread::sleep(Duration::from_millis(50));
        pool.stop();
        assert_eq!(pool.thread_count(), 0);
        // A second stop is a no-op.
        pool.stop();
    }
}
