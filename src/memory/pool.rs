//! Process-wide slab pool of fixed-size [`Chunk`]s.
//!
//! The pool keeps a free list per size class. Allocation picks the
//! smallest class that fits the request, popping from the free list
//! when possible and allocating a fresh chunk otherwise, subject to a
//! byte cap across everything currently handed out. Returned chunks go
//! back on their class's free list; chunks of a capacity the pool does
//! not manage are simply dropped.

use std::sync::OnceLock;

use parking_lot::Mutex;
use tracing::error;

use crate::error::Error;
use crate::memory::chunk::Chunk;

/// The chunk capacities the pool manages, ascending.
pub const MEM_SIZES: [usize; 6] = [
    4096,
    4096 * 4,
    4096 * 16,
    4096 * 64,
    4096 * 256,
    4096 * 1024,
];

/// Chunks preallocated per size class at first use.
const PREALLOC_COUNTS: [usize; 6] = [200, 50, 20, 10, 5, 2];

const DEFAULT_MAX_CAPACITY: usize = 128 * 1024 * 1024;

/// Point-in-time usage counters, returned by value.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub total_allocations: u64,
    pub total_deallocations: u64,
    pub peak_usage_bytes: usize,
    pub current_usage_bytes: usize,
    pub allocation_failures: u64,
}

struct PoolInner {
    free: [Vec<Chunk>; 6],
    max_capacity_bytes: usize,
    current_usage_bytes: usize,
    preallocated_bytes: usize,
    stats: PoolStats,
}

impl PoolInner {
    fn note_alloc(&mut self, class_size: usize) {
        self.current_usage_bytes += class_size;
        self.stats.total_allocations += 1;
        self.stats.current_usage_bytes = self.current_usage_bytes;
        if self.current_usage_bytes > self.stats.peak_usage_bytes {
            self.stats.peak_usage_bytes = self.current_usage_bytes;
        }
    }
}

/// Slab memory pool; obtain the process-wide instance via
/// [`MemoryPool::instance`].
pub struct MemoryPool {
    inner: Mutex<PoolInner>,
}

static POOL: OnceLock<MemoryPool> = OnceLock::new();

fn class_index(capacity: usize) -> Option<usize> {
    MEM_SIZES.iter().position(|&s| s == capacity)
}

/// Smallest size class that satisfies `requested`.
fn find_suitable_class(requested: usize) -> Option<usize> {
    MEM_SIZES.iter().position(|&s| requested <= s)
}

impl MemoryPool {
    /// The process-wide pool, preallocated on first use.
    pub fn instance() -> &'static MemoryPool {
        POOL.get_or_init(MemoryPool::new)
    }

    fn new() -> Self {
        let pool = Self {
            inner: Mutex::new(PoolInner {
                free: std::array::from_fn(|_| Vec::new()),
                max_capacity_bytes: DEFAULT_MAX_CAPACITY,
                current_usage_bytes: 0,
                preallocated_bytes: 0,
                stats: PoolStats::default(),
            }),
        };
        for (class, &count) in PREALLOC_COUNTS.iter().enumerate() {
            pool.preallocate(MEM_SIZES[class], count);
        }
        pool
    }

    /// Allocates `count` chunks of `chunk_size` outside the lock and
    /// splices them into the free list under it.
    fn preallocate(&self, chunk_size: usize, count: usize) {
        let Some(class) = class_index(chunk_size) else {
            return;
        };
        let mut batch = Vec::with_capacity(count);
        for _ in 0..count {
            match Chunk::new(chunk_size) {
                Ok(chunk) => batch.push(chunk),
                Err(err) => {
                    error!(chunk_size, ?err, "preallocation aborted");
                    break;
                }
            }
        }
        let total = chunk_size * batch.len();
        let mut inner = self.inner.lock();
        if inner.preallocated_bytes + total > inner.max_capacity_bytes {
            error!(chunk_size, "preallocation would exceed pool capacity");
            return;
        }
        inner.preallocated_bytes += total;
        inner.free[class].append(&mut batch);
    }

    /// Hands out a chunk whose capacity is the smallest size class that
    /// fits `n` bytes.
    ///
    /// The fast path pops the class's free list. When the list is empty
    /// a fresh chunk is allocated outside the lock, with the capacity
    /// cap checked both before releasing the lock and again after
    /// re-acquiring it.
    pub fn alloc_chunk(&self, n: usize) -> Result<Chunk, Error> {
        if n == 0 {
            self.inner.lock().stats.allocation_failures += 1;
            return Err(Error::AllocationFailure(0));
        }
        let Some(class) = find_suitable_class(n) else {
            let mut inner = self.inner.lock();
            inner.stats.allocation_failures += 1;
            return Err(Error::PoolExhausted {
                requested: n,
                in_use: inner.current_usage_bytes,
                cap: inner.max_capacity_bytes,
            });
        };
        let class_size = MEM_SIZES[class];

        {
            let mut inner = self.inner.lock();
            if let Some(chunk) = inner.free[class].pop() {
                inner.note_alloc(class_size);
                return Ok(chunk);
            }
            if inner.current_usage_bytes + class_size > inner.max_capacity_bytes {
                inner.stats.allocation_failures += 1;
                return Err(Error::PoolExhausted {
                    requested: n,
                    in_use: inner.current_usage_bytes,
                    cap: inner.max_capacity_bytes,
                });
            }
        }

        let chunk = match Chunk::new(class_size) {
            Ok(chunk) => chunk,
            Err(err) => {
                self.inner.lock().stats.allocation_failures += 1;
                return Err(err);
            }
        };

        // The lock was released for the allocation; re-check the cap.
        let mut inner = self.inner.lock();
        if inner.current_usage_bytes + class_size > inner.max_capacity_bytes {
            inner.stats.allocation_failures += 1;
            return Err(Error::PoolExhausted {
                requested: n,
                in_use: inner.current_usage_bytes,
                cap: inner.max_capacity_bytes,
            });
        }
        inner.note_alloc(class_size);
        Ok(chunk)
    }

    /// Returns a chunk to its free list.
    ///
    /// A chunk whose capacity is not one of [`MEM_SIZES`] (a buffer
    /// that outgrew its class) is released to the OS without touching
    /// the counters.
    pub fn retrieve(&self, mut chunk: Chunk) {
        let Some(class) = class_index(chunk.capacity()) else {
            return;
        };
        let class_size = chunk.capacity();
        chunk.clear();

        let mut inner = self.inner.lock();
        inner.free[class].push(chunk);
        inner.current_usage_bytes = inner.current_usage_bytes.saturating_sub(class_size);
        inner.stats.current_usage_bytes = inner.current_usage_bytes;
        inner.stats.total_deallocations += 1;
    }

    pub fn set_max_capacity(&self, max_bytes: usize) {
        self.inner.lock().max_capacity_bytes = max_bytes;
    }

    pub fn get_current_usage(&self) -> usize {
        self.inner.lock().current_usage_bytes
    }

    pub fn get_max_capacity(&self) -> usize {
        self.inner.lock().max_capacity_bytes
    }

    pub fn get_stats(&self) -> PoolStats {
        self.inner.lock().stats
    }

    /// Frees every free list and resets counters and statistics.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        for list in inner.free.iter_mut() {
            list.clear();
        }
        inner.current_usage_bytes = 0;
        inner.preallocated_bytes = 0;
        inner.stats = PoolStats::default();
    }
}
