use crate::error::Error;

/// A fixed-capacity byte store with two cursors: `head` marks the first
/// valid byte, `len` counts the valid bytes after it.
///
/// Chunks are handed out by the [`MemoryPool`] and returned to it; they
/// are move-only (no `Clone`), so ownership of the backing store always
/// transfers with the value.
///
/// [`MemoryPool`]: super::MemoryPool
pub struct Chunk {
    data: Box<[u8]>,
    head: usize,
    len: usize,
}

impl Chunk {
    /// Allocates a zero-filled chunk of exactly `capacity` bytes.
    ///
    /// An allocator refusal is reported as a value instead of aborting.
    pub fn new(capacity: usize) -> Result<Self, Error> {
        let mut data = Vec::new();
        data.try_reserve_exact(capacity)
            .map_err(|_| Error::AllocationFailure(capacity))?;
        data.resize(capacity, 0);
        Ok(Self {
            data: data.into_boxed_slice(),
            head: 0,
            len: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn head(&self) -> usize {
        self.head
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The valid bytes, `data[head..head + len]`.
    pub fn valid(&self) -> &[u8] {
        &self.data[self.head..self.head + self.len]
    }

    /// Trailing space available for appends without moving data.
    pub fn spare_len(&self) -> usize {
        self.capacity() - self.head - self.len
    }

    /// The writable region after the valid bytes.
    pub fn tail_mut(&mut self) -> &mut [u8] {
        let start = self.head + self.len;
        &mut self.data[start..]
    }

    /// Marks `n` freshly written tail bytes as valid.
    pub fn advance(&mut self, n: usize) {
        debug_assert!(self.head + self.len + n <= self.capacity());
        self.len += n;
    }

    /// Appends `src` after the valid bytes. Callers must have checked
    /// `spare_len()` first.
    pub fn extend_from_slice(&mut self, src: &[u8]) {
        let start = self.head + self.len;
        self.data[start..start + src.len()].copy_from_slice(src);
        self.len += src.len();
    }

    /// Resets both cursors without touching the store.
    pub fn clear(&mut self) {
        self.head = 0;
        self.len = 0;
    }

    /// Discards the first `n` valid bytes. Popping everything (or more)
    /// resets both cursors.
    pub fn pop(&mut self, n: usize) {
        if n >= self.len {
            self.head = 0;
            self.len = 0;
        } else {
            self.head += n;
            self.len -= n;
        }
    }

    /// Compacts the valid bytes to offset 0. No-op when `head == 0`.
    pub fn adjust(&mut self) {
        if self.head != 0 {
            if self.len != 0 {
                self.data.copy_within(self.head..self.head + self.len, 0);
            }
            self.head = 0;
        }
    }

    /// Overwrites this chunk's contents with `other`'s valid bytes,
    /// expanding first when they do not fit. Returns `false` if the
    /// expansion fails, leaving this chunk untouched.
    pub fn copy(&mut self, other: &Chunk) -> bool {
        if other.len == 0 {
            self.len = 0;
            self.head = 0;
            return true;
        }
        if other.len > self.capacity() && !self.ensure_capacity(other.len) {
            return false;
        }
        self.data[..other.len].copy_from_slice(other.valid());
        self.head = 0;
        self.len = other.len;
        true
    }

    /// Guarantees `capacity() >= required`, expanding to
    /// `max(2 * capacity, required)` when short. Expansion copies the
    /// valid bytes to offset 0 of the new store; on allocation failure
    /// the chunk is left intact and `false` is returned.
    pub fn ensure_capacity(&mut self, required: usize) -> bool {
        if required <= self.capacity() {
            return true;
        }
        self.grow(required.max(self.capacity() * 2))
    }

    fn grow(&mut self, new_capacity: usize) -> bool {
        let mut data = Vec::new();
        if data.try_reserve_exact(new_capacity).is_err() {
            return false;
        }
        data.resize(new_capacity, 0);
        data[..self.len].copy_from_slice(&self.data[self.head..self.head + self.len]);
        self.data = data.into_boxed_slice();
        self.head = 0;
        true
    }
}
