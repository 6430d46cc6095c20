//! Directional byte buffers backed by pooled chunks.
//!
//! Each buffer owns at most one [`Chunk`] from the [`MemoryPool`] and
//! releases it back as soon as it drains, so an idle connection holds
//! no buffer memory at all. [`InputBuffer`] accumulates bytes read from
//! a descriptor and may carry a nonzero head after partial consumption;
//! [`OutputBuffer`] keeps its data contiguous from offset 0 and feeds a
//! descriptor one write at a time.

use std::io;
use std::os::unix::io::RawFd;

use crate::error::Error;
use crate::memory::chunk::Chunk;
use crate::memory::pool::MemoryPool;

/// Minimum trailing space guaranteed before a read, and the initial
/// allocation size.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Upper bound on bytes consumed from a descriptor per syscall.
const MAX_READ_PER_CALL: usize = 64 * 1024;

/// Upper bound for a single expand or write request.
const MAX_ALLOWED_SIZE: usize = 1024 * 1024;

fn release(chunk: &mut Option<Chunk>) {
    if let Some(chunk) = chunk.take() {
        MemoryPool::instance().retrieve(chunk);
    }
}

/// Read side of a connection: bytes arrive via [`read_from_fd`] and are
/// consumed by the application through [`get_from_buf`] and [`pop`].
///
/// [`read_from_fd`]: InputBuffer::read_from_fd
/// [`get_from_buf`]: InputBuffer::get_from_buf
/// [`pop`]: InputBuffer::pop
#[derive(Default)]
pub struct InputBuffer {
    chunk: Option<Chunk>,
}

impl InputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of valid bytes buffered.
    pub fn length(&self) -> usize {
        self.chunk.as_ref().map_or(0, Chunk::len)
    }

    /// The valid bytes. Empty when nothing is buffered.
    pub fn get_from_buf(&self) -> &[u8] {
        self.chunk.as_ref().map(Chunk::valid).unwrap_or(&[])
    }

    /// Discards the first `n` buffered bytes, releasing the backing
    /// chunk to the pool once the buffer drains.
    pub fn pop(&mut self, n: usize) -> Result<(), Error> {
        let Some(chunk) = self.chunk.as_mut() else {
            return Err(Error::PopOverflow {
                requested: n,
                available: 0,
            });
        };
        if n > chunk.len() {
            return Err(Error::PopOverflow {
                requested: n,
                available: chunk.len(),
            });
        }
        chunk.pop(n);
        if chunk.is_empty() {
            release(&mut self.chunk);
        }
        Ok(())
    }

    /// Releases the backing chunk, discarding any buffered bytes.
    pub fn clear(&mut self) {
        release(&mut self.chunk);
    }

    /// Compacts buffered bytes to offset 0.
    pub fn adjust(&mut self) {
        if let Some(chunk) = self.chunk.as_mut() {
            chunk.adjust();
        }
    }

    /// Reads once from `fd` into the trailing space.
    ///
    /// At least [`DEFAULT_BUFFER_SIZE`] bytes of space are arranged
    /// first (compacting a consumed prefix when present), and at most
    /// 64 KiB is requested per call. Interrupted reads are retried;
    /// would-block reads report `Ok(0)`, indistinguishable from EOF.
    /// Callers only invoke this on a readable descriptor.
    pub fn read_from_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        if !self.ensure_space(DEFAULT_BUFFER_SIZE) {
            return Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "input buffer expansion failed",
            ));
        }
        let Some(chunk) = self.chunk.as_mut() else {
            return Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "input buffer unallocated",
            ));
        };

        let to_read = chunk.spare_len().min(MAX_READ_PER_CALL);
        // Raw pointer into the tail; the backing store does not move
        // between here and `advance`.
        let tail = chunk.tail_mut().as_mut_ptr();
        loop {
            let n = unsafe { libc::read(fd, tail.cast(), to_read) };
            if n >= 0 {
                chunk.advance(n as usize);
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(e) if e == libc::EAGAIN || e == libc::EWOULDBLOCK => return Ok(0),
                _ => return Err(err),
            }
        }
    }

    /// Arranges at least `additional` bytes of trailing space, within
    /// the 1 MiB per-request bound.
    fn ensure_space(&mut self, additional: usize) -> bool {
        if additional == 0 || additional > MAX_ALLOWED_SIZE {
            return false;
        }
        let Some(chunk) = self.chunk.as_mut() else {
            let size = additional.max(DEFAULT_BUFFER_SIZE);
            match MemoryPool::instance().alloc_chunk(size) {
                Ok(chunk) => {
                    self.chunk = Some(chunk);
                    return true;
                }
                Err(_) => return false,
            }
        };

        if chunk.head() != 0 {
            chunk.adjust();
        }
        if chunk.spare_len() >= additional {
            return true;
        }

        let needed = additional - chunk.spare_len();
        let new_size = chunk.len() + needed;
        self.expand(new_size)
    }

    /// Swaps the backing chunk for a larger one from the pool, carrying
    /// the valid bytes over.
    fn expand(&mut self, new_size: usize) -> bool {
        let Some(old) = self.chunk.as_ref() else {
            return false;
        };
        let Ok(mut grown) = MemoryPool::instance().alloc_chunk(new_size) else {
            return false;
        };
        if !grown.copy(old) {
            MemoryPool::instance().retrieve(grown);
            return false;
        }
        release(&mut self.chunk);
        self.chunk = Some(grown);
        true
    }
}

impl Drop for InputBuffer {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Write side of a connection: bytes queue up via [`write_to_buf`] and
/// drain to the descriptor via [`write_to_fd`]. The head stays at 0;
/// writes are contiguous from the start of the chunk.
///
/// [`write_to_buf`]: OutputBuffer::write_to_buf
/// [`write_to_fd`]: OutputBuffer::write_to_fd
#[derive(Default)]
pub struct OutputBuffer {
    chunk: Option<Chunk>,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn length(&self) -> usize {
        self.chunk.as_ref().map_or(0, Chunk::len)
    }

    /// The queued bytes awaiting a writable descriptor.
    pub fn pending(&self) -> &[u8] {
        self.chunk.as_ref().map(Chunk::valid).unwrap_or(&[])
    }

    /// Trailing space the current chunk could take without growing.
    pub fn available_space(&self) -> usize {
        self.chunk
            .as_ref()
            .map_or(DEFAULT_BUFFER_SIZE, Chunk::spare_len)
    }

    pub fn pop(&mut self, n: usize) -> Result<(), Error> {
        let Some(chunk) = self.chunk.as_mut() else {
            return Err(Error::PopOverflow {
                requested: n,
                available: 0,
            });
        };
        if n > chunk.len() {
            return Err(Error::PopOverflow {
                requested: n,
                available: chunk.len(),
            });
        }
        chunk.pop(n);
        if chunk.is_empty() {
            release(&mut self.chunk);
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        release(&mut self.chunk);
    }

    /// Appends `data`, growing the backing chunk as needed. The buffer
    /// never grows past 1 MiB; a request that would is refused and the
    /// buffer left untouched.
    pub fn write_to_buf(&mut self, data: &[u8]) -> bool {
        if data.is_empty() {
            return true;
        }
        if data.len() > MAX_ALLOWED_SIZE || !self.ensure_capacity(data.len()) {
            return false;
        }
        let Some(chunk) = self.chunk.as_mut() else {
            return false;
        };
        chunk.extend_from_slice(data);
        true
    }

    /// Writes the queued bytes to `fd` with a single syscall, popping
    /// the written prefix. Interrupted writes are retried; would-block
    /// reports `Ok(0)` so the caller keeps write interest armed.
    pub fn write_to_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let Some(chunk) = self.chunk.as_mut() else {
            return Ok(0);
        };
        if chunk.is_empty() {
            return Ok(0);
        }
        debug_assert_eq!(chunk.head(), 0);

        let pending = chunk.valid();
        let written = loop {
            let n = unsafe { libc::write(fd, pending.as_ptr().cast(), pending.len()) };
            if n >= 0 {
                break n as usize;
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(e) if e == libc::EAGAIN || e == libc::EWOULDBLOCK => return Ok(0),
                _ => return Err(err),
            }
        };

        chunk.pop(written);
        if chunk.is_empty() {
            release(&mut self.chunk);
        }
        Ok(written)
    }

    fn ensure_capacity(&mut self, additional: usize) -> bool {
        let Some(chunk) = self.chunk.as_mut() else {
            let size = additional.max(DEFAULT_BUFFER_SIZE);
            match MemoryPool::instance().alloc_chunk(size) {
                Ok(chunk) => {
                    self.chunk = Some(chunk);
                    return true;
                }
                Err(_) => return false,
            }
        };

        if chunk.head() != 0 {
            chunk.adjust();
        }
        if chunk.spare_len() >= additional {
            return true;
        }

        let new_size = chunk.len() + additional;
        if new_size > MAX_ALLOWED_SIZE {
            return false;
        }
        let Ok(mut grown) = MemoryPool::instance().alloc_chunk(new_size) else {
            return false;
        };
        if !grown.copy(chunk) {
            MemoryPool::instance().retrieve(grown);
            return false;
        }
        release(&mut self.chunk);
        self.chunk = Some(grown);
        true
    }
}

impl Drop for OutputBuffer {
    fn drop(&mut self) {
        self.clear();
    }
}
