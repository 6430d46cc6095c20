//! Pooled buffer memory: fixed-capacity chunks, the slab pool that
//! recycles them, and the directional buffers connections read and
//! write through.

pub mod buffer;
pub mod chunk;
pub mod pool;

pub use buffer::{InputBuffer, OutputBuffer, DEFAULT_BUFFER_SIZE};
pub use chunk::Chunk;
pub use pool::{MemoryPool, PoolStats, MEM_SIZES};
