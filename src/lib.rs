//! Multi-reactor event-driven TCP server framework.
//!
//! This crate provides a reusable TCP networking foundation: a server
//! accepts connections on a listening endpoint, shards them across a
//! pool of IO worker threads, and drives per-connection read/write
//! state machines over epoll readiness notifications. Buffer memory
//! comes from a process-wide slab pool, and a hashed time wheel evicts
//! idle connections.
//!
//! # Architecture
//!
//! - **EventLoop**: single-thread reactor combining readiness polling,
//!   a cross-thread task queue, and eventfd wakeup
//! - **Channel**: binds one fd, an interest mask, and an event callback
//!   to a loop
//! - **EventLoopThreadPool**: fixed set of loops on owned threads,
//!   round-robin dispatch
//! - **Acceptor**: listening socket plus accept loop on the base loop
//! - **TcpConnection**: per-connection state machine with pooled
//!   input/output buffers
//! - **TcpServer**: composition root, connection registry, and user
//!   callback surface
//! - **MemoryPool / Chunk**: slab free lists across fixed size classes
//! - **TimeoutManager**: hashed time wheel over connection idle
//!   deadlines
//!
//! # Example
//!
//! ```ignore
//! use evnet::{EventLoop, TcpServer};
//!
//! let base_loop = EventLoop::new()?;
//! let server = TcpServer::new(base_loop.clone(), "127.0.0.1", 8080, 4, "echo")?;
//! server.set_message_callback(|conn, buf| {
//!     let bytes = buf.get_from_buf().to_vec();
//!     buf.pop(bytes.len()).ok();
//!     conn.send(&bytes);
//! });
//! server.start()?;
//! base_loop.run();
//! ```

pub mod error;
pub mod memory;
pub mod net;
pub mod reactor;
pub mod time;

pub use error::{Error, Result};
pub use memory::{Chunk, InputBuffer, MemoryPool, OutputBuffer, PoolStats};
pub use net::{State, TcpConnection, TcpServer};
pub use reactor::{Channel, EventLoop, EventLoopThreadPool};
pub use time::TimeoutManager;
