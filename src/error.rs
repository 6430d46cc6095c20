//! Error taxonomy for the crate.
//!
//! Setup-time failures (bad constructor arguments, socket/bind/listen
//! errors) surface as [`Error`] values from constructors and `start`.
//! Per-event IO failures never reach this type: they are handled on the
//! owning loop by closing the affected connection.

use std::io;

use thiserror::Error;

/// Errors reported by fallible construction and startup paths.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid constructor arguments (zero port, unparsable address).
    #[error("invalid configuration: {0}")]
    Configuration(&'static str),

    /// A system call failed during setup.
    #[error("{op} failed: {source}")]
    Syscall {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// The OS allocator refused a request.
    #[error("allocation of {0} bytes failed")]
    AllocationFailure(usize),

    /// Satisfying the request would exceed the pool capacity cap.
    #[error("memory pool exhausted: {requested} bytes requested, {in_use} in use, cap {cap}")]
    PoolExhausted {
        requested: usize,
        in_use: usize,
        cap: usize,
    },

    /// A pop asked for more bytes than the buffer holds.
    #[error("pop of {requested} bytes exceeds buffer length {available}")]
    PopOverflow { requested: usize, available: usize },
}

pub type Result<T> = std::result::Result<T, Error>;
