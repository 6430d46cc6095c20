//! TCP server components.
//!
//! - [`acceptor`]: [`Acceptor`] owns the listening socket and shards
//!   new connections across the IO loops
//! - [`connection`]: [`TcpConnection`] drives one connection's
//!   state machine on its assigned loop
//! - [`server`]: [`TcpServer`] composes the listener, the loop pool,
//!   the connection registry, and the idle-timeout manager
//! - [`socket`]: raw IPv4 socket helpers
//!
//! [`Acceptor`]: acceptor::Acceptor
//! [`TcpConnection`]: connection::TcpConnection
//! [`TcpServer`]: server::TcpServer

pub mod acceptor;
pub mod connection;
pub mod server;
pub(crate) mod socket;

pub use acceptor::Acceptor;
pub use connection::{State, TcpConnection};
pub use server::TcpServer;
