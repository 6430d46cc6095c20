//! Idle-connection timeout management over a hashed time wheel.

pub mod timeout;

pub use timeout::{TimeoutCallback, TimeoutManager};
