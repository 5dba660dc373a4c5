//! Synchronization primitives for in-process communication.
//!
//! Every work queue in the engine (resolve, process, send, terminate and
//! statistics) is a [`BoundedQueue`].

pub mod queue;

pub use queue::{BoundedQueue, Closed, Timeout};
