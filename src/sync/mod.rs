//! Synchronization primitives shared between the I/O event loop and
//! application threads.

mod queue;

pub use queue::*;
