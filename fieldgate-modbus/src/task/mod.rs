//! Per-device poll tasks and the pool that routes control commands to them.

pub mod pool;
pub mod processor;

#[cfg(test)]
pub(crate) mod mock;

pub use pool::{CallbackSet, TaskPool};
pub use processor::{ProcessorState, RetryPolicy, TaskProcessor};
