//! Bounded-concurrency pipeline over asynchronous streams.

mod engine;
mod stream;

pub use engine::{FailMode, ParallelMonitor, ParallelizeOption};
pub use stream::{AsyncStream, ExecutionStatus, StreamedValue};

#[cfg(test)]
pub use stream::ExecutionOutcome;
