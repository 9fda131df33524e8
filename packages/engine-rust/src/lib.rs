//! Bulkops engine: concurrency-limited batch dispatch with progress
//! tracking, cooperative cancellation, and time-boxed undo.

pub mod config;
pub mod dispatch;
pub mod domain;
pub mod engine;
pub mod jobs;
pub mod logging;
pub mod progress;
pub mod undo;

pub use config::EngineConfig;
pub use dispatch::{HandlerContext, HandlerRouter, OperationHandler};
pub use engine::{BatchEngine, BatchExecutionError, LogNotifier};
pub use jobs::{Job, JobError, JobRegistry, JobStatus};
pub use logging::{init_tracing, LogFormat};
pub use progress::ProgressTracker;
pub use undo::{UndoContext, UndoError, UndoStore};

#[cfg(test)]
mod tests {
    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }
}
