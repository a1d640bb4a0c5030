//! Worker side of the CI: claiming queued jobs and running them.
//!
//! # Components
//!
//! - [`JobClaimer`]: takes exclusive ownership of a queued job with a
//!   conditional write on the record's version tag
//! - [`JobRunner`]: runs the job's command in a sandbox with a hard timeout,
//!   uploading output in batches and publishing the terminal status
//! - [`log_buffer`]: per-stream batching between uploads
//!
//! # Execution Flow
//!
//! 1. [`JobClaimer::claim`] wins the record and removes it from the queue
//! 2. [`JobRunner::run`] resets the logs and publishes `started`
//! 3. Output is drained from both pipes concurrently and uploaded every flush interval
//! 4. Exit, failure or timeout is published exactly once as the terminal status

pub mod claimer;
pub mod log_buffer;
pub mod runner;

pub use claimer::JobClaimer;
pub use runner::{JobRunner, RunOutcome};
