//! Worker execution engine for running buckets.
//!
//! - [`TaskRunner`]: runs one build task as a subprocess and tails its output
//!   into the bucket's log fragments
//! - [`TaskPipeline`]: runs the before-all, before-bucket, bucket and
//!   after-bucket tasks of a bucket and records the outcome
//! - [`BuildTool`]: turns a task name into a command line
//!
//! # Execution Flow
//!
//! 1. The worker loop receives a bucket id from the leader
//! 2. [`TaskPipeline::perform`] updates the checkout and walks the task groups
//! 3. Each task is spawned through [`TaskRunner::run`] with the storage
//!    connection released
//! 4. Logs are folded into the bucket, which ends `done` or `failed`

pub mod command;
pub mod pipeline;
pub mod runner;

pub use command::BuildTool;
pub use pipeline::{PipelineMemo, TaskPipeline};
pub use runner::{BucketLogSink, LogSink, TaskOutcome, TaskRunner, Termination};
