//! Step Execution Module
//!
//! Runs a dependency graph to completion with bounded parallelism.
//!
//! # Architecture
//!
//! - [`engine`]: Dispatch loop, failure propagation and resume
//! - [`pool`]: Bounded worker threads with a completion channel
//! - [`step`]: Running a single step action

pub mod engine;
pub mod pool;
pub mod step;

pub use engine::{CancelToken, EngineConfig, ExecutionEngine, RunResult, DEFAULT_CONCURRENCY};
