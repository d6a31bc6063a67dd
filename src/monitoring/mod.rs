//! Run Monitoring Module
//!
//! Tracks the execution timeline of a run: dispatch order, step
//! durations and peak concurrency.

pub mod timeline;

pub use timeline::{EventType, ExecutionTimeline, TimelineEvent};
