//! StepFlow - Step Dependency Execution Engine
//!
//! Runs the steps of a multi-step processing pipeline in dependency order,
//! in parallel where allowed, and records every status change in a durable
//! ledger so an interrupted or partially failed run can be resumed without
//! redoing finished work.
//!
//! # Architecture
//!
//! - [`workflow`]: Step declarations, the dependency graph, the run ledger
//!   and YAML pipeline parsing
//! - [`execution`]: Execution engine, worker pool and step runners
//! - [`monitoring`]: Execution timeline
//! - [`error`]: Error types
//!
//! # Example
//!
//! ```rust,no_run
//! use stepflow::{load_pipeline, ExecutionEngine, RunLedger};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut graph = load_pipeline("pipeline.yaml")?;
//!
//!     let mut engine = ExecutionEngine::new(RunLedger::open(".stepflow/pipeline.ledger.jsonl")?);
//!     engine.set_working_dir("/data/analysis");
//!
//!     let result = engine.resume(&mut graph, 4)?;
//!     println!("{:?}", result);
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod execution;
pub mod monitoring;
pub mod workflow;

// Re-export commonly used types
pub use execution::engine::{CancelToken, EngineConfig, ExecutionEngine, RunResult};
pub use workflow::graph::DependencyGraph;
pub use workflow::ledger::RunLedger;
pub use workflow::model::{StepId, StepSpec, StepStatus};
pub use workflow::parser::load_pipeline;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "StepFlow";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_version() {
        assert!(!VERSION.is_empty());
        assert!(VERSION.contains('.'));
    }

    #[test]
    fn test_app_name() {
        assert_eq!(APP_NAME, "StepFlow");
    }

    #[test]
    fn test_module_exports_graph() {
        let mut graph = DependencyGraph::new();
        let id = graph.add_step(StepSpec::command("list", "ls")).unwrap();
        assert_eq!(id, StepId(1));
        assert_eq!(graph.status(id), Some(StepStatus::Pending));
    }

    #[test]
    fn test_module_exports_engine() {
        let mut graph = DependencyGraph::new();
        let mut engine = ExecutionEngine::new(RunLedger::in_memory());
        engine.set_dry_run(true);
        graph.add_step(StepSpec::command("list", "ls")).unwrap();
        assert_eq!(engine.run(&mut graph, 1).unwrap(), RunResult::Completed);
    }
}
