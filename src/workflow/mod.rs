//! Step Declaration Module
//!
//! Data structures for declaring steps and their prerequisites, and the
//! durable ledger of their status transitions.
//!
//! # Structure
//!
//! - [`model`]: Core data structures (StepSpec, StepRecord, StepAction)
//! - [`graph`]: The dependency graph and its status rules
//! - [`ledger`]: JSON Lines run ledger used for resume
//! - [`parser`]: YAML pipeline loading

pub mod graph;
pub mod ledger;
pub mod model;
pub mod parser;

pub use graph::DependencyGraph;
pub use ledger::{LedgerEntry, RunLedger};
pub use model::{CommandSpec, StepAction, StepId, StepKind, StepRecord, StepSpec, StepStatus};
pub use parser::{load_pipeline, parse_pipeline};
