//! Step Data Model
//!
//! Core data structures describing one unit of pipeline work.
//!
//! A step is declared with a [`StepSpec`] builder and becomes a
//! [`StepRecord`] once registered in a
//! [`DependencyGraph`](super::graph::DependencyGraph), which assigns its id.
//!
//! ```
//! use stepflow::workflow::{DependencyGraph, StepSpec};
//!
//! let mut graph = DependencyGraph::new();
//! let convert = graph
//!     .add_step(
//!         StepSpec::command("convert", "xmipp_image_convert")
//!             .args(["-i", "raw.stk", "-o", "images.mrcs"])
//!             .produces("images.mrcs"),
//!     )
//!     .unwrap();
//! let sort = graph
//!     .add_step(
//!         StepSpec::command("sort", "xmipp_image_sort_by_statistics")
//!             .args(["-i", "images.mrcs"])
//!             .env("OMP_NUM_THREADS", "4")
//!             .after(convert),
//!     )
//!     .unwrap();
//! assert!(graph.get(sort).unwrap().prerequisites.contains(&convert));
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{BoxError, StepError};

/// Identifier of a step, assigned from 1 in insertion order.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct StepId(pub usize);

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a step.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepStatus {
    /// Waiting for prerequisites
    Pending,
    /// Prerequisites satisfied, waiting for a worker slot
    Ready,
    /// Handed to a worker
    Running,
    /// Finished and produced its artifacts
    Done,
    /// Action failed or artifacts were missing
    Failed,
    /// Never run because an ancestor failed or the run was cancelled
    Skipped,
}

impl StepStatus {
    /// Returns true for statuses a run will not change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Skipped)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Which kind of body a step runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    InProcessCall,
    ExternalCommand,
}

/// Callable executed by an in-process step.
pub type StepFunction = Arc<dyn Fn(&[Value]) -> Result<(), BoxError> + Send + Sync>;

/// An external program invocation.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct CommandSpec {
    /// Program to execute (resolved through PATH when not absolute)
    pub program: String,

    #[serde(default)]
    pub args: Vec<String>,

    /// Variables merged over the ambient environment
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Directory to run in; the engine's working directory when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
}

impl CommandSpec {
    /// Renders the command line for logs.
    pub fn display_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// The work a step performs.
#[derive(Clone)]
pub enum StepAction {
    InProcessCall {
        function: StepFunction,
        args: Vec<Value>,
    },
    ExternalCommand(CommandSpec),
}

impl StepAction {
    pub fn kind(&self) -> StepKind {
        match self {
            Self::InProcessCall { .. } => StepKind::InProcessCall,
            Self::ExternalCommand(_) => StepKind::ExternalCommand,
        }
    }
}

impl fmt::Debug for StepAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InProcessCall { args, .. } => f
                .debug_struct("InProcessCall")
                .field("args", args)
                .finish_non_exhaustive(),
            Self::ExternalCommand(cmd) => f.debug_tuple("ExternalCommand").field(cmd).finish(),
        }
    }
}

/// Declaration of a step before it is registered in a graph.
#[derive(Debug, Clone)]
pub struct StepSpec {
    pub name: String,
    pub action: StepAction,
    pub prerequisites: BTreeSet<StepId>,
    pub expected_artifacts: Vec<PathBuf>,
    pub parallel_allowed: bool,
    pub timeout: Option<Duration>,
}

impl StepSpec {
    fn with_action(name: impl Into<String>, action: StepAction) -> Self {
        Self {
            name: name.into().trim().to_string(),
            action,
            prerequisites: BTreeSet::new(),
            expected_artifacts: Vec::new(),
            parallel_allowed: true,
            timeout: None,
        }
    }

    /// Declares an in-process call with no arguments.
    pub fn function<F>(name: impl Into<String>, function: F) -> Self
    where
        F: Fn(&[Value]) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        Self::with_action(
            name,
            StepAction::InProcessCall {
                function: Arc::new(function),
                args: Vec::new(),
            },
        )
    }

    /// Declares an external program invocation.
    pub fn command(name: impl Into<String>, program: impl Into<String>) -> Self {
        Self::with_action(
            name,
            StepAction::ExternalCommand(CommandSpec {
                program: program.into(),
                ..CommandSpec::default()
            }),
        )
    }

    /// Declares an external invocation from a prepared command.
    pub fn from_command(name: impl Into<String>, command: CommandSpec) -> Self {
        Self::with_action(name, StepAction::ExternalCommand(command))
    }

    /// Sets the arguments passed to an in-process call.
    ///
    /// Ignored for external commands; use [`StepSpec::arg`] there.
    pub fn with_args(mut self, values: Vec<Value>) -> Self {
        if let StepAction::InProcessCall { args, .. } = &mut self.action {
            *args = values;
        }
        self
    }

    /// Appends one command-line argument.
    pub fn arg(mut self, value: impl Into<String>) -> Self {
        if let StepAction::ExternalCommand(cmd) = &mut self.action {
            cmd.args.push(value.into());
        }
        self
    }

    /// Appends command-line arguments.
    pub fn args<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let StepAction::ExternalCommand(cmd) = &mut self.action {
            cmd.args.extend(values.into_iter().map(Into::into));
        }
        self
    }

    /// Adds an environment variable to the command's overlay.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        if let StepAction::ExternalCommand(cmd) = &mut self.action {
            cmd.env.insert(key.into(), value.into());
        }
        self
    }

    /// Runs the command in a specific directory.
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        if let StepAction::ExternalCommand(cmd) = &mut self.action {
            cmd.working_dir = Some(dir.into());
        }
        self
    }

    /// Adds a prerequisite step.
    pub fn after(mut self, id: StepId) -> Self {
        self.prerequisites.insert(id);
        self
    }

    /// Adds several prerequisite steps.
    pub fn after_all(mut self, ids: impl IntoIterator<Item = StepId>) -> Self {
        self.prerequisites.extend(ids);
        self
    }

    /// Declares a file the step must produce.
    pub fn produces(mut self, path: impl Into<PathBuf>) -> Self {
        self.expected_artifacts.push(path.into());
        self
    }

    /// Forces the step to run alone.
    pub fn serial(mut self) -> Self {
        self.parallel_allowed = false;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A registered step, owned by its graph.
#[derive(Debug, Clone)]
pub struct StepRecord {
    pub id: StepId,
    pub name: String,
    pub action: StepAction,
    pub prerequisites: BTreeSet<StepId>,
    pub expected_artifacts: Vec<PathBuf>,
    pub parallel_allowed: bool,
    pub timeout: Option<Duration>,
    pub(crate) status: StepStatus,
    pub(crate) failure: Option<StepError>,
}

impl StepRecord {
    pub(crate) fn from_spec(id: StepId, spec: StepSpec) -> Self {
        Self {
            id,
            name: spec.name,
            action: spec.action,
            prerequisites: spec.prerequisites,
            expected_artifacts: spec.expected_artifacts,
            parallel_allowed: spec.parallel_allowed,
            timeout: spec.timeout,
            status: StepStatus::Pending,
            failure: None,
        }
    }

    pub fn kind(&self) -> StepKind {
        self.action.kind()
    }

    pub fn status(&self) -> StepStatus {
        self.status
    }

    /// The reason this step failed in the current run, if it did.
    pub fn failure(&self) -> Option<&StepError> {
        self.failure.as_ref()
    }

    /// Returns the declared artifacts that do not exist.
    ///
    /// Relative paths are resolved against `base` when given.
    pub fn missing_artifacts(&self, base: Option<&Path>) -> Vec<PathBuf> {
        self.expected_artifacts
            .iter()
            .filter(|path| !resolve_path(path, base).exists())
            .cloned()
            .collect()
    }

    /// Checks that every declared artifact exists.
    pub fn artifacts_exist(&self, base: Option<&Path>) -> bool {
        self.missing_artifacts(base).is_empty()
    }
}

/// Resolves a possibly relative path against an optional base directory.
pub fn resolve_path(path: &Path, base: Option<&Path>) -> PathBuf {
    match base {
        Some(dir) if path.is_relative() => dir.join(path),
        _ => path.to_path_buf(),
    }
}
