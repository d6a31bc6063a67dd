//! Pipeline Parser
//!
//! Loads YAML pipeline definitions into a [`DependencyGraph`] of
//! external-command steps.
//!
//! ```yaml
//! steps:
//!   - name: copyImages
//!     program: cp
//!     args: [raw.stk, images.stk]
//!     produces: images.stk
//!   - name: fourierFilter
//!     program: xmipp_fourier_filter
//!     args: ["-i", images.stk, "--sampling", 1.5]
//!     after: copyImages
//!     parallel: false
//!     timeout_secs: 600
//! ```
//!
//! `after` may name steps declared later in the file; references are
//! resolved once every step is registered.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info};
use serde::de::{self, Deserializer};
use serde::Deserialize;
use serde_json::Value;

use crate::error::ParseError;

use super::graph::DependencyGraph;
use super::model::{StepId, StepSpec};

#[derive(Debug, Deserialize)]
struct PipelineFile {
    #[serde(default)]
    steps: Vec<StepDefinition>,
}

/// One step as written in a pipeline file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepDefinition {
    pub name: String,
    pub program: String,

    /// Numbers and booleans are accepted and passed through as text
    #[serde(deserialize_with = "scalar_list", default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Names of prerequisite steps
    #[serde(deserialize_with = "single_or_vec", default)]
    pub after: Vec<String>,

    #[serde(deserialize_with = "single_or_vec", default)]
    pub produces: Vec<String>,

    #[serde(default = "default_parallel")]
    pub parallel: bool,

    #[serde(default)]
    pub timeout_secs: Option<u64>,

    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

fn default_parallel() -> bool {
    true
}

/// Deserializes either a single string or array of strings into Vec<String>
fn single_or_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    match val {
        Value::Null => Ok(Vec::new()),
        Value::String(s) if s.trim().is_empty() => Ok(Vec::new()),
        Value::String(s) => Ok(vec![s.trim().to_string()]),
        Value::Array(arr) => arr
            .into_iter()
            .map(|v| match v {
                Value::String(s) => Ok(s.trim().to_string()),
                _ => Err(de::Error::custom("Expected string in array")),
            })
            .collect(),
        _ => Err(de::Error::custom("Expected string or array of strings")),
    }
}

fn scalar_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    let items = match val {
        Value::Null => return Ok(Vec::new()),
        Value::Array(arr) => arr,
        other => vec![other],
    };
    items
        .into_iter()
        .map(|v| match v {
            Value::String(s) => Ok(s),
            Value::Number(n) => Ok(n.to_string()),
            Value::Bool(b) => Ok(b.to_string()),
            _ => Err(de::Error::custom("Expected scalar argument")),
        })
        .collect()
}

/// Loads a pipeline from a YAML file.
///
/// # Example
///
/// ```rust,no_run
/// use stepflow::workflow::load_pipeline;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let graph = load_pipeline("pipeline.yaml")?;
///     println!("Loaded {} steps", graph.len());
///     Ok(())
/// }
/// ```
pub fn load_pipeline(path: impl AsRef<Path>) -> Result<DependencyGraph, ParseError> {
    let path = path.as_ref();
    info!("Loading pipeline from: {}", path.display());

    let content = fs::read_to_string(path).map_err(|source| ParseError::Read {
        path: path.display().to_string(),
        source,
    })?;
    debug!("YAML content loaded ({} bytes)", content.len());

    parse_pipeline(&content)
}

/// Parses pipeline YAML into a dependency graph.
///
/// Steps get ids in file order. Fails on an empty pipeline, duplicate
/// names, empty programs, unknown `after` references, and cycles.
pub fn parse_pipeline(yaml: &str) -> Result<DependencyGraph, ParseError> {
    let pipeline: PipelineFile = serde_yaml::from_str(yaml)?;
    if pipeline.steps.is_empty() {
        return Err(ParseError::Empty);
    }

    let mut graph = DependencyGraph::new();
    let mut ids: HashMap<String, StepId> = HashMap::new();

    for definition in &pipeline.steps {
        let name = definition.name.trim().to_string();
        if definition.program.trim().is_empty() {
            return Err(ParseError::EmptyProgram(name));
        }
        if ids.contains_key(&name) {
            return Err(ParseError::DuplicateName(name));
        }

        let id = graph.add_step(build_spec(&name, definition))?;
        ids.insert(name, id);
    }

    let mut edges = 0;
    for definition in &pipeline.steps {
        let name = definition.name.trim();
        let Some(&step) = ids.get(name) else { continue };

        for reference in &definition.after {
            let prerequisite = ids
                .get(reference)
                .copied()
                .ok_or_else(|| ParseError::UnknownReference {
                    step: name.to_string(),
                    reference: reference.clone(),
                })?;
            graph.add_dependency(step, prerequisite)?;
            edges += 1;
        }
    }

    info!("Parsed {} steps, {} dependencies", graph.len(), edges);
    Ok(graph)
}

fn build_spec(name: &str, definition: &StepDefinition) -> StepSpec {
    let mut spec = StepSpec::command(name, definition.program.trim()).args(definition.args.iter());

    for (key, value) in &definition.env {
        spec = spec.env(key, value);
    }
    if let Some(dir) = &definition.working_dir {
        spec = spec.working_dir(dir);
    }
    for artifact in &definition.produces {
        spec = spec.produces(artifact);
    }
    if !definition.parallel {
        spec = spec.serial();
    }
    if let Some(secs) = definition.timeout_secs {
        spec = spec.with_timeout(Duration::from_secs(secs));
    }
    spec
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GraphError;
    use crate::workflow::model::{StepAction, StepStatus};
    use tempfile::tempdir;

    fn command_of(graph: &DependencyGraph, name: &str) -> crate::workflow::model::CommandSpec {
        match &graph.find_by_name(name).unwrap().action {
            StepAction::ExternalCommand(cmd) => cmd.clone(),
            other => panic!("expected command, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_full_definition() {
        let graph = parse_pipeline(
            r#"
steps:
  - name: copyImages
    program: cp
    args: [raw.stk, images.stk]
    produces: images.stk
  - name: filter
    program: xmipp_fourier_filter
    args: ["-i", images.stk, "--sampling", 1.5, "--keep", true]
    env:
      OMP_NUM_THREADS: "2"
    after: copyImages
    produces: [filtered.stk, filtered.xmd]
    parallel: false
    timeout_secs: 600
    working_dir: /data/run1
"#,
        )
        .unwrap();

        assert_eq!(graph.len(), 2);
        let filter = graph.find_by_name("filter").unwrap();
        assert_eq!(filter.id, StepId(2));
        assert!(filter.prerequisites.contains(&StepId(1)));
        assert!(!filter.parallel_allowed);
        assert_eq!(filter.timeout, Some(Duration::from_secs(600)));
        assert_eq!(filter.expected_artifacts.len(), 2);
        assert_eq!(filter.status(), StepStatus::Pending);

        let cmd = command_of(&graph, "filter");
        assert_eq!(
            cmd.args,
            vec!["-i", "images.stk", "--sampling", "1.5", "--keep", "true"]
        );
        assert_eq!(cmd.env.get("OMP_NUM_THREADS").map(String::as_str), Some("2"));
        assert_eq!(cmd.working_dir, Some(PathBuf::from("/data/run1")));

        let copy = graph.find_by_name("copyImages").unwrap();
        assert!(copy.parallel_allowed);
        assert!(copy.timeout.is_none());
    }

    #[test]
    fn test_forward_reference() {
        let graph = parse_pipeline(
            r#"
steps:
  - name: report
    program: cat
    after: [sort, count]
  - name: sort
    program: sort
  - name: count
    program: wc
"#,
        )
        .unwrap();

        let report = graph.find_by_name("report").unwrap();
        assert_eq!(report.id, StepId(1));
        assert_eq!(report.prerequisites.len(), 2);
        assert_eq!(graph.ready_set().into_iter().collect::<Vec<_>>(), vec![StepId(2), StepId(3)]);
    }

    #[test]
    fn test_cycle_rejected() {
        let result = parse_pipeline(
            r#"
steps:
  - name: a
    program: "true"
    after: c
  - name: b
    program: "true"
    after: a
  - name: c
    program: "true"
    after: b
"#,
        );
        assert!(matches!(result, Err(ParseError::Graph(GraphError::Cycle { .. }))));
    }

    #[test]
    fn test_self_reference_rejected() {
        let result = parse_pipeline("steps:\n  - name: a\n    program: ls\n    after: a\n");
        assert!(matches!(result, Err(ParseError::Graph(GraphError::Cycle { .. }))));
    }

    #[test]
    fn test_unknown_reference() {
        let result = parse_pipeline("steps:\n  - name: a\n    program: ls\n    after: missing\n");
        match result {
            Err(ParseError::UnknownReference { step, reference }) => {
                assert_eq!(step, "a");
                assert_eq!(reference, "missing");
            }
            other => panic!("unexpected result {:?}", other.map(|g| g.len())),
        }
    }

    #[test]
    fn test_duplicate_name() {
        let result = parse_pipeline(
            "steps:\n  - name: a\n    program: ls\n  - name: a\n    program: pwd\n",
        );
        assert!(matches!(result, Err(ParseError::DuplicateName(n)) if n == "a"));
    }

    #[test]
    fn test_empty_program() {
        let result = parse_pipeline("steps:\n  - name: a\n    program: \"  \"\n");
        assert!(matches!(result, Err(ParseError::EmptyProgram(n)) if n == "a"));
    }

    #[test]
    fn test_empty_pipeline() {
        assert!(matches!(parse_pipeline("steps: []\n"), Err(ParseError::Empty)));
        assert!(matches!(parse_pipeline("{}\n"), Err(ParseError::Empty)));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result = parse_pipeline("steps:\n  - name: a\n    program: ls\n    threads: 4\n");
        assert!(matches!(result, Err(ParseError::Yaml(_))));
    }

    #[test]
    fn test_load_pipeline_file_not_found() {
        let result = load_pipeline("/nonexistent/path/pipeline.yaml");
        assert!(matches!(result, Err(ParseError::Read { .. })));
    }

    #[test]
    fn test_load_pipeline_from_file() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("pipeline.yaml");
        fs::write(&path, "steps:\n  - name: hello\n    program: echo\n    args: hi\n").unwrap();

        let graph = load_pipeline(&path).unwrap();
        assert_eq!(graph.len(), 1);
        assert_eq!(command_of(&graph, "hello").args, vec!["hi"]);
    }

    #[test]
    fn test_invalid_yaml() {
        assert!(matches!(
            parse_pipeline("this is not valid yaml: [[["),
            Err(ParseError::Yaml(_))
        ));
    }
}
