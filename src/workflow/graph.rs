//! Dependency Graph
//!
//! Arena of [`StepRecord`]s indexed by [`StepId`], with prerequisite edges
//! stored as id sets. The graph:
//! - Assigns ids in insertion order
//! - Rejects edges that would close a cycle
//! - Answers which steps are ready to run
//! - Enforces forward-only status transitions

use std::collections::{BTreeMap, BTreeSet, HashMap};

use log::debug;

use crate::error::{GraphError, StepError, TransitionError};

use super::model::{StepId, StepRecord, StepSpec, StepStatus};

/// All steps of one pipeline run and their precedence edges.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    steps: Vec<StepRecord>,
    /// Reverse edges: step -> steps that list it as a prerequisite
    dependents: HashMap<StepId, BTreeSet<StepId>>,
}

impl DependencyGraph {
    /// Creates an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> StepId {
        StepId(self.steps.len() + 1)
    }

    fn index(&self, id: StepId) -> Option<usize> {
        (id.0 >= 1 && id.0 <= self.steps.len()).then(|| id.0 - 1)
    }

    /// Registers a step and returns its id.
    ///
    /// Every prerequisite must already be registered. The graph is left
    /// untouched when the step is rejected.
    pub fn add_step(&mut self, spec: StepSpec) -> Result<StepId, GraphError> {
        let id = self.next_id();

        for &prerequisite in &spec.prerequisites {
            if prerequisite == id {
                return Err(GraphError::Cycle {
                    step: id,
                    prerequisite,
                });
            }
            if self.index(prerequisite).is_none() {
                return Err(GraphError::UnknownStep(prerequisite));
            }
        }

        for &prerequisite in &spec.prerequisites {
            self.dependents.entry(prerequisite).or_default().insert(id);
        }

        debug!(
            "Registered step {} '{}' (prerequisites: {:?})",
            id, spec.name, spec.prerequisites
        );
        self.steps.push(StepRecord::from_spec(id, spec));
        Ok(id)
    }

    /// Makes `step` depend on `prerequisite`.
    ///
    /// Fails with [`GraphError::Cycle`] if `step` is already reachable by
    /// walking back from `prerequisite` through its prerequisite chains.
    pub fn add_dependency(&mut self, step: StepId, prerequisite: StepId) -> Result<(), GraphError> {
        let step_index = self.index(step).ok_or(GraphError::UnknownStep(step))?;
        if self.index(prerequisite).is_none() {
            return Err(GraphError::UnknownStep(prerequisite));
        }

        if self.reaches(prerequisite, step) {
            return Err(GraphError::Cycle { step, prerequisite });
        }

        self.steps[step_index].prerequisites.insert(prerequisite);
        self.dependents.entry(prerequisite).or_default().insert(step);
        Ok(())
    }

    /// Returns true if `target` is `from` or one of its transitive prerequisites.
    fn reaches(&self, from: StepId, target: StepId) -> bool {
        let mut stack = vec![from];
        let mut visited = BTreeSet::new();

        while let Some(current) = stack.pop() {
            if current == target {
                return true;
            }
            if !visited.insert(current) {
                continue;
            }
            if let Some(record) = self.get(current) {
                stack.extend(record.prerequisites.iter().copied());
            }
        }
        false
    }

    /// Looks up a step by id.
    pub fn get(&self, id: StepId) -> Option<&StepRecord> {
        self.index(id).map(|i| &self.steps[i])
    }

    /// Finds the first step registered under `name`.
    pub fn find_by_name(&self, name: &str) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Iterates over steps in id order.
    pub fn iter(&self) -> impl Iterator<Item = &StepRecord> {
        self.steps.iter()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Returns the ids of steps whose prerequisites are all `Done` and that
    /// have not started (status `Pending` or `Ready`), ascending.
    pub fn ready_set(&self) -> BTreeSet<StepId> {
        self.steps
            .iter()
            .filter(|s| matches!(s.status, StepStatus::Pending | StepStatus::Ready))
            .filter(|s| {
                s.prerequisites
                    .iter()
                    .all(|p| self.status(*p) == Some(StepStatus::Done))
            })
            .map(|s| s.id)
            .collect()
    }

    pub fn status(&self, id: StepId) -> Option<StepStatus> {
        self.get(id).map(|s| s.status)
    }

    /// Returns the ids currently in `status`, ascending.
    pub fn ids_with_status(&self, status: StepStatus) -> Vec<StepId> {
        self.steps
            .iter()
            .filter(|s| s.status == status)
            .map(|s| s.id)
            .collect()
    }

    /// Counts steps per status.
    pub fn summary(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for step in &self.steps {
            *counts.entry(step.status.to_string()).or_insert(0) += 1;
        }
        counts
    }

    /// Returns every step that transitively depends on `id`, ascending.
    pub fn dependents_of(&self, id: StepId) -> BTreeSet<StepId> {
        let mut result = BTreeSet::new();
        let mut stack = vec![id];

        while let Some(current) = stack.pop() {
            if let Some(direct) = self.dependents.get(&current) {
                for &dependent in direct {
                    if result.insert(dependent) {
                        stack.push(dependent);
                    }
                }
            }
        }
        result
    }

    /// Applies a status transition.
    ///
    /// Allowed: Pending→Ready→Running→{Done, Failed}, and any status other
    /// than Skipped to Skipped.
    pub fn mark_status(&mut self, id: StepId, new_status: StepStatus) -> Result<(), TransitionError> {
        let index = self.index(id).ok_or(TransitionError {
            id,
            from: StepStatus::Pending,
            to: new_status,
        })?;
        let record = &mut self.steps[index];
        let from = record.status;

        use StepStatus::*;
        let allowed = matches!(
            (from, new_status),
            (Pending, Ready) | (Ready, Running) | (Running, Done) | (Running, Failed)
        ) || (new_status == Skipped && from != Skipped);

        if !allowed {
            return Err(TransitionError {
                id,
                from,
                to: new_status,
            });
        }

        record.status = new_status;
        if new_status == Running {
            record.failure = None;
        }
        Ok(())
    }

    /// Records why a step failed.
    pub(crate) fn set_failure(&mut self, id: StepId, error: StepError) {
        if let Some(i) = self.index(id) {
            self.steps[i].failure = Some(error);
        }
    }

    /// Overwrites a status without transition checks. Only used to seed a
    /// resumed run before its first dispatch cycle.
    pub(crate) fn seed_status(&mut self, id: StepId, status: StepStatus) {
        if let Some(i) = self.index(id) {
            self.steps[i].status = status;
            self.steps[i].failure = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(name: &str) -> StepSpec {
        StepSpec::command(name, "true")
    }

    fn diamond() -> (DependencyGraph, [StepId; 4]) {
        let mut graph = DependencyGraph::new();
        let a = graph.add_step(step("a")).unwrap();
        let b = graph.add_step(step("b").after(a)).unwrap();
        let c = graph.add_step(step("c").after(a)).unwrap();
        let d = graph.add_step(step("d").after(b).after(c)).unwrap();
        (graph, [a, b, c, d])
    }

    fn finish(graph: &mut DependencyGraph, id: StepId) {
        graph.mark_status(id, StepStatus::Ready).unwrap();
        graph.mark_status(id, StepStatus::Running).unwrap();
        graph.mark_status(id, StepStatus::Done).unwrap();
    }

    #[test]
    fn test_ids_assigned_in_insertion_order() {
        let (graph, ids) = diamond();
        assert_eq!(ids, [StepId(1), StepId(2), StepId(3), StepId(4)]);
        assert_eq!(graph.len(), 4);
        assert_eq!(graph.get(StepId(3)).unwrap().name, "c");
        assert!(graph.get(StepId(0)).is_none());
        assert!(graph.get(StepId(5)).is_none());
    }

    #[test]
    fn test_unknown_prerequisite_rejected() {
        let mut graph = DependencyGraph::new();
        let err = graph.add_step(step("a").after(StepId(9))).unwrap_err();
        assert_eq!(err, GraphError::UnknownStep(StepId(9)));
        assert!(graph.is_empty());
    }

    #[test]
    fn test_self_reference_is_cycle() {
        let mut graph = DependencyGraph::new();
        graph.add_step(step("a")).unwrap();
        let err = graph.add_step(step("b").after(StepId(2))).unwrap_err();
        assert!(matches!(err, GraphError::Cycle { .. }));
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn test_add_dependency_closing_cycle_rejected_without_mutation() {
        let (mut graph, [a, _, _, d]) = diamond();
        let before = graph.get(a).unwrap().prerequisites.clone();

        let err = graph.add_dependency(a, d).unwrap_err();
        assert_eq!(err, GraphError::Cycle { step: a, prerequisite: d });
        assert_eq!(graph.get(a).unwrap().prerequisites, before);
        assert!(graph.dependents_of(d).is_empty());
    }

    #[test]
    fn test_add_dependency_acyclic_accepted() {
        let mut graph = DependencyGraph::new();
        let a = graph.add_step(step("a")).unwrap();
        let b = graph.add_step(step("b")).unwrap();
        let c = graph.add_step(step("c")).unwrap();

        // Forward edge: an earlier id may depend on a later one.
        graph.add_dependency(a, c).unwrap();
        graph.add_dependency(b, a).unwrap();

        assert!(graph.get(a).unwrap().prerequisites.contains(&c));
        assert_eq!(graph.dependents_of(c), [a, b].into_iter().collect());
        assert_eq!(graph.add_dependency(c, b), Err(GraphError::Cycle { step: c, prerequisite: b }));
    }

    #[test]
    fn test_acyclic_chains_never_cycle() {
        // Every edge points from a later id to an earlier one: always a DAG.
        let mut graph = DependencyGraph::new();
        for n in 0..20usize {
            let prereqs: Vec<StepId> = (1..=n).filter(|k| (n + k) % 3 == 0).map(StepId).collect();
            assert!(graph.add_step(step(&format!("s{}", n)).after_all(prereqs)).is_ok());
        }
        for later in 1..=20 {
            for earlier in 1..later {
                if later % 4 == 0 {
                    assert!(graph.add_dependency(StepId(later), StepId(earlier)).is_ok());
                }
            }
        }
    }

    #[test]
    fn test_ready_set_follows_prerequisites() {
        let (mut graph, [a, b, c, d]) = diamond();
        assert_eq!(graph.ready_set(), [a].into_iter().collect());

        finish(&mut graph, a);
        assert_eq!(graph.ready_set(), [b, c].into_iter().collect());

        finish(&mut graph, b);
        assert_eq!(graph.ready_set(), [c].into_iter().collect());

        finish(&mut graph, c);
        assert_eq!(graph.ready_set(), [d].into_iter().collect());
    }

    #[test]
    fn test_ready_set_is_pure() {
        let (graph, _) = diamond();
        let _ = graph.ready_set();
        assert!(graph.iter().all(|s| s.status() == StepStatus::Pending));
    }

    #[test]
    fn test_ready_set_includes_ready_but_not_running() {
        let mut graph = DependencyGraph::new();
        let a = graph.add_step(step("a")).unwrap();
        let b = graph.add_step(step("b")).unwrap();
        graph.mark_status(a, StepStatus::Ready).unwrap();
        graph.mark_status(b, StepStatus::Ready).unwrap();
        graph.mark_status(b, StepStatus::Running).unwrap();
        assert_eq!(graph.ready_set(), [a].into_iter().collect());
    }

    #[test]
    fn test_forward_transitions_only() {
        let mut graph = DependencyGraph::new();
        let a = graph.add_step(step("a")).unwrap();

        assert!(graph.mark_status(a, StepStatus::Running).is_err());
        graph.mark_status(a, StepStatus::Ready).unwrap();
        assert!(graph.mark_status(a, StepStatus::Ready).is_err());
        graph.mark_status(a, StepStatus::Running).unwrap();
        graph.mark_status(a, StepStatus::Done).unwrap();

        let err = graph.mark_status(a, StepStatus::Pending).unwrap_err();
        assert_eq!(err.from, StepStatus::Done);
        assert_eq!(err.to, StepStatus::Pending);
        assert!(graph.mark_status(a, StepStatus::Failed).is_err());
    }

    #[test]
    fn test_skip_allowed_from_any_status_once() {
        let mut graph = DependencyGraph::new();
        let a = graph.add_step(step("a")).unwrap();
        let b = graph.add_step(step("b")).unwrap();

        graph.mark_status(a, StepStatus::Skipped).unwrap();
        assert!(graph.mark_status(a, StepStatus::Skipped).is_err());

        graph.mark_status(b, StepStatus::Ready).unwrap();
        graph.mark_status(b, StepStatus::Skipped).unwrap();
        assert_eq!(graph.ids_with_status(StepStatus::Skipped), vec![a, b]);
    }

    #[test]
    fn test_unknown_id_transition_fails() {
        let mut graph = DependencyGraph::new();
        assert!(graph.mark_status(StepId(1), StepStatus::Ready).is_err());
    }

    #[test]
    fn test_dependents_transitive() {
        let (graph, [a, b, c, d]) = diamond();
        assert_eq!(graph.dependents_of(a), [b, c, d].into_iter().collect());
        assert_eq!(graph.dependents_of(b), [d].into_iter().collect());
        assert!(graph.dependents_of(d).is_empty());
    }

    #[test]
    fn test_summary_and_find_by_name() {
        let (mut graph, [a, ..]) = diamond();
        finish(&mut graph, a);

        let summary = graph.summary();
        assert_eq!(summary.get("Done"), Some(&1));
        assert_eq!(summary.get("Pending"), Some(&3));
        assert_eq!(graph.find_by_name("c").unwrap().id, StepId(3));
        assert!(graph.find_by_name("zzz").is_none());
    }

    #[test]
    fn test_seed_status_bypasses_checks() {
        let (mut graph, [a, ..]) = diamond();
        graph.seed_status(a, StepStatus::Done);
        assert_eq!(graph.status(a), Some(StepStatus::Done));
        graph.seed_status(a, StepStatus::Pending);
        assert_eq!(graph.status(a), Some(StepStatus::Pending));
    }
}
