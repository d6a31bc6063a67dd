//! Step Execution Engine
//!
//! Drives a [`DependencyGraph`] to completion:
//! - Dispatches ready steps in ascending id order, up to the concurrency limit
//! - Gives serial steps exclusive use of the engine while they run
//! - Verifies declared artifacts before accepting a step as done
//! - Skips the dependents of failed steps while independent branches continue
//! - Writes every transition to the [`RunLedger`] before acting on it
//! - Resumes from a prior ledger, trusting only verified artifacts
//! - Supports dry runs, a pause flag file and cooperative cancellation

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use once_cell::sync::Lazy;

use crate::error::{EngineError, StepError};
use crate::monitoring::{EventType, ExecutionTimeline};
use crate::workflow::ledger::{LedgerEntry, RunLedger};
use crate::workflow::model::{resolve_path, StepAction, StepId, StepRecord, StepStatus};
use crate::workflow::DependencyGraph;

use super::pool::{Completion, Job, WorkerPool};

/// Default concurrency: one step per available CPU.
pub static DEFAULT_CONCURRENCY: Lazy<usize> = Lazy::new(num_cpus::get);

/// How long the dispatch loop sleeps between checks while waiting.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Outcome of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunResult {
    /// Every step reached `Done`.
    Completed,
    /// Some steps failed; their dependents were skipped.
    PartiallyFailed {
        failed: Vec<StepId>,
        skipped: Vec<StepId>,
    },
    /// The run was cancelled; these steps did not run.
    Cancelled { skipped: Vec<StepId> },
}

impl RunResult {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// Cooperative cancellation handle, checked at the top of each dispatch cycle.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Running steps are allowed to finish.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clears a previous cancellation request.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Engine settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub concurrency: usize,
    pub dry_run: bool,
    pub working_dir: Option<PathBuf>,
    pub pause_flag_path: Option<PathBuf>,
    /// Time limit for steps that do not declare their own
    pub step_timeout: Option<Duration>,
    /// Whether resume re-offers steps that previously failed
    pub retry_failed: bool,
    pub poll_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: *DEFAULT_CONCURRENCY,
            dry_run: false,
            working_dir: None,
            pause_flag_path: None,
            step_timeout: None,
            retry_failed: true,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Step dependency execution engine.
///
/// # Example
///
/// ```rust,no_run
/// use stepflow::execution::ExecutionEngine;
/// use stepflow::workflow::{DependencyGraph, RunLedger, StepSpec};
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mut graph = DependencyGraph::new();
///     let copy = graph.add_step(
///         StepSpec::command("copyImages", "cp")
///             .args(["raw.stk", "images.stk"])
///             .produces("images.stk"),
///     )?;
///     graph.add_step(
///         StepSpec::command("mask", "xmipp_transform_mask")
///             .args(["-i", "images.stk", "--mask", "circular", "-32"])
///             .after(copy),
///     )?;
///
///     let mut engine = ExecutionEngine::new(RunLedger::open(".stepflow/run.jsonl")?);
///     engine.set_working_dir("/data/project");
///     let result = engine.resume(&mut graph, 4)?;
///     println!("{:?}", result);
///     Ok(())
/// }
/// ```
pub struct ExecutionEngine {
    config: EngineConfig,
    ledger: RunLedger,
    cancel: CancelToken,
    timeline: ExecutionTimeline,
}

impl ExecutionEngine {
    /// Creates an engine writing transitions to `ledger`.
    pub fn new(ledger: RunLedger) -> Self {
        Self::with_config(ledger, EngineConfig::default())
    }

    pub fn with_config(ledger: RunLedger, config: EngineConfig) -> Self {
        Self {
            config,
            ledger,
            cancel: CancelToken::new(),
            timeline: ExecutionTimeline::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Sets the default concurrency used by [`ExecutionEngine::execute`].
    pub fn set_concurrency(&mut self, concurrency: usize) {
        self.config.concurrency = concurrency;
    }

    /// Enables or disables dry run mode.
    pub fn set_dry_run(&mut self, dry_run: bool) {
        self.config.dry_run = dry_run;
    }

    /// Sets the working directory for commands and relative artifact paths.
    pub fn set_working_dir(&mut self, dir: impl Into<PathBuf>) {
        self.config.working_dir = Some(dir.into());
    }

    /// Sets the path for pause/resume signaling.
    pub fn set_pause_flag_path(&mut self, path: impl Into<PathBuf>) {
        self.config.pause_flag_path = Some(path.into());
    }

    pub fn set_step_timeout(&mut self, timeout: Duration) {
        self.config.step_timeout = Some(timeout);
    }

    /// Whether [`ExecutionEngine::resume`] retries previously failed steps.
    pub fn set_retry_failed(&mut self, retry: bool) {
        self.config.retry_failed = retry;
    }

    pub fn set_poll_interval(&mut self, interval: Duration) {
        self.config.poll_interval = interval;
    }

    /// Returns a handle that cancels the current or next run.
    ///
    /// The request is cleared once a run has ended as
    /// [`RunResult::Cancelled`], so the engine can run again afterwards.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Timeline of the most recent run.
    pub fn timeline(&self) -> &ExecutionTimeline {
        &self.timeline
    }

    pub fn ledger(&self) -> &RunLedger {
        &self.ledger
    }

    /// Runs the graph from its current statuses with `concurrency` workers.
    pub fn run(&mut self, graph: &mut DependencyGraph, concurrency: usize) -> Result<RunResult, EngineError> {
        self.config.concurrency = concurrency;
        self.execute(graph)
    }

    /// Seeds statuses from the ledger's prior run, then runs.
    pub fn resume(&mut self, graph: &mut DependencyGraph, concurrency: usize) -> Result<RunResult, EngineError> {
        self.seed_from_ledger(graph)?;
        self.run(graph, concurrency)
    }

    /// Applies the prior run's statuses to a freshly declared graph.
    ///
    /// Returns the number of steps trusted as already done.
    pub fn seed_from_ledger(&mut self, graph: &mut DependencyGraph) -> Result<usize, EngineError> {
        let prior = self.ledger.load_prior_run()?;
        if prior.is_empty() {
            info!("No prior run recorded - starting fresh");
        }

        let base = self.config.working_dir.clone();
        let mut seeds = Vec::with_capacity(graph.len());

        for record in graph.iter() {
            let seeded = match prior.get(&record.id) {
                None => StepStatus::Pending,
                Some(entry) if entry.name != record.name => {
                    warn!(
                        "Ledger entry for step {} is '{}' but the step is '{}' - ignoring it",
                        record.id, entry.name, record.name
                    );
                    StepStatus::Pending
                }
                Some(entry) => match entry.status {
                    StepStatus::Done => {
                        if RunLedger::verify_artifacts_still_present(record, base.as_deref()) {
                            StepStatus::Done
                        } else {
                            info!("Step {} '{}' outputs missing - scheduling rerun", record.id, record.name);
                            StepStatus::Pending
                        }
                    }
                    StepStatus::Failed if !self.config.retry_failed => StepStatus::Failed,
                    _ => StepStatus::Pending,
                },
            };
            seeds.push((record.id, seeded));
        }

        // Outputs built from a step that runs again are stale.
        let rerun: Vec<StepId> = seeds
            .iter()
            .filter(|(_, s)| *s == StepStatus::Pending)
            .map(|(id, _)| *id)
            .collect();
        for id in rerun {
            let downstream = graph.dependents_of(id);
            for (dependent, status) in seeds.iter_mut() {
                if *status == StepStatus::Done && downstream.contains(dependent) {
                    info!("Step {} depends on re-run step {} - scheduling rerun", dependent, id);
                    *status = StepStatus::Pending;
                }
            }
        }

        for &(id, status) in &seeds {
            graph.seed_status(id, status);
        }

        if !self.config.retry_failed {
            for &(id, status) in &seeds {
                if status != StepStatus::Failed {
                    continue;
                }
                for dependent in graph.dependents_of(id) {
                    if graph.status(dependent) != Some(StepStatus::Done) {
                        graph.seed_status(dependent, StepStatus::Skipped);
                    }
                }
            }
        }

        let trusted = seeds.iter().filter(|(_, s)| *s == StepStatus::Done).count();
        if trusted > 0 {
            info!("Skipping {} previously completed steps", trusted);
        }
        Ok(trusted)
    }

    /// Runs the graph with the configured concurrency.
    pub fn execute(&mut self, graph: &mut DependencyGraph) -> Result<RunResult, EngineError> {
        let start_time = Instant::now();
        let mut pool = WorkerPool::new(self.config.concurrency);
        let mut serial_running: Option<StepId> = None;
        let mut cancelled = false;
        let mut paused = false;

        self.timeline = ExecutionTimeline::new();

        info!(
            "Starting execution of {} steps (concurrency: {}, dry run: {})",
            graph.len(),
            pool.capacity(),
            self.config.dry_run
        );

        loop {
            if !cancelled && self.cancel.is_cancelled() {
                info!("Cancellation requested - no new steps will be dispatched");
                cancelled = true;
            }

            if cancelled {
                for id in graph.ids_with_status(StepStatus::Ready) {
                    self.transition(graph, id, StepStatus::Skipped, Some("run cancelled"))?;
                }
                if pool.in_flight() == 0 {
                    break;
                }
            } else if self.pause_requested() {
                if !paused {
                    info!("Execution paused - waiting for resume signal");
                    paused = true;
                }
                if pool.in_flight() == 0 {
                    thread::sleep(self.config.poll_interval);
                    continue;
                }
            } else {
                if paused {
                    info!("Resumed");
                    paused = false;
                }

                for id in graph.ready_set() {
                    if graph.status(id) == Some(StepStatus::Pending) {
                        self.transition(graph, id, StepStatus::Ready, None)?;
                    }
                }

                self.dispatch(graph, &mut pool, &mut serial_running)?;

                if pool.in_flight() == 0 {
                    if graph.ready_set().is_empty() {
                        break;
                    }
                    continue;
                }
            }

            if let Some(completion) = pool.wait_completion(self.config.poll_interval)? {
                if serial_running == Some(completion.id) {
                    serial_running = None;
                }
                self.handle_completion(graph, completion)?;
            }
        }

        let result = self.finish(graph, cancelled)?;
        info!(
            "Run finished in {:.2?}: {:?} ({} steps dispatched)",
            start_time.elapsed(),
            result,
            self.timeline.dispatched_count()
        );
        Ok(result)
    }

    fn pause_requested(&self) -> bool {
        self.config
            .pause_flag_path
            .as_deref()
            .map_or(false, Path::exists)
    }

    /// Hands ready steps to the pool in ascending id order.
    fn dispatch(
        &mut self,
        graph: &mut DependencyGraph,
        pool: &mut WorkerPool,
        serial_running: &mut Option<StepId>,
    ) -> Result<(), EngineError> {
        if serial_running.is_some() {
            return Ok(());
        }

        for id in graph.ids_with_status(StepStatus::Ready) {
            if !pool.has_free_slot() {
                break;
            }

            let Some(record) = graph.get(id) else { continue };
            let parallel_allowed = record.parallel_allowed;

            // A serial step waits until it can run alone.
            if !parallel_allowed && pool.in_flight() > 0 {
                debug!("Step {} '{}' waits for exclusive access", id, record.name);
                break;
            }

            let job = self.job_for(record);
            self.transition(graph, id, StepStatus::Running, None)?;
            self.timeline.add_event(id, job.label.clone(), EventType::Dispatched);
            info!("Starting step {}: {}", id, job.label);

            if self.config.dry_run {
                print_dry_run(&job);
                self.transition(graph, id, StepStatus::Done, None)?;
                self.timeline.add_event(id, job.label, EventType::Completed);
                continue;
            }

            match pool.submit(job) {
                Ok(()) if !parallel_allowed => {
                    *serial_running = Some(id);
                    break;
                }
                Ok(()) => {}
                Err(e) => self.fail_step(graph, id, e)?,
            }
        }
        Ok(())
    }

    fn job_for(&self, record: &StepRecord) -> Job {
        let base = self.config.working_dir.as_deref();
        Job {
            id: record.id,
            label: record.name.clone(),
            action: record.action.clone(),
            working_dir: self.config.working_dir.clone(),
            artifacts: record
                .expected_artifacts
                .iter()
                .map(|p| resolve_path(p, base))
                .collect(),
            timeout: record.timeout.or(self.config.step_timeout),
        }
    }

    fn handle_completion(&mut self, graph: &mut DependencyGraph, completion: Completion) -> Result<(), EngineError> {
        let id = completion.id;
        match completion.outcome {
            Ok(_) => {
                let missing = graph
                    .get(id)
                    .map(|r| r.missing_artifacts(self.config.working_dir.as_deref()))
                    .unwrap_or_default();

                if !missing.is_empty() {
                    return self.fail_step(graph, id, StepError::MissingArtifacts(missing));
                }

                self.transition(graph, id, StepStatus::Done, None)?;
                let label = graph.get(id).map(|r| r.name.clone()).unwrap_or_default();
                info!("Step {} '{}' completed in {:.2?}", id, label, completion.elapsed);
                self.timeline.add_event(id, label, EventType::Completed);
                Ok(())
            }
            Err(e) => self.fail_step(graph, id, e),
        }
    }

    /// Marks a step failed and skips everything downstream of it.
    fn fail_step(&mut self, graph: &mut DependencyGraph, id: StepId, err: StepError) -> Result<(), EngineError> {
        let label = graph.get(id).map(|r| r.name.clone()).unwrap_or_default();
        error!("Step {} '{}' failed: {}", id, label, err);

        let message = err.to_string();
        graph.set_failure(id, err);
        self.transition(graph, id, StepStatus::Failed, Some(&message))?;
        self.timeline.add_event(id, label, EventType::Failed);

        let reason = format!("prerequisite {} failed", id);
        for dependent in graph.dependents_of(id) {
            match graph.status(dependent) {
                Some(StepStatus::Pending) | Some(StepStatus::Ready) => {
                    self.transition(graph, dependent, StepStatus::Skipped, Some(&reason))?;
                    let name = graph.get(dependent).map(|r| r.name.clone()).unwrap_or_default();
                    warn!("Skipping step {} '{}': {}", dependent, name, reason);
                    self.timeline.add_event(dependent, name, EventType::Skipped);
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Applies a transition to the graph and records it durably.
    fn transition(
        &mut self,
        graph: &mut DependencyGraph,
        id: StepId,
        status: StepStatus,
        message: Option<&str>,
    ) -> Result<(), EngineError> {
        graph.mark_status(id, status)?;

        if self.config.dry_run {
            return Ok(());
        }

        let Some(record) = graph.get(id) else {
            return Ok(());
        };
        let mut entry = LedgerEntry::for_record(record, status);
        if status == StepStatus::Done {
            entry = entry.with_verified(true);
        }
        if let Some(message) = message {
            entry = entry.with_message(message);
        }
        self.ledger.record_transition(entry)?;
        Ok(())
    }

    fn finish(&mut self, graph: &mut DependencyGraph, cancelled: bool) -> Result<RunResult, EngineError> {
        if cancelled {
            for id in graph.ids_with_status(StepStatus::Pending) {
                self.transition(graph, id, StepStatus::Skipped, Some("run cancelled"))?;
            }
            self.cancel.reset();
            return Ok(RunResult::Cancelled {
                skipped: graph.ids_with_status(StepStatus::Skipped),
            });
        }

        // Anything still pending can never become ready.
        for id in graph.ids_with_status(StepStatus::Pending) {
            warn!("Step {} was never reachable", id);
            self.transition(graph, id, StepStatus::Skipped, Some("unreachable"))?;
        }

        let failed = graph.ids_with_status(StepStatus::Failed);
        let skipped = graph.ids_with_status(StepStatus::Skipped);

        if failed.is_empty() && skipped.is_empty() {
            Ok(RunResult::Completed)
        } else {
            Ok(RunResult::PartiallyFailed { failed, skipped })
        }
    }
}

fn print_dry_run(job: &Job) {
    println!();
    println!("[DRY RUN] Step {}: {}", job.id, job.label);
    match &job.action {
        StepAction::ExternalCommand(cmd) => {
            println!("  Command: {}", cmd.display_line());
            if !cmd.env.is_empty() {
                println!("  Env: {:?}", cmd.env);
            }
        }
        StepAction::InProcessCall { args, .. } => {
            println!("  Function call with {} args", args.len());
        }
    }
    if !job.artifacts.is_empty() {
        println!("  Produces: {:?}", job.artifacts);
    }
    if let Some(timeout) = job.timeout {
        println!("  Timeout: {:.1?}", timeout);
    }
}
