//! Worker Pool
//!
//! Runs step bodies on worker threads, at most `capacity` at a time, and
//! reports each outcome back over a completion channel. The pool never
//! touches step status; the engine's control thread does.

use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error};

use crate::error::{EngineError, StepError};
use crate::workflow::model::{StepAction, StepId};

use super::step::{ensure_artifact_directories, execute_action, StepOutput};

/// Everything a worker needs to run one step.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: StepId,
    pub label: String,
    pub action: StepAction,
    pub working_dir: Option<PathBuf>,
    /// Artifact paths, already resolved against the working directory
    pub artifacts: Vec<PathBuf>,
    pub timeout: Option<Duration>,
}

/// Outcome of one job, sent back to the engine.
#[derive(Debug)]
pub struct Completion {
    pub id: StepId,
    pub outcome: Result<StepOutput, StepError>,
    pub elapsed: Duration,
}

/// Bounded set of worker threads with a shared completion channel.
pub struct WorkerPool {
    capacity: usize,
    in_flight: usize,
    tx: Sender<Completion>,
    rx: Receiver<Completion>,
}

impl WorkerPool {
    /// Creates a pool accepting at most `capacity` concurrent jobs (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = channel();
        Self {
            capacity: capacity.max(1),
            in_flight: 0,
            tx,
            rx,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of jobs submitted whose completion has not been received.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn has_free_slot(&self) -> bool {
        self.in_flight < self.capacity
    }

    /// Starts a job on a new worker thread.
    ///
    /// Fails without running anything if the pool is full or the thread
    /// cannot be spawned.
    pub fn submit(&mut self, job: Job) -> Result<(), StepError> {
        if !self.has_free_slot() {
            return Err(StepError::Execution(format!(
                "worker pool is full ({} in flight)",
                self.in_flight
            )));
        }

        let tx = self.tx.clone();
        let id = job.id;

        thread::Builder::new()
            .name(format!("step-{}", id))
            .spawn(move || {
                let start = Instant::now();
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| run_job(&job)))
                    .unwrap_or_else(|_| Err(StepError::Execution("worker panicked".to_string())));

                let completion = Completion {
                    id: job.id,
                    outcome,
                    elapsed: start.elapsed(),
                };
                if let Err(e) = tx.send(completion) {
                    error!("Failed to send completion signal: {}", e);
                }
            })
            .map_err(|e| StepError::Execution(format!("failed to spawn worker: {}", e)))?;

        self.in_flight += 1;
        debug!(
            "Step {} submitted ({}/{} workers busy)",
            id, self.in_flight, self.capacity
        );
        Ok(())
    }

    /// Waits up to `timeout` for the next finished job.
    ///
    /// Returns `Ok(None)` on timeout.
    pub fn wait_completion(&mut self, timeout: Duration) -> Result<Option<Completion>, EngineError> {
        match self.rx.recv_timeout(timeout) {
            Ok(completion) => {
                self.in_flight = self.in_flight.saturating_sub(1);
                Ok(Some(completion))
            }
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(EngineError::WorkerDisconnected(self.in_flight)),
        }
    }
}

fn run_job(job: &Job) -> Result<StepOutput, StepError> {
    ensure_artifact_directories(&job.artifacts)?;
    execute_action(&job.label, &job.action, job.working_dir.as_deref(), job.timeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn job(id: usize, action: StepAction) -> Job {
        Job {
            id: StepId(id),
            label: format!("job{}", id),
            action,
            working_dir: None,
            artifacts: Vec::new(),
            timeout: None,
        }
    }

    fn sleeper(counter: Arc<AtomicUsize>, peak: Arc<AtomicUsize>) -> StepAction {
        StepAction::InProcessCall {
            function: Arc::new(move |_| {
                let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(30));
                counter.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }),
            args: Vec::new(),
        }
    }

    fn wait(pool: &mut WorkerPool) -> Completion {
        loop {
            if let Some(c) = pool.wait_completion(Duration::from_millis(50)).unwrap() {
                return c;
            }
        }
    }

    #[test]
    fn test_capacity_minimum_one() {
        let pool = WorkerPool::new(0);
        assert_eq!(pool.capacity(), 1);
        assert!(pool.has_free_slot());
    }

    #[test]
    fn test_submit_rejected_when_full() {
        let counter = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut pool = WorkerPool::new(1);

        pool.submit(job(1, sleeper(counter.clone(), peak.clone()))).unwrap();
        assert!(!pool.has_free_slot());
        assert!(pool.submit(job(2, sleeper(counter, peak))).is_err());

        let c = wait(&mut pool);
        assert_eq!(c.id, StepId(1));
        assert!(c.outcome.is_ok());
        assert_eq!(pool.in_flight(), 0);
    }

    #[test]
    fn test_never_exceeds_capacity() {
        let counter = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut pool = WorkerPool::new(3);
        let mut pending: Vec<usize> = (1..=10).collect();
        let mut finished = 0;

        while finished < 10 {
            while pool.has_free_slot() && !pending.is_empty() {
                let id = pending.remove(0);
                pool.submit(job(id, sleeper(counter.clone(), peak.clone()))).unwrap();
            }
            wait(&mut pool);
            finished += 1;
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(pool.in_flight(), 0);
    }

    #[test]
    fn test_failure_reported_not_propagated() {
        let mut pool = WorkerPool::new(2);
        let action = StepAction::InProcessCall {
            function: Arc::new(|_| Err("bad parameters".into())),
            args: Vec::new(),
        };
        pool.submit(job(7, action)).unwrap();

        let c = wait(&mut pool);
        assert_eq!(c.id, StepId(7));
        assert_eq!(
            c.outcome.unwrap_err(),
            StepError::Execution("bad parameters".to_string())
        );
    }

    #[test]
    fn test_wait_without_jobs_times_out() {
        let mut pool = WorkerPool::new(1);
        assert!(pool.wait_completion(Duration::from_millis(10)).unwrap().is_none());
    }
}
