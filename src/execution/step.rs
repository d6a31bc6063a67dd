//! Individual Step Execution
//!
//! Runs the body of a single step and reports its outcome:
//! - In-process calls, with errors and panics captured
//! - External commands, with merged environment and captured output
//! - Optional time limit, killing the subprocess when exceeded
//! - Output directory creation for declared artifacts
//!
//! Artifact verification is not done here; the engine owns that decision.

use std::fs;
use std::io::Read;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, warn};
use serde_json::Value;

use crate::error::StepError;
use crate::workflow::model::{CommandSpec, StepAction, StepFunction};

/// How often a running command is polled when a time limit applies.
const TIMEOUT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Number of trailing stderr lines kept in failure reports.
const STDERR_TAIL_LINES: usize = 20;

/// Captured result of a successful step body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code of an external command; `None` for in-process calls
    pub exit_code: Option<i32>,
}

/// Executes one step action.
///
/// # Arguments
///
/// * `label` - Step label used in logs
/// * `action` - What to run
/// * `working_dir` - Directory for commands that do not set their own
/// * `timeout` - Optional time limit
///
/// # Returns
///
/// * `Ok(StepOutput)` - The body completed successfully
/// * `Err(StepError)` - The body failed, panicked or timed out
pub fn execute_action(
    label: &str,
    action: &StepAction,
    working_dir: Option<&Path>,
    timeout: Option<Duration>,
) -> Result<StepOutput, StepError> {
    match action {
        StepAction::InProcessCall { function, args } => {
            debug!("Step '{}': calling function with {} args", label, args.len());
            call_function(function, args, timeout)?;
            Ok(StepOutput::default())
        }
        StepAction::ExternalCommand(cmd) => {
            debug!("Step '{}': {}", label, cmd.display_line());
            let output = run_command(cmd, working_dir, timeout)?;

            if !output.stdout.trim().is_empty() {
                debug!("Step '{}' output:\n{}", label, output.stdout);
            }
            Ok(output)
        }
    }
}

/// Invokes a function, converting errors and panics into step failures.
fn call_function(
    function: &StepFunction,
    args: &[Value],
    timeout: Option<Duration>,
) -> Result<(), StepError> {
    let Some(limit) = timeout else {
        return invoke_guarded(function, args);
    };

    // A thread cannot be killed, so a timed-out call is abandoned.
    let (tx, rx) = mpsc::channel();
    let function = StepFunction::clone(function);
    let args = args.to_vec();
    thread::spawn(move || {
        let _ = tx.send(invoke_guarded(&function, &args));
    });

    match rx.recv_timeout(limit) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => Err(StepError::Timeout(limit)),
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(StepError::Execution(
            "function thread exited without a result".to_string(),
        )),
    }
}

fn invoke_guarded(function: &StepFunction, args: &[Value]) -> Result<(), StepError> {
    match panic::catch_unwind(AssertUnwindSafe(|| (**function)(args))) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(StepError::Execution(e.to_string())),
        Err(payload) => Err(StepError::Execution(format!(
            "step panicked: {}",
            panic_message(payload.as_ref())
        ))),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Spawns an external command and waits for it, honoring the time limit.
fn run_command(
    cmd: &CommandSpec,
    working_dir: Option<&Path>,
    timeout: Option<Duration>,
) -> Result<StepOutput, StepError> {
    let mut command = Command::new(&cmd.program);
    command
        .args(&cmd.args)
        .envs(&cmd.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    if let Some(dir) = cmd.working_dir.as_deref().or(working_dir) {
        command.current_dir(dir);
        debug!("Executing in directory: {}", dir.display());
    }

    // Own process group, so a timeout reaches everything the command started.
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    let mut child = command
        .spawn()
        .map_err(|e| StepError::Execution(format!("failed to start '{}': {}", cmd.program, e)))?;

    let stdout_reader = spawn_reader(child.stdout.take());
    let stderr_reader = spawn_reader(child.stderr.take());

    let status = match timeout {
        Some(limit) => wait_with_timeout(&mut child, limit),
        None => child
            .wait()
            .map_err(|e| StepError::Execution(format!("failed to wait for '{}': {}", cmd.program, e))),
    };

    // Not joined on failure: a surviving descendant may still hold the pipes.
    let status = status?;
    let stdout = join_reader(stdout_reader);
    let stderr = join_reader(stderr_reader);
    let exit_code = exit_status_code(&status);

    if status.success() {
        return Ok(StepOutput {
            stdout,
            stderr,
            exit_code,
        });
    }

    error!(
        "Command '{}' failed with exit code: {:?}",
        cmd.program, exit_code
    );
    if !stderr.trim().is_empty() {
        error!("stderr:\n{}", stderr);
    }
    if !stdout.trim().is_empty() {
        debug!("stdout:\n{}", stdout);
    }

    Err(StepError::ExitStatus {
        code: exit_code,
        stderr: tail_lines(&stderr, STDERR_TAIL_LINES),
    })
}

fn wait_with_timeout(child: &mut Child, limit: Duration) -> Result<ExitStatus, StepError> {
    let deadline = Instant::now() + limit;

    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(status),
            Ok(None) if Instant::now() >= deadline => {
                warn!("Killing process {} after {:.1?}", child.id(), limit);
                kill_process_tree(child);
                return Err(StepError::Timeout(limit));
            }
            Ok(None) => thread::sleep(TIMEOUT_POLL_INTERVAL),
            Err(e) => return Err(StepError::Execution(format!("failed to poll process: {}", e))),
        }
    }
}

/// Kills the child and, on Unix, every process in its group.
fn kill_process_tree(child: &mut Child) {
    #[cfg(unix)]
    {
        let group = format!("-{}", child.id());
        match Command::new("kill")
            .args(["-KILL", "--", group.as_str()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
        {
            Ok(status) if status.success() => {}
            Ok(status) => warn!("kill for process group {} exited with {}", child.id(), status),
            Err(e) => warn!("Failed to signal process group {}: {}", child.id(), e),
        }
    }
    if let Err(e) = child.kill() {
        debug!("Failed to kill process {}: {}", child.id(), e);
    }
    let _ = child.wait();
}

type Reader = Option<thread::JoinHandle<String>>;

/// Drains a pipe on its own thread so neither stream can fill and block the child.
fn spawn_reader<R: Read + Send + 'static>(pipe: Option<R>) -> Reader {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            if let Err(e) = pipe.read_to_end(&mut buf) {
                warn!("Failed to read process output: {}", e);
            }
            String::from_utf8_lossy(&buf).into_owned()
        })
    })
}

fn join_reader(reader: Reader) -> String {
    reader
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

/// Exit code, using 128+signal for signal-terminated processes on Unix.
fn exit_status_code(status: &ExitStatus) -> Option<i32> {
    if let Some(code) = status.code() {
        return Some(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return Some(128 + signal);
        }
    }
    None
}

fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.trim_end().lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

/// Creates parent directories for declared artifacts.
pub fn ensure_artifact_directories(artifacts: &[PathBuf]) -> Result<(), StepError> {
    for path in artifacts {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| {
                    StepError::Execution(format!(
                        "failed to create directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
                debug!("Created directory: {}", parent.display());
            }
        }
    }
    Ok(())
}
