//! StepFlow CLI Entry Point
//!
//! Runs a YAML pipeline through the execution engine.
//!
//! # Usage
//!
//! ```bash
//! # Execute a pipeline
//! stepflow pipeline.yaml
//!
//! # Continue an interrupted or failed run
//! stepflow pipeline.yaml --resume
//!
//! # Dry run mode (preview commands)
//! stepflow pipeline.yaml --dry-run
//!
//! # With pause control
//! stepflow pipeline.yaml --pause-flag /tmp/pause.flag
//!
//! # Set working directory and parallelism
//! stepflow pipeline.yaml --working-dir /data/run1 --parallel 8
//! ```

use std::env;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use colored::Colorize;
use log::{error, info};

use stepflow::execution::DEFAULT_CONCURRENCY;
use stepflow::workflow::load_pipeline;
use stepflow::{DependencyGraph, ExecutionEngine, RunLedger, RunResult, StepStatus, APP_NAME, VERSION};

/// Directory holding ledgers when `--ledger` is not given.
const LEDGER_DIR: &str = ".stepflow";

/// Command-line configuration parsed from arguments.
#[derive(Debug)]
struct Config {
    pipeline_path: Option<String>,
    ledger_path: Option<PathBuf>,
    pause_flag_path: Option<PathBuf>,
    working_dir: Option<PathBuf>,
    parallel: usize,
    step_timeout: Option<Duration>,
    resume: bool,
    retry_failed: bool,
    dry_run: bool,
    verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pipeline_path: None,
            ledger_path: None,
            pause_flag_path: None,
            working_dir: None,
            parallel: *DEFAULT_CONCURRENCY,
            step_timeout: None,
            resume: false,
            retry_failed: true,
            dry_run: false,
            verbose: false,
        }
    }
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME.bold(), VERSION);
    println!("Step Dependency Execution Engine");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: stepflow [OPTIONS] <PIPELINE_FILE> [PAUSE_FLAG_PATH]");
    println!();
    println!("Arguments:");
    println!("  <PIPELINE_FILE>     Path to pipeline YAML file");
    println!("  [PAUSE_FLAG_PATH]   Optional path for pause/resume control");
    println!();
    println!("Options:");
    println!("  --ledger PATH       Run ledger file (default: {}/<name>.ledger.jsonl)", LEDGER_DIR);
    println!("  --resume            Skip steps the ledger records as done");
    println!("  --no-retry          With --resume, keep failed steps failed");
    println!("  --dry-run           Preview commands without execution");
    println!("  --working-dir PATH  Directory for commands and relative artifacts");
    println!("  --parallel N        Maximum parallel steps (default: {})", *DEFAULT_CONCURRENCY);
    println!("  --timeout SECS      Time limit for steps without their own");
    println!("  --pause-flag PATH   Pause dispatch while this file exists");
    println!("  --verbose           Enable debug logging and print a timeline");
    println!("  --help              Show this help message");
    println!("  --version           Show version information");
    println!();
    println!("Examples:");
    println!("  stepflow pipeline.yaml");
    println!("  stepflow pipeline.yaml --resume --no-retry");
    println!("  stepflow pipeline.yaml --working-dir /data/run1 --parallel 8");
}

fn next_value<'a>(args: &'a [String], i: &mut usize, flag: &str, what: &str) -> Result<&'a str, String> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("{} requires a {} argument", flag, what))
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut positional_index = 0;
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--dry-run" => config.dry_run = true,
            "--verbose" | "-v" => config.verbose = true,
            "--resume" => config.resume = true,
            "--no-retry" => config.retry_failed = false,
            "--ledger" => {
                config.ledger_path = Some(PathBuf::from(next_value(args, &mut i, arg, "path")?));
            }
            "--working-dir" => {
                config.working_dir = Some(PathBuf::from(next_value(args, &mut i, arg, "path")?));
            }
            "--pause-flag" => {
                config.pause_flag_path = Some(PathBuf::from(next_value(args, &mut i, arg, "path")?));
            }
            "--parallel" => {
                let value = next_value(args, &mut i, arg, "number")?;
                config.parallel = match value.parse() {
                    Ok(n) if n > 0 => n,
                    _ => return Err(format!("Invalid parallel value: {}", value)),
                };
            }
            "--timeout" => {
                let value = next_value(args, &mut i, arg, "number")?;
                let secs: u64 = value
                    .parse()
                    .map_err(|_| format!("Invalid timeout value: {}", value))?;
                config.step_timeout = Some(Duration::from_secs(secs));
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                // Positional argument
                match positional_index {
                    0 => config.pipeline_path = Some(arg.clone()),
                    1 => config.pause_flag_path = Some(PathBuf::from(arg)),
                    _ => return Err(format!("Unexpected argument: {}", arg)),
                }
                positional_index += 1;
            }
        }
        i += 1;
    }

    if config.pipeline_path.is_none() {
        return Err("Missing pipeline file".to_string());
    }

    Ok(config)
}

/// Default ledger location for a pipeline: `.stepflow/<stem>.ledger.jsonl`
/// under the working directory, or the current directory.
fn default_ledger_path(pipeline: &str, working_dir: Option<&Path>) -> PathBuf {
    let stem = Path::new(pipeline)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("pipeline");
    let file = PathBuf::from(LEDGER_DIR).join(format!("{}.ledger.jsonl", stem));
    match working_dir {
        Some(dir) => dir.join(file),
        None => file,
    }
}

/// Validates the working directory.
fn check_working_directory(dir: &Path) -> Result<(), Box<dyn std::error::Error>> {
    if !dir.exists() {
        return Err(format!("Working directory does not exist: {}", dir.display()).into());
    }
    if !dir.is_dir() {
        return Err(format!("Path is not a directory: {}", dir.display()).into());
    }
    info!("Working directory: {}", dir.display());
    Ok(())
}

/// Prints per-status counts and the run outcome.
fn print_summary(graph: &DependencyGraph, result: &RunResult) {
    println!();
    println!("{}", "Summary".bold());
    for (status, count) in graph.summary() {
        let line = format!("  {:<8} {}", status, count);
        let line = match status.as_str() {
            "Done" => line.green(),
            "Failed" => line.red(),
            "Skipped" => line.yellow(),
            _ => line.normal(),
        };
        println!("{}", line);
    }

    let failure_lines = graph
        .iter()
        .filter(|s| s.status() == StepStatus::Failed)
        .filter_map(|s| s.failure().map(|f| format!("  {} '{}': {}", s.id, s.name, f)));
    for line in failure_lines {
        println!("{}", line.red());
    }

    println!();
    match result {
        RunResult::Completed => println!("{}", "Pipeline completed successfully".green().bold()),
        RunResult::PartiallyFailed { failed, skipped } => println!(
            "{}",
            format!(
                "Pipeline finished with {} failed and {} skipped steps",
                failed.len(),
                skipped.len()
            )
            .red()
            .bold()
        ),
        RunResult::Cancelled { skipped } => println!(
            "{}",
            format!("Pipeline cancelled ({} steps not started)", skipped.len())
                .yellow()
                .bold()
        ),
    }
}

/// Main application entry point.
fn run() -> Result<RunResult, Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    // Parse arguments
    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(config.verbose);
    print_banner();

    let pipeline_path = config.pipeline_path.unwrap_or_default();
    if let Some(dir) = &config.working_dir {
        check_working_directory(dir)?;
    }

    let mut graph = load_pipeline(&pipeline_path).map_err(|e| {
        error!("Failed to load pipeline: {}", e);
        format!("Could not load pipeline from '{}': {}", pipeline_path, e)
    })?;
    info!("Pipeline loaded: {} steps", graph.len());

    let ledger_path = config
        .ledger_path
        .unwrap_or_else(|| default_ledger_path(&pipeline_path, config.working_dir.as_deref()));
    let mut ledger = RunLedger::open(&ledger_path)?;
    if !config.resume && !config.dry_run {
        // A fresh run must not inherit statuses from an older one.
        ledger.clear()?;
    }

    let mut engine = ExecutionEngine::new(ledger);
    engine.set_dry_run(config.dry_run);
    engine.set_retry_failed(config.retry_failed);
    if let Some(dir) = config.working_dir {
        engine.set_working_dir(dir);
    }
    if let Some(path) = config.pause_flag_path {
        info!("Pause control: {}", path.display());
        engine.set_pause_flag_path(path);
    }
    if let Some(timeout) = config.step_timeout {
        engine.set_step_timeout(timeout);
    }

    if config.dry_run {
        info!("Mode: DRY RUN (commands will not execute)");
    }

    let result = if config.resume {
        engine.resume(&mut graph, config.parallel)?
    } else {
        engine.run(&mut graph, config.parallel)?
    };

    print_summary(&graph, &result);
    if config.verbose {
        println!("{}", engine.timeline().gantt_chart());
    }

    Ok(result)
}

fn main() -> ExitCode {
    match run() {
        Ok(result) if result.is_completed() => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
