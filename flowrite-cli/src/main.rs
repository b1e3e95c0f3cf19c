use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};

use flowrite_core::{Config, FlowriteError};
use flowrite_engine::run_workflow;

#[derive(Parser)]
#[command(author, version, about = "YAML-based workflow execution engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow from a YAML file
    Run {
        /// Path to the workflow YAML file
        yaml_file: PathBuf,
        /// Accepted for compatibility with the original tool's CLI; this
        /// build only ever executes locally, so the flag is a no-op beyond
        /// the startup log line.
        #[arg(long)]
        local: bool,
        /// Raise the log filter to debug and print full error chains
        #[arg(long)]
        verbose: bool,
    },
    /// Start the distributed worker (not implemented by this engine)
    Worker,
    /// Write a sample workflow YAML file to disk
    CreateSample {
        /// Output filename for the sample workflow
        #[arg(short = 'f', long = "file", default_value = "sample_workflow.yaml")]
        filename: PathBuf,
    },
}

/// Installs the `tracing-subscriber` filter, defaulting to `info` unless
/// `--verbose` raises it to `debug` (an explicit `RUST_LOG` still wins).
fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(
            |_| tracing_subscriber::EnvFilter::new(default_filter),
        ))
        .init();
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { yaml_file, local, verbose } => {
            init_tracing(verbose);
            run_command(&yaml_file, local, verbose)
        }
        Commands::Worker => {
            init_tracing(false);
            worker_command()
        }
        Commands::CreateSample { filename } => {
            init_tracing(false);
            create_sample_command(&filename)
        }
    }
}

fn run_command(yaml_file: &PathBuf, local: bool, verbose: bool) {
    let mode_desc = if local { "(local)" } else { "(temporal)" };
    println!("Executing {} {mode_desc}", yaml_file.display());

    let workflow = match load_and_validate(yaml_file) {
        Ok(workflow) => workflow,
        Err(e) => {
            if verbose {
                eprintln!("ERROR: {e:#}");
            } else {
                eprintln!("ERROR: {e}");
            }
            std::process::exit(2);
        }
    };

    let config = Config::from_env();
    let base_env: std::collections::HashMap<String, String> = std::env::vars().collect();

    match run_workflow(&workflow, &config, base_env) {
        Ok(state) => {
            let status = flowrite_engine::scheduler::overall_status(&workflow, &state);
            display_result(&workflow, &state, verbose);
            if matches!(status, flowrite_core::JobStatus::Completed) {
                std::process::exit(0);
            } else {
                eprintln!("FAILED: one or more jobs did not complete successfully");
                std::process::exit(1);
            }
        }
        Err(FlowriteError::SchedulerStuck(msg)) => {
            eprintln!("FAILED: {msg}");
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("FAILED: {e}");
            std::process::exit(1);
        }
    }
}

/// Parses and structurally validates a workflow file. Collapsed into one
/// `anyhow` chain since `run_command` only needs to know "this failed before
/// anything ran" (exit code 2), not which of the two steps it was.
fn load_and_validate(yaml_file: &PathBuf) -> anyhow::Result<flowrite_core::Workflow> {
    let workflow = flowrite_core::parse_workflow_file(yaml_file)
        .with_context(|| format!("failed to parse {}", yaml_file.display()))?;
    flowrite_core::validator::validate(&workflow).context("workflow validation failed")?;
    Ok(workflow)
}

fn display_result(
    workflow: &flowrite_core::Workflow,
    state: &flowrite_engine::ExecutionState,
    verbose: bool,
) {
    println!("Workflow: {}", workflow.name.as_deref().unwrap_or("<unnamed>"));
    println!("Jobs:");
    for job_id in workflow.jobs.keys() {
        let Some(result) = state.job_results.get(job_id) else {
            continue;
        };
        println!("  {job_id}: {:?}", result.status);
        for (key, value) in &result.outputs {
            println!("    {key}={value}");
        }
        if verbose {
            if let Some(error) = &result.error {
                println!("    error: {error}");
            }
        }
    }
}

fn worker_command() {
    eprintln!("Worker failed: distributed execution is out of scope for this build");
    std::process::exit(1);
}

fn create_sample_command(filename: &PathBuf) {
    match std::fs::write(filename, SAMPLE_WORKFLOW) {
        Ok(()) => println!("Created {}", filename.display()),
        Err(e) => {
            eprintln!("Error creating sample file: {e}");
            std::process::exit(1);
        }
    }
}

const SAMPLE_WORKFLOW: &str = r#"name: Simple Parallel Workflow (loop semantics explained)

jobs:
  setup:
    name: Setup and decision job
    runs-on: ubuntu-latest
    outputs:
      run_extra: ${{ steps.decide.outputs.run_extra }}
    steps:
      - name: Setup step
        run: echo "Running setup job"

      - name: Decide whether to run job B
        id: decide
        run: |
          echo "run_extra=true" >> "$GITHUB_OUTPUT"
          echo "Setup decided run_extra=true"

  job_a:
    name: Parallel job A
    runs-on: ubuntu-latest
    needs: setup
    steps:
      - run: echo "Running job A"

  job_b:
    name: Parallel job B (job-level + step-level loops)
    runs-on: ubuntu-latest
    needs: setup
    if: needs.setup.outputs.run_extra == 'true'
    loop:
      until: success()
      max_iterations: 3
    steps:
      - name: Job B attempt start
        run: echo "Starting job B attempt"

      - name: Poll external condition
        id: poll
        loop:
          until: env.POLL_STATUS == 'COMPLETE'
          max_iterations: 5
        run: |
          echo "Polling inside job B..."
          echo "POLL_STATUS=COMPLETE" >> "$GITHUB_ENV"
          echo "POLL_STATUS is now $POLL_STATUS"

      - name: Check completion signal
        id: check
        run: |
          echo "status=COMPLETE" >> "$GITHUB_OUTPUT"
          echo "Job-level completion signaled"

  final:
    name: Final aggregation job
    runs-on: ubuntu-latest
    needs: [job_a, job_b]
    if: always()
    steps:
      - run: echo "Running final job"
"#;
