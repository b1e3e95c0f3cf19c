//! Runs a single job to completion: its steps in order, each subject to its
//! own loop and retry policy, accumulating a per-attempt environment that
//! later steps (and the job's own `outputs:` templates) can read from.
//!
//! A job with no `loop:` runs once. A job with an `until:` loop retries the
//! whole step sequence from scratch on failure, consulting the condition
//! only when an attempt fails — success always stops the loop immediately.
//! A job with a `foreach:` loop runs the step sequence once per item
//! unconditionally, since §4.G's "executes all steps once [per item]" is an
//! explicit override of the generic retry-until shape for this case.

use std::collections::HashMap;
use std::time::Duration;

use flowrite_core::{Config, Job, JobId, JobResult, JobStatus, LoopSpec, Step, StepResult};

use crate::expressions::{evaluate_until, EvalContext};
use crate::shell;
use crate::substitute::{substitute, SubstitutionContext};

/// Everything a job needs from the rest of the workflow to run: its
/// dependencies' outputs/results (for substitution and `until:`/`if:`), and
/// the environment snapshot the scheduler launched it with.
#[derive(Debug, Clone, Default)]
pub struct JobInputs {
    pub needs_outputs: HashMap<JobId, HashMap<String, String>>,
    pub needs_results: HashMap<JobId, JobStatus>,
    pub base_env: HashMap<String, String>,
}

/// `foreach` item parsing, shared by job- and step-level loops: if the raw
/// string contains a newline, split on newlines and drop blank lines after
/// trimming; otherwise split on runs of whitespace. Order is preserved and
/// duplicates are kept, so this is idempotent on newline-joined output.
pub fn parse_foreach_items(raw: &str) -> Vec<String> {
    if raw.contains('\n') {
        raw.lines()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
            .collect()
    } else {
        raw.split_whitespace().map(|s| s.to_string()).collect()
    }
}

fn backoff_for(attempt: u32) -> Duration {
    Duration::from_secs((1u64 << attempt.min(6)).min(60))
}

struct Attempt {
    env: HashMap<String, String>,
    step_outputs: HashMap<String, HashMap<String, String>>,
}

/// Runs every step of `job` once, in order, against a fresh copy of
/// `attempt_env`. Stops at the first failing step.
fn run_steps_once(
    job: &Job,
    inputs: &JobInputs,
    attempt_env: HashMap<String, String>,
    config: &Config,
) -> Result<Attempt, String> {
    let mut env = attempt_env;
    let mut step_outputs: HashMap<String, HashMap<String, String>> = HashMap::new();

    for step in &job.steps {
        let result = run_step(step, &env, &step_outputs, inputs, config)?;
        env.extend(result.env_updates.clone());
        if let Some(id) = &step.id {
            step_outputs.insert(id.0.clone(), result.outputs.clone());
            for (key, value) in &result.outputs {
                env.insert(format!("STEP_{}_{}", id.0, key).to_uppercase(), value.clone());
            }
        }
        if !result.success {
            return Err(result.error.unwrap_or_else(|| "step failed".to_string()));
        }
    }

    Ok(Attempt { env, step_outputs })
}

fn resolve_job_outputs(
    job: &Job,
    inputs: &JobInputs,
    env: &HashMap<String, String>,
    step_outputs: &HashMap<String, HashMap<String, String>>,
) -> HashMap<String, String> {
    let ctx = SubstitutionContext {
        needs_outputs: inputs
            .needs_outputs
            .iter()
            .map(|(k, v)| (k.0.clone(), v.clone()))
            .collect(),
        step_outputs: step_outputs.clone(),
        env: env.clone(),
    };
    job.outputs
        .iter()
        .map(|(key, template)| (key.clone(), substitute(template, &ctx)))
        .collect()
}

/// Runs `job` to completion and returns its `JobResult`. `job` is assumed to
/// already have passed its `if:` guard; that decision belongs to the
/// scheduler.
pub fn run_job(job_id: &JobId, job: &Job, inputs: &JobInputs, config: &Config) -> JobResult {
    match &job.loop_spec {
        Some(LoopSpec::Until { until, max_iterations }) => {
            run_until_job(job_id, job, inputs, until, *max_iterations, config)
        }
        Some(LoopSpec::Foreach { foreach, max_iterations }) => {
            run_foreach_job(job_id, job, inputs, foreach, *max_iterations, config)
        }
        None => run_plain_job(job_id, job, inputs, config),
    }
}

fn run_plain_job(job_id: &JobId, job: &Job, inputs: &JobInputs, config: &Config) -> JobResult {
    match run_steps_once(job, inputs, inputs.base_env.clone(), config) {
        Ok(attempt) => JobResult::completed(
            job_id.clone(),
            resolve_job_outputs(job, inputs, &attempt.env, &attempt.step_outputs),
        ),
        Err(error) => JobResult::failed(job_id.clone(), error),
    }
}

fn run_until_job(
    job_id: &JobId,
    job: &Job,
    inputs: &JobInputs,
    until: &str,
    max_iterations: u32,
    config: &Config,
) -> JobResult {
    let mut last_error = String::new();

    for attempt_index in 0..max_iterations {
        match run_steps_once(job, inputs, inputs.base_env.clone(), config) {
            Ok(attempt) => {
                return JobResult::completed(
                    job_id.clone(),
                    resolve_job_outputs(job, inputs, &attempt.env, &attempt.step_outputs),
                );
            }
            Err(error) => {
                last_error = error;
                let eval_ctx = EvalContext {
                    needs_outputs: inputs.needs_outputs.clone(),
                    needs_results: inputs.needs_results.clone(),
                    env: inputs.base_env.clone(),
                };
                let satisfied = evaluate_until(
                    until,
                    attempt_index + 1,
                    max_iterations,
                    false,
                    &eval_ctx,
                );
                if satisfied || attempt_index + 1 >= max_iterations {
                    return JobResult::failed(job_id.clone(), last_error);
                }
                std::thread::sleep(Duration::from_secs(1));
            }
        }
    }

    JobResult::failed(job_id.clone(), last_error)
}

fn run_foreach_job(
    job_id: &JobId,
    job: &Job,
    inputs: &JobInputs,
    foreach: &str,
    max_iterations: Option<u32>,
    config: &Config,
) -> JobResult {
    let items = parse_foreach_items(foreach);
    let count = max_iterations
        .map(|n| items.len().min(n as usize))
        .unwrap_or(items.len());

    let mut last_attempt: Option<Attempt> = None;
    let mut failure: Option<String> = None;

    for (index, item) in items.iter().take(count).enumerate() {
        let mut env = inputs.base_env.clone();
        env.insert("FOREACH_ITEM".to_string(), item.clone());
        env.insert("FOREACH_INDEX".to_string(), index.to_string());
        env.insert("FOREACH_ITERATION".to_string(), (index + 1).to_string());

        match run_steps_once(job, inputs, env, config) {
            Ok(attempt) => last_attempt = Some(attempt),
            Err(error) => {
                failure.get_or_insert(error);
            }
        }
    }

    match failure {
        Some(error) => JobResult::failed(job_id.clone(), error),
        None => {
            let outputs = match &last_attempt {
                Some(attempt) => resolve_job_outputs(job, inputs, &attempt.env, &attempt.step_outputs),
                None => HashMap::new(),
            };
            JobResult::completed(job_id.clone(), outputs)
        }
    }
}

/// Runs one step, including its own loop and retry policy. A step with no
/// `run:` is a no-op success (e.g. a step that exists purely to declare an
/// `id`/`loop` as a checkpoint).
fn run_step(
    step: &Step,
    env: &HashMap<String, String>,
    step_outputs: &HashMap<String, HashMap<String, String>>,
    inputs: &JobInputs,
    config: &Config,
) -> Result<StepResult, String> {
    let Some(run) = &step.run else {
        return Ok(StepResult {
            success: true,
            ..Default::default()
        });
    };

    match &step.loop_spec {
        Some(LoopSpec::Until { until, max_iterations }) => {
            run_step_until(run, until, *max_iterations, env, step_outputs, inputs, config)
        }
        Some(LoopSpec::Foreach { foreach, max_iterations }) => {
            run_step_foreach(run, foreach, *max_iterations, env, step_outputs, inputs, config)
        }
        None => run_step_with_config_retries(run, env, step_outputs, &inputs.needs_outputs, config),
    }
}

fn execute_step_command(
    run: &str,
    env: &HashMap<String, String>,
    step_outputs: &HashMap<String, HashMap<String, String>>,
    needs_outputs: &HashMap<JobId, HashMap<String, String>>,
    config: &Config,
) -> Result<StepResult, String> {
    let sub_ctx = SubstitutionContext {
        needs_outputs: needs_outputs
            .iter()
            .map(|(k, v)| (k.0.clone(), v.clone()))
            .collect(),
        step_outputs: step_outputs.clone(),
        env: env.clone(),
    };
    let command = substitute(run, &sub_ctx);
    let timeout = Duration::from_secs(config.step_timeout_seconds);

    let outcome = shell::execute(&command, timeout).map_err(|e| e.to_string())?;
    if outcome.success() {
        Ok(StepResult {
            success: true,
            outputs: outcome.side_channel.outputs,
            env_updates: outcome.side_channel.env,
            stdout: outcome.side_channel.user_stdout,
            stderr: outcome.stderr,
            error: None,
        })
    } else {
        let message = if outcome.timed_out {
            format!("step timed out after {}s", config.step_timeout_seconds)
        } else {
            format!(
                "step exited with code {}",
                outcome
                    .exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "unknown".to_string())
            )
        };
        Ok(StepResult {
            success: false,
            outputs: outcome.side_channel.outputs,
            env_updates: outcome.side_channel.env,
            stdout: outcome.side_channel.user_stdout,
            stderr: outcome.stderr,
            error: Some(message),
        })
    }
}

/// §4.G step loop: at most `max_iterations` invocations of the Sub-Executor.
/// Success stops the loop immediately; on failure, `until` is consulted
/// (with the failing attempt's own env mutations visible to it, though
/// those mutations never propagate to the next attempt or to the job env).
fn run_step_until(
    run: &str,
    until: &str,
    max_iterations: u32,
    env: &HashMap<String, String>,
    step_outputs: &HashMap<String, HashMap<String, String>>,
    inputs: &JobInputs,
    config: &Config,
) -> Result<StepResult, String> {
    for attempt_index in 0..max_iterations {
        let outcome = execute_step_command(run, env, step_outputs, &inputs.needs_outputs, config)?;
        if outcome.success {
            return Ok(outcome);
        }

        let mut eval_env = env.clone();
        eval_env.extend(outcome.env_updates.clone());
        let eval_ctx = EvalContext {
            needs_outputs: inputs.needs_outputs.clone(),
            needs_results: inputs.needs_results.clone(),
            env: eval_env,
        };
        let satisfied = evaluate_until(until, attempt_index + 1, max_iterations, false, &eval_ctx);
        if satisfied || attempt_index + 1 >= max_iterations {
            return Ok(outcome);
        }
        std::thread::sleep(backoff_for(attempt_index));
    }
    unreachable!("max_iterations >= 1 guarantees at least one iteration")
}

fn run_step_foreach(
    run: &str,
    foreach: &str,
    max_iterations: Option<u32>,
    env: &HashMap<String, String>,
    step_outputs: &HashMap<String, HashMap<String, String>>,
    inputs: &JobInputs,
    config: &Config,
) -> Result<StepResult, String> {
    let items = parse_foreach_items(foreach);
    let count = max_iterations
        .map(|n| items.len().min(n as usize))
        .unwrap_or(items.len());

    let mut last = StepResult {
        success: true,
        ..Default::default()
    };
    let mut first_failure = None;

    for (index, item) in items.iter().take(count).enumerate() {
        let mut item_env = env.clone();
        item_env.insert("FOREACH_ITEM".to_string(), item.clone());
        item_env.insert("FOREACH_INDEX".to_string(), index.to_string());
        item_env.insert("FOREACH_ITERATION".to_string(), (index + 1).to_string());

        last = execute_step_command(run, &item_env, step_outputs, &inputs.needs_outputs, config)?;
        if !last.success && first_failure.is_none() {
            first_failure = Some(last.clone());
        }
    }

    Ok(first_failure.unwrap_or(last))
}

/// No explicit loop: retry on failure up to `config.max_retries` additional
/// times with exponential backoff, succeeding on the first success.
fn run_step_with_config_retries(
    run: &str,
    env: &HashMap<String, String>,
    step_outputs: &HashMap<String, HashMap<String, String>>,
    needs_outputs: &HashMap<JobId, HashMap<String, String>>,
    config: &Config,
) -> Result<StepResult, String> {
    let mut last = execute_step_command(run, env, step_outputs, needs_outputs, config)?;
    for attempt_index in 0..config.max_retries {
        if last.success {
            break;
        }
        std::thread::sleep(backoff_for(attempt_index));
        last = execute_step_command(run, env, step_outputs, needs_outputs, config)?;
    }
    Ok(last)
}
