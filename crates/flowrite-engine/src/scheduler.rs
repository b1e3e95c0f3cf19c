//! Drives a workflow to completion.
//!
//! Unlike a fixed topological-sort execution plan, readiness here is
//! recomputed every iteration: a job becomes eligible only once its
//! dependencies have all finished *and* its `if:` guard evaluates true
//! against their actual outcomes, so the set of ready jobs can't be known
//! up front. Each iteration launches every currently-ready job on its own
//! thread and joins the wave before recomputing readiness, the same
//! spawn-a-thread-per-job-then-join shape as a precomputed wave executor,
//! just re-entered on a loop instead of walked once.

use std::collections::HashMap;
use std::thread;

use crossbeam_channel::unbounded;

use flowrite_core::{Config, FlowriteError, Job, JobId, JobResult, JobStatus, Result, Workflow};

use flowrite_core::diagnostics::{diagnose_remaining_jobs, JobReadiness};

use crate::expressions::{evaluate_condition, EvalContext};
use crate::job_runner::{run_job, JobInputs};

#[derive(Debug, Clone)]
pub struct ExecutionState {
    pub job_results: HashMap<JobId, JobResult>,
    pub global_env: HashMap<String, String>,
}

impl ExecutionState {
    fn new(base_env: HashMap<String, String>) -> Self {
        Self {
            job_results: HashMap::new(),
            global_env: base_env,
        }
    }

    fn statuses(&self) -> HashMap<JobId, JobStatus> {
        self.job_results
            .iter()
            .map(|(id, r)| (id.clone(), r.status))
            .collect()
    }

    fn integrate(&mut self, result: JobResult) {
        for (key, value) in &result.outputs {
            self.global_env.insert(
                format!("JOB_{}_{}", result.job_id, key).to_uppercase(),
                value.clone(),
            );
        }
        self.job_results.insert(result.job_id.clone(), result);
    }
}

fn needs_outputs_for(
    job: &Job,
    job_results: &HashMap<JobId, JobResult>,
) -> HashMap<JobId, HashMap<String, String>> {
    job.needs
        .iter()
        .filter_map(|dep| job_results.get(dep).map(|r| (dep.clone(), r.outputs.clone())))
        .collect()
}

fn needs_results_for(job: &Job, finished: &HashMap<JobId, JobStatus>) -> HashMap<JobId, JobStatus> {
    job.needs
        .iter()
        .filter_map(|dep| finished.get(dep).map(|s| (dep.clone(), *s)))
        .collect()
}

fn job_condition_holds(job: &Job, finished: &HashMap<JobId, JobStatus>, state: &ExecutionState) -> bool {
    match &job.if_condition {
        None => true,
        Some(condition) => {
            let ctx = EvalContext {
                needs_outputs: needs_outputs_for(job, &state.job_results),
                needs_results: needs_results_for(job, finished),
                env: state.global_env.clone(),
            };
            evaluate_condition(condition, &ctx)
        }
    }
}

fn ready_jobs(workflow: &Workflow, state: &ExecutionState) -> Vec<JobId> {
    let finished = state.statuses();
    workflow
        .jobs
        .iter()
        .filter(|(id, _)| !finished.contains_key(id))
        .filter(|(_, job)| job.needs.iter().all(|dep| finished.contains_key(dep)))
        .filter(|(_, job)| job_condition_holds(job, &finished, state))
        .map(|(id, _)| id.clone())
        .collect()
}

/// Runs every job in `workflow` to completion, polling readiness between
/// waves. Returns once every job has a recorded result, or an error if no
/// progress can be made while jobs remain.
pub fn run_workflow(
    workflow: &Workflow,
    config: &Config,
    base_env: HashMap<String, String>,
) -> Result<ExecutionState> {
    let mut state = ExecutionState::new(base_env);

    loop {
        if state.job_results.len() == workflow.jobs.len() {
            return Ok(state);
        }

        let ready = ready_jobs(workflow, &state);

        if ready.is_empty() {
            let finished = state.statuses();
            let diagnostics = diagnose_remaining_jobs(workflow, &finished, |condition| {
                let ctx = EvalContext {
                    env: state.global_env.clone(),
                    ..Default::default()
                };
                evaluate_condition(condition, &ctx)
            });

            let mut made_progress = false;
            for diag in &diagnostics {
                if let JobReadiness::ConditionNotMet { .. } = diag.readiness {
                    state.integrate(JobResult::skipped(diag.job_id.clone()));
                    made_progress = true;
                }
            }

            if !made_progress {
                let stuck: Vec<String> = diagnostics.iter().map(|d| d.job_id.to_string()).collect();
                return Err(FlowriteError::SchedulerStuck(format!(
                    "no job is ready and none can be skipped; remaining: {}",
                    stuck.join(", ")
                )));
            }
            continue;
        }

        let (tx, rx) = unbounded();
        for job_id in &ready {
            let job = workflow
                .jobs
                .get(job_id)
                .expect("job_id came from workflow.jobs")
                .clone();
            let finished = state.statuses();
            let inputs = JobInputs {
                needs_outputs: needs_outputs_for(&job, &state.job_results),
                needs_results: needs_results_for(&job, &finished),
                base_env: state.global_env.clone(),
            };
            let config = config.clone();
            let job_id = job_id.clone();
            let tx = tx.clone();
            thread::spawn(move || {
                let result = run_job(&job_id, &job, &inputs, &config);
                let _ = tx.send(result);
            });
        }
        drop(tx);

        for result in rx {
            state.integrate(result);
        }
    }
}

pub fn overall_status(workflow: &Workflow, state: &ExecutionState) -> JobStatus {
    if state
        .job_results
        .values()
        .any(|r| matches!(r.status, JobStatus::Failed))
    {
        JobStatus::Failed
    } else if state.job_results.len() == workflow.jobs.len() {
        JobStatus::Completed
    } else {
        JobStatus::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowrite_core::parse_workflow_str;

    #[test]
    fn runs_dependent_jobs_after_their_dependency() {
        let wf = parse_workflow_str(
            r#"
jobs:
  a:
    steps:
      - id: make
        run: echo "v=1" >> "$GITHUB_OUTPUT"
    outputs:
      v: "${{ steps.make.outputs.v }}"
  b:
    needs: a
    steps:
      - run: echo ${{ needs.a.outputs.v }}
"#,
        )
        .unwrap();
        let state = run_workflow(&wf, &Config::default(), HashMap::new()).unwrap();
        assert_eq!(state.job_results.len(), 2);
        assert!(matches!(
            state.job_results[&JobId::from("a")].status,
            JobStatus::Completed
        ));
        assert!(matches!(
            state.job_results[&JobId::from("b")].status,
            JobStatus::Completed
        ));
    }

    #[test]
    fn job_with_false_condition_is_skipped_not_stuck() {
        let wf = parse_workflow_str(
            r#"
jobs:
  a:
    if: "env.NEVER == 'true'"
    steps: [{ run: "true" }]
"#,
        )
        .unwrap();
        let state = run_workflow(&wf, &Config::default(), HashMap::new()).unwrap();
        assert!(matches!(
            state.job_results[&JobId::from("a")].status,
            JobStatus::Skipped
        ));
    }

    #[test]
    fn failed_job_still_lets_independent_jobs_run() {
        let wf = parse_workflow_str(
            r#"
jobs:
  a:
    steps: [{ run: "exit 1" }]
  b:
    steps: [{ run: "true" }]
"#,
        )
        .unwrap();
        let state = run_workflow(&wf, &Config::default(), HashMap::new()).unwrap();
        assert!(matches!(
            state.job_results[&JobId::from("a")].status,
            JobStatus::Failed
        ));
        assert!(matches!(
            state.job_results[&JobId::from("b")].status,
            JobStatus::Completed
        ));
        assert!(matches!(overall_status(&wf, &state), JobStatus::Failed));
    }
}
