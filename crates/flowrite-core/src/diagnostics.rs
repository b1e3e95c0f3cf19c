//! Scheduler diagnostics: for every job that hasn't finished yet, explain
//! *why* (waiting on dependencies, guard condition false, or genuinely
//! ready). The scheduler calls `diagnose_remaining_jobs` whenever a poll
//! iteration finds no ready job but the workflow isn't done, both to decide
//! whether to mark `if:`-failed jobs Skipped and to report a stuck scheduler.
//!
//! Condition evaluation itself lives one layer up, in the expression
//! evaluator, so this module takes it as a closure rather than depending on
//! it directly.

use std::collections::HashMap;

use crate::model::{JobId, JobStatus, Workflow};

#[derive(Debug, Clone, PartialEq)]
pub enum JobReadiness {
    Ready,
    WaitingForDependencies { missing: Vec<JobId> },
    ConditionNotMet { condition: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobDiagnostic {
    pub job_id: JobId,
    pub readiness: JobReadiness,
}

/// Diagnoses every job not yet present in `finished`. `eval_condition` is
/// called with a job's `if:` string only once all of its dependencies have
/// finished.
pub fn diagnose_remaining_jobs<F>(
    workflow: &Workflow,
    finished: &HashMap<JobId, JobStatus>,
    mut eval_condition: F,
) -> Vec<JobDiagnostic>
where
    F: FnMut(&str) -> bool,
{
    let mut diagnostics = Vec::new();

    for (job_id, job) in workflow.jobs.iter() {
        if finished.contains_key(job_id) {
            continue;
        }

        let missing: Vec<JobId> = job
            .needs
            .iter()
            .filter(|dep| !finished.contains_key(*dep))
            .cloned()
            .collect();

        let readiness = if !missing.is_empty() {
            JobReadiness::WaitingForDependencies { missing }
        } else {
            match &job.if_condition {
                Some(condition) if !eval_condition(condition) => {
                    JobReadiness::ConditionNotMet {
                        condition: condition.clone(),
                    }
                }
                _ => JobReadiness::Ready,
            }
        };

        diagnostics.push(JobDiagnostic {
            job_id: job_id.clone(),
            readiness,
        });
    }

    diagnostics
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::parse_workflow_str;

    fn wf() -> Workflow {
        parse_workflow_str(
            r#"
jobs:
  a:
    steps: [{ run: "true" }]
  b:
    needs: a
    steps: [{ run: "true" }]
  c:
    needs: a
    if: "needs.a.outputs.ok == 'yes'"
    steps: [{ run: "true" }]
"#,
        )
        .unwrap()
    }

    #[test]
    fn job_with_unfinished_dependency_is_waiting() {
        let workflow = wf();
        let finished = HashMap::new();
        let diags = diagnose_remaining_jobs(&workflow, &finished, |_| true);
        let b = diags
            .iter()
            .find(|d| d.job_id == JobId::from("b"))
            .unwrap();
        assert_eq!(
            b.readiness,
            JobReadiness::WaitingForDependencies {
                missing: vec![JobId::from("a")]
            }
        );
    }

    #[test]
    fn job_with_false_condition_is_condition_not_met() {
        let workflow = wf();
        let mut finished = HashMap::new();
        finished.insert(JobId::from("a"), JobStatus::Completed);
        let diags = diagnose_remaining_jobs(&workflow, &finished, |_| false);
        let c = diags
            .iter()
            .find(|d| d.job_id == JobId::from("c"))
            .unwrap();
        assert!(matches!(c.readiness, JobReadiness::ConditionNotMet { .. }));
    }

    #[test]
    fn job_with_satisfied_dependencies_and_condition_is_ready() {
        let workflow = wf();
        let mut finished = HashMap::new();
        finished.insert(JobId::from("a"), JobStatus::Completed);
        let diags = diagnose_remaining_jobs(&workflow, &finished, |_| true);
        let b = diags
            .iter()
            .find(|d| d.job_id == JobId::from("b"))
            .unwrap();
        assert_eq!(b.readiness, JobReadiness::Ready);
    }
}
