//! Structural validation of a parsed `Workflow`: the checks that need the
//! whole job set at once (reference integrity, cycles) rather than a single
//! job in isolation, which `Job::from_raw` already enforces.

use std::collections::HashMap;

use crate::error::FlowriteError;
use crate::model::{JobId, Workflow};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Runs all structural checks and returns every violation found, rather than
/// stopping at the first one, so a single `flowrite run` reports everything
/// wrong with the document in one pass.
pub fn validate(workflow: &Workflow) -> Result<(), FlowriteError> {
    let mut errors = Vec::new();

    if workflow.jobs.is_empty() {
        errors.push("workflow declares no jobs".to_string());
    }

    for (job_id, job) in workflow.jobs.iter() {
        for dep in &job.needs {
            if !workflow.jobs.contains_key(dep) {
                errors.push(format!(
                    "job '{job_id}' needs undeclared job '{dep}'"
                ));
            }
        }
    }

    if errors.is_empty() {
        if let Some(cycle) = find_cycle(workflow) {
            errors.push(format!(
                "circular dependency detected: {}",
                cycle
                    .iter()
                    .map(|j| j.0.as_str())
                    .collect::<Vec<_>>()
                    .join(" -> ")
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(FlowriteError::Validation(errors))
    }
}

/// Three-color DFS cycle detection. Returns the cycle (including the
/// repeated job at both ends) if one exists.
fn find_cycle(workflow: &Workflow) -> Option<Vec<JobId>> {
    let mut color: HashMap<&JobId, Color> = workflow
        .jobs
        .keys()
        .map(|id| (id, Color::White))
        .collect();
    let mut stack: Vec<JobId> = Vec::new();

    for start in workflow.jobs.keys() {
        if color[start] == Color::White {
            if let Some(cycle) = visit(workflow, start, &mut color, &mut stack) {
                return Some(cycle);
            }
        }
    }
    None
}

fn visit<'a>(
    workflow: &'a Workflow,
    job_id: &'a JobId,
    color: &mut HashMap<&'a JobId, Color>,
    stack: &mut Vec<JobId>,
) -> Option<Vec<JobId>> {
    color.insert(job_id, Color::Gray);
    stack.push(job_id.clone());

    let job = workflow
        .jobs
        .get(job_id)
        .expect("job_id comes from workflow.jobs.keys()");
    for dep in &job.needs {
        match color.get(dep).copied() {
            Some(Color::White) => {
                if let Some(cycle) = visit(workflow, dep, color, stack) {
                    return Some(cycle);
                }
            }
            Some(Color::Gray) => {
                let start = stack.iter().position(|j| j == dep).unwrap_or(0);
                let mut cycle: Vec<JobId> = stack[start..].to_vec();
                cycle.push(dep.clone());
                return Some(cycle);
            }
            Some(Color::Black) | None => {}
        }
    }

    stack.pop();
    color.insert(job_id, Color::Black);
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::parse_workflow_str;

    #[test]
    fn empty_jobs_is_rejected() {
        let wf = parse_workflow_str("jobs: {}").unwrap();
        let err = validate(&wf).unwrap_err();
        assert!(err.to_string().contains("no jobs"));
    }

    #[test]
    fn undeclared_dependency_is_rejected() {
        let wf = parse_workflow_str(
            r#"
jobs:
  a:
    needs: ghost
    steps: [{ run: "true" }]
"#,
        )
        .unwrap();
        let err = validate(&wf).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn direct_cycle_is_detected() {
        let wf = parse_workflow_str(
            r#"
jobs:
  a:
    needs: b
    steps: [{ run: "true" }]
  b:
    needs: a
    steps: [{ run: "true" }]
"#,
        )
        .unwrap();
        let err = validate(&wf).unwrap_err();
        assert!(err.to_string().contains("circular"));
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let wf = parse_workflow_str(
            r#"
jobs:
  a:
    needs: a
    steps: [{ run: "true" }]
"#,
        )
        .unwrap();
        let err = validate(&wf).unwrap_err();
        assert!(err.to_string().contains("circular"));
    }

    #[test]
    fn diamond_shaped_graph_is_valid() {
        let wf = parse_workflow_str(
            r#"
jobs:
  a:
    steps: [{ run: "true" }]
  b:
    needs: a
    steps: [{ run: "true" }]
  c:
    needs: a
    steps: [{ run: "true" }]
  d:
    needs: [b, c]
    steps: [{ run: "true" }]
"#,
        )
        .unwrap();
        assert!(validate(&wf).is_ok());
    }
}
