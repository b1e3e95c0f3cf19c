//! The typed workflow document: workflow -> jobs -> steps -> loop specs.
//!
//! Raw YAML is decoded into `Raw*` shapes by `serde`, then coerced into the
//! typed `Workflow`/`Job`/`Step`/`LoopSpec` entities by explicit `TryFrom`
//! constructors that perform the shape coercion (`needs` scalar-or-list,
//! `if`/`runs-on` aliasing, loop-shape rejection) and enforce the
//! construction-time invariants (step id uniqueness, `max_iterations >= 1`).
//! Reference-integrity checks (needs existence, cycles) are *not* done here;
//! they belong to `crate::validator`, which needs the whole job set at once.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use serde::Deserialize;

use crate::error::{FlowriteError, Result};

/// A job identifier. Newtype over `String` so call sites can't confuse a job
/// id with an arbitrary string key (e.g. an output name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub String);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        JobId(s.to_string())
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        JobId(s)
    }
}

/// A step identifier, scoped to the job that declares it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StepId(pub String);

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StepId {
    fn from(s: &str) -> Self {
        StepId(s.to_string())
    }
}

/// At most one of `until`/`foreach` may be present (§3 LoopSpec).
#[derive(Debug, Clone, PartialEq)]
pub enum LoopSpec {
    Until { until: String, max_iterations: u32 },
    Foreach { foreach: String, max_iterations: Option<u32> },
}

impl LoopSpec {
    fn from_raw(raw: RawLoopSpec, context: &str) -> Result<Self> {
        match (raw.until, raw.foreach) {
            (Some(_), Some(_)) => Err(FlowriteError::Parse(format!(
                "{context}: loop cannot declare both 'until' and 'foreach'"
            ))),
            (Some(until), None) => {
                let max_iterations = raw.max_iterations.ok_or_else(|| {
                    FlowriteError::Parse(format!(
                        "{context}: an 'until' loop requires 'max_iterations'"
                    ))
                })?;
                if max_iterations < 1 {
                    return Err(FlowriteError::Parse(format!(
                        "{context}: max_iterations must be >= 1"
                    )));
                }
                Ok(LoopSpec::Until { until, max_iterations })
            }
            (None, Some(foreach)) => {
                if let Some(n) = raw.max_iterations {
                    if n < 1 {
                        return Err(FlowriteError::Parse(format!(
                            "{context}: max_iterations must be >= 1"
                        )));
                    }
                }
                Ok(LoopSpec::Foreach {
                    foreach,
                    max_iterations: raw.max_iterations,
                })
            }
            (None, None) => Err(FlowriteError::Parse(format!(
                "{context}: loop must declare either 'until' or 'foreach'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RawLoopSpec {
    #[serde(default)]
    until: Option<String>,
    #[serde(default)]
    foreach: Option<String>,
    #[serde(default)]
    max_iterations: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct Step {
    pub name: Option<String>,
    pub id: Option<StepId>,
    pub run: Option<String>,
    pub loop_spec: Option<LoopSpec>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawStep {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    run: Option<String>,
    #[serde(default, rename = "loop")]
    loop_spec: Option<RawLoopSpec>,
}

impl Step {
    fn from_raw(raw: RawStep, job_id: &str, index: usize) -> Result<Self> {
        let id = raw.id.map(StepId);
        let context = match &id {
            Some(id) => format!("step '{id}' in job '{job_id}'"),
            None => format!("step {index} in job '{job_id}'"),
        };
        let loop_spec = raw
            .loop_spec
            .map(|l| LoopSpec::from_raw(l, &context))
            .transpose()?;
        Ok(Step {
            name: raw.name,
            id,
            run: raw.run,
            loop_spec,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub name: Option<String>,
    pub runs_on: Option<String>,
    pub needs: Vec<JobId>,
    pub if_condition: Option<String>,
    pub outputs: HashMap<String, String>,
    pub steps: Vec<Step>,
    pub loop_spec: Option<LoopSpec>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawJob {
    #[serde(default)]
    name: Option<String>,
    #[serde(default, rename = "runs-on")]
    runs_on: Option<String>,
    #[serde(default, deserialize_with = "deserialize_scalar_or_list")]
    needs: Vec<String>,
    #[serde(default, rename = "if")]
    if_condition: Option<String>,
    #[serde(default)]
    outputs: HashMap<String, String>,
    #[serde(default)]
    steps: Vec<RawStep>,
    #[serde(default, rename = "loop")]
    loop_spec: Option<RawLoopSpec>,
}

fn deserialize_scalar_or_list<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ScalarOrList {
        Scalar(String),
        List(Vec<String>),
    }
    Ok(match Option::<ScalarOrList>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(ScalarOrList::Scalar(s)) => vec![s],
        Some(ScalarOrList::List(v)) => v,
    })
}

impl Job {
    fn from_raw(raw: RawJob, job_id: &str) -> Result<Self> {
        let mut steps = Vec::with_capacity(raw.steps.len());
        let mut seen_step_ids = std::collections::HashSet::new();
        for (index, raw_step) in raw.steps.into_iter().enumerate() {
            let step = Step::from_raw(raw_step, job_id, index)?;
            if let Some(id) = &step.id {
                if !seen_step_ids.insert(id.clone()) {
                    return Err(FlowriteError::Parse(format!(
                        "job '{job_id}': duplicate step id '{id}'"
                    )));
                }
            }
            steps.push(step);
        }

        let loop_spec = raw
            .loop_spec
            .map(|l| LoopSpec::from_raw(l, &format!("job '{job_id}'")))
            .transpose()?;

        Ok(Job {
            name: raw.name,
            runs_on: raw.runs_on,
            needs: raw.needs.into_iter().map(JobId).collect(),
            if_condition: raw.if_condition,
            outputs: raw.outputs,
            steps,
            loop_spec,
        })
    }
}

/// Jobs in declaration order. Scheduling order is determined solely by the
/// dependency graph and condition outcomes (§3); this only preserves order
/// for diagnostic reporting, so it's a flat `Vec` rather than a `HashMap`.
#[derive(Debug, Clone, Default)]
pub struct JobMap {
    entries: Vec<(JobId, Job)>,
}

impl JobMap {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &JobId) -> Option<&Job> {
        self.entries.iter().find(|(k, _)| k == id).map(|(_, v)| v)
    }

    pub fn contains_key(&self, id: &JobId) -> bool {
        self.entries.iter().any(|(k, _)| k == id)
    }

    pub fn keys(&self) -> impl Iterator<Item = &JobId> {
        self.entries.iter().map(|(k, _)| k)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&JobId, &Job)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }
}

#[derive(Debug, Clone)]
pub struct Workflow {
    pub name: Option<String>,
    pub jobs: JobMap,
}

#[derive(Debug, Deserialize)]
struct RawWorkflowFields {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    on: Option<serde_yaml::Value>,
    jobs: serde_yaml::Mapping,
}

const ACCEPTED_TOP_LEVEL_KEYS: [&str; 3] = ["name", "jobs", "on"];

fn reject_unknown_top_level_keys(doc: &serde_yaml::Mapping) -> Result<()> {
    for key in doc.keys() {
        let key_str = key.as_str().unwrap_or("<non-string key>");
        if !ACCEPTED_TOP_LEVEL_KEYS.contains(&key_str) {
            return Err(FlowriteError::Parse(format!(
                "unknown workflow key '{key_str}': expected one of {}",
                ACCEPTED_TOP_LEVEL_KEYS.join(", ")
            )));
        }
    }
    Ok(())
}

/// Parses and coerces a workflow document from a raw YAML string.
pub fn parse_workflow_str(source: &str) -> Result<Workflow> {
    let value: serde_yaml::Value = serde_yaml::from_str(source).map_err(|e| {
        FlowriteError::Yaml {
            path: Path::new("<string>").to_path_buf(),
            source: e,
        }
    })?;

    let doc = value.as_mapping().cloned().ok_or_else(|| {
        FlowriteError::Parse("workflow document must be a YAML mapping".to_string())
    })?;
    reject_unknown_top_level_keys(&doc)?;

    let fields: RawWorkflowFields = serde_yaml::from_value(value).map_err(|e| {
        FlowriteError::Yaml {
            path: Path::new("<string>").to_path_buf(),
            source: e,
        }
    })?;

    let mut jobs = JobMap::default();
    for (key, job_value) in fields.jobs.iter() {
        let job_id = key
            .as_str()
            .ok_or_else(|| FlowriteError::Parse("job ids must be strings".to_string()))?
            .to_string();
        let raw_job: RawJob = serde_yaml::from_value(job_value.clone()).map_err(|e| {
            FlowriteError::Parse(format!("job '{job_id}': {e}"))
        })?;
        let job = Job::from_raw(raw_job, &job_id)?;
        jobs.entries.push((JobId(job_id), job));
    }

    Ok(Workflow {
        name: fields.name,
        jobs,
    })
}

/// Parses and coerces a workflow document from a file on disk.
pub fn parse_workflow_file(path: &Path) -> Result<Workflow> {
    let content = std::fs::read_to_string(path).map_err(|e| FlowriteError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;
    parse_workflow_str(&content).map_err(|e| match e {
        FlowriteError::Yaml { source, .. } => FlowriteError::Yaml {
            path: path.to_path_buf(),
            source,
        },
        other => other,
    })
}

// --- Runtime result types (§3) ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl JobStatus {
    /// The normalized status name used by `needs.J.result == 'V'` (§4.C):
    /// `Completed` maps to `success`, everything else to its lowercase name.
    pub fn normalized_name(&self) -> &'static str {
        match self {
            JobStatus::Completed => "success",
            JobStatus::Failed => "failed",
            JobStatus::Skipped => "skipped",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobResult {
    pub job_id: JobId,
    pub status: JobStatus,
    pub outputs: HashMap<String, String>,
    pub error: Option<String>,
}

impl JobResult {
    pub fn completed(job_id: JobId, outputs: HashMap<String, String>) -> Self {
        JobResult {
            job_id,
            status: JobStatus::Completed,
            outputs,
            error: None,
        }
    }

    pub fn failed(job_id: JobId, error: String) -> Self {
        JobResult {
            job_id,
            status: JobStatus::Failed,
            outputs: HashMap::new(),
            error: Some(error),
        }
    }

    pub fn skipped(job_id: JobId) -> Self {
        JobResult {
            job_id,
            status: JobStatus::Skipped,
            outputs: HashMap::new(),
            error: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StepResult {
    pub success: bool,
    pub outputs: HashMap<String, String>,
    pub env_updates: HashMap<String, String>,
    pub stdout: String,
    pub stderr: String,
    pub error: Option<String>,
}

/// Aggregate result of a full workflow run.
#[derive(Debug, Clone)]
pub struct WorkflowResult {
    pub workflow_name: Option<String>,
    pub status: JobStatus,
    pub jobs: HashMap<JobId, JobResult>,
}

impl WorkflowResult {
    pub fn is_completed(&self) -> bool {
        matches!(self.status, JobStatus::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn needs_scalar_coerces_to_single_element_list() {
        let wf = parse_workflow_str(
            r#"
jobs:
  a:
    steps: [{ run: "true" }]
  b:
    needs: a
    steps: [{ run: "true" }]
"#,
        )
        .unwrap();
        let b = wf.jobs.get(&JobId::from("b")).unwrap();
        assert_eq!(b.needs, vec![JobId::from("a")]);
    }

    #[test]
    fn if_and_runs_on_aliases_are_coerced() {
        let wf = parse_workflow_str(
            r#"
jobs:
  a:
    runs-on: ubuntu-latest
    if: "always()"
    steps: [{ run: "true" }]
"#,
        )
        .unwrap();
        let a = wf.jobs.get(&JobId::from("a")).unwrap();
        assert_eq!(a.runs_on.as_deref(), Some("ubuntu-latest"));
        assert_eq!(a.if_condition.as_deref(), Some("always()"));
    }

    #[test]
    fn unknown_top_level_key_is_rejected() {
        let err = parse_workflow_str(
            r#"
name: x
bogus: 1
jobs:
  a:
    steps: [{ run: "true" }]
"#,
        )
        .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("bogus"));
        assert!(message.contains("name, jobs, on"));
    }

    #[test]
    fn unknown_job_key_is_accepted_silently() {
        let wf = parse_workflow_str(
            r#"
jobs:
  a:
    totally-made-up: true
    steps: [{ run: "true" }]
"#,
        )
        .unwrap();
        assert_eq!(wf.jobs.len(), 1);
    }

    #[test]
    fn loop_with_both_until_and_foreach_is_rejected() {
        let err = parse_workflow_str(
            r#"
jobs:
  a:
    loop: { until: "always()", foreach: "x y", max_iterations: 3 }
    steps: [{ run: "true" }]
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("both"));
    }

    #[test]
    fn until_loop_requires_max_iterations() {
        let err = parse_workflow_str(
            r#"
jobs:
  a:
    loop: { until: "always()" }
    steps: [{ run: "true" }]
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("max_iterations"));
    }

    #[test]
    fn duplicate_step_ids_within_a_job_are_rejected() {
        let err = parse_workflow_str(
            r#"
jobs:
  a:
    steps:
      - id: dup
        run: "true"
      - id: dup
        run: "true"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate step id"));
    }

    #[test]
    fn job_order_is_preserved_for_diagnostics() {
        let wf = parse_workflow_str(
            r#"
jobs:
  zeta:
    steps: [{ run: "true" }]
  alpha:
    steps: [{ run: "true" }]
"#,
        )
        .unwrap();
        let ids: Vec<&str> = wf.jobs.keys().map(|j| j.0.as_str()).collect();
        assert_eq!(ids, vec!["zeta", "alpha"]);
    }
}
