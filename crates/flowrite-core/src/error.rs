//! Error taxonomy for the workflow model and the engine built on top of it.
//!
//! `StepTimeout`/`StepFailure`/`JobFailure` from the design's error table are
//! deliberately not variants here: per the propagation policy they never
//! escape the job runner, so they travel as plain fields on `StepResult`/
//! `JobResult` instead (see `crate::model`).

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum FlowriteError {
    #[error("failed to read workflow file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML parsing error in {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("{0}")]
    Parse(String),

    #[error("workflow validation failed:\n{}", .0.join("\n"))]
    Validation(Vec<String>),

    #[error("scheduler stuck: {0}")]
    SchedulerStuck(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FlowriteError>;
