pub mod config;
pub mod diagnostics;
pub mod error;
pub mod model;
pub mod validator;

pub use config::Config;
pub use error::{FlowriteError, Result};
pub use model::{
    parse_workflow_file, parse_workflow_str, Job, JobId, JobMap, JobResult, JobStatus, LoopSpec,
    Step, StepId, StepResult, Workflow, WorkflowResult,
};
