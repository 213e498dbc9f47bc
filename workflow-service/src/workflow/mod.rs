pub mod models;
pub mod parser;

pub use models::{
    Input, InstanceOutcome, Job, JobStatus, Matrix, RunResult, Step, StepOutcome, StepStatus,
    Workflow,
};
pub use parser::{parse_workflow, parse_workflow_file};
