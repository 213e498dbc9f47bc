// Error taxonomy for workflow loading and execution
// Parse and graph errors are fatal for the whole run; step errors fail one
// job instance and let skip propagation handle its dependents.

use thiserror::Error;

/// Errors raised while turning a YAML document into a workflow model.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid workflow document: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("{0}")]
    InvalidDefinition(String),

    #[error("missing required input '{0}'")]
    MissingRequiredInput(String),

    #[error("unknown input '{0}'")]
    UnknownInput(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors raised while validating the job-instance graph.
///
/// Both variants abort the run before any job starts.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CycleError {
    #[error("circular dependency detected: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    #[error("job '{job}' depends on unknown job '{dependency}'")]
    UnknownDependency { job: String, dependency: String },
}

/// Errors local to one step of one job instance.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StepError {
    #[error("unresolved variable reference '{0}'")]
    UnresolvedVariable(String),

    #[error("unknown action '{0}'")]
    ActionNotFound(String),

    #[error("invalid assignment target '{0}'")]
    InvalidAssignment(String),

    #[error("command exited with status {0}")]
    Execution(i32),

    #[error("backend error: {0}")]
    Backend(String),
}

impl StepError {
    /// Exit code to report for this failure, when the underlying
    /// command never produced one.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            StepError::Execution(code) => Some(*code),
            _ => None,
        }
    }
}

/// Top-level error for a run that never got to execute anything.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Cycle(#[from] CycleError),
}

pub type WorkflowResult<T> = Result<T, WorkflowError>;
