pub mod actions;
pub mod error;
pub mod execution;
pub mod expression;
pub mod reporter;
pub mod runners;
pub mod workflow;

pub use error::{CycleError, ParseError, StepError, WorkflowError, WorkflowResult};
pub use execution::{
    progress_channel, ExecutionEvent, ExecutorConfig, ProgressReceiver, ProgressSender,
    WorkflowExecutor,
};
pub use reporter::Reporter;
pub use workflow::{parse_workflow, parse_workflow_file, RunResult, Workflow};
