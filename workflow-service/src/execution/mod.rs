pub mod events;
pub mod executor;
pub mod graph;
pub mod matrix;
pub mod scope;

pub use events::{
    progress_channel, EchoPolicy, EventSender, ExecutionEvent, ProgressReceiver, ProgressSender,
    StepEmitter,
};
pub use executor::{ExecutorConfig, WorkflowExecutor};
pub use graph::{InstanceGraph, ScheduleState};
pub use matrix::{expand_workflow, JobInstance};
pub use scope::{ScopeChain, SharedWorkflowScope, WorkflowScope};
