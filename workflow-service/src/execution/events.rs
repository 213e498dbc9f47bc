// Progress events
// The executor narrates a run as a typed event stream. Echo policy is
// applied before sending, so text that should stay hidden is never
// placed on the channel at all.

use tokio::sync::mpsc;

use std::sync::Arc;
use std::time::Duration;

use crate::workflow::{JobStatus, StepStatus};

pub type ProgressSender = mpsc::UnboundedSender<ExecutionEvent>;
pub type ProgressReceiver = mpsc::UnboundedReceiver<ExecutionEvent>;

pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    RunStarted {
        workflow: String,
        total_instances: usize,
    },
    /// Bound inputs with sensitive values already masked
    InputsBound {
        inputs: Vec<(String, String)>,
    },
    RunCompleted {
        workflow: String,
        success: bool,
        duration: Duration,
    },
    JobStarted {
        instance_id: String,
        name: String,
        target: String,
        total_steps: usize,
    },
    JobCompleted {
        instance_id: String,
        status: JobStatus,
        duration: Duration,
    },
    JobSkipped {
        instance_id: String,
        reason: String,
    },
    StepStarted {
        instance_id: String,
        step_id: String,
        name: String,
    },
    /// The interpolated command, present only when echoing is on
    StepCommand {
        instance_id: String,
        step_id: String,
        command: String,
    },
    /// Command output, present only when echoing is on
    StepOutput {
        instance_id: String,
        step_id: String,
        output: String,
        is_error: bool,
    },
    StepCompleted {
        instance_id: String,
        step_id: String,
        status: StepStatus,
        exit_code: Option<i32>,
        duration: Duration,
    },
    StepSkipped {
        instance_id: String,
        step_id: String,
        reason: String,
    },
}

impl ExecutionEvent {
    pub fn step_output(
        instance_id: impl Into<String>,
        step_id: impl Into<String>,
        output: impl Into<String>,
        is_error: bool,
    ) -> Self {
        ExecutionEvent::StepOutput {
            instance_id: instance_id.into(),
            step_id: step_id.into(),
            output: output.into(),
            is_error,
        }
    }
}

/// Fire-and-forget event emission: a dropped receiver never fails a
/// run.
pub trait EventSender {
    fn send_event(&self, event: ExecutionEvent);
}

/// What a node is allowed to echo. Each job and step narrows its
/// parent's policy; sensitivity is monotonic downward, so a sensitive
/// ancestor silences the whole subtree no matter what children ask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EchoPolicy {
    pub commands: bool,
    pub output: bool,
    pub sensitive: bool,
}

impl EchoPolicy {
    pub fn root() -> Self {
        Self {
            commands: true,
            output: true,
            sensitive: false,
        }
    }

    pub fn narrow(
        self,
        echo_commands: Option<bool>,
        echo_output: Option<bool>,
        is_sensitive: Option<bool>,
    ) -> Self {
        let sensitive = self.sensitive || is_sensitive.unwrap_or(false);
        Self {
            commands: !sensitive && echo_commands.unwrap_or(self.commands),
            output: !sensitive && echo_output.unwrap_or(self.output),
            sensitive,
        }
    }
}

/// Policy-gated emitter for one step. Suppressed command and output
/// text is never placed on the channel, and sensitive input values are
/// masked out of whatever is.
#[derive(Clone)]
pub struct StepEmitter {
    pub sender: Option<ProgressSender>,
    pub policy: EchoPolicy,
    pub secrets: Arc<Vec<String>>,
    pub instance_id: String,
    pub step_id: String,
}

impl StepEmitter {
    pub fn command(&self, command: &str) {
        if self.policy.commands {
            self.sender.send_event(ExecutionEvent::StepCommand {
                instance_id: self.instance_id.clone(),
                step_id: self.step_id.clone(),
                command: self.redact(command),
            });
        }
    }

    pub fn output(&self, text: &str, is_error: bool) {
        if self.policy.output && !text.trim().is_empty() {
            self.sender.send_event(ExecutionEvent::step_output(
                self.instance_id.clone(),
                self.step_id.clone(),
                self.redact(text),
                is_error,
            ));
        }
    }

    fn redact(&self, text: &str) -> String {
        let mut masked = text.to_string();
        for secret in self.secrets.iter() {
            if masked.contains(secret.as_str()) {
                masked = masked.replace(secret.as_str(), "********");
            }
        }
        masked
    }
}

impl EventSender for ProgressSender {
    fn send_event(&self, event: ExecutionEvent) {
        let _ = self.send(event);
    }
}

impl EventSender for Option<ProgressSender> {
    fn send_event(&self, event: ExecutionEvent) {
        if let Some(sender) = self {
            let _ = sender.send(event);
        }
    }
}
