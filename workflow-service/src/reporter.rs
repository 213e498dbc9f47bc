// Terminal rendering of progress events
// Sensitive text never reaches the channel, so rendering is plain: one
// line per event, command/output lines indented under their step.

use crate::execution::events::{ExecutionEvent, ProgressReceiver};
use crate::workflow::{JobStatus, StepStatus};

pub struct Reporter;

impl Reporter {
    /// Drain the channel until the executor drops its sender.
    pub async fn render(mut receiver: ProgressReceiver) {
        while let Some(event) = receiver.recv().await {
            println!("{}", Self::format_event(&event));
        }
    }

    pub fn format_event(event: &ExecutionEvent) -> String {
        match event {
            ExecutionEvent::RunStarted {
                workflow,
                total_instances,
            } => format!("==> {} ({} job instances)", workflow, total_instances),
            ExecutionEvent::InputsBound { inputs } => {
                let pairs: Vec<String> = inputs
                    .iter()
                    .map(|(name, value)| format!("{}={}", name, value))
                    .collect();
                format!("    inputs: {}", pairs.join(" "))
            }
            ExecutionEvent::RunCompleted {
                workflow,
                success,
                duration,
            } => {
                let verdict = if *success { "succeeded" } else { "failed" };
                format!("==> {} {} in {:.1?}", workflow, verdict, duration)
            }
            ExecutionEvent::JobStarted {
                instance_id,
                name,
                target,
                total_steps,
            } => format!(
                "[{}] {} on {} ({} steps)",
                instance_id, name, target, total_steps
            ),
            ExecutionEvent::JobCompleted {
                instance_id,
                status,
                duration,
            } => format!(
                "[{}] {} in {:.1?}",
                instance_id,
                Self::job_status_label(*status),
                duration
            ),
            ExecutionEvent::JobSkipped {
                instance_id,
                reason,
            } => format!("[{}] skipped: {}", instance_id, reason),
            ExecutionEvent::StepStarted {
                instance_id,
                step_id,
                name,
            } => format!("[{}] {}: {}", instance_id, step_id, name),
            ExecutionEvent::StepCommand {
                instance_id,
                command,
                ..
            } => Self::indented(instance_id, "$", command),
            ExecutionEvent::StepOutput {
                instance_id,
                output,
                is_error,
                ..
            } => {
                let marker = if *is_error { "!" } else { "|" };
                Self::indented(instance_id, marker, output)
            }
            ExecutionEvent::StepCompleted {
                instance_id,
                step_id,
                status,
                exit_code,
                ..
            } => {
                let label = Self::step_status_label(*status);
                match exit_code {
                    Some(code) if *status == StepStatus::Failed => {
                        format!("[{}] {}: {} (exit {})", instance_id, step_id, label, code)
                    }
                    _ => format!("[{}] {}: {}", instance_id, step_id, label),
                }
            }
            ExecutionEvent::StepSkipped {
                instance_id,
                step_id,
                reason,
            } => format!("[{}] {}: skipped ({})", instance_id, step_id, reason),
        }
    }

    fn indented(instance_id: &str, marker: &str, text: &str) -> String {
        text.trim_end_matches('\n')
            .lines()
            .map(|line| format!("[{}]   {} {}", instance_id, marker, line))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn job_status_label(status: JobStatus) -> &'static str {
        match status {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Skipped => "skipped",
        }
    }

    fn step_status_label(status: StepStatus) -> &'static str {
        match status {
            StepStatus::Succeeded => "ok",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }
}
