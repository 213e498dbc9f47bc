// The execution driver
// Validates the instance graph up front, then runs a scheduling loop:
// ready instances spawn into a JoinSet bounded by max_workers, skips
// propagate as failures land, and every instance reaches a terminal
// state before the run result is assembled.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::task::JoinSet;

use crate::actions::{ActionContext, ActionRegistry};
use crate::error::{StepError, WorkflowResult};
use crate::expression::{evaluate_gate, interpolate};
use crate::runners::{Backend, Target, DEFAULT_SHELL};
use crate::workflow::{
    InstanceOutcome, JobStatus, RunResult, Step, StepOutcome, StepStatus, Workflow,
};

use super::events::{EchoPolicy, EventSender, ExecutionEvent, ProgressSender, StepEmitter};
use super::graph::{InstanceGraph, ScheduleState};
use super::matrix::{expand_workflow, JobInstance};
use super::scope::{ScopeChain, SharedWorkflowScope, WorkflowScope};

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Upper bound on concurrently running job instances. 1 keeps the
    /// run strictly sequential in declaration order.
    pub max_workers: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self { max_workers: 1 }
    }
}

pub struct WorkflowExecutor {
    config: ExecutorConfig,
    actions: Arc<ActionRegistry>,
    events: Option<ProgressSender>,
}

impl WorkflowExecutor {
    pub fn new() -> Self {
        Self {
            config: ExecutorConfig::default(),
            actions: Arc::new(ActionRegistry::new()),
            events: None,
        }
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_progress(mut self, sender: ProgressSender) -> Self {
        self.events = Some(sender);
        self
    }

    pub fn with_actions(mut self, actions: ActionRegistry) -> Self {
        self.actions = Arc::new(actions);
        self
    }

    /// Run a workflow to completion.
    ///
    /// Parse-class and graph-class problems return `Err` before any
    /// job starts; everything after that lands in the `RunResult`.
    pub async fn execute(
        &self,
        workflow: &Workflow,
        inputs: HashMap<String, String>,
    ) -> WorkflowResult<RunResult> {
        let started = Instant::now();

        let scope = WorkflowScope::bind(workflow, &inputs)?;
        let graph = InstanceGraph::new(expand_workflow(workflow));
        graph.validate()?;

        let workflow_name = workflow
            .name
            .clone()
            .unwrap_or_else(|| "workflow".to_string());
        self.events.send_event(ExecutionEvent::RunStarted {
            workflow: workflow_name.clone(),
            total_instances: graph.len(),
        });
        if !workflow.inputs.is_empty() {
            self.events.send_event(ExecutionEvent::InputsBound {
                inputs: scope.redacted_inputs(),
            });
        }

        let secrets = Arc::new(scope.sensitive_values());
        let runner = Arc::new(InstanceRunner {
            actions: self.actions.clone(),
            events: self.events.clone(),
            scope: Arc::new(Mutex::new(scope)),
            secrets,
            root_policy: EchoPolicy::root().narrow(
                workflow.echo_commands,
                workflow.echo_output,
                workflow.is_sensitive,
            ),
            default_working_dir: workflow.working_directory.clone(),
        });

        let mut state = ScheduleState::new(graph.len());
        let mut outcomes: Vec<Option<InstanceOutcome>> = (0..graph.len()).map(|_| None).collect();
        let mut tasks: JoinSet<(usize, InstanceOutcome)> = JoinSet::new();
        let mut task_index: HashMap<tokio::task::Id, usize> = HashMap::new();
        let limit = self.config.max_workers.max(1);

        loop {
            for index in state.propagate_skips(&graph) {
                let instance = graph.instance(index);
                self.events.send_event(ExecutionEvent::JobSkipped {
                    instance_id: instance.id.clone(),
                    reason: "upstream failure".to_string(),
                });
                outcomes[index] = Some(InstanceOutcome::skipped(&instance.id, &instance.job.id));
            }

            while tasks.len() < limit {
                let Some(index) = state.next_ready(&graph) else {
                    break;
                };
                state.set(index, JobStatus::Running);
                let instance = graph.instance(index).clone();
                let runner = runner.clone();
                let handle =
                    tasks.spawn(async move { (index, runner.run_instance(instance).await) });
                task_index.insert(handle.id(), index);
            }

            if tasks.is_empty() {
                break;
            }

            match tasks.join_next_with_id().await {
                Some(Ok((id, (index, outcome)))) => {
                    task_index.remove(&id);
                    state.set(index, outcome.status);
                    outcomes[index] = Some(outcome);
                }
                Some(Err(join_error)) => {
                    if let Some(index) = task_index.remove(&join_error.id()) {
                        let instance = graph.instance(index);
                        state.set(index, JobStatus::Failed);
                        outcomes[index] = Some(InstanceOutcome {
                            instance_id: instance.id.clone(),
                            job_id: instance.job.id.clone(),
                            status: JobStatus::Failed,
                            steps: Vec::new(),
                            error: Some(format!("job task aborted: {}", join_error)),
                            duration: started.elapsed(),
                        });
                    }
                }
                None => {}
            }
        }

        let instances: Vec<InstanceOutcome> = outcomes
            .into_iter()
            .enumerate()
            .map(|(index, outcome)| {
                let instance = graph.instance(index);
                outcome
                    .unwrap_or_else(|| InstanceOutcome::skipped(&instance.id, &instance.job.id))
            })
            .collect();
        let success = state.all_succeeded();

        self.events.send_event(ExecutionEvent::RunCompleted {
            workflow: workflow_name,
            success,
            duration: started.elapsed(),
        });

        Ok(RunResult {
            instances,
            success,
            duration: started.elapsed(),
        })
    }
}

impl Default for WorkflowExecutor {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared pieces each spawned instance task needs.
struct InstanceRunner {
    actions: Arc<ActionRegistry>,
    events: Option<ProgressSender>,
    scope: SharedWorkflowScope,
    /// Sensitive input values, masked out of every echoed line.
    secrets: Arc<Vec<String>>,
    root_policy: EchoPolicy,
    default_working_dir: Option<String>,
}

enum StepRun {
    Skipped,
    Succeeded(i32),
    Failed(i32),
}

impl InstanceRunner {
    async fn run_instance(&self, instance: JobInstance) -> InstanceOutcome {
        let started = Instant::now();
        let job = &instance.job;
        let policy = self
            .root_policy
            .narrow(job.echo_commands, job.echo_output, job.is_sensitive);
        let mut chain = ScopeChain::new(
            self.scope.clone(),
            job.var.clone(),
            instance.matrix.clone(),
        );

        // Started before target resolution, so even a bad `runs_on`
        // yields a balanced started/completed pair in the stream.
        self.events.send_event(ExecutionEvent::JobStarted {
            instance_id: instance.id.clone(),
            name: job.display_name().to_string(),
            target: job.runs_on.clone().unwrap_or_else(|| "local".to_string()),
            total_steps: job.steps.len(),
        });

        let runs_on = match job
            .runs_on
            .as_deref()
            .map(|r| interpolate(r, &chain))
            .transpose()
        {
            Ok(runs_on) => runs_on,
            Err(error) => return self.fail_outcome(&instance, started, error.to_string()),
        };
        let target = match Target::parse(runs_on.as_deref()) {
            Ok(target) => target,
            Err(error) => return self.fail_outcome(&instance, started, error.to_string()),
        };
        let mut backend = target.backend();

        if let Err(error) = backend.acquire().await {
            return self.fail_outcome(&instance, started, error.to_string());
        }

        let (status, steps, error) = self
            .run_steps(&instance, &mut chain, backend.as_ref(), policy)
            .await;
        let _ = backend.release().await;

        self.events.send_event(ExecutionEvent::JobCompleted {
            instance_id: instance.id.clone(),
            status,
            duration: started.elapsed(),
        });

        InstanceOutcome {
            instance_id: instance.id.clone(),
            job_id: job.id.clone(),
            status,
            steps,
            error,
            duration: started.elapsed(),
        }
    }

    async fn run_steps(
        &self,
        instance: &JobInstance,
        chain: &mut ScopeChain,
        backend: &dyn Backend,
        policy: EchoPolicy,
    ) -> (JobStatus, Vec<StepOutcome>, Option<String>) {
        let job = &instance.job;
        let job_shell = job
            .shell
            .clone()
            .unwrap_or_else(|| DEFAULT_SHELL.to_string());
        let job_workdir = job
            .working_directory
            .clone()
            .or_else(|| self.default_working_dir.clone());

        if let Some(condition) = &job.if_condition {
            match evaluate_gate(condition, chain, backend, &job_shell).await {
                Ok(true) => {}
                // A closed gate skips the job without failing it.
                Ok(false) => {
                    self.events.send_event(ExecutionEvent::JobSkipped {
                        instance_id: instance.id.clone(),
                        reason: "gate condition false".to_string(),
                    });
                    return (JobStatus::Succeeded, Vec::new(), None);
                }
                Err(error) => return (JobStatus::Failed, Vec::new(), Some(error.to_string())),
            }
        }

        let mut outcomes = Vec::with_capacity(job.steps.len());
        for step in &job.steps {
            let step_started = Instant::now();
            let step_id = step.id.clone().unwrap_or_default();
            let step_policy = policy.narrow(step.echo_commands, step.echo_output, step.is_sensitive);
            let shell = step.shell.clone().unwrap_or_else(|| job_shell.clone());
            let working_dir = step.working_directory.clone().or_else(|| job_workdir.clone());
            let emitter = StepEmitter {
                sender: self.events.clone(),
                policy: step_policy,
                secrets: self.secrets.clone(),
                instance_id: instance.id.clone(),
                step_id: step_id.clone(),
            };

            self.events.send_event(ExecutionEvent::StepStarted {
                instance_id: instance.id.clone(),
                step_id: step_id.clone(),
                name: step.display_name(),
            });

            chain.push_step_vars(step.var.clone());
            let verdict = self
                .run_step(chain, backend, step, emitter, &shell, working_dir)
                .await;
            chain.pop_step_vars();

            match verdict {
                Ok(StepRun::Skipped) => {
                    self.events.send_event(ExecutionEvent::StepSkipped {
                        instance_id: instance.id.clone(),
                        step_id: step_id.clone(),
                        reason: "gate condition false".to_string(),
                    });
                    outcomes.push(StepOutcome {
                        step_id,
                        name: step.name.clone(),
                        status: StepStatus::Skipped,
                        exit_code: None,
                        error: None,
                        duration: step_started.elapsed(),
                    });
                }
                Ok(StepRun::Succeeded(exit_code)) => {
                    self.events.send_event(ExecutionEvent::StepCompleted {
                        instance_id: instance.id.clone(),
                        step_id: step_id.clone(),
                        status: StepStatus::Succeeded,
                        exit_code: Some(exit_code),
                        duration: step_started.elapsed(),
                    });
                    outcomes.push(StepOutcome {
                        step_id,
                        name: step.name.clone(),
                        status: StepStatus::Succeeded,
                        exit_code: Some(exit_code),
                        error: None,
                        duration: step_started.elapsed(),
                    });
                }
                Ok(StepRun::Failed(exit_code)) => {
                    let error = StepError::Execution(exit_code).to_string();
                    self.events.send_event(ExecutionEvent::StepCompleted {
                        instance_id: instance.id.clone(),
                        step_id: step_id.clone(),
                        status: StepStatus::Failed,
                        exit_code: Some(exit_code),
                        duration: step_started.elapsed(),
                    });
                    outcomes.push(StepOutcome {
                        step_id,
                        name: step.name.clone(),
                        status: StepStatus::Failed,
                        exit_code: Some(exit_code),
                        error: Some(error.clone()),
                        duration: step_started.elapsed(),
                    });
                    if !step.continue_on_error {
                        return (JobStatus::Failed, outcomes, Some(error));
                    }
                }
                Err(step_error) => {
                    let error = step_error.to_string();
                    self.events.send_event(ExecutionEvent::StepCompleted {
                        instance_id: instance.id.clone(),
                        step_id: step_id.clone(),
                        status: StepStatus::Failed,
                        exit_code: step_error.exit_code(),
                        duration: step_started.elapsed(),
                    });
                    outcomes.push(StepOutcome {
                        step_id,
                        name: step.name.clone(),
                        status: StepStatus::Failed,
                        exit_code: step_error.exit_code(),
                        error: Some(error.clone()),
                        duration: step_started.elapsed(),
                    });
                    if !step.continue_on_error {
                        return (JobStatus::Failed, outcomes, Some(error));
                    }
                }
            }
        }

        (JobStatus::Succeeded, outcomes, None)
    }

    async fn run_step(
        &self,
        chain: &mut ScopeChain,
        backend: &dyn Backend,
        step: &Step,
        emitter: StepEmitter,
        shell: &str,
        working_dir: Option<String>,
    ) -> Result<StepRun, StepError> {
        if let Some(condition) = &step.if_condition {
            if !evaluate_gate(condition, chain, backend, shell).await? {
                return Ok(StepRun::Skipped);
            }
        }

        let action = self.actions.lookup(step.uses.as_deref())?;
        let mut ctx = ActionContext {
            step,
            scope: chain,
            backend,
            shell: shell.to_string(),
            working_dir,
            emitter,
        };
        let output = action.run(&mut ctx).await?;

        chain.record_result(&output);
        if !output.success() {
            return Ok(StepRun::Failed(output.exit_code));
        }

        // Assignments apply only after the step succeeded.
        for (target, value) in &step.set {
            let value = interpolate(value, chain)?;
            chain.assign(target, value)?;
        }
        Ok(StepRun::Succeeded(output.exit_code))
    }

    fn fail_outcome(
        &self,
        instance: &JobInstance,
        started: Instant,
        error: String,
    ) -> InstanceOutcome {
        self.events.send_event(ExecutionEvent::JobCompleted {
            instance_id: instance.id.clone(),
            status: JobStatus::Failed,
            duration: started.elapsed(),
        });
        InstanceOutcome {
            instance_id: instance.id.clone(),
            job_id: instance.job.id.clone(),
            status: JobStatus::Failed,
            steps: Vec::new(),
            error: Some(error),
            duration: started.elapsed(),
        }
    }
}
