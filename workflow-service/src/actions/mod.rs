// Action dispatch
// A step either names an action with `uses` or falls through to the
// default run-command handler. Handlers see the step, the scope chain
// and the instance's backend; custom handlers register by id.

use async_trait::async_trait;

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::StepError;
use crate::execution::events::StepEmitter;
use crate::execution::scope::ScopeChain;
use crate::expression::interpolate;
use crate::runners::{exec_with_capture, Backend, ExecRequest, ProcessOutput};
use crate::workflow::Step;

/// Everything a handler needs to run one step.
pub struct ActionContext<'a> {
    pub step: &'a Step,
    pub scope: &'a mut ScopeChain,
    pub backend: &'a dyn Backend,
    /// Resolved shell selector for this step
    pub shell: String,
    pub working_dir: Option<String>,
    pub emitter: StepEmitter,
}

impl ActionContext<'_> {
    /// Interpolated `with` input, rendered to a string.
    pub fn input(&self, key: &str) -> Result<Option<String>, StepError> {
        let Some(value) = self.step.with.get(key) else {
            return Ok(None);
        };
        let raw = match crate::workflow::models::scalar_to_string(value) {
            Ok(text) => text,
            Err(_) => serde_yaml::to_string(value)
                .unwrap_or_default()
                .trim_end()
                .to_string(),
        };
        interpolate(&raw, self.scope).map(Some)
    }
}

#[async_trait]
pub trait Action: Send + Sync {
    fn id(&self) -> &str;

    /// `with` keys this handler understands.
    fn input_keys(&self) -> &[&str] {
        &[]
    }

    /// Run the step. A non-zero exit code in the returned output is a
    /// step failure; `Err` is reserved for faults outside the command
    /// itself.
    async fn run(&self, ctx: &mut ActionContext<'_>) -> Result<ProcessOutput, StepError>;
}

pub struct ActionRegistry {
    handlers: HashMap<String, Arc<dyn Action>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            handlers: HashMap::new(),
        };
        registry.register(Arc::new(RunCommand));
        registry
    }

    pub fn register(&mut self, action: Arc<dyn Action>) {
        self.handlers.insert(action.id().to_string(), action);
    }

    /// Resolve a step's handler; no `uses` means the default action.
    pub fn lookup(&self, uses: Option<&str>) -> Result<Arc<dyn Action>, StepError> {
        let id = uses.unwrap_or(RunCommand::ID);
        self.handlers
            .get(id)
            .cloned()
            .ok_or_else(|| StepError::ActionNotFound(id.to_string()))
    }
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The default action: interpolate `run`, feed it to the shell on the
/// instance's backend, capture outputs written to the output channel.
pub struct RunCommand;

impl RunCommand {
    pub const ID: &'static str = "core/run";
}

#[async_trait]
impl Action for RunCommand {
    fn id(&self) -> &str {
        Self::ID
    }

    async fn run(&self, ctx: &mut ActionContext<'_>) -> Result<ProcessOutput, StepError> {
        let Some(run) = &ctx.step.run else {
            // A step with only `set` still succeeds.
            return Ok(ProcessOutput::default());
        };
        let command = interpolate(run.trim(), ctx.scope)?;
        ctx.emitter.command(&command);

        let mut request = ExecRequest::new(command, ctx.shell.clone());
        request.working_dir = ctx.working_dir.clone();
        let (output, captured) = exec_with_capture(ctx.backend, &request).await?;

        ctx.emitter.output(&output.stdout, false);
        ctx.emitter.output(&output.stderr, true);
        for (key, value) in captured {
            ctx.scope.record_output(key, value);
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::events::{progress_channel, EchoPolicy, ExecutionEvent};
    use crate::execution::scope::{ScopeChain, WorkflowScope};
    use crate::runners::{LocalBackend, OUTPUT_CHANNEL_ENV};
    use crate::workflow::Workflow;
    use std::sync::Mutex;

    fn chain() -> ScopeChain {
        let scope = WorkflowScope::bind(&Workflow::default(), &HashMap::new()).unwrap();
        ScopeChain::new(Arc::new(Mutex::new(scope)), HashMap::new(), Vec::new())
    }

    fn emitter(policy: EchoPolicy) -> (StepEmitter, crate::execution::events::ProgressReceiver) {
        let (tx, rx) = progress_channel();
        (
            StepEmitter {
                sender: Some(tx),
                policy,
                secrets: Arc::new(Vec::new()),
                instance_id: "job".to_string(),
                step_id: "step_1".to_string(),
            },
            rx,
        )
    }

    #[tokio::test]
    async fn test_run_command_interpolates_and_captures() {
        let mut scope = chain();
        scope
            .assign("var.who", "world".to_string())
            .unwrap();
        let step = Step {
            run: Some(format!(
                "echo hello ${{{{ who }}}}\necho greeting=done >> \"${}\"",
                OUTPUT_CHANNEL_ENV
            )),
            ..Default::default()
        };
        let backend = LocalBackend::new();
        let (emitter, mut rx) = emitter(EchoPolicy::root());
        let mut ctx = ActionContext {
            step: &step,
            scope: &mut scope,
            backend: &backend,
            shell: "sh".to_string(),
            working_dir: None,
            emitter,
        };

        let output = RunCommand.run(&mut ctx).await.unwrap();
        assert!(output.success());
        assert_eq!(scope.output("greeting").as_deref(), Some("done"));

        let first = rx.try_recv().unwrap();
        assert!(
            matches!(first, ExecutionEvent::StepCommand { command, .. } if command.starts_with("echo hello world"))
        );
    }

    #[tokio::test]
    async fn test_run_command_quiet_policy_emits_nothing() {
        let mut scope = chain();
        let step = Step {
            run: Some("echo loud".to_string()),
            ..Default::default()
        };
        let backend = LocalBackend::new();
        let (emitter, mut rx) = emitter(EchoPolicy::root().narrow(None, None, Some(true)));
        let mut ctx = ActionContext {
            step: &step,
            scope: &mut scope,
            backend: &backend,
            shell: "sh".to_string(),
            working_dir: None,
            emitter,
        };

        RunCommand.run(&mut ctx).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_set_only_step_succeeds_without_command() {
        let mut scope = chain();
        let step = Step::default();
        let backend = LocalBackend::new();
        let (emitter, _rx) = emitter(EchoPolicy::root());
        let mut ctx = ActionContext {
            step: &step,
            scope: &mut scope,
            backend: &backend,
            shell: "sh".to_string(),
            working_dir: None,
            emitter,
        };
        let output = RunCommand.run(&mut ctx).await.unwrap();
        assert_eq!(output, ProcessOutput::default());
    }

    #[test]
    fn test_lookup_default_and_unknown() {
        let registry = ActionRegistry::new();
        assert_eq!(registry.lookup(None).unwrap().id(), RunCommand::ID);
        assert_eq!(registry.lookup(Some("core/run")).unwrap().id(), RunCommand::ID);
        let err = registry.lookup(Some("ghost/action")).err().unwrap();
        assert!(matches!(err, StepError::ActionNotFound(id) if id == "ghost/action"));
    }

    #[test]
    fn test_custom_action_registration() {
        struct Fake;
        #[async_trait]
        impl Action for Fake {
            fn id(&self) -> &str {
                "test/fake"
            }
            async fn run(&self, _ctx: &mut ActionContext<'_>) -> Result<ProcessOutput, StepError> {
                Ok(ProcessOutput::default())
            }
        }
        let mut registry = ActionRegistry::new();
        registry.register(Arc::new(Fake));
        assert_eq!(registry.lookup(Some("test/fake")).unwrap().id(), "test/fake");
    }

    #[tokio::test]
    async fn test_with_input_interpolation() {
        let mut scope = chain();
        scope.assign("var.name", "demo".to_string()).unwrap();
        let mut with = HashMap::new();
        with.insert(
            "template".to_string(),
            serde_yaml::Value::String("hello ${{ name }}".to_string()),
        );
        let step = Step {
            run: Some("true".to_string()),
            with,
            ..Default::default()
        };
        let backend = LocalBackend::new();
        let (emitter, _rx) = emitter(EchoPolicy::root());
        let ctx = ActionContext {
            step: &step,
            scope: &mut scope,
            backend: &backend,
            shell: "sh".to_string(),
            working_dir: None,
            emitter,
        };
        assert_eq!(ctx.input("template").unwrap().as_deref(), Some("hello demo"));
        assert_eq!(ctx.input("missing").unwrap(), None);
    }
}
