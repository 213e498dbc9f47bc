// Layered variable scopes
// One WorkflowScope is shared by every job instance; each instance
// owns a ScopeChain layering job vars, matrix bindings, step outputs
// and a transient step-var frame on top of it.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::{ParseError, StepError};
use crate::expression::Resolver;
use crate::runners::ProcessOutput;
use crate::workflow::Workflow;

pub type SharedWorkflowScope = Arc<Mutex<WorkflowScope>>;

/// Workflow-level state: variables plus bound inputs.
///
/// Writes from concurrent instances are serialized by the mutex in
/// `SharedWorkflowScope`.
#[derive(Debug, Default)]
pub struct WorkflowScope {
    var: HashMap<String, String>,
    inputs: HashMap<String, String>,
    sensitive: HashSet<String>,
}

impl WorkflowScope {
    /// Bind caller-supplied input values against the declared inputs.
    ///
    /// Unknown supplied names and missing required inputs abort before
    /// anything is scheduled.
    pub fn bind(
        workflow: &Workflow,
        provided: &HashMap<String, String>,
    ) -> Result<Self, ParseError> {
        for key in provided.keys() {
            if !workflow.inputs.iter().any(|input| &input.name == key) {
                return Err(ParseError::UnknownInput(key.clone()));
            }
        }

        let mut inputs = HashMap::new();
        let mut sensitive = HashSet::new();
        for input in &workflow.inputs {
            let value = provided
                .get(&input.name)
                .cloned()
                .or_else(|| input.default.clone());
            match value {
                Some(value) => {
                    inputs.insert(input.name.clone(), value);
                }
                None if input.required => {
                    return Err(ParseError::MissingRequiredInput(input.name.clone()));
                }
                None => {}
            }
            if input.sensitive {
                sensitive.insert(input.name.clone());
            }
        }

        Ok(Self {
            var: workflow.var.clone(),
            inputs,
            sensitive,
        })
    }

    pub fn set_var(&mut self, name: impl Into<String>, value: String) {
        self.var.insert(name.into(), value);
    }

    pub fn var(&self, name: &str) -> Option<String> {
        self.var.get(name).cloned()
    }

    pub fn input(&self, name: &str) -> Option<String> {
        self.inputs.get(name).cloned()
    }

    pub fn is_sensitive_input(&self, name: &str) -> bool {
        self.sensitive.contains(name)
    }

    /// Values that must never appear in echoed text.
    pub fn sensitive_values(&self) -> Vec<String> {
        self.sensitive
            .iter()
            .filter_map(|name| self.inputs.get(name))
            .filter(|value| !value.is_empty())
            .cloned()
            .collect()
    }

    /// Bound inputs with sensitive values masked, for reporting.
    pub fn redacted_inputs(&self) -> Vec<(String, String)> {
        let mut pairs: Vec<_> = self
            .inputs
            .iter()
            .map(|(name, value)| {
                let shown = if self.sensitive.contains(name) {
                    "********".to_string()
                } else {
                    value.clone()
                };
                (name.clone(), shown)
            })
            .collect();
        pairs.sort();
        pairs
    }
}

/// Per-instance view over the shared workflow scope.
pub struct ScopeChain {
    workflow: SharedWorkflowScope,
    job_var: HashMap<String, String>,
    matrix: Vec<(String, String)>,
    outputs: HashMap<String, String>,
    step_var: Option<HashMap<String, String>>,
    last_result: Option<ProcessOutput>,
}

impl ScopeChain {
    pub fn new(
        workflow: SharedWorkflowScope,
        job_var: HashMap<String, String>,
        matrix: Vec<(String, String)>,
    ) -> Self {
        Self {
            workflow,
            job_var,
            matrix,
            outputs: HashMap::new(),
            step_var: None,
            last_result: None,
        }
    }

    /// Install the step-var frame. Exactly one frame is active at a
    /// time; the executor pops it on every step exit path.
    pub fn push_step_vars(&mut self, vars: HashMap<String, String>) {
        self.step_var = Some(vars);
    }

    pub fn pop_step_vars(&mut self) {
        self.step_var = None;
    }

    /// Record the last command's result for the `.stdout` / `.stderr`
    /// / `.returncode` channel names.
    pub fn record_result(&mut self, output: &ProcessOutput) {
        self.last_result = Some(output.clone());
    }

    /// Record a captured step output for the rest of the instance.
    pub fn record_output(&mut self, key: String, value: String) {
        self.outputs.insert(key, value);
    }

    pub fn output(&self, key: &str) -> Option<String> {
        self.outputs.get(key).cloned()
    }

    /// Apply one `set` assignment.
    pub fn assign(&mut self, target: &str, value: String) -> Result<(), StepError> {
        if let Some(name) = target.strip_prefix("workflow.var.") {
            self.lock_workflow().set_var(name, value);
            Ok(())
        } else if let Some(name) = target.strip_prefix("job.var.") {
            self.job_var.insert(name.to_string(), value);
            Ok(())
        } else if let Some(name) = target.strip_prefix("var.") {
            self.job_var.insert(name.to_string(), value);
            Ok(())
        } else if let Some(name) = target.strip_prefix("outputs.") {
            self.outputs.insert(name.to_string(), value);
            Ok(())
        } else {
            Err(StepError::InvalidAssignment(target.to_string()))
        }
    }

    fn lock_workflow(&self) -> std::sync::MutexGuard<'_, WorkflowScope> {
        self.workflow
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lookup_var(&self, name: &str) -> Option<String> {
        if let Some(frame) = &self.step_var {
            if let Some(value) = frame.get(name) {
                return Some(value.clone());
            }
        }
        if let Some(value) = self.job_var.get(name) {
            return Some(value.clone());
        }
        self.lock_workflow().var(name)
    }

    fn lookup_matrix(&self, name: &str) -> Option<String> {
        self.matrix
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.clone())
    }

    fn lookup_result(&self, name: &str) -> Option<String> {
        let result = self.last_result.as_ref()?;
        match name {
            ".stdout" => Some(result.stdout.trim_end_matches('\n').to_string()),
            ".stderr" => Some(result.stderr.trim_end_matches('\n').to_string()),
            ".returncode" => Some(result.exit_code.to_string()),
            _ => None,
        }
    }
}

impl Resolver for ScopeChain {
    fn resolve(&self, name: &str) -> Option<String> {
        if let Some(rest) = name.strip_prefix("workflow.var.") {
            return self.lock_workflow().var(rest);
        }
        if let Some(rest) = name.strip_prefix("job.var.") {
            return self.job_var.get(rest).cloned();
        }
        if let Some(rest) = name.strip_prefix("var.") {
            return self.lookup_var(rest);
        }
        if let Some(rest) = name.strip_prefix("inputs.") {
            return self.lock_workflow().input(rest);
        }
        if let Some(rest) = name.strip_prefix("outputs.") {
            return self.outputs.get(rest).cloned();
        }
        if let Some(rest) = name.strip_prefix("matrix.") {
            return self.lookup_matrix(rest);
        }
        if name.starts_with('.') {
            return self.lookup_result(name);
        }

        // Bare key: narrowest scope first, then inputs, then matrix.
        self.lookup_var(name)
            .or_else(|| self.lock_workflow().input(name))
            .or_else(|| self.lookup_matrix(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{Input, Workflow};

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn workflow_with_inputs(inputs: Vec<Input>) -> Workflow {
        Workflow {
            inputs,
            ..Default::default()
        }
    }

    #[test]
    fn test_bind_defaults_and_overrides() {
        let workflow = workflow_with_inputs(vec![
            Input {
                name: "bucket".to_string(),
                default: Some("artifacts".to_string()),
                ..Default::default()
            },
            Input {
                name: "region".to_string(),
                default: Some("eu-west-1".to_string()),
                ..Default::default()
            },
        ]);
        let provided = map(&[("region", "us-east-2")]);
        let scope = WorkflowScope::bind(&workflow, &provided).unwrap();
        assert_eq!(scope.input("bucket").as_deref(), Some("artifacts"));
        assert_eq!(scope.input("region").as_deref(), Some("us-east-2"));
    }

    #[test]
    fn test_bind_missing_required_input() {
        let workflow = workflow_with_inputs(vec![Input {
            name: "token".to_string(),
            required: true,
            ..Default::default()
        }]);
        let err = WorkflowScope::bind(&workflow, &HashMap::new()).unwrap_err();
        assert!(matches!(err, ParseError::MissingRequiredInput(name) if name == "token"));
    }

    #[test]
    fn test_bind_unknown_input() {
        let workflow = workflow_with_inputs(vec![]);
        let err = WorkflowScope::bind(&workflow, &map(&[("surprise", "x")])).unwrap_err();
        assert!(matches!(err, ParseError::UnknownInput(name) if name == "surprise"));
    }

    #[test]
    fn test_redacted_inputs() {
        let workflow = workflow_with_inputs(vec![
            Input {
                name: "token".to_string(),
                default: Some("s3cret".to_string()),
                sensitive: true,
                ..Default::default()
            },
            Input {
                name: "bucket".to_string(),
                default: Some("artifacts".to_string()),
                ..Default::default()
            },
        ]);
        let scope = WorkflowScope::bind(&workflow, &HashMap::new()).unwrap();
        assert_eq!(
            scope.redacted_inputs(),
            vec![
                ("bucket".to_string(), "artifacts".to_string()),
                ("token".to_string(), "********".to_string()),
            ]
        );
    }

    fn chain_with(
        workflow_var: &[(&str, &str)],
        inputs: Vec<Input>,
        job_var: &[(&str, &str)],
        matrix: &[(&str, &str)],
    ) -> ScopeChain {
        let workflow = Workflow {
            var: map(workflow_var),
            inputs,
            ..Default::default()
        };
        let scope = WorkflowScope::bind(&workflow, &HashMap::new()).unwrap();
        ScopeChain::new(
            Arc::new(Mutex::new(scope)),
            map(job_var),
            matrix
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_bare_key_precedence() {
        let mut chain = chain_with(
            &[("name", "workflow")],
            vec![Input {
                name: "name".to_string(),
                default: Some("input".to_string()),
                ..Default::default()
            }],
            &[("name", "job")],
            &[("name", "matrix")],
        );
        assert_eq!(chain.resolve("name").as_deref(), Some("job"));

        chain.push_step_vars(map(&[("name", "step")]));
        assert_eq!(chain.resolve("name").as_deref(), Some("step"));
        chain.pop_step_vars();
        assert_eq!(chain.resolve("name").as_deref(), Some("job"));
    }

    #[test]
    fn test_var_wins_over_input_for_bare_keys() {
        let chain = chain_with(
            &[("region", "from-var")],
            vec![Input {
                name: "region".to_string(),
                default: Some("from-input".to_string()),
                ..Default::default()
            }],
            &[],
            &[],
        );
        assert_eq!(chain.resolve("region").as_deref(), Some("from-var"));
        assert_eq!(chain.resolve("inputs.region").as_deref(), Some("from-input"));
    }

    #[test]
    fn test_qualified_lookups() {
        let mut chain = chain_with(
            &[("w", "1")],
            vec![],
            &[("j", "2")],
            &[("flavor", "a")],
        );
        chain.record_output("digest".to_string(), "abc".to_string());
        assert_eq!(chain.resolve("workflow.var.w").as_deref(), Some("1"));
        assert_eq!(chain.resolve("job.var.j").as_deref(), Some("2"));
        assert_eq!(chain.resolve("var.j").as_deref(), Some("2"));
        assert_eq!(chain.resolve("matrix.flavor").as_deref(), Some("a"));
        assert_eq!(chain.resolve("outputs.digest").as_deref(), Some("abc"));
        assert_eq!(chain.resolve("matrix.missing"), None);
    }

    #[test]
    fn test_result_channel() {
        let mut chain = chain_with(&[], vec![], &[], &[]);
        assert_eq!(chain.resolve(".stdout"), None);
        chain.record_result(&ProcessOutput {
            exit_code: 3,
            stdout: "hello\n".to_string(),
            stderr: "oops\n".to_string(),
        });
        assert_eq!(chain.resolve(".stdout").as_deref(), Some("hello"));
        assert_eq!(chain.resolve(".stderr").as_deref(), Some("oops"));
        assert_eq!(chain.resolve(".returncode").as_deref(), Some("3"));
    }

    #[test]
    fn test_assign_targets() {
        let mut chain = chain_with(&[], vec![], &[], &[]);
        chain
            .assign("workflow.var.shared", "one".to_string())
            .unwrap();
        chain.assign("var.local", "two".to_string()).unwrap();
        chain.assign("outputs.digest", "abc".to_string()).unwrap();
        assert_eq!(chain.resolve("workflow.var.shared").as_deref(), Some("one"));
        assert_eq!(chain.resolve("local").as_deref(), Some("two"));
        assert_eq!(chain.resolve("outputs.digest").as_deref(), Some("abc"));

        let err = chain.assign("inputs.bucket", "x".to_string()).unwrap_err();
        assert!(matches!(err, StepError::InvalidAssignment(_)));
    }

    #[test]
    fn test_workflow_assignment_visible_across_chains() {
        let workflow = Workflow::default();
        let scope = Arc::new(Mutex::new(
            WorkflowScope::bind(&workflow, &HashMap::new()).unwrap(),
        ));
        let mut producer = ScopeChain::new(scope.clone(), HashMap::new(), Vec::new());
        let consumer = ScopeChain::new(scope, HashMap::new(), Vec::new());

        producer
            .assign("workflow.var.artifact", "v1".to_string())
            .unwrap();
        assert_eq!(consumer.resolve("artifact").as_deref(), Some("v1"));
    }
}
