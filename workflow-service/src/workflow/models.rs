// Workflow data model
// Mirrors the YAML definition schema: a workflow holds variables, named
// inputs and an ordered mapping of jobs; jobs hold ordered steps.

use serde::{Deserialize, Deserializer};

use std::collections::HashMap;
use std::time::Duration;

/// A parsed workflow definition.
///
/// `jobs` preserves declaration order; the scheduler uses it as the
/// tie-break among equally-ready instances.
#[derive(Debug, Clone, Default)]
pub struct Workflow {
    /// Display name of the workflow
    pub name: Option<String>,

    /// Workflow-level variables
    pub var: HashMap<String, String>,

    /// Named inputs with defaults, bound from caller-supplied values
    pub inputs: Vec<Input>,

    /// Jobs in declaration order, with their ids injected
    pub jobs: Vec<Job>,

    /// Inheritance roots for the echo policy
    pub echo_commands: Option<bool>,
    pub echo_output: Option<bool>,
    pub is_sensitive: Option<bool>,

    /// Default working directory for every job
    pub working_directory: Option<String>,
}

impl Workflow {
    /// Look up a job by id.
    pub fn job(&self, id: &str) -> Option<&Job> {
        self.jobs.iter().find(|j| j.id == id)
    }
}

/// A named workflow input.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Input {
    pub name: String,

    #[serde(deserialize_with = "de_opt_scalar")]
    pub default: Option<String>,

    /// Missing required inputs abort the run before scheduling
    pub required: bool,

    /// Sensitive input values render as `********` when echoed
    pub sensitive: bool,
}

/// A job definition.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Job {
    /// Unique id within the workflow (the key in the `jobs` mapping)
    #[serde(skip)]
    pub id: String,

    /// Display name
    pub name: Option<String>,

    /// Execution target: empty = local, `docker://...` or `ssh://...`
    pub runs_on: Option<String>,

    /// Ids of jobs that must succeed before this one runs
    pub depends_on: Vec<String>,

    /// Matrix parameters multiplying this job into instances
    pub matrix: Option<Matrix>,

    /// Gate expression, shell-evaluated before steps run
    #[serde(rename = "if")]
    pub if_condition: Option<String>,

    pub echo_commands: Option<bool>,
    pub echo_output: Option<bool>,
    pub is_sensitive: Option<bool>,

    /// Default shell for the job's steps
    pub shell: Option<String>,

    pub working_directory: Option<String>,

    /// Job-level variables
    #[serde(deserialize_with = "de_string_map")]
    pub var: HashMap<String, String>,

    /// Ordered steps
    pub steps: Vec<Step>,
}

impl Job {
    /// Display name for logs: explicit name, else the id.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// A step definition.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Step {
    /// Step id; synthesized as `step_N` when absent
    pub id: Option<String>,

    pub name: Option<String>,

    /// Action id; absent means the default run-command action
    pub uses: Option<String>,

    /// Command text for the default action
    pub run: Option<String>,

    /// Shell selector override for this step
    pub shell: Option<String>,

    /// Action inputs
    pub with: HashMap<String, serde_yaml::Value>,

    /// Step-level variables
    #[serde(deserialize_with = "de_string_map")]
    pub var: HashMap<String, String>,

    #[serde(rename = "if")]
    pub if_condition: Option<String>,

    pub echo_commands: Option<bool>,
    pub echo_output: Option<bool>,
    pub is_sensitive: Option<bool>,

    pub working_directory: Option<String>,

    /// A failing step with this flag set does not fail the job
    pub continue_on_error: bool,

    /// Assignments applied only after the step succeeds, in order
    #[serde(deserialize_with = "de_string_pairs")]
    pub set: Vec<(String, String)>,
}

impl Step {
    /// Display name for logs: explicit name, else action id, else the
    /// first line of `run`, else the step id.
    pub fn display_name(&self) -> String {
        if let Some(name) = &self.name {
            name.clone()
        } else if let Some(uses) = &self.uses {
            uses.clone()
        } else if let Some(run) = &self.run {
            run.lines().next().unwrap_or(run).to_string()
        } else {
            self.id.clone().unwrap_or_default()
        }
    }
}

/// A job's matrix: parameter names mapped to ordered value sequences.
///
/// Declaration order of both keys and values is preserved so expansion
/// produces stable instance ids across runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Matrix {
    pub entries: Vec<(String, Vec<String>)>,
}

impl Matrix {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parameter names in declaration order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }
}

impl<'de> Deserialize<'de> for Matrix {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let mapping = serde_yaml::Mapping::deserialize(deserializer)?;
        let mut entries = Vec::with_capacity(mapping.len());
        for (key, value) in &mapping {
            let key = key
                .as_str()
                .ok_or_else(|| serde::de::Error::custom("matrix parameter names must be strings"))?
                .to_string();
            let seq = value.as_sequence().ok_or_else(|| {
                serde::de::Error::custom(format!("matrix parameter '{}' must be a sequence", key))
            })?;
            let mut values = Vec::with_capacity(seq.len());
            for item in seq {
                values.push(scalar_to_string(item).map_err(serde::de::Error::custom)?);
            }
            entries.push((key, values));
        }
        Ok(Self { entries })
    }
}

/// Terminal and in-flight states of a job instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Skipped
        )
    }
}

/// Per-step outcome within a job instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Succeeded,
    Failed,
    Skipped,
}

/// Result of one executed (or skipped) step.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub step_id: String,
    pub name: Option<String>,
    pub status: StepStatus,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub duration: Duration,
}

/// Result of one job instance.
#[derive(Debug, Clone)]
pub struct InstanceOutcome {
    pub instance_id: String,
    pub job_id: String,
    pub status: JobStatus,
    pub steps: Vec<StepOutcome>,
    pub error: Option<String>,
    pub duration: Duration,
}

impl InstanceOutcome {
    pub fn skipped(instance_id: impl Into<String>, job_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            job_id: job_id.into(),
            status: JobStatus::Skipped,
            steps: Vec::new(),
            error: None,
            duration: Duration::ZERO,
        }
    }
}

/// Result of a whole run.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub instances: Vec<InstanceOutcome>,
    /// True only when every instance succeeded
    pub success: bool,
    pub duration: Duration,
}

/// Render a YAML scalar as the string the scope store works with.
pub(crate) fn scalar_to_string(value: &serde_yaml::Value) -> Result<String, String> {
    match value {
        serde_yaml::Value::String(s) => Ok(s.clone()),
        serde_yaml::Value::Number(n) => Ok(n.to_string()),
        serde_yaml::Value::Bool(b) => Ok(b.to_string()),
        serde_yaml::Value::Null => Ok(String::new()),
        _ => Err("expected a scalar value".to_string()),
    }
}

pub(crate) fn de_string_map<'de, D>(deserializer: D) -> Result<HashMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = HashMap::<String, serde_yaml::Value>::deserialize(deserializer)?;
    raw.into_iter()
        .map(|(k, v)| {
            scalar_to_string(&v)
                .map(|v| (k, v))
                .map_err(serde::de::Error::custom)
        })
        .collect()
}

/// Like `de_string_map` but preserves declaration order, for `set`
/// assignments whose right-hand sides may reference earlier targets.
fn de_string_pairs<'de, D>(deserializer: D) -> Result<Vec<(String, String)>, D::Error>
where
    D: Deserializer<'de>,
{
    let mapping = serde_yaml::Mapping::deserialize(deserializer)?;
    let mut pairs = Vec::with_capacity(mapping.len());
    for (key, value) in &mapping {
        let key = key
            .as_str()
            .ok_or_else(|| serde::de::Error::custom("assignment targets must be strings"))?
            .to_string();
        let value = scalar_to_string(value).map_err(serde::de::Error::custom)?;
        pairs.push((key, value));
    }
    Ok(pairs)
}

fn de_opt_scalar<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<serde_yaml::Value>::deserialize(deserializer)?;
    match raw {
        None => Ok(None),
        Some(value) => scalar_to_string(&value)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}
