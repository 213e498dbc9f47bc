// YAML parsing for workflow definitions
// Deserializes through serde_yaml::Mapping so job declaration order
// survives into the model; ids are injected from the mapping keys.

use serde::Deserialize;

use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::error::ParseError;

use super::models::{Input, Job, Workflow};

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawWorkflow {
    name: Option<String>,

    #[serde(deserialize_with = "super::models::de_string_map")]
    var: HashMap<String, String>,

    inputs: Vec<Input>,

    jobs: serde_yaml::Mapping,

    echo_commands: Option<bool>,
    echo_output: Option<bool>,
    is_sensitive: Option<bool>,
    working_directory: Option<String>,
}

/// Parse a workflow definition from YAML text.
pub fn parse_workflow(text: &str) -> Result<Workflow, ParseError> {
    let raw: RawWorkflow = serde_yaml::from_str(text)?;

    validate_inputs(&raw.inputs)?;

    let mut jobs = Vec::with_capacity(raw.jobs.len());
    let mut seen = HashSet::new();
    for (key, value) in &raw.jobs {
        let id = key
            .as_str()
            .ok_or_else(|| ParseError::InvalidDefinition("job ids must be strings".to_string()))?
            .to_string();
        if !seen.insert(id.clone()) {
            return Err(ParseError::InvalidDefinition(format!(
                "duplicate job id '{}'",
                id
            )));
        }

        let mut job: Job = serde_yaml::from_value(value.clone())?;
        job.id = id;
        assign_step_ids(&mut job)?;
        validate_job(&job)?;
        jobs.push(job);
    }

    if jobs.is_empty() {
        return Err(ParseError::InvalidDefinition(
            "workflow has no jobs".to_string(),
        ));
    }

    Ok(Workflow {
        name: raw.name,
        var: raw.var,
        inputs: raw.inputs,
        jobs,
        echo_commands: raw.echo_commands,
        echo_output: raw.echo_output,
        is_sensitive: raw.is_sensitive,
        working_directory: raw.working_directory,
    })
}

/// Parse a workflow definition from a file on disk.
pub fn parse_workflow_file(path: impl AsRef<Path>) -> Result<Workflow, ParseError> {
    let text = std::fs::read_to_string(path)?;
    parse_workflow(&text)
}

/// Give every step an id: the declared one, else `step_N` (1-based).
fn assign_step_ids(job: &mut Job) -> Result<(), ParseError> {
    let mut seen = HashSet::new();
    for (index, step) in job.steps.iter_mut().enumerate() {
        let id = match &step.id {
            Some(id) => id.clone(),
            None => {
                let id = format!("step_{}", index + 1);
                step.id = Some(id.clone());
                id
            }
        };
        if !seen.insert(id.clone()) {
            return Err(ParseError::InvalidDefinition(format!(
                "job '{}': duplicate step id '{}'",
                job.id, id
            )));
        }
    }
    Ok(())
}

fn validate_job(job: &Job) -> Result<(), ParseError> {
    for step in &job.steps {
        if step.run.is_none() && step.uses.is_none() && step.set.is_empty() {
            return Err(ParseError::InvalidDefinition(format!(
                "job '{}': step '{}' needs one of 'run', 'uses' or 'set'",
                job.id,
                step.id.as_deref().unwrap_or("?")
            )));
        }
    }
    if let Some(matrix) = &job.matrix {
        for (key, values) in &matrix.entries {
            if values.is_empty() {
                return Err(ParseError::InvalidDefinition(format!(
                    "job '{}': matrix parameter '{}' has no values",
                    job.id, key
                )));
            }
        }
    }
    Ok(())
}

fn validate_inputs(inputs: &[Input]) -> Result<(), ParseError> {
    let mut seen = HashSet::new();
    for input in inputs {
        if input.name.is_empty() {
            return Err(ParseError::InvalidDefinition(
                "input without a name".to_string(),
            ));
        }
        if !seen.insert(input.name.as_str()) {
            return Err(ParseError::InvalidDefinition(format!(
                "duplicate input '{}'",
                input.name
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
name: Sample pipeline
var:
  region: eu-west-1
inputs:
  - name: bucket
    default: artifacts
  - name: token
    required: true
    sensitive: true
jobs:
  prepare:
    steps:
      - run: echo preparing
  build:
    depends_on: [prepare]
    matrix:
      flavor: [a, b]
    steps:
      - id: compile
        run: echo building ${{ matrix.flavor }}
      - run: echo done
  deploy:
    depends_on: [build]
    steps:
      - run: echo deploying to ${{ region }}
"#;

    #[test]
    fn test_jobs_keep_declaration_order() {
        let workflow = parse_workflow(SAMPLE).unwrap();
        let ids: Vec<_> = workflow.jobs.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec!["prepare", "build", "deploy"]);
    }

    #[test]
    fn test_step_ids_synthesized_and_declared() {
        let workflow = parse_workflow(SAMPLE).unwrap();
        let build = workflow.job("build").unwrap();
        assert_eq!(build.steps[0].id.as_deref(), Some("compile"));
        assert_eq!(build.steps[1].id.as_deref(), Some("step_2"));
    }

    #[test]
    fn test_inputs_parsed() {
        let workflow = parse_workflow(SAMPLE).unwrap();
        assert_eq!(workflow.inputs.len(), 2);
        assert_eq!(workflow.inputs[0].default.as_deref(), Some("artifacts"));
        assert!(workflow.inputs[1].required);
        assert!(workflow.inputs[1].sensitive);
    }

    #[test]
    fn test_empty_workflow_rejected() {
        let err = parse_workflow("name: nothing here").unwrap_err();
        assert!(matches!(err, ParseError::InvalidDefinition(_)));
    }

    #[test]
    fn test_step_without_payload_rejected() {
        let yaml = r#"
jobs:
  broken:
    steps:
      - name: does nothing
"#;
        let err = parse_workflow(yaml).unwrap_err();
        assert!(matches!(err, ParseError::InvalidDefinition(_)));
    }

    #[test]
    fn test_empty_matrix_values_rejected() {
        let yaml = r#"
jobs:
  broken:
    matrix:
      flavor: []
    steps:
      - run: echo hi
"#;
        let err = parse_workflow(yaml).unwrap_err();
        assert!(matches!(err, ParseError::InvalidDefinition(_)));
    }

    #[test]
    fn test_parse_workflow_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let workflow = parse_workflow_file(file.path()).unwrap();
        assert_eq!(workflow.name.as_deref(), Some("Sample pipeline"));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = parse_workflow_file("/nonexistent/workflow.yaml").unwrap_err();
        assert!(matches!(err, ParseError::Io(_)));
    }
}
