// Matrix expansion
// Jobs multiply into one instance per combination of their matrix
// values before anything is scheduled; dependencies are rewritten to
// instance ids at the same time.

use std::collections::{HashMap, HashSet};

use crate::workflow::{Job, Matrix, Workflow};

/// One schedulable unit: a job plus a concrete matrix binding.
#[derive(Debug, Clone)]
pub struct JobInstance {
    /// Unique across the run: the job id, suffixed with the binding
    /// for matrix jobs, e.g. `build[flavor=a,version=1]`
    pub id: String,
    pub job: Job,
    pub matrix: Vec<(String, String)>,
    /// Rewritten to instance ids; unknown names survive verbatim for
    /// graph validation to report
    pub depends_on: Vec<String>,
}

/// Expand every job into its instances, in declaration order.
pub fn expand_workflow(workflow: &Workflow) -> Vec<JobInstance> {
    let mut metas: Vec<(usize, String, Vec<(String, String)>)> = Vec::new();
    let mut by_job: HashMap<String, Vec<usize>> = HashMap::new();

    for (job_index, job) in workflow.jobs.iter().enumerate() {
        let mut seen = HashSet::new();
        for binding in combinations(job.matrix.as_ref()) {
            let id = instance_id(&job.id, &binding);
            // Repeated values in a matrix list collapse to one instance.
            if !seen.insert(id.clone()) {
                continue;
            }
            by_job
                .entry(job.id.clone())
                .or_default()
                .push(metas.len());
            metas.push((job_index, id, binding));
        }
    }

    metas
        .iter()
        .map(|(job_index, id, binding)| {
            let job = &workflow.jobs[*job_index];
            let depends_on = job
                .depends_on
                .iter()
                .flat_map(|dep| rewrite_dependency(dep, binding, &by_job, &metas))
                .collect();
            JobInstance {
                id: id.clone(),
                job: job.clone(),
                matrix: binding.clone(),
                depends_on,
            }
        })
        .collect()
}

/// Map one declared dependency to the producer instances it means.
///
/// Producers sharing matrix parameters with the consumer are narrowed
/// to the instances whose values agree with the consumer's binding;
/// everything else fans in to all instances of the producer.
fn rewrite_dependency(
    dep: &str,
    binding: &[(String, String)],
    by_job: &HashMap<String, Vec<usize>>,
    metas: &[(usize, String, Vec<(String, String)>)],
) -> Vec<String> {
    let Some(indexes) = by_job.get(dep) else {
        return vec![dep.to_string()];
    };

    let narrowed: Vec<String> = indexes
        .iter()
        .filter(|&&index| {
            let producer_binding = &metas[index].2;
            binding.iter().all(|(key, value)| {
                match producer_binding.iter().find(|(k, _)| k == key) {
                    Some((_, producer_value)) => producer_value == value,
                    None => true,
                }
            })
        })
        .map(|&index| metas[index].1.clone())
        .collect();

    if narrowed.is_empty() {
        indexes.iter().map(|&index| metas[index].1.clone()).collect()
    } else {
        narrowed
    }
}

fn combinations(matrix: Option<&Matrix>) -> Vec<Vec<(String, String)>> {
    let mut combos: Vec<Vec<(String, String)>> = vec![Vec::new()];
    let Some(matrix) = matrix else {
        return combos;
    };
    for (key, values) in &matrix.entries {
        let mut next = Vec::with_capacity(combos.len() * values.len());
        for combo in &combos {
            for value in values {
                let mut extended = combo.clone();
                extended.push((key.clone(), value.clone()));
                next.push(extended);
            }
        }
        combos = next;
    }
    combos
}

fn instance_id(job_id: &str, binding: &[(String, String)]) -> String {
    if binding.is_empty() {
        return job_id.to_string();
    }
    let parts: Vec<String> = binding
        .iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect();
    format!("{}[{}]", job_id, parts.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::parse_workflow;

    #[test]
    fn test_plain_job_is_one_instance() {
        let workflow = parse_workflow("jobs:\n  solo:\n    steps:\n      - run: echo hi\n").unwrap();
        let instances = expand_workflow(&workflow);
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].id, "solo");
        assert!(instances[0].matrix.is_empty());
    }

    #[test]
    fn test_cartesian_expansion_order() {
        let yaml = r#"
jobs:
  build:
    matrix:
      flavor: [a, b]
      version: [1, 2]
    steps:
      - run: echo hi
"#;
        let workflow = parse_workflow(yaml).unwrap();
        let ids: Vec<_> = expand_workflow(&workflow)
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(
            ids,
            vec![
                "build[flavor=a,version=1]",
                "build[flavor=a,version=2]",
                "build[flavor=b,version=1]",
                "build[flavor=b,version=2]",
            ]
        );
    }

    #[test]
    fn test_duplicate_values_collapse() {
        let yaml = r#"
jobs:
  build:
    matrix:
      flavor: [a, a, b]
    steps:
      - run: echo hi
"#;
        let workflow = parse_workflow(yaml).unwrap();
        assert_eq!(expand_workflow(&workflow).len(), 2);
    }

    #[test]
    fn test_dependency_fans_in_to_all_instances() {
        let yaml = r#"
jobs:
  build:
    matrix:
      flavor: [a, b]
    steps:
      - run: echo hi
  publish:
    depends_on: [build]
    steps:
      - run: echo hi
"#;
        let workflow = parse_workflow(yaml).unwrap();
        let instances = expand_workflow(&workflow);
        let publish = instances.iter().find(|i| i.id == "publish").unwrap();
        assert_eq!(
            publish.depends_on,
            vec!["build[flavor=a]", "build[flavor=b]"]
        );
    }

    #[test]
    fn test_dependency_narrows_on_shared_parameter() {
        let yaml = r#"
jobs:
  build:
    matrix:
      flavor: [a, b]
    steps:
      - run: echo hi
  test:
    depends_on: [build]
    matrix:
      flavor: [a, b]
      suite: [unit, e2e]
    steps:
      - run: echo hi
"#;
        let workflow = parse_workflow(yaml).unwrap();
        let instances = expand_workflow(&workflow);
        let test_a = instances
            .iter()
            .find(|i| i.id == "test[flavor=a,suite=unit]")
            .unwrap();
        assert_eq!(test_a.depends_on, vec!["build[flavor=a]"]);
        let test_b = instances
            .iter()
            .find(|i| i.id == "test[flavor=b,suite=e2e]")
            .unwrap();
        assert_eq!(test_b.depends_on, vec!["build[flavor=b]"]);
    }

    #[test]
    fn test_disjoint_parameters_fan_in() {
        let yaml = r#"
jobs:
  build:
    matrix:
      arch: [x86, arm]
    steps:
      - run: echo hi
  scan:
    depends_on: [build]
    matrix:
      tool: [audit]
    steps:
      - run: echo hi
"#;
        let workflow = parse_workflow(yaml).unwrap();
        let instances = expand_workflow(&workflow);
        let scan = instances.iter().find(|i| i.id == "scan[tool=audit]").unwrap();
        assert_eq!(scan.depends_on, vec!["build[arch=x86]", "build[arch=arm]"]);
    }

    #[test]
    fn test_unknown_dependency_survives_verbatim() {
        let yaml = r#"
jobs:
  deploy:
    depends_on: [ghost]
    steps:
      - run: echo hi
"#;
        let workflow = parse_workflow(yaml).unwrap();
        let instances = expand_workflow(&workflow);
        assert_eq!(instances[0].depends_on, vec!["ghost"]);
    }
}
