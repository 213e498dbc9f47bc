// Instance graph and schedule state
// The graph is flat: matrix expansion already happened, every node is
// one job instance. Validation runs before any job starts.

use std::collections::{HashMap, HashSet};

use crate::error::CycleError;
use crate::workflow::JobStatus;

use super::matrix::JobInstance;

pub struct InstanceGraph {
    instances: Vec<JobInstance>,
    index: HashMap<String, usize>,
}

impl InstanceGraph {
    pub fn new(instances: Vec<JobInstance>) -> Self {
        let index = instances
            .iter()
            .enumerate()
            .map(|(i, instance)| (instance.id.clone(), i))
            .collect();
        Self { instances, index }
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn instance(&self, index: usize) -> &JobInstance {
        &self.instances[index]
    }

    pub fn instances(&self) -> &[JobInstance] {
        &self.instances
    }

    /// Reject dangling dependencies and cycles before execution.
    pub fn validate(&self) -> Result<(), CycleError> {
        for instance in &self.instances {
            for dep in &instance.depends_on {
                if !self.index.contains_key(dep) {
                    return Err(CycleError::UnknownDependency {
                        job: instance.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }
        if let Some(cycle) = self.detect_cycle() {
            return Err(CycleError::Cycle(cycle));
        }
        Ok(())
    }

    fn deps_of(&self, node: usize) -> impl Iterator<Item = usize> + '_ {
        self.instances[node]
            .depends_on
            .iter()
            .filter_map(|dep| self.index.get(dep).copied())
    }

    fn detect_cycle(&self) -> Option<Vec<String>> {
        let mut visited = HashSet::new();
        let mut on_stack = HashSet::new();
        let mut stack = Vec::new();
        for start in 0..self.instances.len() {
            if !visited.contains(&start) {
                if let Some(cycle) = self.dfs(start, &mut visited, &mut on_stack, &mut stack) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    fn dfs(
        &self,
        node: usize,
        visited: &mut HashSet<usize>,
        on_stack: &mut HashSet<usize>,
        stack: &mut Vec<usize>,
    ) -> Option<Vec<String>> {
        visited.insert(node);
        on_stack.insert(node);
        stack.push(node);

        for dep in self.deps_of(node).collect::<Vec<_>>() {
            if !visited.contains(&dep) {
                if let Some(cycle) = self.dfs(dep, visited, on_stack, stack) {
                    return Some(cycle);
                }
            } else if on_stack.contains(&dep) {
                let position = stack.iter().position(|&n| n == dep).unwrap_or(0);
                let mut cycle: Vec<String> = stack[position..]
                    .iter()
                    .map(|&n| self.instances[n].id.clone())
                    .collect();
                cycle.push(self.instances[dep].id.clone());
                return Some(cycle);
            }
        }

        stack.pop();
        on_stack.remove(&node);
        None
    }
}

/// Per-instance status vector driving the scheduling loop.
pub struct ScheduleState {
    status: Vec<JobStatus>,
}

impl ScheduleState {
    pub fn new(len: usize) -> Self {
        Self {
            status: vec![JobStatus::Pending; len],
        }
    }

    pub fn set(&mut self, index: usize, status: JobStatus) {
        self.status[index] = status;
    }

    pub fn status(&self, index: usize) -> JobStatus {
        self.status[index]
    }

    /// First pending instance whose dependencies all succeeded, in
    /// declaration order.
    pub fn next_ready(&self, graph: &InstanceGraph) -> Option<usize> {
        (0..self.status.len()).find(|&index| {
            self.status[index] == JobStatus::Pending
                && graph
                    .deps_of(index)
                    .all(|dep| self.status[dep] == JobStatus::Succeeded)
        })
    }

    /// Skip every pending instance downstream of a failure or a skip,
    /// transitively. Returns the newly skipped indexes in order.
    pub fn propagate_skips(&mut self, graph: &InstanceGraph) -> Vec<usize> {
        let mut newly = Vec::new();
        loop {
            let mut changed = false;
            for index in 0..self.status.len() {
                if self.status[index] != JobStatus::Pending {
                    continue;
                }
                let blocked = graph.deps_of(index).any(|dep| {
                    matches!(self.status[dep], JobStatus::Failed | JobStatus::Skipped)
                });
                if blocked {
                    self.status[index] = JobStatus::Skipped;
                    newly.push(index);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        newly
    }

    pub fn all_terminal(&self) -> bool {
        self.status.iter().all(|s| s.is_terminal())
    }

    pub fn all_succeeded(&self) -> bool {
        self.status.iter().all(|s| *s == JobStatus::Succeeded)
    }
}
