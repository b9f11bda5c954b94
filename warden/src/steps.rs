//! Optional step decomposition for multi-action requests
//!
//! A TaskPlan sequences a plan's actions through named steps with
//! dependencies. Dispatch order is topological; a cycle or an unknown
//! dependency is a typed error, caught before anything executes.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

use crate::error::{WardenError, WardenResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStep {
    /// Unique name other steps reference in `dependencies`.
    pub name: String,
    pub description: String,
    /// Index into the owning plan's action list.
    pub action_index: usize,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default = "default_step_status")]
    pub status: StepStatus,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_step_status() -> StepStatus {
    StepStatus::Pending
}

fn default_max_retries() -> u32 {
    3
}

impl TaskStep {
    pub fn new(name: impl Into<String>, action_index: usize) -> Self {
        let name = name.into();
        Self {
            description: name.clone(),
            name,
            action_index,
            dependencies: Vec::new(),
            status: StepStatus::Pending,
            retry_count: 0,
            max_retries: default_max_retries(),
        }
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPlan {
    pub id: String,
    pub steps: Vec<TaskStep>,
}

impl TaskPlan {
    pub fn new(steps: Vec<TaskStep>) -> Self {
        Self {
            id: format!("task-{}", uuid::Uuid::new_v4()),
            steps,
        }
    }

    /// Kahn's algorithm over step names. Ties resolve in declaration order
    /// so runs are deterministic. Returns step indices in dispatch order.
    pub fn topological_order(&self) -> WardenResult<Vec<usize>> {
        let positions: HashMap<&str, usize> = self
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.as_str(), i))
            .collect();

        let mut in_degree = vec![0usize; self.steps.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.steps.len()];
        for (i, step) in self.steps.iter().enumerate() {
            for dep in &step.dependencies {
                let &dep_index = positions
                    .get(dep.as_str())
                    .ok_or_else(|| WardenError::UnknownDependency(dep.clone()))?;
                in_degree[i] += 1;
                dependents[dep_index].push(i);
            }
        }

        let mut ready: VecDeque<usize> = (0..self.steps.len())
            .filter(|&i| in_degree[i] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.steps.len());
        while let Some(i) = ready.pop_front() {
            order.push(i);
            for &next in &dependents[i] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.push_back(next);
                }
            }
        }

        if order.len() != self.steps.len() {
            let stuck = self
                .steps
                .iter()
                .enumerate()
                .find(|(i, _)| in_degree[*i] > 0)
                .map(|(_, s)| s.name.clone())
                .unwrap_or_default();
            return Err(WardenError::DependencyCycle(stuck));
        }
        Ok(order)
    }

    /// Action indices in dispatch order.
    pub fn dispatch_order(&self) -> WardenResult<Vec<usize>> {
        Ok(self
            .topological_order()?
            .into_iter()
            .map(|i| self.steps[i].action_index)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_respects_dependencies() {
        let plan = TaskPlan::new(vec![
            TaskStep::new("test", 2).with_dependencies(vec!["build".to_string()]),
            TaskStep::new("fetch", 0),
            TaskStep::new("build", 1).with_dependencies(vec!["fetch".to_string()]),
        ]);
        assert_eq!(plan.dispatch_order().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn independent_steps_keep_declaration_order() {
        let plan = TaskPlan::new(vec![
            TaskStep::new("a", 0),
            TaskStep::new("b", 1),
            TaskStep::new("c", 2),
        ]);
        assert_eq!(plan.dispatch_order().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn cycles_are_typed_errors() {
        let plan = TaskPlan::new(vec![
            TaskStep::new("a", 0).with_dependencies(vec!["b".to_string()]),
            TaskStep::new("b", 1).with_dependencies(vec!["a".to_string()]),
        ]);
        assert!(matches!(
            plan.topological_order(),
            Err(WardenError::DependencyCycle(_))
        ));
    }

    #[test]
    fn unknown_dependency_is_a_typed_error() {
        let plan = TaskPlan::new(vec![
            TaskStep::new("a", 0).with_dependencies(vec!["ghost".to_string()])
        ]);
        assert!(matches!(
            plan.topological_order(),
            Err(WardenError::UnknownDependency(d)) if d == "ghost"
        ));
    }
}
