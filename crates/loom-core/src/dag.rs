//! Plan-intake validation: topological sort and cycle detection.
//!
//! `SPEC_FULL.md` §9 notes that the reference implementation never
//! validates its task graphs and recommends that an implementer do so at
//! plan intake. This module implements that recommendation with Kahn's
//! algorithm.

use std::collections::{HashMap, HashSet, VecDeque};

use thiserror::Error;

use crate::model::Plan;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DagError {
    #[error("task {task:?} declares a dependency on unknown task {dependency:?}")]
    UnknownDependency { task: String, dependency: String },

    #[error("plan contains a dependency cycle among tasks: {0:?}")]
    Cycle(Vec<String>),

    #[error("duplicate task id {0:?} in plan")]
    DuplicateTaskId(String),
}

/// Validate that `plan`'s task graph is well-formed and acyclic.
///
/// Checks, in order: no duplicate `task_id`s, every `dependencies` entry
/// names a task present in the same plan, and the dependency graph has no
/// cycle (via Kahn's algorithm -- topological sort must consume every node).
pub fn validate_acyclic(plan: &Plan) -> Result<Vec<String>, DagError> {
    let mut seen = HashSet::new();
    for task in &plan.tasks {
        if !seen.insert(task.task_id.as_str()) {
            return Err(DagError::DuplicateTaskId(task.task_id.clone()));
        }
    }

    for task in &plan.tasks {
        for dep in &task.dependencies {
            if plan.task(dep).is_none() {
                return Err(DagError::UnknownDependency {
                    task: task.task_id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    // Kahn's algorithm: repeatedly remove nodes with in-degree zero.
    let mut in_degree: HashMap<&str, usize> = plan
        .tasks
        .iter()
        .map(|t| (t.task_id.as_str(), t.dependencies.len()))
        .collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for task in &plan.tasks {
        for dep in &task.dependencies {
            dependents
                .entry(dep.as_str())
                .or_default()
                .push(task.task_id.as_str());
        }
    }

    // Deterministic order for callers that care (e.g. dispatch-order tests).
    let mut initial: Vec<&str> = in_degree
        .iter()
        .filter(|(_, &deg)| deg == 0)
        .map(|(&id, _)| id)
        .collect();
    initial.sort();
    let mut queue: VecDeque<&str> = initial.into();

    let mut order = Vec::with_capacity(plan.tasks.len());
    while let Some(id) = queue.pop_front() {
        order.push(id.to_string());
        if let Some(next) = dependents.get(id) {
            let mut ready = Vec::new();
            for &dep_task in next {
                let deg = in_degree.get_mut(dep_task).unwrap();
                *deg -= 1;
                if *deg == 0 {
                    ready.push(dep_task);
                }
            }
            ready.sort();
            for r in ready {
                queue.push_back(r);
            }
        }
    }

    if order.len() != plan.tasks.len() {
        let remaining: Vec<String> = plan
            .tasks
            .iter()
            .map(|t| t.task_id.clone())
            .filter(|id| !order.contains(id))
            .collect();
        return Err(DagError::Cycle(remaining));
    }

    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Task;
    use std::collections::BTreeMap;

    fn task(id: &str, deps: &[&str]) -> Task {
        Task {
            task_id: id.to_string(),
            agent: "echo".to_string(),
            details: BTreeMap::new(),
            dependencies: deps.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn plan(tasks: Vec<Task>) -> Plan {
        Plan {
            job_id: "j1".to_string(),
            goal: "g".to_string(),
            tasks,
        }
    }

    #[test]
    fn linear_chain_is_acyclic() {
        let p = plan(vec![task("a", &[]), task("b", &["a"]), task("c", &["b"])]);
        let order = validate_acyclic(&p).unwrap();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn fan_out_fan_in_is_acyclic() {
        let p = plan(vec![
            task("t1", &[]),
            task("t2", &["t1"]),
            task("t3", &["t1"]),
            task("t4", &["t2", "t3"]),
        ]);
        let order = validate_acyclic(&p).unwrap();
        assert_eq!(order.last().unwrap(), "t4");
    }

    #[test]
    fn direct_cycle_is_rejected() {
        let p = plan(vec![task("a", &["b"]), task("b", &["a"])]);
        let err = validate_acyclic(&p).unwrap_err();
        assert!(matches!(err, DagError::Cycle(_)));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let p = plan(vec![task("a", &["ghost"])]);
        let err = validate_acyclic(&p).unwrap_err();
        assert!(matches!(err, DagError::UnknownDependency { .. }));
    }

    #[test]
    fn duplicate_task_id_is_rejected() {
        let p = plan(vec![task("a", &[]), task("a", &[])]);
        let err = validate_acyclic(&p).unwrap_err();
        assert_eq!(err, DagError::DuplicateTaskId("a".to_string()));
    }
}
