//! Execution Planner
//!
//! Builds the dependency graph of a workflow and derives its execution plan:
//! - Dependency reference checking
//! - Cycle detection (naming the steps on the cycle)
//! - Topological ordering with declaration-order tie-break
//! - Grouping into parallel-safe batches

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::fmt;

use log::debug;
use serde::Serialize;
use thiserror::Error;

use super::model::Step;

/// The steps on a dependency cycle, in dependency order.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct CyclicDependencyError {
    pub steps: Vec<String>,
}

impl fmt::Display for CyclicDependencyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cyclic dependency: {}", self.steps.join(" -> "))?;
        if let Some(first) = self.steps.first() {
            write!(f, " -> {}", first)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error(transparent)]
    Cyclic(#[from] CyclicDependencyError),

    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("duplicate step id '{0}'")]
    DuplicateStep(String),
}

/// Ordered step ids grouped into batches.
///
/// Every step appears after all of its dependencies; members of one batch
/// never depend on each other, directly or transitively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionPlan {
    pub order: Vec<String>,
    pub batches: Vec<Vec<String>>,
    pub parallel: bool,
}

impl ExecutionPlan {
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Index of the batch containing a step.
    pub fn batch_of(&self, step_id: &str) -> Option<usize> {
        self.batches
            .iter()
            .position(|batch| batch.iter().any(|id| id == step_id))
    }

    /// Position of a step in the overall order.
    pub fn position(&self, step_id: &str) -> Option<usize> {
        self.order.iter().position(|id| id == step_id)
    }
}

/// Dependency graph over the steps of one workflow.
///
/// Nodes are addressed by declaration index so every traversal is
/// deterministic.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    ids: Vec<String>,
    index: HashMap<String, usize>,
    dependencies: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
}

impl DependencyGraph {
    /// Builds the graph, rejecting duplicate ids and unknown dependencies.
    pub fn new(steps: &[Step]) -> Result<Self, PlanError> {
        let mut index = HashMap::with_capacity(steps.len());
        for (i, step) in steps.iter().enumerate() {
            if index.insert(step.id.clone(), i).is_some() {
                return Err(PlanError::DuplicateStep(step.id.clone()));
            }
        }

        let mut dependencies = vec![Vec::new(); steps.len()];
        let mut dependents = vec![Vec::new(); steps.len()];

        for (i, step) in steps.iter().enumerate() {
            for dep in &step.depends_on {
                let &d = index.get(dep).ok_or_else(|| PlanError::UnknownDependency {
                    step: step.id.clone(),
                    dependency: dep.clone(),
                })?;
                if !dependencies[i].contains(&d) {
                    dependencies[i].push(d);
                    dependents[d].push(i);
                }
            }
        }

        for list in dependencies.iter_mut().chain(dependents.iter_mut()) {
            list.sort_unstable();
        }

        Ok(Self {
            ids: steps.iter().map(|s| s.id.clone()).collect(),
            index,
            dependencies,
            dependents,
        })
    }

    /// Derives the execution plan using Kahn's algorithm.
    ///
    /// With `parallel`, batch k holds every step whose longest dependency
    /// chain has length k. Otherwise each batch holds one step and the
    /// order prefers the earliest declared ready step.
    pub fn plan(&self, parallel: bool) -> Result<ExecutionPlan, CyclicDependencyError> {
        let mut in_degree: Vec<usize> = self.dependencies.iter().map(Vec::len).collect();
        let mut processed = vec![false; self.ids.len()];
        let mut order = Vec::with_capacity(self.ids.len());
        let mut batches = Vec::new();

        if parallel {
            let mut current: Vec<usize> = (0..self.ids.len()).filter(|&i| in_degree[i] == 0).collect();

            while !current.is_empty() {
                let mut next = Vec::new();
                for &node in &current {
                    processed[node] = true;
                    for &dependent in &self.dependents[node] {
                        in_degree[dependent] -= 1;
                        if in_degree[dependent] == 0 {
                            next.push(dependent);
                        }
                    }
                }
                next.sort_unstable();

                let batch: Vec<String> = current.iter().map(|&i| self.ids[i].clone()).collect();
                order.extend(batch.iter().cloned());
                batches.push(batch);
                current = next;
            }
        } else {
            let mut ready: BinaryHeap<Reverse<usize>> = (0..self.ids.len())
                .filter(|&i| in_degree[i] == 0)
                .map(Reverse)
                .collect();

            while let Some(Reverse(node)) = ready.pop() {
                processed[node] = true;
                order.push(self.ids[node].clone());
                batches.push(vec![self.ids[node].clone()]);

                for &dependent in &self.dependents[node] {
                    in_degree[dependent] -= 1;
                    if in_degree[dependent] == 0 {
                        ready.push(Reverse(dependent));
                    }
                }
            }
        }

        if order.len() != self.ids.len() {
            return Err(self.find_cycle(&processed));
        }

        debug!("Topological order: {:?}", order);
        debug!("Batches: {:?}", batches);

        Ok(ExecutionPlan {
            order,
            batches,
            parallel,
        })
    }

    /// Walks unprocessed dependencies until a node repeats.
    ///
    /// Every node Kahn's algorithm left behind still has an unprocessed
    /// dependency, so the walk always closes a cycle.
    fn find_cycle(&self, processed: &[bool]) -> CyclicDependencyError {
        let Some(start) = processed.iter().position(|done| !done) else {
            return CyclicDependencyError { steps: Vec::new() };
        };

        let mut path: Vec<usize> = Vec::new();
        let mut seen_at: HashMap<usize, usize> = HashMap::new();
        let mut current = start;

        let cycle = loop {
            if let Some(&at) = seen_at.get(&current) {
                break path[at..].to_vec();
            }
            seen_at.insert(current, path.len());
            path.push(current);

            match self.dependencies[current].iter().find(|&&d| !processed[d]) {
                Some(&next) => current = next,
                None => break vec![current],
            }
        };

        // Start the report at the earliest declared member
        let pivot = cycle
            .iter()
            .enumerate()
            .min_by_key(|(_, &node)| node)
            .map(|(i, _)| i)
            .unwrap_or(0);
        let mut rotated = cycle[pivot..].to_vec();
        rotated.extend_from_slice(&cycle[..pivot]);

        CyclicDependencyError {
            steps: rotated.into_iter().map(|i| self.ids[i].clone()).collect(),
        }
    }

    /// All steps the given step depends on, directly or transitively.
    pub fn ancestors(&self, step_id: &str) -> HashSet<String> {
        let mut found = HashSet::new();
        let Some(&start) = self.index.get(step_id) else {
            return found;
        };

        let mut stack = self.dependencies[start].clone();
        while let Some(node) = stack.pop() {
            if found.insert(self.ids[node].clone()) {
                stack.extend(self.dependencies[node].iter().copied());
            }
        }
        found
    }

    /// Direct dependents of a step.
    pub fn dependents_of(&self, step_id: &str) -> Vec<&str> {
        self.index
            .get(step_id)
            .map(|&i| self.dependents[i].iter().map(|&d| self.ids[d].as_str()).collect())
            .unwrap_or_default()
    }
}

/// Builds the execution plan for a list of steps.
pub fn build_plan(steps: &[Step], parallel: bool) -> Result<ExecutionPlan, PlanError> {
    Ok(DependencyGraph::new(steps)?.plan(parallel)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::Operation;

    fn step(id: &str, deps: &[&str]) -> Step {
        deps.iter().fold(Step::new(id, Operation::Mutation, "op"), |s, d| s.depends_on(*d))
    }

    fn assert_topological(steps: &[Step], plan: &ExecutionPlan) {
        for s in steps {
            let pos = plan.position(&s.id).unwrap();
            for dep in &s.depends_on {
                assert!(plan.position(dep).unwrap() < pos, "{} must follow {}", s.id, dep);
            }
        }
    }

    #[test]
    fn test_promotion_batches() {
        let steps = vec![
            step("create", &[]),
            step("add_condition", &["create"]),
            step("add_action", &["create"]),
        ];

        let plan = build_plan(&steps, true).unwrap();
        assert_eq!(plan.batches.len(), 2);
        assert_eq!(plan.batches[0], vec!["create"]);
        assert_eq!(plan.batches[1], vec!["add_condition", "add_action"]);
        assert_eq!(plan.batch_of("add_action"), Some(1));
    }

    #[test]
    fn test_sequential_keeps_declared_order() {
        let steps = vec![step("a", &[]), step("b", &[]), step("c", &["a"])];

        let plan = build_plan(&steps, false).unwrap();
        assert_eq!(plan.order, vec!["a", "b", "c"]);
        assert!(plan.batches.iter().all(|b| b.len() == 1));
        assert!(!plan.parallel);
    }

    #[test]
    fn test_sequential_reorders_when_needed() {
        let steps = vec![step("c", &["b"]), step("a", &[]), step("b", &["a"])];

        let plan = build_plan(&steps, false).unwrap();
        assert_eq!(plan.order, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_order_is_topological() {
        let steps = vec![
            step("report", &["merge"]),
            step("fetch_a", &[]),
            step("merge", &["fetch_a", "fetch_b"]),
            step("fetch_b", &[]),
            step("notify", &["report", "fetch_a"]),
        ];

        for parallel in [true, false] {
            let plan = build_plan(&steps, parallel).unwrap();
            assert_eq!(plan.len(), steps.len());
            assert_topological(&steps, &plan);
        }
    }

    #[test]
    fn test_batch_members_are_independent() {
        let steps = vec![
            step("a", &[]),
            step("b", &["a"]),
            step("c", &[]),
            step("d", &["b", "c"]),
            step("e", &["a"]),
        ];
        let graph = DependencyGraph::new(&steps).unwrap();
        let plan = graph.plan(true).unwrap();

        for batch in &plan.batches {
            for x in batch {
                let ancestors = graph.ancestors(x);
                assert!(batch.iter().all(|y| !ancestors.contains(y)));
            }
        }
        assert_eq!(plan.batches[0], vec!["a", "c"]);
        assert_eq!(plan.batches[1], vec!["b", "e"]);
        assert_eq!(plan.batches[2], vec!["d"]);
    }

    #[test]
    fn test_plan_is_deterministic() {
        let steps = vec![
            step("x", &[]),
            step("y", &["x"]),
            step("z", &["x"]),
            step("w", &["y", "z"]),
        ];

        let first = build_plan(&steps, true).unwrap();
        for _ in 0..10 {
            assert_eq!(build_plan(&steps, true).unwrap(), first);
        }
    }

    #[test]
    fn test_cycle_names_participants() {
        let steps = vec![
            step("start", &[]),
            step("a", &["start", "c"]),
            step("b", &["a"]),
            step("c", &["b"]),
            step("tail", &["c"]),
        ];

        for parallel in [true, false] {
            let err = build_plan(&steps, parallel).unwrap_err();
            match err {
                PlanError::Cyclic(cycle) => {
                    let mut names = cycle.steps.clone();
                    names.sort();
                    assert_eq!(names, vec!["a", "b", "c"]);
                    assert_eq!(cycle.steps[0], "a");
                }
                other => panic!("expected cycle, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let err = build_plan(&[step("loop", &["loop"])], true).unwrap_err();
        assert_eq!(
            err,
            PlanError::Cyclic(CyclicDependencyError {
                steps: vec!["loop".into()]
            })
        );
        assert!(err.to_string().contains("loop -> loop"));
    }

    #[test]
    fn test_unknown_dependency() {
        let err = build_plan(&[step("a", &["ghost"])], true).unwrap_err();
        assert!(matches!(err, PlanError::UnknownDependency { .. }));
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_duplicate_step() {
        let err = DependencyGraph::new(&[step("a", &[]), step("a", &[])]).unwrap_err();
        assert_eq!(err, PlanError::DuplicateStep("a".into()));
    }

    #[test]
    fn test_ancestors_and_dependents() {
        let steps = vec![step("a", &[]), step("b", &["a"]), step("c", &["b"])];
        let graph = DependencyGraph::new(&steps).unwrap();

        let ancestors = graph.ancestors("c");
        assert!(ancestors.contains("a") && ancestors.contains("b"));
        assert!(graph.ancestors("a").is_empty());
        assert_eq!(graph.dependents_of("a"), vec!["b"]);
    }

    #[test]
    fn test_duplicate_edges_are_collapsed() {
        let steps = vec![step("a", &[]), step("b", &["a", "a"])];
        let plan = build_plan(&steps, true).unwrap();
        assert_eq!(plan.order, vec!["a", "b"]);
    }

    #[test]
    fn test_empty_plan() {
        let plan = build_plan(&[], true).unwrap();
        assert!(plan.is_empty());
        assert!(plan.batches.is_empty());
    }
}
