//! Job dependency graph.
//!
//! Nodes move through `pending -> ready -> running -> {success, failure}`,
//! or jump from any pre-terminal state to `skipped`/`cancelled`. The
//! scheduler is the only mutator; executors never touch the DAG.

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DagError {
    #[error("cycle detected in job dependencies")]
    CycleDetected,
    #[error("unknown job dependency: {0}")]
    UnknownDependency(String),
    #[error("duplicate job name: {0}")]
    DuplicateName(String),
    #[error("empty job set")]
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Pending,
    Ready,
    Running,
    Success,
    Failure,
    Skipped,
    Cancelled,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeStatus::Success | NodeStatus::Failure | NodeStatus::Skipped | NodeStatus::Cancelled
        )
    }
}

/// Result of applying a completion to the graph.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CompletionEffect {
    /// Nodes that transitioned `pending -> ready`.
    pub newly_ready: Vec<String>,
    /// Nodes transitively skipped because a dependency failed.
    pub skipped: Vec<String>,
}

#[derive(Debug)]
pub struct JobDag {
    graph: DiGraph<String, ()>,
    index: HashMap<String, NodeIndex>,
    status: HashMap<NodeIndex, NodeStatus>,
}

impl JobDag {
    /// Build and validate a DAG from `(name, dependencies)` pairs.
    pub fn build<'a, I>(nodes: I) -> Result<Self, DagError>
    where
        I: IntoIterator<Item = (&'a str, Vec<&'a str>)>,
    {
        let nodes: Vec<(&str, Vec<&str>)> = nodes.into_iter().collect();
        if nodes.is_empty() {
            return Err(DagError::Empty);
        }

        let mut graph = DiGraph::new();
        let mut index = HashMap::new();

        for (name, _) in &nodes {
            if index.contains_key(*name) {
                return Err(DagError::DuplicateName(name.to_string()));
            }
            let idx = graph.add_node(name.to_string());
            index.insert(name.to_string(), idx);
        }

        for (name, deps) in &nodes {
            let node_idx = index[*name];
            for dep in deps {
                let dep_idx = index
                    .get(*dep)
                    .ok_or_else(|| DagError::UnknownDependency(dep.to_string()))?;
                graph.add_edge(*dep_idx, node_idx, ());
            }
        }

        toposort(&graph, None).map_err(|_| DagError::CycleDetected)?;

        let status = graph
            .node_indices()
            .map(|idx| {
                let has_deps = graph
                    .neighbors_directed(idx, Direction::Incoming)
                    .next()
                    .is_some();
                let initial = if has_deps {
                    NodeStatus::Pending
                } else {
                    NodeStatus::Ready
                };
                (idx, initial)
            })
            .collect();

        Ok(Self {
            graph,
            index,
            status,
        })
    }

    pub fn status(&self, name: &str) -> Option<NodeStatus> {
        self.index.get(name).map(|idx| self.status[idx])
    }

    /// Names currently in `Ready`, sorted for deterministic dispatch.
    pub fn ready(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .status
            .iter()
            .filter(|(_, s)| **s == NodeStatus::Ready)
            .map(|(idx, _)| self.graph[*idx].clone())
            .collect();
        names.sort();
        names
    }

    pub fn mark_running(&mut self, name: &str) -> bool {
        match self.index.get(name) {
            Some(idx) if self.status[idx] == NodeStatus::Ready => {
                self.status.insert(*idx, NodeStatus::Running);
                true
            }
            _ => false,
        }
    }

    /// Record a terminal result for `name`.
    ///
    /// On success, dependents whose dependencies are now all successful
    /// become ready. On failure, every transitive dependent that has not
    /// already reached a terminal state is skipped.
    pub fn mark_completed(&mut self, name: &str, success: bool) -> CompletionEffect {
        let Some(&idx) = self.index.get(name) else {
            return CompletionEffect::default();
        };

        let mut effect = CompletionEffect::default();

        if success {
            self.status.insert(idx, NodeStatus::Success);
            for dependent in self
                .graph
                .neighbors_directed(idx, Direction::Outgoing)
                .collect::<Vec<_>>()
            {
                if self.status[&dependent] == NodeStatus::Pending && self.deps_satisfied(dependent) {
                    self.status.insert(dependent, NodeStatus::Ready);
                    effect.newly_ready.push(self.graph[dependent].clone());
                }
            }
            effect.newly_ready.sort();
        } else {
            self.status.insert(idx, NodeStatus::Failure);
            effect.skipped = self.skip_dependents(idx);
        }

        effect
    }

    /// Record that a running job ended cancelled (the executor observed the
    /// cancel intent). Dependents are skipped.
    pub fn mark_cancelled(&mut self, name: &str) -> CompletionEffect {
        let Some(&idx) = self.index.get(name) else {
            return CompletionEffect::default();
        };
        let mut effect = CompletionEffect::default();
        if !self.status[&idx].is_terminal() {
            self.status.insert(idx, NodeStatus::Cancelled);
            effect.skipped = self.skip_dependents(idx);
        }
        effect
    }

    /// Mark a non-terminal node cancelled; its transitive dependents are
    /// skipped. Running nodes are left alone (the executor observes the
    /// cancel flag and reports its own terminal status).
    pub fn cancel_node(&mut self, name: &str) -> CompletionEffect {
        let Some(&idx) = self.index.get(name) else {
            return CompletionEffect::default();
        };
        let mut effect = CompletionEffect::default();
        if matches!(self.status[&idx], NodeStatus::Pending | NodeStatus::Ready) {
            self.status.insert(idx, NodeStatus::Cancelled);
            effect.skipped = self.skip_dependents(idx);
        }
        effect
    }

    /// Every non-terminal, non-running node becomes cancelled. Returns the
    /// affected names.
    pub fn cancel_all(&mut self) -> Vec<String> {
        let mut cancelled = Vec::new();
        for idx in self.graph.node_indices() {
            if matches!(self.status[&idx], NodeStatus::Pending | NodeStatus::Ready) {
                self.status.insert(idx, NodeStatus::Cancelled);
                cancelled.push(self.graph[idx].clone());
            }
        }
        cancelled.sort();
        cancelled
    }

    pub fn is_complete(&self) -> bool {
        self.status.values().all(NodeStatus::is_terminal)
    }

    pub fn has_status(&self, wanted: NodeStatus) -> bool {
        self.status.values().any(|s| *s == wanted)
    }

    pub fn running_count(&self) -> usize {
        self.status
            .values()
            .filter(|s| **s == NodeStatus::Running)
            .count()
    }

    /// Deterministic topological order of all job names.
    pub fn topological_order(&self) -> Vec<String> {
        // Validated at build time; a cycle here is a structural bug.
        let order = toposort(&self.graph, None).expect("validated DAG became cyclic");
        order.into_iter().map(|idx| self.graph[idx].clone()).collect()
    }

    /// Layers such that every dependency of a job lives in an earlier layer.
    pub fn parallel_layers(&self) -> Vec<Vec<String>> {
        let mut depth: HashMap<NodeIndex, usize> = HashMap::new();
        let order = toposort(&self.graph, None).expect("validated DAG became cyclic");

        let mut layers: Vec<Vec<String>> = Vec::new();
        for idx in order {
            let level = self
                .graph
                .neighbors_directed(idx, Direction::Incoming)
                .map(|dep| depth[&dep] + 1)
                .max()
                .unwrap_or(0);
            depth.insert(idx, level);
            if layers.len() <= level {
                layers.resize_with(level + 1, Vec::new);
            }
            layers[level].push(self.graph[idx].clone());
        }
        for layer in &mut layers {
            layer.sort();
        }
        layers
    }

    fn deps_satisfied(&self, idx: NodeIndex) -> bool {
        self.graph
            .neighbors_directed(idx, Direction::Incoming)
            .all(|dep| self.status[&dep] == NodeStatus::Success)
    }

    fn skip_dependents(&mut self, from: NodeIndex) -> Vec<String> {
        let mut skipped = Vec::new();
        let mut stack = vec![from];
        while let Some(idx) = stack.pop() {
            for dependent in self
                .graph
                .neighbors_directed(idx, Direction::Outgoing)
                .collect::<Vec<_>>()
            {
                if !self.status[&dependent].is_terminal()
                    && self.status[&dependent] != NodeStatus::Running
                {
                    self.status.insert(dependent, NodeStatus::Skipped);
                    skipped.push(self.graph[dependent].clone());
                }
                stack.push(dependent);
            }
        }
        skipped.sort();
        skipped.dedup();
        skipped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear() -> JobDag {
        JobDag::build([("a", vec![]), ("b", vec!["a"]), ("c", vec!["b"])]).unwrap()
    }

    #[test]
    fn test_initial_ready_set() {
        let dag = linear();
        assert_eq!(dag.ready(), vec!["a"]);
        assert_eq!(dag.status("b"), Some(NodeStatus::Pending));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let err = JobDag::build([("a", vec!["ghost"])]).unwrap_err();
        assert!(matches!(err, DagError::UnknownDependency(_)));
    }

    #[test]
    fn test_cycle_rejected() {
        let err = JobDag::build([("a", vec!["b"]), ("b", vec!["a"])]).unwrap_err();
        assert!(matches!(err, DagError::CycleDetected));
    }

    #[test]
    fn test_success_chain() {
        let mut dag = linear();
        assert!(dag.mark_running("a"));
        let effect = dag.mark_completed("a", true);
        assert_eq!(effect.newly_ready, vec!["b"]);

        dag.mark_running("b");
        let effect = dag.mark_completed("b", true);
        assert_eq!(effect.newly_ready, vec!["c"]);

        dag.mark_running("c");
        dag.mark_completed("c", true);
        assert!(dag.is_complete());
        assert!(!dag.has_status(NodeStatus::Failure));
    }

    #[test]
    fn test_failure_skips_transitively() {
        let mut dag = JobDag::build([
            ("a", vec![]),
            ("b", vec!["a"]),
            ("c", vec!["b"]),
            ("d", vec![]),
        ])
        .unwrap();

        dag.mark_running("a");
        let effect = dag.mark_completed("a", false);
        assert_eq!(effect.skipped, vec!["b", "c"]);
        assert_eq!(dag.status("d"), Some(NodeStatus::Ready));

        dag.mark_running("d");
        dag.mark_completed("d", true);
        assert!(dag.is_complete());
        assert!(dag.has_status(NodeStatus::Failure));
    }

    #[test]
    fn test_fan_in_waits_for_all_deps() {
        let mut dag = JobDag::build([
            ("root", vec![]),
            ("left", vec!["root"]),
            ("right", vec!["root"]),
            ("join", vec!["left", "right"]),
        ])
        .unwrap();

        dag.mark_running("root");
        let effect = dag.mark_completed("root", true);
        assert_eq!(effect.newly_ready, vec!["left", "right"]);

        dag.mark_running("left");
        let effect = dag.mark_completed("left", true);
        assert!(effect.newly_ready.is_empty());

        dag.mark_running("right");
        let effect = dag.mark_completed("right", true);
        assert_eq!(effect.newly_ready, vec!["join"]);
    }

    #[test]
    fn test_cancel_all_leaves_running_alone() {
        let mut dag = linear();
        dag.mark_running("a");
        let cancelled = dag.cancel_all();
        assert_eq!(cancelled, vec!["b", "c"]);
        assert_eq!(dag.status("a"), Some(NodeStatus::Running));

        dag.mark_completed("a", true);
        assert!(dag.is_complete());
    }

    #[test]
    fn test_cancel_node_skips_dependents() {
        let mut dag = linear();
        let effect = dag.cancel_node("a");
        assert_eq!(effect.skipped, vec!["b", "c"]);
        assert_eq!(dag.status("a"), Some(NodeStatus::Cancelled));
        assert!(dag.is_complete());
    }

    #[test]
    fn test_topological_order_respects_deps() {
        let dag = JobDag::build([
            ("join", vec!["left", "right"]),
            ("left", vec!["root"]),
            ("right", vec!["root"]),
            ("root", vec![]),
        ])
        .unwrap();

        let order = dag.topological_order();
        let pos = |n: &str| order.iter().position(|x| x == n).unwrap();
        assert!(pos("root") < pos("left"));
        assert!(pos("root") < pos("right"));
        assert!(pos("left") < pos("join"));
        assert!(pos("right") < pos("join"));
    }

    #[test]
    fn test_parallel_layers() {
        let dag = JobDag::build([
            ("root", vec![]),
            ("left", vec!["root"]),
            ("right", vec!["root"]),
            ("join", vec!["left", "right"]),
        ])
        .unwrap();

        assert_eq!(
            dag.parallel_layers(),
            vec![
                vec!["root".to_string()],
                vec!["left".to_string(), "right".to_string()],
                vec!["join".to_string()],
            ]
        );
    }

    #[test]
    fn test_random_completion_terminates() {
        // Property: repeatedly completing any ready node with an arbitrary
        // result always drains the DAG.
        for failure_mask in 0u32..32 {
            let mut dag = JobDag::build([
                ("a", vec![]),
                ("b", vec!["a"]),
                ("c", vec!["a"]),
                ("d", vec!["b", "c"]),
                ("e", vec![]),
            ])
            .unwrap();

            let mut step = 0;
            while !dag.is_complete() {
                let ready = dag.ready();
                assert!(!ready.is_empty(), "live DAG must expose ready work");
                let name = ready[0].clone();
                dag.mark_running(&name);
                let success = failure_mask & (1 << step) == 0;
                dag.mark_completed(&name, success);
                step += 1;
                assert!(step <= 5, "must terminate within node count");
            }
        }
    }
}
