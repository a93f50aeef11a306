use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::error::WorkflowError;
use crate::workflow::types::NodeSpec;

/// Compiled execution plan for one phase: node indices in an order that
/// respects every declared dependency edge.
#[derive(Debug)]
pub struct NodeDag {
    order: Vec<usize>,
}

impl NodeDag {
    /// Build the dependency graph for a phase's node list and produce a
    /// topological order. Fails fast on unknown dependencies and cycles —
    /// a cycle is fatal for the phase and never yields a partial order.
    pub fn build(nodes: &[NodeSpec]) -> Result<Self, WorkflowError> {
        let index_by_id: HashMap<&str, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.as_str(), i))
            .collect();

        // dependents[i] lists the nodes waiting on node i
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
        let mut in_degree: Vec<usize> = vec![0; nodes.len()];

        for (i, node) in nodes.iter().enumerate() {
            let mut seen = HashSet::new();
            for dep in &node.dependencies {
                if !seen.insert(dep.as_str()) {
                    continue; // duplicate edge, count once
                }
                let dep_idx = *index_by_id.get(dep.as_str()).ok_or_else(|| {
                    WorkflowError::UnknownDependency {
                        node: node.id.clone(),
                        dependency: dep.clone(),
                    }
                })?;
                dependents[dep_idx].push(i);
                in_degree[i] += 1;
            }
        }

        // Kahn's algorithm. The ready set is kept sorted by declaration
        // index so the order is deterministic across runs.
        let mut ready: Vec<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| i)
            .collect();
        ready.sort_unstable();

        let mut order = Vec::with_capacity(nodes.len());
        while let Some(next) = ready.first().copied() {
            ready.remove(0);
            order.push(next);
            for &dependent in &dependents[next] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    let pos = ready.binary_search(&dependent).unwrap_or_else(|p| p);
                    ready.insert(pos, dependent);
                }
            }
        }

        if order.len() != nodes.len() {
            // Any node still holding an in-degree is part of (or behind) a cycle
            let stuck = in_degree
                .iter()
                .enumerate()
                .find(|(_, d)| **d > 0)
                .map(|(i, _)| nodes[i].id.clone())
                .unwrap_or_default();
            return Err(WorkflowError::CycleDetected(stuck));
        }

        debug!(
            order = ?order.iter().map(|&i| nodes[i].id.as_str()).collect::<Vec<_>>(),
            "built node execution order"
        );

        Ok(Self { order })
    }

    /// Nodes in execution order.
    pub fn ordered<'a>(&self, nodes: &'a [NodeSpec]) -> Vec<&'a NodeSpec> {
        self.order.iter().map(|&i| &nodes[i]).collect()
    }
}
