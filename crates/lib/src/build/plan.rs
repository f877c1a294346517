//! Step scheduling.
//!
//! Steps and their `needs` form a DAG. Waves are computed level by level:
//! every step in a wave has all of its prerequisites in earlier waves.

use std::collections::HashMap;

use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use thiserror::Error;

use crate::recipe::Step;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("build steps form a dependency cycle")]
pub struct StepCycle;

/// Group step indices into waves. Indices within a wave are ascending.
pub fn step_waves(steps: &[Step]) -> Result<Vec<Vec<usize>>, StepCycle> {
  let mut graph: DiGraph<usize, ()> = DiGraph::new();
  let nodes: Vec<NodeIndex> = (0..steps.len()).map(|i| graph.add_node(i)).collect();

  for (idx, step) in steps.iter().enumerate() {
    for &dep in &step.needs {
      let Some(&from) = nodes.get(dep) else {
        continue;
      };
      graph.add_edge(from, nodes[idx], ());
    }
  }

  toposort(&graph, None).map_err(|_| StepCycle)?;

  let mut in_degree: HashMap<NodeIndex, usize> = graph
    .node_indices()
    .map(|n| (n, graph.neighbors_directed(n, Direction::Incoming).count()))
    .collect();
  let mut remaining: Vec<NodeIndex> = graph.node_indices().collect();
  let mut waves = Vec::new();

  while !remaining.is_empty() {
    let (ready, rest): (Vec<NodeIndex>, Vec<NodeIndex>) = remaining.into_iter().partition(|n| in_degree[n] == 0);
    if ready.is_empty() {
      return Err(StepCycle);
    }

    for &node in &ready {
      for next in graph.neighbors_directed(node, Direction::Outgoing) {
        if let Some(deg) = in_degree.get_mut(&next) {
          *deg = deg.saturating_sub(1);
        }
      }
    }

    let mut wave: Vec<usize> = ready.iter().map(|n| graph[*n]).collect();
    wave.sort_unstable();
    waves.push(wave);
    remaining = rest;
  }

  Ok(waves)
}
