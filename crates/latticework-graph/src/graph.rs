use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::error::GraphError;
use crate::lattice::LatticeMetadata;
use crate::node::{ArgTemplate, Node, NodeId, NodeMetadata, NodeRole, parse_node_key};
use crate::task::TaskFunction;

/// How a dependency is consumed by the downstream node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
  Positional(usize),
  Keyword(String),
  /// Parent of a generated node.
  Projection,
}

/// A data dependency: `from`'s output feeds `to`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
  pub from: NodeId,
  pub to: NodeId,
  pub param: ParamKind,
}

/// The DAG of one lattice invocation.
///
/// Nodes are stored by index; a node's id is its position. The graph is
/// built once and never loses nodes or edges, but node metadata, status and
/// results are updated in place during planning and execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportGraph {
  nodes: Vec<Node>,
  edges: Vec<Edge>,
  lattice_metadata: LatticeMetadata,
}

impl TransportGraph {
  pub fn new(lattice_metadata: LatticeMetadata) -> Self {
    Self {
      nodes: Vec::new(),
      edges: Vec::new(),
      lattice_metadata,
    }
  }

  pub fn lattice_metadata(&self) -> &LatticeMetadata {
    &self.lattice_metadata
  }

  pub fn lattice_metadata_mut(&mut self) -> &mut LatticeMetadata {
    &mut self.lattice_metadata
  }

  /// Add a node and return its id.
  pub fn add_node(
    &mut self,
    name: impl Into<String>,
    role: NodeRole,
    metadata: NodeMetadata,
    function: Option<TaskFunction>,
  ) -> NodeId {
    let id = self.nodes.len();
    self
      .nodes
      .push(Node::new(id, name.into(), role, metadata, function));
    id
  }

  /// Add a dependency edge. Rejects unknown endpoints and cycles.
  pub fn add_edge(&mut self, from: NodeId, to: NodeId, param: ParamKind) -> Result<(), GraphError> {
    if from >= self.nodes.len() || to >= self.nodes.len() {
      return Err(GraphError::InvalidEdge { from, to });
    }
    if from == to || self.reaches(to, from) {
      return Err(GraphError::Cycle {
        from: self.nodes[from].key(),
        to: self.nodes[to].key(),
      });
    }
    self.edges.push(Edge { from, to, param });
    Ok(())
  }

  /// Record the argument templates of a task node.
  pub fn set_arguments(
    &mut self,
    id: NodeId,
    args: Vec<ArgTemplate>,
    kwargs: Vec<(String, ArgTemplate)>,
  ) -> Result<(), GraphError> {
    let node = self.node_mut(id).ok_or(GraphError::NodeNotFound(id))?;
    node.args = args;
    node.kwargs = kwargs;
    Ok(())
  }

  pub fn node(&self, id: NodeId) -> Option<&Node> {
    self.nodes.get(id)
  }

  pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
    self.nodes.get_mut(id)
  }

  pub fn nodes(&self) -> &[Node] {
    &self.nodes
  }

  pub fn edges(&self) -> &[Edge] {
    &self.edges
  }

  pub fn len(&self) -> usize {
    self.nodes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.nodes.is_empty()
  }

  /// Find a node by its key, e.g. `:generated:a()[0](2)`.
  pub fn find(&self, key: &str) -> Option<NodeId> {
    let (name, id) = parse_node_key(key)?;
    self.nodes.get(id).filter(|node| node.name == name).map(|node| node.id)
  }

  /// Build adjacency lists for traversal.
  pub fn adjacency(&self) -> Adjacency {
    Adjacency::new(self.nodes.len(), &self.edges)
  }

  /// Topological order, smallest id first among ready nodes.
  pub fn topological_order(&self) -> Result<Vec<NodeId>, GraphError> {
    let adjacency = self.adjacency();
    let mut in_degree: Vec<usize> = (0..self.nodes.len())
      .map(|id| adjacency.upstream(id).len())
      .collect();

    let mut ready: BinaryHeap<Reverse<NodeId>> = in_degree
      .iter()
      .enumerate()
      .filter(|(_, degree)| **degree == 0)
      .map(|(id, _)| Reverse(id))
      .collect();

    let mut order = Vec::with_capacity(self.nodes.len());
    while let Some(Reverse(id)) = ready.pop() {
      order.push(id);
      for &next in adjacency.downstream(id) {
        in_degree[next] -= 1;
        if in_degree[next] == 0 {
          ready.push(Reverse(next));
        }
      }
    }

    if order.len() != self.nodes.len() {
      let stuck = in_degree
        .iter()
        .position(|degree| *degree > 0)
        .map(|id| self.nodes[id].key())
        .unwrap_or_default();
      return Err(GraphError::Cyclic(stuck));
    }

    Ok(order)
  }

  /// Every node reachable from `id`, excluding `id` itself.
  pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
    let adjacency = self.adjacency();
    let mut seen = HashSet::new();
    let mut queue: VecDeque<NodeId> = adjacency.downstream(id).iter().copied().collect();
    let mut out = Vec::new();
    while let Some(next) = queue.pop_front() {
      if seen.insert(next) {
        out.push(next);
        queue.extend(adjacency.downstream(next).iter().copied());
      }
    }
    out
  }

  /// Serialize the graph. `metadata_only` drops outputs and captured streams.
  pub fn to_json(&self, metadata_only: bool) -> Result<serde_json::Value, GraphError> {
    let mut value = serde_json::to_value(self)?;
    if metadata_only && let Some(nodes) = value.get_mut("nodes").and_then(|n| n.as_array_mut()) {
      for node in nodes.iter_mut().filter_map(|n| n.as_object_mut()) {
        for field in ["output", "error", "stdout", "stderr"] {
          node.remove(field);
        }
      }
    }
    Ok(value)
  }

  fn reaches(&self, from: NodeId, target: NodeId) -> bool {
    let adjacency = self.adjacency();
    let mut seen = HashSet::new();
    let mut stack = vec![from];
    while let Some(id) = stack.pop() {
      if id == target {
        return true;
      }
      if seen.insert(id) {
        stack.extend(adjacency.downstream(id).iter().copied());
      }
    }
    false
  }
}

/// Adjacency lists for a transport graph.
#[derive(Debug, Clone)]
pub struct Adjacency {
  /// node -> downstream nodes.
  downstream: HashMap<NodeId, Vec<NodeId>>,
  /// node -> upstream nodes.
  upstream: HashMap<NodeId, Vec<NodeId>>,
  /// Nodes with no incoming edges.
  entry_points: Vec<NodeId>,
}

impl Adjacency {
  fn new(node_count: usize, edges: &[Edge]) -> Self {
    let mut downstream: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
    let mut upstream: HashMap<NodeId, Vec<NodeId>> = HashMap::new();

    for id in 0..node_count {
      downstream.entry(id).or_default();
      upstream.entry(id).or_default();
    }

    // A node passed twice to the same call still counts as one dependency.
    for edge in edges {
      let down = downstream.entry(edge.from).or_default();
      if !down.contains(&edge.to) {
        down.push(edge.to);
      }
      let up = upstream.entry(edge.to).or_default();
      if !up.contains(&edge.from) {
        up.push(edge.from);
      }
    }

    let entry_points = (0..node_count)
      .filter(|id| upstream.get(id).is_none_or(|v| v.is_empty()))
      .collect();

    Self {
      downstream,
      upstream,
      entry_points,
    }
  }

  pub fn entry_points(&self) -> &[NodeId] {
    &self.entry_points
  }

  pub fn downstream(&self, id: NodeId) -> &[NodeId] {
    self.downstream.get(&id).map(|v| v.as_slice()).unwrap_or(&[])
  }

  pub fn upstream(&self, id: NodeId) -> &[NodeId] {
    self.upstream.get(&id).map(|v| v.as_slice()).unwrap_or(&[])
  }
}
