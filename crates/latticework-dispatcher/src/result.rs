use std::collections::HashMap;

use chrono::{DateTime, Utc};
use latticework_graph::{Invocation, Node, NodeStatus, TransportGraph};
use serde::{Serialize, Serializer};

/// Aggregate status of a dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
  #[default]
  Pending,
  Running,
  Completed,
  Failed,
  Cancelled,
}

/// Everything known about one dispatch of a lattice.
#[derive(Debug, Serialize)]
pub struct WorkflowResult {
  pub dispatch_id: String,
  pub lattice_name: String,
  pub status: RunStatus,
  #[serde(rename = "transport_graph", serialize_with = "serialize_graph")]
  invocation: Invocation,
  /// The lattice's reconstructed return value.
  pub output: Option<serde_json::Value>,
  /// Which node failed, and its traceback.
  pub error: Option<String>,
  pub started_at: Option<DateTime<Utc>>,
  pub completed_at: Option<DateTime<Utc>>,
}

fn serialize_graph<S: Serializer>(invocation: &Invocation, serializer: S) -> Result<S::Ok, S::Error> {
  invocation.graph.serialize(serializer)
}

impl WorkflowResult {
  /// A pending result for a built invocation, with a fresh dispatch id.
  pub fn new(invocation: Invocation) -> Self {
    Self {
      dispatch_id: uuid::Uuid::new_v4().to_string(),
      lattice_name: invocation.lattice.name().to_string(),
      status: RunStatus::Pending,
      invocation,
      output: None,
      error: None,
      started_at: None,
      completed_at: None,
    }
  }

  pub fn invocation(&self) -> &Invocation {
    &self.invocation
  }

  pub fn graph(&self) -> &TransportGraph {
    &self.invocation.graph
  }

  pub fn graph_mut(&mut self) -> &mut TransportGraph {
    &mut self.invocation.graph
  }

  /// Look up a node by key, e.g. `a(0)`.
  pub fn node(&self, key: &str) -> Option<&Node> {
    let graph = self.graph();
    graph.find(key).and_then(|id| graph.node(id))
  }

  /// Outputs of completed nodes, keyed by node key.
  pub fn node_outputs(&self) -> HashMap<String, serde_json::Value> {
    self
      .graph()
      .nodes()
      .iter()
      .filter(|node| node.status == NodeStatus::Completed)
      .filter_map(|node| node.output.clone().map(|output| (node.key(), output)))
      .collect()
  }

  /// Keys of nodes in `status`, in id order.
  pub fn nodes_with_status(&self, status: NodeStatus) -> Vec<String> {
    self
      .graph()
      .nodes()
      .iter()
      .filter(|node| node.status == status)
      .map(Node::key)
      .collect()
  }
}
