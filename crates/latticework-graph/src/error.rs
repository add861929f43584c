use thiserror::Error;

use crate::node::NodeId;

#[derive(Debug, Error)]
pub enum GraphError {
  #[error("node not found: {0}")]
  NodeNotFound(NodeId),

  #[error("edge references unknown node: from={from}, to={to}")]
  InvalidEdge { from: NodeId, to: NodeId },

  #[error("edge from '{from}' to '{to}' would create a cycle")]
  Cycle { from: String, to: String },

  #[error("graph contains a cycle through node '{0}'")]
  Cyclic(String),

  #[error("lattice input not provided: {0}")]
  MissingInput(String),

  #[error("output of node {node} is not available while the graph is being built")]
  Unresolved { node: NodeId },

  #[error("cannot unpack {found} into {expected} values")]
  NotUnpackable { expected: usize, found: String },

  #[error("expected {expected} values to unpack, found {found}")]
  UnpackLength { expected: usize, found: usize },

  #[error("index {index} out of range for sequence of length {len}")]
  IndexOutOfRange { index: usize, len: usize },

  #[error("key '{key}' not found")]
  MissingKey { key: String },

  #[error("cannot select from {found}")]
  NotSelectable { found: String },

  #[error("replay ran out of task outputs at call to '{function}'")]
  ReplayExhausted { function: String },

  #[error("replay expected a call to '{expected}' but the workflow called '{found}'")]
  CallMismatch { expected: String, found: String },

  #[error("graph serialization failed: {0}")]
  Serialization(#[from] serde_json::Error),
}
