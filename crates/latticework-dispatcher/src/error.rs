use latticework_graph::{GraphError, NodeId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlanError {
  #[error("node '{node}' requests unknown executor '{executor}'")]
  UnknownExecutor { node: String, executor: String },

  #[error(transparent)]
  Graph(#[from] GraphError),
}

#[derive(Debug, Error)]
pub enum PostProcessError {
  #[error("no output recorded for task node '{node}'")]
  MissingOutput { node: String },

  #[error("node {0} is not part of the transport graph")]
  NodeNotFound(NodeId),

  #[error("recorded output of '{node}' does not match its inputs")]
  OutputMismatch { node: String },

  #[error("replaying the lattice failed: {0}")]
  Replay(#[from] GraphError),
}

#[derive(Debug, Error)]
pub enum DispatchError {
  #[error(transparent)]
  Graph(#[from] GraphError),

  #[error("planning failed: {0}")]
  Plan(#[from] PlanError),

  #[error("no executor '{executor}' registered for node '{node}'")]
  MissingExecutor { node: String, executor: String },

  #[error("task node '{node}' has no function")]
  MissingFunction { node: String },

  #[error("dispatch stalled with {unfinished} unfinished nodes")]
  Stalled { unfinished: usize },
}
