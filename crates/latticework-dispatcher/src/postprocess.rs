//! Reconstruction of a lattice's return value.

use std::collections::HashMap;

use latticework_graph::{Invocation, NodeId, NodeRole, TransportGraph};
use tracing::{debug, instrument};

use crate::error::PostProcessError;
use crate::input::project;

/// Replay the lattice over computed node outputs.
///
/// `order` is a topological order of the invocation's graph and every node in
/// it must have an output. Task outputs are fed back in that order, one per
/// electron call. Parameter and generated outputs are recomputed by the
/// replayed body, so they are only checked against the literal and the
/// parent's output.
#[instrument(name = "post_process", skip_all, fields(lattice = %invocation.lattice.name()))]
pub fn post_process(
  invocation: &Invocation,
  node_outputs: &HashMap<String, serde_json::Value>,
  order: &[NodeId],
) -> Result<serde_json::Value, PostProcessError> {
  let graph = &invocation.graph;
  let mut outputs = Vec::new();
  for &id in order {
    let output = recorded(graph, node_outputs, id)?;
    let Some(node) = graph.node(id) else {
      return Err(PostProcessError::NodeNotFound(id));
    };
    match &node.role {
      NodeRole::Task => outputs.push((node.name.clone(), output.clone())),
      NodeRole::Parameter { value } => {
        if value != output {
          return Err(PostProcessError::OutputMismatch { node: node.key() });
        }
      }
      NodeRole::Generated { parent, selector } => {
        let expected = project(recorded(graph, node_outputs, *parent)?, selector).ok();
        if expected.as_ref() != Some(output) {
          return Err(PostProcessError::OutputMismatch { node: node.key() });
        }
      }
    }
  }

  debug!(tasks = outputs.len(), "replaying");
  Ok(invocation.replay(outputs)?)
}

fn recorded<'a>(
  graph: &TransportGraph,
  node_outputs: &'a HashMap<String, serde_json::Value>,
  id: NodeId,
) -> Result<&'a serde_json::Value, PostProcessError> {
  let node = graph.node(id).ok_or(PostProcessError::NodeNotFound(id))?;
  let key = node.key();
  node_outputs
    .get(&key)
    .ok_or(PostProcessError::MissingOutput { node: key })
}
