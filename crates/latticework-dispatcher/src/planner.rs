//! Executor assignment.

use std::sync::Arc;

use latticework_executor::ExecutorRegistry;
use latticework_graph::{Node, NodeId, TransportGraph};
use tracing::{debug, instrument};

use crate::error::PlanError;

/// Reassigns task nodes when the lattice enables scheduling.
pub trait SchedulePolicy: Send + Sync {
  /// Executor for `node`, given the executor it declared.
  fn assign(&self, graph: &TransportGraph, node: &Node, declared: &str) -> String;
}

/// Keeps every node on the executor it declared.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityPolicy;

impl SchedulePolicy for IdentityPolicy {
  fn assign(&self, _graph: &TransportGraph, _node: &Node, declared: &str) -> String {
    declared.to_string()
  }
}

/// Spreads nodes over a pool of interchangeable executors.
///
/// Only nodes declaring a pool member are moved. The n-th task node of the
/// graph goes to member `n % pool.len()`, so the assignment depends on the
/// graph alone.
#[derive(Debug, Clone)]
pub struct RoundRobinPolicy {
  pool: Vec<String>,
}

impl RoundRobinPolicy {
  pub fn new(pool: impl IntoIterator<Item = impl Into<String>>) -> Self {
    Self {
      pool: pool.into_iter().map(Into::into).collect(),
    }
  }
}

impl SchedulePolicy for RoundRobinPolicy {
  fn assign(&self, graph: &TransportGraph, node: &Node, declared: &str) -> String {
    if self.pool.is_empty() || !self.pool.iter().any(|member| member == declared) {
      return declared.to_string();
    }
    let position = graph
      .nodes()
      .iter()
      .filter(|other| other.is_task() && other.id < node.id)
      .count();
    self.pool[position % self.pool.len()].clone()
  }
}

/// Assigns a registered executor to every task node.
#[derive(Clone)]
pub struct Planner {
  policy: Arc<dyn SchedulePolicy>,
}

impl Default for Planner {
  fn default() -> Self {
    Self::new()
  }
}

impl Planner {
  pub fn new() -> Self {
    Self {
      policy: Arc::new(IdentityPolicy),
    }
  }

  pub fn with_policy(policy: Arc<dyn SchedulePolicy>) -> Self {
    Self { policy }
  }

  /// Plan `graph` in place.
  ///
  /// Assignments are derived from node metadata only, so planning an already
  /// planned graph yields the same assignment. Nothing is written if any
  /// node requests an executor that is not registered.
  #[instrument(name = "plan", skip_all, fields(nodes = graph.len()))]
  pub fn plan(&self, graph: &mut TransportGraph, registry: &ExecutorRegistry) -> Result<(), PlanError> {
    graph.topological_order()?;

    let schedule = graph.lattice_metadata().schedule;
    let default = graph.lattice_metadata().executor.clone();

    let mut assignments: Vec<(NodeId, String)> = Vec::new();
    for node in graph.nodes().iter().filter(|node| node.is_task()) {
      let declared = node.metadata.executor.as_deref().unwrap_or(&default);
      let executor = if schedule {
        self.policy.assign(graph, node, declared)
      } else {
        declared.to_string()
      };
      if !registry.contains(&executor) {
        return Err(PlanError::UnknownExecutor {
          node: node.key(),
          executor,
        });
      }
      assignments.push((node.id, executor));
    }

    for (id, executor) in assignments {
      if let Some(node) = graph.node_mut(id) {
        debug!(node = %node.key(), executor = %executor, "node_planned");
        node.executor = Some(executor);
      }
    }

    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use async_trait::async_trait;
  use latticework_executor::{Executor, ExecutorError, JobHandle, TaskMetadata, TaskStreams};
  use latticework_graph::{Electron, Inputs, Lattice, NodeMetadata, NodeRole, TaskArgs, TaskFunction};
  use serde_json::json;

  struct Named(&'static str);

  #[async_trait]
  impl Executor for Named {
    fn short_name(&self) -> &str {
      self.0
    }

    async fn run(
      &self,
      _function: &TaskFunction,
      _args: TaskArgs,
      _metadata: &TaskMetadata,
      _streams: &mut TaskStreams,
    ) -> Result<serde_json::Value, ExecutorError> {
      Ok(serde_json::Value::Null)
    }

    async fn cancel(&self, _metadata: &TaskMetadata, _handle: &JobHandle) -> Result<bool, ExecutorError> {
      Ok(false)
    }
  }

  fn registry(names: &[&'static str]) -> ExecutorRegistry {
    names
      .iter()
      .fold(ExecutorRegistry::new(), |registry, &name| registry.with(Arc::new(Named(name))))
  }

  /// `pipeline(x) = task(x)`, built with `x = "absolute"`.
  fn pipeline_graph() -> TransportGraph {
    let task = Electron::new("task", |args, _ctx| Ok(args.arg(0)?.clone()));
    Lattice::new("pipeline", move |scope, inputs| {
      scope.call(&task, vec![inputs.kwarg("x")?], vec![])
    })
    .build_graph(Inputs::new().with_kwarg("x", json!("absolute")))
    .unwrap()
    .graph
  }

  #[test]
  fn test_plan_assigns_declared_executor() {
    let mut graph = pipeline_graph();

    Planner::new().plan(&mut graph, &registry(&["local"])).unwrap();

    assert_eq!(graph.node(0).unwrap().executor.as_deref(), Some("local"));
    // Parameter nodes never reach an executor.
    assert_eq!(graph.node(1).unwrap().key(), ":parameter:absolute(1)");
    assert_eq!(graph.node(1).unwrap().executor, None);
  }

  #[test]
  fn test_plan_preserves_schedule_metadata() {
    let mut graph = pipeline_graph();
    graph.lattice_metadata_mut().schedule = true;

    Planner::new().plan(&mut graph, &registry(&["local"])).unwrap();

    let planned = graph.to_json(true).unwrap();
    assert_eq!(planned["lattice_metadata"]["schedule"], json!(true));
  }

  #[test]
  fn test_plan_rejects_unknown_executor() {
    let mut graph = pipeline_graph();

    let err = Planner::new().plan(&mut graph, &registry(&["cluster"])).unwrap_err();

    assert!(matches!(
      err,
      PlanError::UnknownExecutor { ref node, ref executor } if node == "task(0)" && executor == "local"
    ));
    assert_eq!(graph.node(0).unwrap().executor, None);
  }

  #[test]
  fn test_plan_is_idempotent() {
    let mut graph = TransportGraph::default();
    graph.lattice_metadata_mut().schedule = true;
    for _ in 0..5 {
      graph.add_node(
        "t",
        NodeRole::Task,
        NodeMetadata {
          executor: Some("pool-a".into()),
          max_retry_attempts: 0,
        },
        None,
      );
    }
    let planner = Planner::with_policy(Arc::new(RoundRobinPolicy::new(["pool-a", "pool-b"])));
    let registry = registry(&["pool-a", "pool-b"]);

    planner.plan(&mut graph, &registry).unwrap();
    let first: Vec<Option<String>> = graph.nodes().iter().map(|n| n.executor.clone()).collect();
    planner.plan(&mut graph, &registry).unwrap();
    let second: Vec<Option<String>> = graph.nodes().iter().map(|n| n.executor.clone()).collect();

    assert_eq!(first, second);
    assert_eq!(
      first,
      ["pool-a", "pool-b", "pool-a", "pool-b", "pool-a"]
        .map(|s| Some(s.to_string()))
        .to_vec()
    );
  }

  #[test]
  fn test_policy_ignored_without_schedule() {
    let mut graph = pipeline_graph();
    let planner = Planner::with_policy(Arc::new(RoundRobinPolicy::new(["local", "cluster"])));

    planner.plan(&mut graph, &registry(&["local", "cluster"])).unwrap();

    assert_eq!(graph.node(0).unwrap().executor.as_deref(), Some("local"));
  }
}
