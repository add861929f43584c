//! The executor dispatch loop.
//!
//! Nodes move through `Pending -> Submitted -> (Completed | Failed |
//! Cancelled)`. A node becomes ready once its count of unfinished
//! dependencies reaches zero. Parameter and generated nodes complete inline;
//! task nodes are spawned onto the runtime and awaited together, so
//! independent branches run concurrently.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use latticework_executor::{
  Executor, ExecutorError, ExecutorRegistry, JobHandle, TaskMetadata, TaskStreams,
};
use latticework_graph::{Adjacency, Inputs, Lattice, NodeId, NodeRole, NodeStatus, TransportGraph};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::error::DispatchError;
use crate::input::{output_of, project, resolve_arguments};
use crate::planner::Planner;
use crate::postprocess::post_process;
use crate::result::{RunStatus, WorkflowResult};

/// What a spawned task reports back to the loop.
struct TaskReport {
  result: Result<serde_json::Value, ExecutorError>,
  stdout: String,
  stderr: String,
  attempts: u32,
}

/// A task node handed to an executor.
struct Job {
  executor: Arc<dyn Executor>,
  metadata: TaskMetadata,
}

enum Event {
  Finished(NodeId, Result<TaskReport, JoinError>),
  CancelAcked(NodeId, Result<Result<bool, ExecutorError>, JoinError>),
  CancelRequested,
  Idle,
}

/// Runs lattices against a set of executors.
#[derive(Clone)]
pub struct Dispatcher {
  registry: ExecutorRegistry,
  planner: Planner,
}

impl Dispatcher {
  pub fn new(registry: ExecutorRegistry) -> Self {
    Self {
      registry,
      planner: Planner::new(),
    }
  }

  pub fn with_planner(mut self, planner: Planner) -> Self {
    self.planner = planner;
    self
  }

  pub fn registry(&self) -> &ExecutorRegistry {
    &self.registry
  }

  /// Build, plan and execute `lattice`, then reconstruct its return value.
  ///
  /// Task failures, post-processing failures and cancellation are reported
  /// on the returned result, not as errors.
  pub async fn dispatch(
    &self,
    lattice: &Lattice,
    inputs: Inputs,
    cancel: CancellationToken,
  ) -> Result<WorkflowResult, DispatchError> {
    let invocation = lattice.build_graph(inputs)?;
    let mut result = WorkflowResult::new(invocation);
    self.run(&mut result, cancel).await?;
    Ok(result)
  }

  /// Execute a pending result's graph to completion.
  #[instrument(
    name = "dispatch_run",
    skip(self, result, cancel),
    fields(dispatch_id = %result.dispatch_id, lattice = %result.lattice_name)
  )]
  pub async fn run(&self, result: &mut WorkflowResult, cancel: CancellationToken) -> Result<(), DispatchError> {
    self.planner.plan(result.graph_mut(), &self.registry)?;

    result.status = RunStatus::Running;
    result.started_at = Some(Utc::now());
    info!(
      dispatch_id = %result.dispatch_id,
      lattice = %result.lattice_name,
      nodes = result.graph().len(),
      "workflow_started"
    );

    let dispatch_id = result.dispatch_id.clone();
    let cancelled = Execution::new(&self.registry, dispatch_id.clone(), result.graph_mut())
      .drive(&cancel)
      .await?;

    let graph = result.graph();
    let failed = graph
      .nodes()
      .iter()
      .find(|node| node.status == NodeStatus::Failed && !is_upstream_failure(node.error.as_deref()));
    let any_cancelled = graph
      .nodes()
      .iter()
      .any(|node| node.status == NodeStatus::Cancelled);

    if let Some(node) = failed {
      result.error = Some(format!(
        "node '{}' failed: {}",
        node.key(),
        node.error.as_deref().unwrap_or_default()
      ));
      result.status = RunStatus::Failed;
    } else if cancelled || any_cancelled {
      result.status = RunStatus::Cancelled;
    } else {
      let order = graph.topological_order()?;
      match post_process(result.invocation(), &result.node_outputs(), &order) {
        Ok(output) => {
          result.output = Some(output);
          result.status = RunStatus::Completed;
        }
        Err(e) => {
          result.error = Some(format!("post-processing failed: {}", e));
          result.status = RunStatus::Failed;
        }
      }
    }
    result.completed_at = Some(Utc::now());

    match result.status {
      RunStatus::Failed => {
        error!(
          dispatch_id = %dispatch_id,
          error = result.error.as_deref().unwrap_or_default(),
          "workflow_failed"
        );
      }
      status => {
        info!(dispatch_id = %dispatch_id, status = ?status, "workflow_completed");
      }
    }

    Ok(())
  }
}

const UPSTREAM_FAILED: &str = "upstream node failed: ";

fn is_upstream_failure(error: Option<&str>) -> bool {
  error.is_some_and(|e| e.starts_with(UPSTREAM_FAILED))
}

type InFlight = FuturesUnordered<futures::future::BoxFuture<'static, (NodeId, Result<TaskReport, JoinError>)>>;
type Acks =
  FuturesUnordered<futures::future::BoxFuture<'static, (NodeId, Result<Result<bool, ExecutorError>, JoinError>)>>;

/// State of one pass over a planned graph.
struct Execution<'a> {
  registry: &'a ExecutorRegistry,
  dispatch_id: String,
  graph: &'a mut TransportGraph,
  adjacency: Adjacency,
  unfinished_deps: Vec<usize>,
  ready: VecDeque<NodeId>,
  jobs: HashMap<NodeId, Job>,
  in_flight: InFlight,
  acks: Acks,
  cancelling: bool,
}

impl<'a> Execution<'a> {
  fn new(registry: &'a ExecutorRegistry, dispatch_id: String, graph: &'a mut TransportGraph) -> Self {
    let adjacency = graph.adjacency();
    let unfinished_deps: Vec<usize> = (0..graph.len())
      .map(|id| adjacency.upstream(id).len())
      .collect();
    let ready = adjacency.entry_points().iter().copied().collect();

    Self {
      registry,
      dispatch_id,
      graph,
      adjacency,
      unfinished_deps,
      ready,
      jobs: HashMap::new(),
      in_flight: FuturesUnordered::new(),
      acks: FuturesUnordered::new(),
      cancelling: false,
    }
  }

  /// Run until every node is terminal. Returns whether the run was
  /// cancelled.
  async fn drive(&mut self, cancel: &CancellationToken) -> Result<bool, DispatchError> {
    loop {
      if !self.cancelling && cancel.is_cancelled() {
        self.cancel_all();
      }
      if !self.cancelling {
        self.submit_ready()?;
      }
      if self.unfinished() == 0 {
        return Ok(self.cancelling);
      }
      // Nothing running and nothing ready: only a cancel could wake us.
      if self.in_flight.is_empty() && self.acks.is_empty() {
        return Err(DispatchError::Stalled {
          unfinished: self.unfinished(),
        });
      }

      let event = tokio::select! {
        Some((id, joined)) = self.in_flight.next(), if !self.in_flight.is_empty() => Event::Finished(id, joined),
        Some((id, joined)) = self.acks.next(), if !self.acks.is_empty() => Event::CancelAcked(id, joined),
        _ = cancel.cancelled(), if !self.cancelling => Event::CancelRequested,
        else => Event::Idle,
      };

      match event {
        Event::Finished(id, joined) => self.on_finished(id, joined),
        Event::CancelAcked(id, joined) => self.on_cancel_acked(id, joined),
        Event::CancelRequested => self.cancel_all(),
        Event::Idle => {
          return Err(DispatchError::Stalled {
            unfinished: self.unfinished(),
          });
        }
      }
    }
  }

  fn unfinished(&self) -> usize {
    self
      .graph
      .nodes()
      .iter()
      .filter(|node| !node.status.is_terminal())
      .count()
  }

  fn submit_ready(&mut self) -> Result<(), DispatchError> {
    while let Some(id) = self.ready.pop_front() {
      let Some(node) = self.graph.node(id) else {
        continue;
      };
      if node.status != NodeStatus::Pending {
        continue;
      }

      match node.role.clone() {
        NodeRole::Parameter { value } => {
          self.mark_started(id);
          self.complete(id, value);
        }
        NodeRole::Generated { parent, selector } => {
          self.mark_started(id);
          match output_of(self.graph, parent).and_then(|output| project(output, &selector)) {
            Ok(value) => self.complete(id, value),
            Err(e) => self.fail(id, e.to_string()),
          }
        }
        NodeRole::Task => self.submit_task(id)?,
      }
    }
    Ok(())
  }

  fn submit_task(&mut self, id: NodeId) -> Result<(), DispatchError> {
    let node = self.graph.node(id).ok_or(latticework_graph::GraphError::NodeNotFound(id))?;
    let key = node.key();
    let executor_name = node.executor.clone().unwrap_or_default();
    let executor = self
      .registry
      .get(&executor_name)
      .ok_or_else(|| DispatchError::MissingExecutor {
        node: key.clone(),
        executor: executor_name.clone(),
      })?;
    let function = node
      .function
      .clone()
      .ok_or_else(|| DispatchError::MissingFunction { node: key.clone() })?;
    let max_retry_attempts = node.metadata.max_retry_attempts;

    let args = match resolve_arguments(self.graph, node) {
      Ok(args) => args,
      Err(e) => {
        self.fail(id, e.to_string());
        return Ok(());
      }
    };

    let metadata = TaskMetadata::new(self.dispatch_id.clone(), id);
    self.jobs.insert(
      id,
      Job {
        executor: executor.clone(),
        metadata: metadata.clone(),
      },
    );

    if let Some(node) = self.graph.node_mut(id) {
      node.status = NodeStatus::Submitted;
      node.started_at = Some(Utc::now());
    }
    info!(
      dispatch_id = %self.dispatch_id,
      node_id = id,
      node = %key,
      executor = %executor_name,
      "task_started"
    );

    let handle = tokio::spawn(async move {
      let mut streams = TaskStreams::open();
      let mut attempts = 0;
      let result = loop {
        attempts += 1;
        match executor.run(&function, args.clone(), &metadata, &mut streams).await {
          Err(e) if e.is_retryable() && attempts <= max_retry_attempts && !metadata.job.cancel_requested() => {
            warn!(
              dispatch_id = %metadata.dispatch_id,
              node_id = metadata.node_id,
              attempt = attempts,
              error = %e,
              "task_retrying"
            );
          }
          other => break other,
        }
      };
      let (stdout, stderr) = streams.close();
      TaskReport {
        result,
        stdout,
        stderr,
        attempts,
      }
    });
    self
      .in_flight
      .push(handle.map(move |joined| (id, joined)).boxed());

    Ok(())
  }

  fn on_finished(&mut self, id: NodeId, joined: Result<TaskReport, JoinError>) {
    let Some(node) = self.graph.node_mut(id) else {
      return;
    };
    // Already cancelled through an acknowledged backend cancel.
    if node.status.is_terminal() {
      return;
    }

    let report = match joined {
      Ok(report) => report,
      Err(e) => {
        self.fail(id, format!("task supervisor failed: {}", e));
        return;
      }
    };
    node.stdout = report.stdout;
    node.stderr = report.stderr;
    node.attempts = report.attempts;

    match report.result {
      Ok(value) => self.complete(id, value),
      Err(ExecutorError::TaskCancelled) => self.cancel_node(id),
      Err(ExecutorError::TaskRuntime { traceback }) => self.fail(id, traceback),
      Err(e) => self.fail(id, e.to_string()),
    }
  }

  fn on_cancel_acked(&mut self, id: NodeId, joined: Result<Result<bool, ExecutorError>, JoinError>) {
    match joined {
      Ok(Ok(true)) => {
        let submitted = self
          .graph
          .node(id)
          .is_some_and(|node| node.status == NodeStatus::Submitted);
        if submitted {
          self.cancel_node(id);
        }
      }
      Ok(Ok(false)) => {
        warn!(dispatch_id = %self.dispatch_id, node_id = id, "cancel_rejected");
      }
      Ok(Err(e)) => {
        warn!(dispatch_id = %self.dispatch_id, node_id = id, error = %e, "cancel_failed");
      }
      Err(e) => {
        warn!(dispatch_id = %self.dispatch_id, node_id = id, error = %e, "cancel_failed");
      }
    }
  }

  /// Stop submitting, cancel pending nodes and ask executors to cancel
  /// submitted ones.
  fn cancel_all(&mut self) {
    self.cancelling = true;
    self.ready.clear();
    info!(dispatch_id = %self.dispatch_id, "workflow_cancelling");

    for job in self.jobs.values() {
      job.metadata.job.request_cancel();
    }

    let mut direct = Vec::new();
    for node in self.graph.nodes() {
      match node.status {
        NodeStatus::Pending => direct.push(node.id),
        NodeStatus::Submitted => {
          let Some(job) = self.jobs.get(&node.id) else {
            direct.push(node.id);
            continue;
          };
          match job.metadata.job.handle() {
            Some(handle) => self.request_backend_cancel(node.id, job, handle),
            // Not yet handed to the backend; the executor sees the cancel flag.
            None => direct.push(node.id),
          }
        }
        _ => {}
      }
    }

    for id in direct {
      self.mark_cancelled(id);
    }
  }

  fn request_backend_cancel(&self, id: NodeId, job: &Job, handle: JobHandle) {
    let executor = job.executor.clone();
    let metadata = job.metadata.clone();
    let ack = tokio::spawn(async move { executor.cancel(&metadata, &handle).await });
    self.acks.push(ack.map(move |joined| (id, joined)).boxed());
  }

  fn mark_started(&mut self, id: NodeId) {
    if let Some(node) = self.graph.node_mut(id) {
      node.started_at = Some(Utc::now());
    }
  }

  fn complete(&mut self, id: NodeId, value: serde_json::Value) {
    if let Some(node) = self.graph.node_mut(id) {
      node.status = NodeStatus::Completed;
      node.output = Some(value);
      node.completed_at = Some(Utc::now());
      if node.is_task() {
        info!(dispatch_id = %self.dispatch_id, node_id = id, node = %node.key(), "task_completed");
      }
    }

    for &next in self.adjacency.downstream(id) {
      self.unfinished_deps[next] -= 1;
      if self.unfinished_deps[next] == 0 {
        self.ready.push_back(next);
      }
    }
  }

  /// Fail `id` and every node downstream of it.
  fn fail(&mut self, id: NodeId, error: String) {
    let key = match self.graph.node_mut(id) {
      Some(node) => {
        node.status = NodeStatus::Failed;
        node.error = Some(error.clone());
        node.completed_at = Some(Utc::now());
        node.key()
      }
      None => return,
    };
    error!(dispatch_id = %self.dispatch_id, node_id = id, node = %key, error = %error, "task_failed");

    for next in self.graph.descendants(id) {
      if let Some(node) = self.graph.node_mut(next)
        && !node.status.is_terminal()
      {
        node.status = NodeStatus::Failed;
        node.error = Some(format!("{}{}", UPSTREAM_FAILED, key));
        node.completed_at = Some(Utc::now());
      }
    }
  }

  /// Cancel `id` and every node downstream of it.
  fn cancel_node(&mut self, id: NodeId) {
    self.mark_cancelled(id);
    for next in self.graph.descendants(id) {
      let pending = self
        .graph
        .node(next)
        .is_some_and(|node| !node.status.is_terminal());
      if pending {
        self.mark_cancelled(next);
      }
    }
  }

  fn mark_cancelled(&mut self, id: NodeId) {
    if let Some(node) = self.graph.node_mut(id) {
      node.status = NodeStatus::Cancelled;
      node.completed_at = Some(Utc::now());
      if node.is_task() {
        info!(dispatch_id = %self.dispatch_id, node_id = id, node = %node.key(), "task_cancelled");
      }
    }
  }
}
