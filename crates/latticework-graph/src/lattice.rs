use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::error::GraphError;
use crate::graph::TransportGraph;
use crate::scope::{Scope, Traced};

/// Executor tag used when neither electron nor lattice names one.
pub const DEFAULT_EXECUTOR: &str = "local";

type Body = dyn Fn(&mut Scope, &Inputs) -> Result<Traced, GraphError> + Send + Sync;

/// Lattice-level metadata, carried on the transport graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatticeMetadata {
  /// Executor for electrons that do not declare one.
  pub executor: String,
  /// Let the planner's schedule policy reassign executors.
  pub schedule: bool,
}

impl Default for LatticeMetadata {
  fn default() -> Self {
    Self {
      executor: DEFAULT_EXECUTOR.to_string(),
      schedule: false,
    }
  }
}

/// A workflow: a body that calls electrons through a [`Scope`].
#[derive(Clone)]
pub struct Lattice {
  name: String,
  body: Arc<Body>,
  metadata: LatticeMetadata,
}

impl fmt::Debug for Lattice {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Lattice")
      .field("name", &self.name)
      .field("metadata", &self.metadata)
      .finish_non_exhaustive()
  }
}

impl Lattice {
  pub fn new<F>(name: impl Into<String>, body: F) -> Self
  where
    F: Fn(&mut Scope, &Inputs) -> Result<Traced, GraphError> + Send + Sync + 'static,
  {
    Self {
      name: name.into(),
      body: Arc::new(body),
      metadata: LatticeMetadata::default(),
    }
  }

  pub fn with_executor(mut self, executor: impl Into<String>) -> Self {
    self.metadata.executor = executor.into();
    self
  }

  pub fn with_schedule(mut self, schedule: bool) -> Self {
    self.metadata.schedule = schedule;
    self
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn metadata(&self) -> &LatticeMetadata {
    &self.metadata
  }

  pub fn metadata_mut(&mut self) -> &mut LatticeMetadata {
    &mut self.metadata
  }

  /// Run the body in build mode and record the transport graph.
  #[instrument(name = "build_graph", skip(self, inputs), fields(lattice = %self.name))]
  pub fn build_graph(&self, inputs: Inputs) -> Result<Invocation, GraphError> {
    let mut scope = Scope::build(TransportGraph::new(self.metadata.clone()));
    // The returned references are discarded; only the recorded graph matters
    // until replay.
    self.invoke(&mut scope, &inputs)?;
    let graph = scope.into_graph().unwrap_or_default();
    // Surface cycles now rather than at dispatch time.
    graph.topological_order()?;

    debug!(
      lattice = %self.name,
      nodes = graph.len(),
      edges = graph.edges().len(),
      "graph_built"
    );

    Ok(Invocation {
      lattice: self.clone(),
      inputs,
      graph,
    })
  }

  pub(crate) fn invoke(&self, scope: &mut Scope, inputs: &Inputs) -> Result<Traced, GraphError> {
    (self.body)(scope, inputs)
  }
}

/// Arguments of one lattice invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Inputs {
  args: Vec<Traced>,
  kwargs: BTreeMap<String, Traced>,
}

impl Inputs {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_arg(mut self, value: impl Into<Traced>) -> Self {
    self.args.push(value.into());
    self
  }

  pub fn with_kwarg(mut self, name: impl Into<String>, value: impl Into<Traced>) -> Self {
    self.kwargs.insert(name.into(), value.into());
    self
  }

  pub fn arg(&self, index: usize) -> Result<Traced, GraphError> {
    self
      .args
      .get(index)
      .cloned()
      .ok_or_else(|| GraphError::MissingInput(format!("positional argument {}", index)))
  }

  pub fn kwarg(&self, name: &str) -> Result<Traced, GraphError> {
    self
      .kwargs
      .get(name)
      .cloned()
      .ok_or_else(|| GraphError::MissingInput(format!("keyword argument '{}'", name)))
  }

  pub fn args(&self) -> &[Traced] {
    &self.args
  }
}

/// A lattice bound to its inputs, with the graph built from them.
#[derive(Debug, Clone)]
pub struct Invocation {
  pub lattice: Lattice,
  pub inputs: Inputs,
  pub graph: TransportGraph,
}

impl Invocation {
  /// Re-run the body, substituting task outputs in call order.
  ///
  /// `outputs` pairs each task node's function name with its output, in the
  /// graph's topological order.
  pub fn replay(&self, outputs: Vec<(String, serde_json::Value)>) -> Result<serde_json::Value, GraphError> {
    let mut scope = Scope::replay(VecDeque::from(outputs));
    let result = self.lattice.invoke(&mut scope, &self.inputs)?;
    result.into_value()
  }
}
