use std::collections::VecDeque;

use serde_json::Value;

use crate::electron::Electron;
use crate::error::GraphError;
use crate::graph::{ParamKind, TransportGraph};
use crate::lattice::{Inputs, Lattice};
use crate::node::{ArgTemplate, NodeId, NodeMetadata, NodeRole, Selector, generated_name, parameter_name};

/// A value flowing through a lattice body.
///
/// While the graph is built, electron calls return [`Traced::Node`]
/// references; during replay every value is concrete.
#[derive(Debug, Clone, PartialEq)]
pub enum Traced {
  Value(Value),
  Node(NodeId),
  /// A tuple or list, possibly holding node references.
  Seq(Vec<Traced>),
  /// A dict, possibly holding node references.
  Map(Vec<(String, Traced)>),
}

impl From<Value> for Traced {
  fn from(value: Value) -> Self {
    Traced::Value(value)
  }
}

impl From<Vec<Traced>> for Traced {
  fn from(items: Vec<Traced>) -> Self {
    Traced::Seq(items)
  }
}

impl Traced {
  /// Build a tuple. Tuples become JSON arrays once resolved.
  pub fn tuple(items: impl IntoIterator<Item = Traced>) -> Self {
    Traced::Seq(items.into_iter().collect())
  }

  pub fn as_node(&self) -> Option<NodeId> {
    match self {
      Traced::Node(id) => Some(*id),
      _ => None,
    }
  }

  /// Whether any node reference is nested in this value.
  pub fn has_refs(&self) -> bool {
    match self {
      Traced::Value(_) => false,
      Traced::Node(_) => true,
      Traced::Seq(items) => items.iter().any(Traced::has_refs),
      Traced::Map(entries) => entries.iter().any(|(_, v)| v.has_refs()),
    }
  }

  /// Convert to a concrete value. Fails on unresolved node references.
  pub fn into_value(self) -> Result<Value, GraphError> {
    match self {
      Traced::Value(value) => Ok(value),
      Traced::Node(node) => Err(GraphError::Unresolved { node }),
      Traced::Seq(items) => items
        .into_iter()
        .map(Traced::into_value)
        .collect::<Result<Vec<_>, _>>()
        .map(Value::Array),
      Traced::Map(entries) => entries
        .into_iter()
        .map(|(k, v)| v.into_value().map(|v| (k, v)))
        .collect::<Result<serde_json::Map<_, _>, _>>()
        .map(Value::Object),
    }
  }
}

enum Mode {
  Build(TransportGraph),
  Replay(VecDeque<(String, Value)>),
}

/// The handle a lattice body calls electrons through.
pub struct Scope {
  mode: Mode,
}

impl Scope {
  pub(crate) fn build(graph: TransportGraph) -> Self {
    Self {
      mode: Mode::Build(graph),
    }
  }

  pub(crate) fn replay(outputs: VecDeque<(String, Value)>) -> Self {
    Self {
      mode: Mode::Replay(outputs),
    }
  }

  pub fn is_replaying(&self) -> bool {
    matches!(self.mode, Mode::Replay(_))
  }

  pub(crate) fn into_graph(self) -> Option<TransportGraph> {
    match self.mode {
      Mode::Build(graph) => Some(graph),
      Mode::Replay(_) => None,
    }
  }

  /// Call an electron.
  ///
  /// Building adds a task node, followed by one parameter node per literal
  /// argument. Replaying returns the next recorded task output.
  pub fn call(
    &mut self,
    electron: &Electron,
    args: Vec<Traced>,
    kwargs: Vec<(&str, Traced)>,
  ) -> Result<Traced, GraphError> {
    let graph = match &mut self.mode {
      Mode::Build(graph) => graph,
      Mode::Replay(outputs) => {
        let (name, value) = outputs
          .pop_front()
          .ok_or_else(|| GraphError::ReplayExhausted {
            function: electron.name().to_string(),
          })?;
        if name != electron.name() {
          return Err(GraphError::CallMismatch {
            expected: name,
            found: electron.name().to_string(),
          });
        }
        return Ok(Traced::Value(value));
      }
    };

    let declared = electron.metadata();
    let metadata = NodeMetadata {
      executor: Some(
        declared
          .executor
          .clone()
          .unwrap_or_else(|| graph.lattice_metadata().executor.clone()),
      ),
      max_retry_attempts: declared.max_retry_attempts,
    };
    let id = graph.add_node(
      electron.name(),
      NodeRole::Task,
      metadata,
      Some(electron.function().clone()),
    );

    let mut arg_templates = Vec::with_capacity(args.len());
    for (position, arg) in args.into_iter().enumerate() {
      arg_templates.push(bind(graph, arg, id, &ParamKind::Positional(position))?);
    }
    let mut kwarg_templates = Vec::with_capacity(kwargs.len());
    for (name, arg) in kwargs {
      let template = bind(graph, arg, id, &ParamKind::Keyword(name.to_string()))?;
      kwarg_templates.push((name.to_string(), template));
    }
    graph.set_arguments(id, arg_templates, kwarg_templates)?;

    Ok(Traced::Node(id))
  }

  /// Unpack a sequence into exactly `len` values.
  ///
  /// Unpacking a task's output adds one generated node per element.
  pub fn unpack(&mut self, value: &Traced, len: usize) -> Result<Vec<Traced>, GraphError> {
    match value {
      Traced::Node(parent) => (0..len)
        .map(|i| self.project(*parent, Selector::Index(i)))
        .collect(),
      Traced::Seq(items) => check_len(items.len(), len).map(|_| items.clone()),
      Traced::Value(Value::Array(items)) => {
        check_len(items.len(), len)?;
        Ok(items.iter().cloned().map(Traced::Value).collect())
      }
      other => Err(GraphError::NotUnpackable {
        expected: len,
        found: describe(other),
      }),
    }
  }

  /// Select element `index` of a sequence.
  pub fn index(&mut self, value: &Traced, index: usize) -> Result<Traced, GraphError> {
    match value {
      Traced::Node(parent) => self.project(*parent, Selector::Index(index)),
      Traced::Seq(items) => items
        .get(index)
        .cloned()
        .ok_or(GraphError::IndexOutOfRange {
          index,
          len: items.len(),
        }),
      Traced::Value(Value::Array(items)) => items
        .get(index)
        .cloned()
        .map(Traced::Value)
        .ok_or(GraphError::IndexOutOfRange {
          index,
          len: items.len(),
        }),
      other => Err(GraphError::NotSelectable {
        found: describe(other),
      }),
    }
  }

  /// Select entry `key` of a dict.
  pub fn get(&mut self, value: &Traced, key: &str) -> Result<Traced, GraphError> {
    let missing = || GraphError::MissingKey {
      key: key.to_string(),
    };
    match value {
      Traced::Node(parent) => self.project(*parent, Selector::Key(key.to_string())),
      Traced::Map(entries) => entries
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.clone())
        .ok_or_else(missing),
      Traced::Value(Value::Object(map)) => map
        .get(key)
        .cloned()
        .map(Traced::Value)
        .ok_or_else(missing),
      other => Err(GraphError::NotSelectable {
        found: describe(other),
      }),
    }
  }

  /// Expand a sublattice inline; its electron calls join this graph.
  pub fn expand(&mut self, lattice: &Lattice, inputs: &Inputs) -> Result<Traced, GraphError> {
    lattice.invoke(self, inputs)
  }

  fn project(&mut self, parent: NodeId, selector: Selector) -> Result<Traced, GraphError> {
    let Mode::Build(graph) = &mut self.mode else {
      return Err(GraphError::Unresolved { node: parent });
    };
    let parent_name = graph
      .node(parent)
      .ok_or(GraphError::NodeNotFound(parent))?
      .name
      .clone();
    let id = graph.add_node(
      generated_name(&parent_name, &selector),
      NodeRole::Generated { parent, selector },
      NodeMetadata::default(),
      None,
    );
    graph.add_edge(parent, id, ParamKind::Projection)?;
    Ok(Traced::Node(id))
  }
}

/// Record how `value` reaches argument `param` of `task`.
fn bind(
  graph: &mut TransportGraph,
  value: Traced,
  task: NodeId,
  param: &ParamKind,
) -> Result<ArgTemplate, GraphError> {
  match value {
    Traced::Node(id) => {
      graph.add_edge(id, task, param.clone())?;
      Ok(ArgTemplate::Node(id))
    }
    Traced::Seq(items) if items.iter().any(Traced::has_refs) => items
      .into_iter()
      .map(|item| bind(graph, item, task, param))
      .collect::<Result<Vec<_>, _>>()
      .map(ArgTemplate::Seq),
    Traced::Map(entries) if entries.iter().any(|(_, v)| v.has_refs()) => entries
      .into_iter()
      .map(|(k, v)| bind(graph, v, task, param).map(|t| (k, t)))
      .collect::<Result<Vec<_>, _>>()
      .map(ArgTemplate::Map),
    literal => {
      let value = literal.into_value()?;
      let id = graph.add_node(
        parameter_name(&value),
        NodeRole::Parameter { value },
        NodeMetadata::default(),
        None,
      );
      graph.add_edge(id, task, param.clone())?;
      Ok(ArgTemplate::Node(id))
    }
  }
}

fn check_len(found: usize, expected: usize) -> Result<(), GraphError> {
  if found == expected {
    Ok(())
  } else {
    Err(GraphError::UnpackLength { expected, found })
  }
}

fn describe(value: &Traced) -> String {
  match value {
    Traced::Value(Value::Null) => "null".to_string(),
    Traced::Value(Value::Bool(_)) => "a bool".to_string(),
    Traced::Value(Value::Number(_)) => "a number".to_string(),
    Traced::Value(Value::String(_)) => "a string".to_string(),
    Traced::Value(Value::Array(_)) | Traced::Seq(_) => "a sequence".to_string(),
    Traced::Value(Value::Object(_)) | Traced::Map(_) => "a map".to_string(),
    Traced::Node(id) => format!("node {}", id),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::node::NodeStatus;
  use serde_json::json;

  fn square_pair() -> Electron {
    Electron::new("a", |args, _ctx| {
      let x: i64 = args.param(0, "x")?;
      Ok(json!([x, x * x]))
    })
  }

  fn chained() -> Lattice {
    let a = square_pair();
    Lattice::new("p", move |scope, inputs| {
      let first = scope.call(&a, vec![], vec![("x", inputs.kwarg("x")?)])?;
      let [result, _] = <[Traced; 2]>::try_from(scope.unpack(&first, 2)?)
        .map_err(|v| GraphError::UnpackLength { expected: 2, found: v.len() })?;
      let second = scope.call(&a, vec![], vec![("x", result)])?;
      let [result, b] = <[Traced; 2]>::try_from(scope.unpack(&second, 2)?)
        .map_err(|v| GraphError::UnpackLength { expected: 2, found: v.len() })?;
      Ok(Traced::tuple([b, result]))
    })
  }

  #[test]
  fn test_build_records_nodes_in_call_order() {
    let invocation = chained()
      .build_graph(Inputs::new().with_kwarg("x", json!(2)))
      .unwrap();
    let keys: Vec<String> = invocation.graph.nodes().iter().map(|n| n.key()).collect();

    assert_eq!(
      keys,
      vec![
        "a(0)",
        ":parameter:2(1)",
        ":generated:a()[0](2)",
        ":generated:a()[1](3)",
        "a(4)",
        ":generated:a()[0](5)",
        ":generated:a()[1](6)",
      ]
    );
    assert!(invocation.graph.nodes().iter().all(|n| n.status == NodeStatus::Pending));
  }

  #[test]
  fn test_build_binds_arguments() {
    let invocation = chained()
      .build_graph(Inputs::new().with_kwarg("x", json!(2)))
      .unwrap();
    let graph = &invocation.graph;

    let first = graph.node(0).unwrap();
    assert_eq!(first.kwargs, vec![("x".to_string(), ArgTemplate::Node(1))]);
    assert_eq!(first.metadata.executor.as_deref(), Some("local"));

    let second = graph.node(4).unwrap();
    assert_eq!(second.kwargs, vec![("x".to_string(), ArgTemplate::Node(2))]);
    assert_eq!(graph.adjacency().upstream(4), &[2]);
    assert_eq!(
      graph.node(5).unwrap().role,
      NodeRole::Generated {
        parent: 4,
        selector: Selector::Index(0)
      }
    );
  }

  #[test]
  fn test_replay_reconstructs_result() {
    let invocation = chained()
      .build_graph(Inputs::new().with_kwarg("x", json!(2)))
      .unwrap();

    let out = invocation
      .replay(vec![("a".into(), json!([2, 4])), ("a".into(), json!([2, 4]))])
      .unwrap();
    assert_eq!(out, json!([4, 2]));
  }

  #[test]
  fn test_replay_errors() {
    let invocation = chained()
      .build_graph(Inputs::new().with_kwarg("x", json!(2)))
      .unwrap();

    let err = invocation.replay(vec![("a".into(), json!([2, 4]))]).unwrap_err();
    assert!(matches!(err, GraphError::ReplayExhausted { .. }));

    let err = invocation
      .replay(vec![("b".into(), json!([2, 4])), ("a".into(), json!([2, 4]))])
      .unwrap_err();
    assert!(matches!(err, GraphError::CallMismatch { .. }));
  }

  #[test]
  fn test_nested_arguments_and_selection() {
    let a = square_pair();
    let sum = Electron::new("sum", |args, _ctx| {
      let items: Vec<i64> = args.param(0, "items")?;
      Ok(json!(items.iter().sum::<i64>()))
    })
    .with_executor("cluster");
    let lattice = Lattice::new("nested", move |scope, _inputs| {
      let pair = scope.call(&a, vec![json!(3).into()], vec![])?;
      let last = scope.index(&pair, 1)?;
      scope.call(&sum, vec![Traced::Seq(vec![last, json!(1).into()])], vec![])
    });

    let graph = lattice.build_graph(Inputs::new()).unwrap().graph;
    let keys: Vec<String> = graph.nodes().iter().map(|n| n.key()).collect();
    assert_eq!(
      keys,
      vec!["a(0)", ":parameter:3(1)", ":generated:a()[1](2)", "sum(3)", ":parameter:1(4)"]
    );
    assert_eq!(
      graph.node(3).unwrap().args,
      vec![ArgTemplate::Seq(vec![ArgTemplate::Node(2), ArgTemplate::Node(4)])]
    );
    assert_eq!(graph.node(3).unwrap().metadata.executor.as_deref(), Some("cluster"));
  }

  #[test]
  fn test_sublattice_expands_inline() {
    let a = square_pair();
    let inner = Lattice::new("inner", move |scope, inputs| {
      scope.call(&a, vec![inputs.arg(0)?], vec![])
    });
    let outer = Lattice::new("outer", move |scope, inputs| {
      let first = scope.expand(&inner, &Inputs::new().with_arg(inputs.arg(0)?))?;
      let x = scope.index(&first, 0)?;
      scope.expand(&inner, &Inputs::new().with_arg(x))
    });

    let invocation = outer.build_graph(Inputs::new().with_arg(json!(5))).unwrap();
    assert_eq!(invocation.graph.nodes().iter().filter(|n| n.is_task()).count(), 2);

    let out = invocation
      .replay(vec![("a".into(), json!([5, 25])), ("a".into(), json!([5, 25]))])
      .unwrap();
    assert_eq!(out, json!([5, 25]));
  }

  #[test]
  fn test_unpack_literals() {
    let mut scope = Scope::replay(VecDeque::new());
    let items = scope.unpack(&Traced::from(json!([1, 2])), 2).unwrap();
    assert_eq!(items, vec![Traced::from(json!(1)), Traced::from(json!(2))]);

    let err = scope.unpack(&Traced::from(json!([1, 2])), 3).unwrap_err();
    assert!(matches!(err, GraphError::UnpackLength { expected: 3, found: 2 }));

    let err = scope.unpack(&Traced::from(json!(7)), 2).unwrap_err();
    assert!(matches!(err, GraphError::NotUnpackable { .. }));

    let value = scope.get(&Traced::from(json!({"k": 1})), "k").unwrap();
    assert_eq!(value, Traced::from(json!(1)));
  }
}
