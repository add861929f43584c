//! Argument resolution from upstream node outputs.

use latticework_graph::{ArgTemplate, GraphError, Node, NodeId, Selector, TaskArgs, TransportGraph};
use serde_json::Value;

/// Assemble a task node's arguments from the outputs of its dependencies.
///
/// Every referenced node must already be completed.
pub(crate) fn resolve_arguments(graph: &TransportGraph, node: &Node) -> Result<TaskArgs, GraphError> {
  let args = node
    .args
    .iter()
    .map(|template| resolve_template(graph, template))
    .collect::<Result<Vec<_>, _>>()?;

  let mut kwargs = serde_json::Map::new();
  for (name, template) in &node.kwargs {
    kwargs.insert(name.clone(), resolve_template(graph, template)?);
  }

  Ok(TaskArgs::new(args, kwargs))
}

fn resolve_template(graph: &TransportGraph, template: &ArgTemplate) -> Result<Value, GraphError> {
  match template {
    ArgTemplate::Node(id) => output_of(graph, *id).cloned(),
    ArgTemplate::Seq(items) => items
      .iter()
      .map(|item| resolve_template(graph, item))
      .collect::<Result<Vec<_>, _>>()
      .map(Value::Array),
    ArgTemplate::Map(entries) => entries
      .iter()
      .map(|(k, v)| resolve_template(graph, v).map(|v| (k.clone(), v)))
      .collect::<Result<serde_json::Map<_, _>, _>>()
      .map(Value::Object),
  }
}

/// The recorded output of a node.
pub(crate) fn output_of(graph: &TransportGraph, id: NodeId) -> Result<&Value, GraphError> {
  graph
    .node(id)
    .ok_or(GraphError::NodeNotFound(id))?
    .output
    .as_ref()
    .ok_or(GraphError::Unresolved { node: id })
}

/// Select one element of a parent node's output.
pub(crate) fn project(value: &Value, selector: &Selector) -> Result<Value, GraphError> {
  match (selector, value) {
    (Selector::Index(index), Value::Array(items)) => {
      items
        .get(*index)
        .cloned()
        .ok_or(GraphError::IndexOutOfRange {
          index: *index,
          len: items.len(),
        })
    }
    (Selector::Key(key), Value::Object(map)) => map
      .get(key)
      .cloned()
      .ok_or_else(|| GraphError::MissingKey { key: key.clone() }),
    (_, other) => Err(GraphError::NotSelectable {
      found: other.to_string(),
    }),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use latticework_graph::{NodeMetadata, NodeRole, ParamKind};
  use serde_json::json;

  #[test]
  fn test_resolve_nested_templates() {
    let mut graph = TransportGraph::default();
    let a = graph.add_node("a", NodeRole::Task, NodeMetadata::default(), None);
    let p = graph.add_node(
      ":parameter:1",
      NodeRole::Parameter { value: json!(1) },
      NodeMetadata::default(),
      None,
    );
    let b = graph.add_node("b", NodeRole::Task, NodeMetadata::default(), None);
    graph.add_edge(a, b, ParamKind::Positional(0)).unwrap();
    graph.add_edge(p, b, ParamKind::Keyword("k".into())).unwrap();
    graph
      .set_arguments(
        b,
        vec![ArgTemplate::Seq(vec![ArgTemplate::Node(a), ArgTemplate::Node(p)])],
        vec![(
          "k".to_string(),
          ArgTemplate::Map(vec![("inner".to_string(), ArgTemplate::Node(p))]),
        )],
      )
      .unwrap();

    let node = graph.node(b).unwrap().clone();
    assert!(matches!(
      resolve_arguments(&graph, &node),
      Err(GraphError::Unresolved { node: 0 })
    ));

    graph.node_mut(a).unwrap().output = Some(json!("x"));
    graph.node_mut(p).unwrap().output = Some(json!(1));
    let args = resolve_arguments(&graph, &node).unwrap();

    assert_eq!(args.args, vec![json!(["x", 1])]);
    assert_eq!(args.kwargs["k"], json!({"inner": 1}));
  }

  #[test]
  fn test_project() {
    let pair = json!([2, 4]);
    assert_eq!(project(&pair, &Selector::Index(1)).unwrap(), json!(4));
    assert!(matches!(
      project(&pair, &Selector::Index(2)),
      Err(GraphError::IndexOutOfRange { index: 2, len: 2 })
    ));

    let map = json!({"rows": 3});
    assert_eq!(project(&map, &Selector::Key("rows".into())).unwrap(), json!(3));
    assert!(project(&map, &Selector::Key("cols".into())).is_err());
    assert!(project(&json!(7), &Selector::Index(0)).is_err());
  }
}
