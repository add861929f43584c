//! Transport graph nodes and their identifiers.
//!
//! Node keys are compatibility-critical and must keep this exact format:
//!
//! - task nodes: `<function_name>(<index>)`, e.g. `a(0)`
//! - parameter nodes: `:parameter:<value>(<index>)`, e.g. `:parameter:2(1)`
//! - generated nodes: `:generated:<function_name>()[<i>](<index>)`,
//!   e.g. `:generated:a()[0](2)`

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::TaskFunction;

/// Monotonically increasing node index within one transport graph.
pub type NodeId = usize;

pub const PARAMETER_PREFIX: &str = ":parameter:";
pub const GENERATED_PREFIX: &str = ":generated:";

/// Format the key of a node from its name and index.
pub fn node_key(name: &str, id: NodeId) -> String {
  format!("{}({})", name, id)
}

/// Split a node key into its name and index.
pub fn parse_node_key(key: &str) -> Option<(&str, NodeId)> {
  let body = key.strip_suffix(')')?;
  let open = body.rfind('(')?;
  let id = body[open + 1..].parse().ok()?;
  Some((&body[..open], id))
}

/// Name of the parameter node holding a literal input.
///
/// Strings are rendered bare, everything else as JSON text.
pub fn parameter_name(value: &serde_json::Value) -> String {
  match value {
    serde_json::Value::String(s) => format!("{}{}", PARAMETER_PREFIX, s),
    other => format!("{}{}", PARAMETER_PREFIX, other),
  }
}

/// Name of the node selecting one element of `parent`'s output.
pub fn generated_name(parent: &str, selector: &Selector) -> String {
  format!("{}{}()[{}]", GENERATED_PREFIX, parent, selector)
}

/// Which element a generated node projects out of its parent's output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Selector {
  Index(usize),
  Key(String),
}

impl fmt::Display for Selector {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Selector::Index(i) => write!(f, "{}", i),
      Selector::Key(k) => write!(f, "{}", k),
    }
  }
}

/// What a node stands for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeRole {
  /// An electron call, submitted to an executor.
  Task,
  /// A literal input value.
  Parameter { value: serde_json::Value },
  /// One element of a parent node's output (collection unpacking).
  Generated { parent: NodeId, selector: Selector },
}

/// Lifecycle of a node during a dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
  #[default]
  Pending,
  Submitted,
  Completed,
  Failed,
  Cancelled,
}

impl NodeStatus {
  pub fn is_terminal(&self) -> bool {
    matches!(
      self,
      NodeStatus::Completed | NodeStatus::Failed | NodeStatus::Cancelled
    )
  }
}

/// How a task argument is assembled from upstream node outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgTemplate {
  Node(NodeId),
  Seq(Vec<ArgTemplate>),
  Map(Vec<(String, ArgTemplate)>),
}

impl ArgTemplate {
  /// Collect every node this template reads from.
  pub fn node_ids(&self, out: &mut Vec<NodeId>) {
    match self {
      ArgTemplate::Node(id) => out.push(*id),
      ArgTemplate::Seq(items) => items.iter().for_each(|item| item.node_ids(out)),
      ArgTemplate::Map(entries) => entries.iter().for_each(|(_, item)| item.node_ids(out)),
    }
  }
}

/// Scheduling metadata declared on a node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeMetadata {
  /// Executor type tag requested by the electron (task nodes only).
  #[serde(skip_serializing_if = "Option::is_none")]
  pub executor: Option<String>,
  /// Extra attempts after a runtime failure.
  pub max_retry_attempts: u32,
}

/// A node in the transport graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
  pub id: NodeId,
  pub name: String,
  pub role: NodeRole,
  pub metadata: NodeMetadata,
  /// Executor assigned by the planner.
  pub executor: Option<String>,
  pub args: Vec<ArgTemplate>,
  pub kwargs: Vec<(String, ArgTemplate)>,
  #[serde(skip)]
  pub function: Option<TaskFunction>,
  pub status: NodeStatus,
  pub output: Option<serde_json::Value>,
  /// Traceback or failure description.
  pub error: Option<String>,
  pub stdout: String,
  pub stderr: String,
  pub attempts: u32,
  pub started_at: Option<DateTime<Utc>>,
  pub completed_at: Option<DateTime<Utc>>,
}

impl Node {
  pub(crate) fn new(
    id: NodeId,
    name: String,
    role: NodeRole,
    metadata: NodeMetadata,
    function: Option<TaskFunction>,
  ) -> Self {
    Self {
      id,
      name,
      role,
      metadata,
      executor: None,
      args: Vec::new(),
      kwargs: Vec::new(),
      function,
      status: NodeStatus::Pending,
      output: None,
      error: None,
      stdout: String::new(),
      stderr: String::new(),
      attempts: 0,
      started_at: None,
      completed_at: None,
    }
  }

  /// The node's stable key, e.g. `a(0)`.
  pub fn key(&self) -> String {
    node_key(&self.name, self.id)
  }

  pub fn is_task(&self) -> bool {
    matches!(self.role, NodeRole::Task)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_key_formats() {
    assert_eq!(node_key("a", 0), "a(0)");
    assert_eq!(node_key(&parameter_name(&json!(2)), 1), ":parameter:2(1)");
    assert_eq!(
      node_key(&generated_name("a", &Selector::Index(0)), 2),
      ":generated:a()[0](2)"
    );
    assert_eq!(
      node_key(&generated_name("fetch", &Selector::Key("rows".into())), 7),
      ":generated:fetch()[rows](7)"
    );
  }

  #[test]
  fn test_parameter_name_renders_strings_bare() {
    assert_eq!(parameter_name(&json!("absolute")), ":parameter:absolute");
    assert_eq!(parameter_name(&json!([1, 2])), ":parameter:[1,2]");
  }

  #[test]
  fn test_parse_node_key() {
    assert_eq!(parse_node_key("a(0)"), Some(("a", 0)));
    assert_eq!(
      parse_node_key(":generated:a()[1](3)"),
      Some((":generated:a()[1]", 3))
    );
    assert_eq!(parse_node_key("a()"), None);
    assert_eq!(parse_node_key("plain"), None);
  }
}
