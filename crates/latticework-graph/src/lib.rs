//! Latticework Graph
//!
//! This crate provides the data model for one workflow invocation:
//!
//! - [`Electron`]: a task function plus its metadata.
//! - [`Lattice`]: a workflow body that calls electrons through a [`Scope`].
//! - [`TransportGraph`]: the DAG recorded when a lattice body is built,
//!   holding task, parameter and generated (unpacking) nodes.
//!
//! A lattice body runs twice. Building records every electron call as a node
//! and returns symbolic [`Traced::Node`] references. Replaying, done after the
//! graph has executed, feeds the computed task outputs back through the same
//! body so the nested return value is reconstructed exactly.

mod electron;
mod error;
mod graph;
mod lattice;
mod node;
mod scope;
mod task;

pub use electron::{Electron, ElectronMetadata};
pub use error::GraphError;
pub use graph::{Adjacency, Edge, ParamKind, TransportGraph};
pub use lattice::{DEFAULT_EXECUTOR, Inputs, Invocation, Lattice, LatticeMetadata};
pub use node::{
  ArgTemplate, GENERATED_PREFIX, Node, NodeId, NodeMetadata, NodeRole, NodeStatus,
  PARAMETER_PREFIX, Selector, generated_name, node_key, parameter_name, parse_node_key,
};
pub use scope::{Scope, Traced};
pub use task::{TaskArgs, TaskContext, TaskFunction};
