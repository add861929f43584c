//! Latticework Executor
//!
//! This crate defines how a single task reaches a compute backend:
//!
//! - [`Executor`]: the submit/await/cancel contract every backend implements.
//! - [`io_wrapper`]: the unit of work shipped to a backend. It runs the task
//!   function, captures its output streams and turns errors and panics into a
//!   transportable [`TaskOutcome`].
//! - [`ConnectionPool`]: clients cached per address, shared by executors.
//! - [`ExecutorRegistry`]: executors keyed by their short name.
//!
//! Two backends ship with the crate. [`LocalExecutor`] runs tasks on the
//! blocking thread pool of the tokio runtime. [`ClusterExecutor`] submits to a
//! scheduler through a [`ClusterClient`]; [`LoopbackConnector`] provides an
//! in-process scheduler for it.

mod cluster;
mod error;
mod executor;
mod local;
mod loopback;
mod pool;
mod registry;
mod wrapper;

pub use cluster::{ClusterClient, ClusterExecutor, ClusterTask, Connector};
pub use error::ExecutorError;
pub use executor::{
  Executor, JobHandle, JobRecord, TaskMetadata, TaskStreams, complete, task_workdir,
  write_streams_to_file,
};
pub use local::LocalExecutor;
pub use loopback::{LOOPBACK_SCHEME, LoopbackCluster, LoopbackConnector};
pub use pool::ConnectionPool;
pub use registry::ExecutorRegistry;
pub use wrapper::{TaskOutcome, WrappedOutput, io_wrapper};
