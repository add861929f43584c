//! Latticework Dispatcher
//!
//! This crate runs one lattice invocation end to end:
//!
//! 1. the [`Planner`] assigns every task node a registered executor,
//! 2. the [`Dispatcher`] submits nodes in dependency order, awaiting
//!    independent branches concurrently and propagating failure and
//!    cancellation to descendants,
//! 3. [`post_process`] replays the lattice over the computed outputs to
//!    rebuild its return value.
//!
//! Progress and the final value are collected in a [`WorkflowResult`].

mod dispatch;
mod error;
mod input;
mod planner;
mod postprocess;
mod result;

pub use dispatch::Dispatcher;
pub use error::{DispatchError, PlanError, PostProcessError};
pub use planner::{IdentityPolicy, Planner, RoundRobinPolicy, SchedulePolicy};
pub use postprocess::post_process;
pub use result::{RunStatus, WorkflowResult};
