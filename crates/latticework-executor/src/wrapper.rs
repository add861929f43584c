//! The unit of work shipped to a backend.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;

use latticework_graph::{TaskArgs, TaskContext, TaskFunction};
use serde::{Deserialize, Serialize};

/// How a wrapped task call ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskOutcome {
  Success { value: serde_json::Value },
  RuntimeFailure { traceback: String },
  Cancelled,
}

/// Result of a wrapped task call, serializable so it can cross a transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WrappedOutput {
  pub outcome: TaskOutcome,
  pub stdout: String,
  pub stderr: String,
}

impl WrappedOutput {
  pub fn cancelled() -> Self {
    Self {
      outcome: TaskOutcome::Cancelled,
      stdout: String::new(),
      stderr: String::new(),
    }
  }

  pub fn failure(traceback: impl Into<String>) -> Self {
    Self {
      outcome: TaskOutcome::RuntimeFailure {
        traceback: traceback.into(),
      },
      stdout: String::new(),
      stderr: String::new(),
    }
  }

  /// `(output, stdout, stderr, traceback)`. The traceback is empty unless the
  /// task failed; the output is `None` unless it succeeded.
  pub fn into_parts(self) -> (Option<serde_json::Value>, String, String, String) {
    match self.outcome {
      TaskOutcome::Success { value } => (Some(value), self.stdout, self.stderr, String::new()),
      TaskOutcome::RuntimeFailure { traceback } => (None, self.stdout, self.stderr, traceback),
      TaskOutcome::Cancelled => (None, self.stdout, self.stderr, String::new()),
    }
  }
}

/// Run `function` in `workdir`, capturing its streams.
///
/// Errors returned by the function and panics inside it both become a
/// [`TaskOutcome::RuntimeFailure`]. Output written before the failure is kept.
pub fn io_wrapper(function: &TaskFunction, args: &TaskArgs, workdir: &Path) -> WrappedOutput {
  if let Err(e) = std::fs::create_dir_all(workdir) {
    return WrappedOutput::failure(format!(
      "failed to create working directory {}: {}",
      workdir.display(),
      e
    ));
  }

  let mut ctx = TaskContext::new(workdir);
  let result = panic::catch_unwind(AssertUnwindSafe(|| function.call(args, &mut ctx)));
  let (stdout, stderr) = ctx.into_streams();

  let outcome = match result {
    Ok(Ok(value)) => TaskOutcome::Success { value },
    Ok(Err(e)) => TaskOutcome::RuntimeFailure {
      traceback: format!("Error: {:?}", e),
    },
    Err(payload) => TaskOutcome::RuntimeFailure {
      traceback: format!("task panicked: {}", panic_message(payload.as_ref())),
    },
  };

  WrappedOutput {
    outcome,
    stdout,
    stderr,
  }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
  if let Some(s) = payload.downcast_ref::<&str>() {
    s
  } else if let Some(s) = payload.downcast_ref::<String>() {
    s
  } else {
    "unknown panic payload"
  }
}
