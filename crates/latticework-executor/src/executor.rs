//! The executor contract.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use latticework_config::ExecutorConfig;
use latticework_graph::{NodeId, TaskArgs, TaskFunction};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::error::ExecutorError;
use crate::wrapper::{TaskOutcome, WrappedOutput};

/// Opaque backend token referencing an in-flight submission.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobHandle(String);

impl JobHandle {
  pub fn new(token: impl Into<String>) -> Self {
    Self(token.into())
  }

  /// A fresh random handle.
  pub fn generate() -> Self {
    Self(uuid::Uuid::new_v4().to_string())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for JobHandle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Per-node job state shared between the dispatcher and the executor.
#[derive(Debug, Default)]
pub struct JobRecord {
  cancel_requested: AtomicBool,
  handle: Mutex<Option<JobHandle>>,
}

impl JobRecord {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn request_cancel(&self) {
    self.cancel_requested.store(true, Ordering::SeqCst);
  }

  pub fn cancel_requested(&self) -> bool {
    self.cancel_requested.load(Ordering::SeqCst)
  }

  pub fn set_handle(&self, handle: JobHandle) {
    *self.handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
  }

  pub fn handle(&self) -> Option<JobHandle> {
    self
      .handle
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }
}

/// Identifies the task an executor is running.
#[derive(Debug, Clone)]
pub struct TaskMetadata {
  pub dispatch_id: String,
  pub node_id: NodeId,
  pub job: Arc<JobRecord>,
}

impl TaskMetadata {
  pub fn new(dispatch_id: impl Into<String>, node_id: NodeId) -> Self {
    Self {
      dispatch_id: dispatch_id.into(),
      node_id,
      job: Arc::new(JobRecord::new()),
    }
  }
}

/// Sinks a task's captured stdout and stderr are replayed into.
///
/// Opened by the dispatcher before a task is handed to its executor and
/// closed once the executor returns.
#[derive(Debug, Default)]
pub struct TaskStreams {
  stdout: String,
  stderr: String,
}

impl TaskStreams {
  pub fn open() -> Self {
    Self::default()
  }

  pub fn write_stdout(&mut self, text: &str) {
    self.stdout.push_str(text);
  }

  pub fn write_stderr(&mut self, text: &str) {
    self.stderr.push_str(text);
  }

  /// Returns `(stdout, stderr)`.
  pub fn close(self) -> (String, String) {
    (self.stdout, self.stderr)
  }
}

/// A compute backend.
///
/// `run` must fail with [`ExecutorError::TaskCancelled`] without submitting
/// anything when cancellation was requested for the task, and must publish
/// the backend's job handle with [`Executor::set_job_handle`] once it has one.
#[async_trait]
pub trait Executor: Send + Sync {
  /// Type tag the executor is registered under.
  fn short_name(&self) -> &str;

  /// Execute `function` and return its output.
  ///
  /// Captured stdout and stderr are written to `streams` whether the task
  /// succeeds or fails. A task failure becomes
  /// [`ExecutorError::TaskRuntime`] carrying the traceback.
  async fn run(
    &self,
    function: &TaskFunction,
    args: TaskArgs,
    metadata: &TaskMetadata,
    streams: &mut TaskStreams,
  ) -> Result<serde_json::Value, ExecutorError>;

  /// Ask the backend to cancel the job. Returns whether the request was
  /// accepted.
  async fn cancel(&self, metadata: &TaskMetadata, handle: &JobHandle) -> Result<bool, ExecutorError>;

  fn get_cancel_requested(&self, metadata: &TaskMetadata) -> bool {
    metadata.job.cancel_requested()
  }

  fn set_job_handle(&self, metadata: &TaskMetadata, handle: JobHandle) {
    metadata.job.set_handle(handle);
  }
}

/// Working directory for a task: `base`, or
/// `<base>/<dispatch_id>/node_<node_id>` when `unique` is set.
pub fn task_workdir(base: &Path, unique: bool, metadata: &TaskMetadata) -> PathBuf {
  if unique {
    base
      .join(&metadata.dispatch_id)
      .join(format!("node_{}", metadata.node_id))
  } else {
    base.to_path_buf()
  }
}

/// Replay a wrapped task's streams into `streams` and unwrap its outcome.
///
/// A traceback is also written to stderr.
pub fn complete(
  output: WrappedOutput,
  streams: &mut TaskStreams,
) -> Result<serde_json::Value, ExecutorError> {
  streams.write_stdout(&output.stdout);
  streams.write_stderr(&output.stderr);
  match output.outcome {
    TaskOutcome::Success { value } => Ok(value),
    TaskOutcome::RuntimeFailure { traceback } => {
      streams.write_stderr(&traceback);
      Err(ExecutorError::TaskRuntime { traceback })
    }
    TaskOutcome::Cancelled => Err(ExecutorError::TaskCancelled),
  }
}

/// Append task output to the per-dispatch log files under the cache
/// directory. Empty output is not written.
pub async fn write_streams_to_file(
  config: &ExecutorConfig,
  metadata: &TaskMetadata,
  stdout: &str,
  stderr: &str,
) -> Result<(), ExecutorError> {
  let dir = config.cache_dir.join(&metadata.dispatch_id);
  for (name, text) in [(&config.log_stdout, stdout), (&config.log_stderr, stderr)] {
    if text.is_empty() || name.is_empty() {
      continue;
    }
    tokio::fs::create_dir_all(&dir).await?;
    let mut file = tokio::fs::OpenOptions::new()
      .create(true)
      .append(true)
      .open(dir.join(name))
      .await?;
    file.write_all(text.as_bytes()).await?;
    file.flush().await?;
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_task_workdir() {
    let metadata = TaskMetadata::new("d1", 3);
    let base = Path::new("/work");

    assert_eq!(task_workdir(base, false, &metadata), PathBuf::from("/work"));
    assert_eq!(
      task_workdir(base, true, &metadata),
      PathBuf::from("/work/d1/node_3")
    );
  }

  #[test]
  fn test_complete_replays_streams() {
    let mut streams = TaskStreams::open();
    let output = WrappedOutput {
      outcome: TaskOutcome::RuntimeFailure {
        traceback: "boom".into(),
      },
      stdout: "hello\n".into(),
      stderr: "warn\n".into(),
    };

    let err = complete(output, &mut streams).unwrap_err();
    assert!(matches!(err, ExecutorError::TaskRuntime { ref traceback } if traceback == "boom"));
    assert_eq!(streams.close(), ("hello\n".into(), "warn\nboom".into()));

    let mut streams = TaskStreams::open();
    let output = WrappedOutput {
      outcome: TaskOutcome::Success { value: json!(1) },
      stdout: String::new(),
      stderr: String::new(),
    };
    assert_eq!(complete(output, &mut streams).unwrap(), json!(1));
  }

  #[test]
  fn test_job_record() {
    let record = JobRecord::new();
    assert!(!record.cancel_requested());
    assert!(record.handle().is_none());

    record.request_cancel();
    record.set_handle(JobHandle::new("job-1"));

    assert!(record.cancel_requested());
    assert_eq!(record.handle(), Some(JobHandle::new("job-1")));
  }

  #[tokio::test]
  async fn test_write_streams_to_file_appends() {
    let temp = tempfile::tempdir().unwrap();
    let config = ExecutorConfig {
      workdir: temp.path().join("work"),
      create_unique_workdir: false,
      cache_dir: temp.path().to_path_buf(),
      log_stdout: "stdout.log".into(),
      log_stderr: "stderr.log".into(),
    };
    let metadata = TaskMetadata::new("d1", 0);

    write_streams_to_file(&config, &metadata, "a\n", "").await.unwrap();
    write_streams_to_file(&config, &metadata, "b\n", "").await.unwrap();

    let log = std::fs::read_to_string(temp.path().join("d1/stdout.log")).unwrap();
    assert_eq!(log, "a\nb\n");
    assert!(!temp.path().join("d1/stderr.log").exists());
  }
}
