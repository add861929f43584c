//! Executor running tasks in the current process.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use latticework_config::{ConfigError, ExecutorConfig, ExecutorOverrides, Settings};
use latticework_graph::{TaskArgs, TaskFunction};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::error::ExecutorError;
use crate::executor::{
  Executor, JobHandle, TaskMetadata, TaskStreams, complete, task_workdir, write_streams_to_file,
};
use crate::wrapper::{WrappedOutput, io_wrapper};

/// Runs tasks on the blocking thread pool of the tokio runtime.
///
/// Cancellation is cooperative: a cancelled job resolves immediately as
/// cancelled, but its thread is left to finish and its result is discarded.
pub struct LocalExecutor {
  config: ExecutorConfig,
  jobs: Arc<RwLock<HashMap<JobHandle, CancellationToken>>>,
}

impl LocalExecutor {
  pub const SHORT_NAME: &'static str = "local";

  pub fn new(config: ExecutorConfig) -> Self {
    Self {
      config,
      jobs: Arc::new(RwLock::new(HashMap::new())),
    }
  }

  /// Build from explicit overrides, the settings document and defaults.
  pub fn from_settings(overrides: ExecutorOverrides, settings: &Settings) -> Result<Self, ConfigError> {
    Ok(Self::new(ExecutorConfig::resolve(
      Self::SHORT_NAME,
      overrides,
      settings,
    )?))
  }

  pub fn config(&self) -> &ExecutorConfig {
    &self.config
  }

  fn forget(&self, handle: &JobHandle) {
    self
      .jobs
      .write()
      .unwrap_or_else(PoisonError::into_inner)
      .remove(handle);
  }
}

#[async_trait]
impl Executor for LocalExecutor {
  fn short_name(&self) -> &str {
    Self::SHORT_NAME
  }

  #[instrument(
    name = "local_run",
    skip(self, function, args, metadata, streams),
    fields(dispatch_id = %metadata.dispatch_id, node_id = metadata.node_id)
  )]
  async fn run(
    &self,
    function: &TaskFunction,
    args: TaskArgs,
    metadata: &TaskMetadata,
    streams: &mut TaskStreams,
  ) -> Result<serde_json::Value, ExecutorError> {
    if self.get_cancel_requested(metadata) {
      return Err(ExecutorError::TaskCancelled);
    }

    let workdir = task_workdir(
      &self.config.workdir,
      self.config.create_unique_workdir,
      metadata,
    );
    let handle = JobHandle::generate();
    let token = CancellationToken::new();
    self
      .jobs
      .write()
      .unwrap_or_else(PoisonError::into_inner)
      .insert(handle.clone(), token.clone());
    self.set_job_handle(metadata, handle.clone());

    // A cancel requested before the handle was published cannot reach the job.
    if self.get_cancel_requested(metadata) {
      self.forget(&handle);
      return Err(ExecutorError::TaskCancelled);
    }

    debug!(job = %handle, workdir = %workdir.display(), "job_submitted");

    let function = function.clone();
    let task = tokio::task::spawn_blocking(move || io_wrapper(&function, &args, &workdir));
    let output = tokio::select! {
      joined = task => joined.unwrap_or_else(|e| WrappedOutput::failure(format!("task thread failed: {}", e))),
      _ = token.cancelled() => WrappedOutput::cancelled(),
    };
    self.forget(&handle);

    if let Err(e) = write_streams_to_file(&self.config, metadata, &output.stdout, &output.stderr).await {
      warn!(job = %handle, error = %e, "task_logs_not_written");
    }
    complete(output, streams)
  }

  async fn cancel(&self, metadata: &TaskMetadata, handle: &JobHandle) -> Result<bool, ExecutorError> {
    let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
    match jobs.get(handle) {
      Some(token) => {
        token.cancel();
        debug!(dispatch_id = %metadata.dispatch_id, node_id = metadata.node_id, job = %handle, "job_cancelled");
        Ok(true)
      }
      None => Ok(false),
    }
  }
}

#[cfg(test)]
mod tests {
  use std::io::Write;
  use std::path::Path;
  use std::time::Duration;

  use super::*;
  use serde_json::json;

  fn config(root: &Path, unique: bool) -> ExecutorConfig {
    ExecutorConfig {
      workdir: root.join("work"),
      create_unique_workdir: unique,
      cache_dir: root.join("cache"),
      log_stdout: "stdout.log".into(),
      log_stderr: "stderr.log".into(),
    }
  }

  fn args(values: Vec<serde_json::Value>) -> TaskArgs {
    TaskArgs::new(values, Default::default())
  }

  #[tokio::test]
  async fn test_run_returns_output_and_streams() {
    let temp = tempfile::tempdir().unwrap();
    let executor = LocalExecutor::new(config(temp.path(), false));
    let function = TaskFunction::new(|args, ctx| {
      let x: i64 = args.param(0, "x")?;
      writeln!(ctx.stdout(), "squaring {}", x)?;
      Ok(json!(x * x))
    });
    let metadata = TaskMetadata::new("d1", 0);
    let mut streams = TaskStreams::open();

    let out = executor
      .run(&function, args(vec![json!(3)]), &metadata, &mut streams)
      .await
      .unwrap();

    assert_eq!(out, json!(9));
    assert_eq!(streams.close().0, "squaring 3\n");
    assert!(metadata.job.handle().is_some());
    let log = std::fs::read_to_string(temp.path().join("cache/d1/stdout.log")).unwrap();
    assert_eq!(log, "squaring 3\n");
  }

  #[tokio::test]
  async fn test_unwritable_log_dir_keeps_output() {
    let temp = tempfile::tempdir().unwrap();
    let mut config = config(temp.path(), false);
    // A regular file where the cache directory should be.
    std::fs::write(temp.path().join("cache"), "").unwrap();
    config.cache_dir = temp.path().join("cache");
    let executor = LocalExecutor::new(config);
    let function = TaskFunction::new(|_args, ctx| {
      writeln!(ctx.stdout(), "still here")?;
      Ok(json!("done"))
    });
    let mut streams = TaskStreams::open();

    let out = executor
      .run(&function, args(vec![]), &TaskMetadata::new("d1", 0), &mut streams)
      .await
      .unwrap();

    assert_eq!(out, json!("done"));
    assert_eq!(streams.close().0, "still here\n");
  }

  #[tokio::test]
  async fn test_run_reports_runtime_error() {
    let temp = tempfile::tempdir().unwrap();
    let executor = LocalExecutor::new(config(temp.path(), false));
    let function = TaskFunction::new(|_args, _ctx| anyhow::bail!("division by zero"));
    let metadata = TaskMetadata::new("d1", 0);
    let mut streams = TaskStreams::open();

    let err = executor
      .run(&function, args(vec![]), &metadata, &mut streams)
      .await
      .unwrap_err();

    assert!(matches!(err, ExecutorError::TaskRuntime { ref traceback } if traceback.contains("division by zero")));
    assert!(streams.close().1.contains("division by zero"));
  }

  #[tokio::test]
  async fn test_cancel_requested_before_run() {
    let temp = tempfile::tempdir().unwrap();
    let executor = LocalExecutor::new(config(temp.path(), false));
    let function = TaskFunction::new(|_args, _ctx| Ok(json!(1)));
    let metadata = TaskMetadata::new("d1", 0);
    metadata.job.request_cancel();

    let err = executor
      .run(&function, args(vec![]), &metadata, &mut TaskStreams::open())
      .await
      .unwrap_err();

    assert!(matches!(err, ExecutorError::TaskCancelled));
    assert!(metadata.job.handle().is_none());
  }

  #[tokio::test]
  async fn test_cancel_in_flight_job() {
    let temp = tempfile::tempdir().unwrap();
    let executor = Arc::new(LocalExecutor::new(config(temp.path(), false)));
    let function = TaskFunction::new(|_args, _ctx| {
      std::thread::sleep(Duration::from_millis(300));
      Ok(json!("late"))
    });
    let metadata = TaskMetadata::new("d1", 0);

    let running = {
      let executor = executor.clone();
      let metadata = metadata.clone();
      tokio::spawn(async move {
        executor
          .run(&function, args(vec![]), &metadata, &mut TaskStreams::open())
          .await
      })
    };

    let handle = loop {
      if let Some(handle) = metadata.job.handle() {
        break handle;
      }
      tokio::time::sleep(Duration::from_millis(5)).await;
    };

    assert!(executor.cancel(&metadata, &handle).await.unwrap());
    let result = running.await.unwrap();
    assert!(matches!(result, Err(ExecutorError::TaskCancelled)));

    // The job is gone once it resolved.
    assert!(!executor.cancel(&metadata, &handle).await.unwrap());
  }

  #[tokio::test]
  async fn test_unique_workdir() {
    let temp = tempfile::tempdir().unwrap();
    let executor = LocalExecutor::new(config(temp.path(), true));
    let function = TaskFunction::new(|_args, ctx| Ok(json!(ctx.workdir().display().to_string())));
    let metadata = TaskMetadata::new("d1", 4);

    let out = executor
      .run(&function, args(vec![]), &metadata, &mut TaskStreams::open())
      .await
      .unwrap();

    let expected = temp.path().join("work/d1/node_4");
    assert_eq!(out, json!(expected.display().to_string()));
    assert!(expected.is_dir());
  }

  #[test]
  fn test_from_settings() {
    let settings = Settings::from_value(json!({
      "executors": { "local": { "workdir": "/srv/work", "create_unique_workdir": true } }
    }));

    let executor = LocalExecutor::from_settings(ExecutorOverrides::default(), &settings).unwrap();

    assert_eq!(executor.config().workdir, std::path::PathBuf::from("/srv/work"));
    assert!(executor.config().create_unique_workdir);
    assert_eq!(executor.short_name(), "local");
  }
}
