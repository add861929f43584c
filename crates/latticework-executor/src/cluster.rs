//! Executor submitting tasks to a cluster scheduler.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use latticework_config::{ExecutorConfig, ExecutorOverrides, Settings, resolve};
use latticework_graph::{TaskArgs, TaskFunction};
use tracing::{debug, instrument, warn};

use crate::error::ExecutorError;
use crate::executor::{
  Executor, JobHandle, TaskMetadata, TaskStreams, complete, task_workdir, write_streams_to_file,
};
use crate::pool::ConnectionPool;
use crate::wrapper::WrappedOutput;

/// A task as submitted to a scheduler: the wrapper's inputs.
#[derive(Debug, Clone)]
pub struct ClusterTask {
  pub function: TaskFunction,
  pub args: TaskArgs,
  pub workdir: PathBuf,
}

/// Client of a running scheduler.
#[async_trait]
pub trait ClusterClient: Send + Sync {
  fn address(&self) -> &str;

  /// Submit a task. The returned key identifies the job.
  async fn submit(&self, task: ClusterTask) -> Result<JobHandle, ExecutorError>;

  /// Wait for a job's wrapped output.
  async fn result(&self, key: &JobHandle) -> Result<WrappedOutput, ExecutorError>;

  /// Best-effort cancellation of a job.
  async fn cancel(&self, key: &JobHandle) -> Result<(), ExecutorError>;
}

/// Opens clients to schedulers.
#[async_trait]
pub trait Connector: Send + Sync {
  async fn connect(&self, address: &str) -> Result<Arc<dyn ClusterClient>, ExecutorError>;
}

/// Submits tasks to the scheduler at `scheduler_address`.
///
/// Clients come from a shared [`ConnectionPool`], so executors pointed at the
/// same address reuse one connection.
pub struct ClusterExecutor {
  scheduler_address: String,
  config: ExecutorConfig,
  connector: Arc<dyn Connector>,
  pool: Arc<ConnectionPool<dyn ClusterClient>>,
}

impl ClusterExecutor {
  pub const SHORT_NAME: &'static str = "cluster";

  pub fn new(
    scheduler_address: impl Into<String>,
    config: ExecutorConfig,
    connector: Arc<dyn Connector>,
    pool: Arc<ConnectionPool<dyn ClusterClient>>,
  ) -> Self {
    Self {
      scheduler_address: scheduler_address.into(),
      config,
      connector,
      pool,
    }
  }

  /// Resolve the scheduler address and executor config from explicit
  /// values, the settings document and defaults.
  pub fn from_settings(
    scheduler_address: Option<String>,
    overrides: ExecutorOverrides,
    settings: &Settings,
    connector: Arc<dyn Connector>,
    pool: Arc<ConnectionPool<dyn ClusterClient>>,
  ) -> Result<Self, ExecutorError> {
    let address = resolve(
      scheduler_address,
      settings,
      &format!("executors.{}.scheduler_address", Self::SHORT_NAME),
      String::new,
    )?;
    if address.is_empty() {
      return Err(ExecutorError::MissingSchedulerAddress {
        executor: Self::SHORT_NAME.to_string(),
      });
    }
    let config = ExecutorConfig::resolve(Self::SHORT_NAME, overrides, settings)?;
    Ok(Self::new(address, config, connector, pool))
  }

  pub fn scheduler_address(&self) -> &str {
    &self.scheduler_address
  }

  async fn client(&self) -> Result<Arc<dyn ClusterClient>, ExecutorError> {
    self
      .pool
      .get_or_connect(&self.scheduler_address, || {
        self.connector.connect(&self.scheduler_address)
      })
      .await
  }
}

#[async_trait]
impl Executor for ClusterExecutor {
  fn short_name(&self) -> &str {
    Self::SHORT_NAME
  }

  #[instrument(
    name = "cluster_run",
    skip(self, function, args, metadata, streams),
    fields(
      dispatch_id = %metadata.dispatch_id,
      node_id = metadata.node_id,
      scheduler = %self.scheduler_address,
    )
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

    let client = self.client().await?;
    let task = ClusterTask {
      function: function.clone(),
      args,
      workdir: task_workdir(
        &self.config.workdir,
        self.config.create_unique_workdir,
        metadata,
      ),
    };
    let key = client.submit(task).await?;
    self.set_job_handle(metadata, key.clone());
    debug!(job = %key, "job_submitted");

    if self.get_cancel_requested(metadata) {
      client.cancel(&key).await?;
      // Collect the job so the scheduler can release it.
      if let Err(e) = client.result(&key).await {
        warn!(job = %key, error = %e, "cancelled_job_not_collected");
      }
      return Err(ExecutorError::TaskCancelled);
    }

    let output = client.result(&key).await?;
    if let Err(e) = write_streams_to_file(&self.config, metadata, &output.stdout, &output.stderr).await {
      warn!(job = %key, error = %e, "task_logs_not_written");
    }
    complete(output, streams)
  }

  async fn cancel(&self, metadata: &TaskMetadata, handle: &JobHandle) -> Result<bool, ExecutorError> {
    let client = self.client().await?;
    client.cancel(handle).await?;
    debug!(dispatch_id = %metadata.dispatch_id, node_id = metadata.node_id, job = %handle, "job_cancelled");
    Ok(true)
  }
}
