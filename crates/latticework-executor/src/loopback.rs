//! An in-process scheduler for [`ClusterExecutor`](crate::ClusterExecutor).

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cluster::{ClusterClient, ClusterTask, Connector};
use crate::error::ExecutorError;
use crate::executor::JobHandle;
use crate::wrapper::{WrappedOutput, io_wrapper};

/// Address scheme accepted by [`LoopbackConnector`].
pub const LOOPBACK_SCHEME: &str = "loopback://";

struct LoopbackJob {
  token: CancellationToken,
  receiver: Option<oneshot::Receiver<WrappedOutput>>,
}

/// Scheduler running submitted tasks on the blocking thread pool.
pub struct LoopbackCluster {
  address: String,
  jobs: Mutex<HashMap<JobHandle, LoopbackJob>>,
}

impl LoopbackCluster {
  pub fn new(address: impl Into<String>) -> Self {
    Self {
      address: address.into(),
      jobs: Mutex::new(HashMap::new()),
    }
  }

  /// Jobs submitted and not yet collected with `result`.
  pub fn pending(&self) -> usize {
    self.jobs.lock().unwrap_or_else(PoisonError::into_inner).len()
  }
}

#[async_trait]
impl ClusterClient for LoopbackCluster {
  fn address(&self) -> &str {
    &self.address
  }

  async fn submit(&self, task: ClusterTask) -> Result<JobHandle, ExecutorError> {
    let key = JobHandle::generate();
    let token = CancellationToken::new();
    let (tx, rx) = oneshot::channel();

    let job_token = token.clone();
    tokio::spawn(async move {
      let ClusterTask {
        function,
        args,
        workdir,
      } = task;
      let work = tokio::task::spawn_blocking(move || io_wrapper(&function, &args, &workdir));
      let output = tokio::select! {
        joined = work => joined.unwrap_or_else(|e| WrappedOutput::failure(format!("worker failed: {}", e))),
        _ = job_token.cancelled() => WrappedOutput::cancelled(),
      };
      // The receiver is gone if nobody waits for the result.
      let _ = tx.send(output);
    });

    self.jobs.lock().unwrap_or_else(PoisonError::into_inner).insert(
      key.clone(),
      LoopbackJob {
        token,
        receiver: Some(rx),
      },
    );
    debug!(address = %self.address, job = %key, "loopback_job_submitted");
    Ok(key)
  }

  async fn result(&self, key: &JobHandle) -> Result<WrappedOutput, ExecutorError> {
    let receiver = {
      let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
      jobs.get_mut(key).and_then(|job| job.receiver.take())
    };
    let receiver = receiver.ok_or_else(|| ExecutorError::Transport {
      message: format!("unknown job '{}'", key),
    })?;

    let output = receiver.await.map_err(|_| ExecutorError::Transport {
      message: format!("job '{}' was dropped by the scheduler", key),
    });
    self
      .jobs
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .remove(key);
    output
  }

  async fn cancel(&self, key: &JobHandle) -> Result<(), ExecutorError> {
    let jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(job) = jobs.get(key) {
      job.token.cancel();
    }
    Ok(())
  }
}

/// Connects to [`LoopbackCluster`]s, one per `loopback://` address.
#[derive(Debug, Default)]
pub struct LoopbackConnector {
  connections: AtomicUsize,
  handshake_delay: Option<Duration>,
}

impl LoopbackConnector {
  pub fn new() -> Self {
    Self::default()
  }

  /// Simulate a slow handshake.
  pub fn with_handshake_delay(mut self, delay: Duration) -> Self {
    self.handshake_delay = Some(delay);
    self
  }

  /// Number of connections opened so far.
  pub fn connections(&self) -> usize {
    self.connections.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl Connector for LoopbackConnector {
  async fn connect(&self, address: &str) -> Result<Arc<dyn ClusterClient>, ExecutorError> {
    if !address.starts_with(LOOPBACK_SCHEME) {
      return Err(ExecutorError::Connection {
        address: address.to_string(),
        message: format!("unsupported scheme, expected '{}'", LOOPBACK_SCHEME),
      });
    }
    if let Some(delay) = self.handshake_delay {
      tokio::time::sleep(delay).await;
    }
    self.connections.fetch_add(1, Ordering::SeqCst);
    debug!(address = %address, "loopback_connected");
    Ok(Arc::new(LoopbackCluster::new(address)))
  }
}
