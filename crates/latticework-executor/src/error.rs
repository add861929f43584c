use latticework_config::ConfigError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecutorError {
  #[error("task was cancelled")]
  TaskCancelled,

  #[error("task raised an error:\n{traceback}")]
  TaskRuntime { traceback: String },

  #[error("failed to connect to '{address}': {message}")]
  Connection { address: String, message: String },

  #[error("transport error: {message}")]
  Transport { message: String },

  #[error("no scheduler address configured for executor '{executor}'")]
  MissingSchedulerAddress { executor: String },

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  #[error(transparent)]
  Config(#[from] ConfigError),
}

impl ExecutorError {
  /// Only failures raised by the task itself are worth another attempt.
  pub fn is_retryable(&self) -> bool {
    matches!(self, ExecutorError::TaskRuntime { .. })
  }
}
