use serde::{Deserialize, Serialize};

use crate::task::{TaskArgs, TaskContext, TaskFunction};

/// Scheduling metadata declared on an electron.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElectronMetadata {
  /// Executor type tag. `None` uses the lattice default.
  pub executor: Option<String>,
  /// Extra attempts after a runtime failure.
  pub max_retry_attempts: u32,
}

/// A task function that can be called from a lattice body.
#[derive(Debug, Clone)]
pub struct Electron {
  name: String,
  function: TaskFunction,
  metadata: ElectronMetadata,
}

impl Electron {
  pub fn new<F>(name: impl Into<String>, f: F) -> Self
  where
    F: Fn(&TaskArgs, &mut TaskContext) -> anyhow::Result<serde_json::Value> + Send + Sync + 'static,
  {
    Self {
      name: name.into(),
      function: TaskFunction::new(f),
      metadata: ElectronMetadata::default(),
    }
  }

  /// Run this electron on the executor registered as `executor`.
  pub fn with_executor(mut self, executor: impl Into<String>) -> Self {
    self.metadata.executor = Some(executor.into());
    self
  }

  pub fn with_retries(mut self, max_retry_attempts: u32) -> Self {
    self.metadata.max_retry_attempts = max_retry_attempts;
    self
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn function(&self) -> &TaskFunction {
    &self.function
  }

  pub fn metadata(&self) -> &ElectronMetadata {
    &self.metadata
  }
}
