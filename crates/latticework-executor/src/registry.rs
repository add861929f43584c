use std::collections::HashMap;
use std::sync::Arc;

use crate::executor::Executor;

/// Executors keyed by short name.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
  executors: HashMap<String, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register an executor under its short name, replacing any previous one.
  pub fn register(&mut self, executor: Arc<dyn Executor>) {
    self
      .executors
      .insert(executor.short_name().to_string(), executor);
  }

  /// Register an executor under `name` instead of its short name, e.g. two
  /// cluster executors pointed at different schedulers.
  pub fn register_as(&mut self, name: impl Into<String>, executor: Arc<dyn Executor>) {
    self.executors.insert(name.into(), executor);
  }

  pub fn with(mut self, executor: Arc<dyn Executor>) -> Self {
    self.register(executor);
    self
  }

  pub fn with_named(mut self, name: impl Into<String>, executor: Arc<dyn Executor>) -> Self {
    self.register_as(name, executor);
    self
  }

  pub fn get(&self, name: &str) -> Option<Arc<dyn Executor>> {
    self.executors.get(name).cloned()
  }

  pub fn contains(&self, name: &str) -> bool {
    self.executors.contains_key(name)
  }

  /// Registered names, sorted.
  pub fn names(&self) -> Vec<&str> {
    let mut names: Vec<&str> = self.executors.keys().map(String::as_str).collect();
    names.sort_unstable();
    names
  }
}

impl std::fmt::Debug for ExecutorRegistry {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ExecutorRegistry")
      .field("executors", &self.names())
      .finish()
  }
}
