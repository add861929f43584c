//! Task functions and the values they receive.

use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

type TaskFn = dyn Fn(&TaskArgs, &mut TaskContext) -> anyhow::Result<serde_json::Value> + Send + Sync;

/// A user task function.
///
/// Output is written to the sinks on [`TaskContext`] rather than the process
/// streams so it can be captured per task, even when tasks run concurrently.
#[derive(Clone)]
pub struct TaskFunction(Arc<TaskFn>);

impl TaskFunction {
  pub fn new<F>(f: F) -> Self
  where
    F: Fn(&TaskArgs, &mut TaskContext) -> anyhow::Result<serde_json::Value> + Send + Sync + 'static,
  {
    Self(Arc::new(f))
  }

  pub fn call(&self, args: &TaskArgs, ctx: &mut TaskContext) -> anyhow::Result<serde_json::Value> {
    (self.0)(args, ctx)
  }
}

impl fmt::Debug for TaskFunction {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str("TaskFunction(..)")
  }
}

/// Resolved positional and keyword arguments of one task call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskArgs {
  pub args: Vec<serde_json::Value>,
  pub kwargs: serde_json::Map<String, serde_json::Value>,
}

impl TaskArgs {
  pub fn new(
    args: Vec<serde_json::Value>,
    kwargs: serde_json::Map<String, serde_json::Value>,
  ) -> Self {
    Self { args, kwargs }
  }

  pub fn arg(&self, index: usize) -> anyhow::Result<&serde_json::Value> {
    self
      .args
      .get(index)
      .ok_or_else(|| anyhow!("missing positional argument {}", index))
  }

  pub fn kwarg(&self, name: &str) -> anyhow::Result<&serde_json::Value> {
    self
      .kwargs
      .get(name)
      .ok_or_else(|| anyhow!("missing keyword argument '{}'", name))
  }

  /// Bind a parameter passed either by keyword or at `index`, and
  /// deserialize it.
  pub fn param<T: DeserializeOwned>(&self, index: usize, name: &str) -> anyhow::Result<T> {
    let value = match self.kwargs.get(name) {
      Some(value) => value,
      None => self
        .args
        .get(index)
        .ok_or_else(|| anyhow!("missing argument '{}'", name))?,
    };
    serde_json::from_value(value.clone()).with_context(|| format!("invalid argument '{}'", name))
  }
}

/// Execution context handed to a task function.
#[derive(Debug)]
pub struct TaskContext {
  workdir: PathBuf,
  stdout: Vec<u8>,
  stderr: Vec<u8>,
}

impl TaskContext {
  pub fn new(workdir: impl Into<PathBuf>) -> Self {
    Self {
      workdir: workdir.into(),
      stdout: Vec::new(),
      stderr: Vec::new(),
    }
  }

  /// Directory the task should treat as its working directory.
  pub fn workdir(&self) -> &Path {
    &self.workdir
  }

  pub fn stdout(&mut self) -> impl Write + '_ {
    &mut self.stdout
  }

  pub fn stderr(&mut self) -> impl Write + '_ {
    &mut self.stderr
  }

  /// Consume the context, returning captured `(stdout, stderr)`.
  pub fn into_streams(self) -> (String, String) {
    (
      String::from_utf8_lossy(&self.stdout).into_owned(),
      String::from_utf8_lossy(&self.stderr).into_owned(),
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_param_prefers_keyword() {
    let mut kwargs = serde_json::Map::new();
    kwargs.insert("x".to_string(), json!(3));
    let args = TaskArgs::new(vec![json!(1)], kwargs);

    assert_eq!(args.param::<i64>(0, "x").unwrap(), 3);
    assert_eq!(args.param::<i64>(0, "y").unwrap(), 1);
    assert!(args.param::<i64>(1, "z").is_err());
    assert!(args.param::<String>(0, "x").is_err());
  }

  #[test]
  fn test_context_captures_streams() {
    let mut ctx = TaskContext::new("/tmp");
    write!(ctx.stdout(), "out").unwrap();
    writeln!(ctx.stderr(), "err").unwrap();

    assert_eq!(ctx.into_streams(), ("out".to_string(), "err\n".to_string()));
  }

  #[test]
  fn test_function_call() {
    let double = TaskFunction::new(|args, _ctx| Ok(json!(args.param::<i64>(0, "x")? * 2)));
    let mut ctx = TaskContext::new("/tmp");

    let out = double.call(&TaskArgs::new(vec![json!(21)], Default::default()), &mut ctx);
    assert_eq!(out.unwrap(), json!(42));
  }
}
