//! Per-executor defaults.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::settings::{Settings, resolve};

const DEFAULT_LOG_STDOUT: &str = "stdout.log";
const DEFAULT_LOG_STDERR: &str = "stderr.log";

/// `$XDG_CACHE_HOME/latticework`, or the platform cache directory.
pub fn default_cache_dir() -> PathBuf {
  std::env::var_os("XDG_CACHE_HOME")
    .map(PathBuf::from)
    .or_else(dirs::cache_dir)
    .unwrap_or_else(|| PathBuf::from(".cache"))
    .join("latticework")
}

/// `<cache dir>/workdir`.
pub fn default_workdir() -> PathBuf {
  default_cache_dir().join("workdir")
}

/// Values passed explicitly when constructing an executor.
///
/// Any field left as `None` is looked up in the persisted settings under
/// `executors.<name>.<field>`, then falls back to the hardcoded default.
#[derive(Debug, Clone, Default)]
pub struct ExecutorOverrides {
  pub workdir: Option<PathBuf>,
  pub create_unique_workdir: Option<bool>,
  pub cache_dir: Option<PathBuf>,
  pub log_stdout: Option<String>,
  pub log_stderr: Option<String>,
}

/// Resolved executor configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorConfig {
  /// Directory tasks run in.
  pub workdir: PathBuf,
  /// Give every task its own `<workdir>/<dispatch_id>/node_<node_id>` directory.
  pub create_unique_workdir: bool,
  /// Root for per-dispatch log files.
  pub cache_dir: PathBuf,
  /// File name captured task stdout is appended to.
  pub log_stdout: String,
  /// File name captured task stderr is appended to.
  pub log_stderr: String,
}

impl ExecutorConfig {
  /// Resolve the configuration for the executor registered as `executor`.
  pub fn resolve(
    executor: &str,
    overrides: ExecutorOverrides,
    settings: &Settings,
  ) -> Result<Self, ConfigError> {
    let key = |field: &str| format!("executors.{}.{}", executor, field);

    Ok(Self {
      workdir: resolve(overrides.workdir, settings, &key("workdir"), default_workdir)?,
      create_unique_workdir: resolve(
        overrides.create_unique_workdir,
        settings,
        &key("create_unique_workdir"),
        || false,
      )?,
      cache_dir: resolve(
        overrides.cache_dir,
        settings,
        &key("cache_dir"),
        default_cache_dir,
      )?,
      log_stdout: resolve(overrides.log_stdout, settings, &key("log_stdout"), || {
        DEFAULT_LOG_STDOUT.to_string()
      })?,
      log_stderr: resolve(overrides.log_stderr, settings, &key("log_stderr"), || {
        DEFAULT_LOG_STDERR.to_string()
      })?,
    })
  }
}
