//! The persisted settings document.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::ConfigError;

/// Environment variable that overrides the settings file location.
pub const CONFIG_ENV_VAR: &str = "LATTICEWORK_CONFIG";

/// Persisted settings, stored as a JSON document.
///
/// ```json
/// {
///   "executors": {
///     "local": { "workdir": "/scratch/latticework" },
///     "cluster": {
///       "create_unique_workdir": true,
///       "scheduler_address": "loopback://scheduler"
///     }
///   }
/// }
/// ```
#[derive(Debug, Clone, Default)]
pub struct Settings {
  root: serde_json::Value,
  path: Option<PathBuf>,
}

impl Settings {
  /// Settings with no persisted values. Every lookup falls through to defaults.
  pub fn empty() -> Self {
    Self::default()
  }

  /// Wrap an in-memory settings document.
  pub fn from_value(root: serde_json::Value) -> Self {
    Self { root, path: None }
  }

  /// Load settings from a file. A missing file yields empty settings.
  pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
    let path = path.as_ref();
    if !path.exists() {
      debug!(path = %path.display(), "config file not found, using defaults");
      return Ok(Self {
        root: serde_json::Value::Null,
        path: Some(path.to_path_buf()),
      });
    }

    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    let root = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
      path: path.to_path_buf(),
      source,
    })?;

    Ok(Self {
      root,
      path: Some(path.to_path_buf()),
    })
  }

  /// Load settings from `$LATTICEWORK_CONFIG`, falling back to
  /// `<config_dir>/latticework/config.json`.
  pub fn load_default() -> Result<Self, ConfigError> {
    match Self::default_path() {
      Some(path) => Self::load(path),
      None => Ok(Self::empty()),
    }
  }

  /// The settings file location used by [`Settings::load_default`].
  pub fn default_path() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os(CONFIG_ENV_VAR) {
      return Some(PathBuf::from(path));
    }
    dirs::config_dir().map(|dir| dir.join("latticework").join("config.json"))
  }

  /// Path the settings were loaded from, if any.
  pub fn path(&self) -> Option<&Path> {
    self.path.as_deref()
  }

  /// Look up a raw value by dotted key.
  pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
    let mut current = &self.root;
    for segment in key.split('.') {
      current = current.as_object()?.get(segment)?;
    }
    if current.is_null() { None } else { Some(current) }
  }

  /// Look up a value by dotted key and deserialize it.
  pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ConfigError> {
    match self.get(key) {
      Some(value) => serde_json::from_value(value.clone())
        .map(Some)
        .map_err(|source| ConfigError::InvalidValue {
          key: key.to_string(),
          source,
        }),
      None => Ok(None),
    }
  }
}

/// Resolve a setting: explicit value, then persisted settings, then default.
pub fn resolve<T: DeserializeOwned + std::fmt::Debug>(
  explicit: Option<T>,
  settings: &Settings,
  key: &str,
  default: impl FnOnce() -> T,
) -> Result<T, ConfigError> {
  if let Some(value) = explicit {
    return Ok(value);
  }
  if let Some(value) = settings.get_as(key)? {
    return Ok(value);
  }
  let value = default();
  debug!(key, value = ?value, "couldn't find key in config, using default value");
  Ok(value)
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn sample() -> Settings {
    Settings::from_value(json!({
      "executors": {
        "cluster": {
          "workdir": "/srv/work",
          "create_unique_workdir": true
        }
      },
      "cluster": { "scheduler_address": "loopback://main" }
    }))
  }

  #[test]
  fn test_get_dotted_key() {
    let settings = sample();
    assert_eq!(
      settings.get("cluster.scheduler_address"),
      Some(&json!("loopback://main"))
    );
    assert_eq!(settings.get("executors.cluster.missing"), None);
    assert_eq!(settings.get("executors.cluster.workdir.deeper"), None);
  }

  #[test]
  fn test_resolve_prefers_explicit() {
    let settings = sample();
    let value = resolve(
      Some("/explicit".to_string()),
      &settings,
      "executors.cluster.workdir",
      || "/default".to_string(),
    )
    .unwrap();
    assert_eq!(value, "/explicit");
  }

  #[test]
  fn test_resolve_falls_back_to_settings_then_default() {
    let settings = sample();
    let from_settings: bool = resolve(
      None,
      &settings,
      "executors.cluster.create_unique_workdir",
      || false,
    )
    .unwrap();
    assert!(from_settings);

    let from_default: bool = resolve(
      None,
      &settings,
      "executors.local.create_unique_workdir",
      || false,
    )
    .unwrap();
    assert!(!from_default);
  }

  #[test]
  fn test_resolve_rejects_wrong_type() {
    let settings = sample();
    let result: Result<u32, _> = resolve(None, &settings, "cluster.scheduler_address", || 0);
    assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
  }

  #[test]
  fn test_load_missing_file_is_empty() {
    let dir = tempfile::tempdir().unwrap();
    let settings = Settings::load(dir.path().join("config.json")).unwrap();
    assert_eq!(settings.get("cluster.scheduler_address"), None);
  }

  #[test]
  fn test_load_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(&path, r#"{ "cluster": { "scheduler_address": "loopback://disk" } }"#).unwrap();

    let settings = Settings::load(&path).unwrap();
    assert_eq!(settings.path(), Some(path.as_path()));
    assert_eq!(
      settings.get_as::<String>("cluster.scheduler_address").unwrap(),
      Some("loopback://disk".to_string())
    );
  }

  #[test]
  fn test_load_invalid_json() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(&path, "{ not json").unwrap();

    assert!(matches!(Settings::load(&path), Err(ConfigError::Parse { .. })));
  }
}
