//! Latticework Config
//!
//! This crate owns the settings consumed by executors. Values are resolved
//! with a three-tier fallback:
//!
//! 1. an explicit value passed by the caller,
//! 2. the persisted settings document (`config.json`),
//! 3. a hardcoded default.
//!
//! Settings are addressed with dotted keys such as
//! `executors.cluster.workdir`.

mod error;
mod executor;
mod settings;

pub use error::ConfigError;
pub use executor::{ExecutorConfig, ExecutorOverrides, default_cache_dir, default_workdir};
pub use settings::{CONFIG_ENV_VAR, Settings, resolve};
