//! Controller and per-session launch configuration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use kalix_protocol::DEFAULT_RESULT_FORMAT;
use serde::Deserialize;

pub const DEFAULT_ENGINE_ARGS: &[&str] = &["new-session"];
pub const DEFAULT_STARTUP_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_TERMINATION_GRACE_MS: u64 = 5_000;

fn default_engine_args() -> Vec<String> {
    DEFAULT_ENGINE_ARGS
        .iter()
        .map(|arg| (*arg).to_string())
        .collect()
}

fn default_startup_timeout_ms() -> u64 {
    DEFAULT_STARTUP_TIMEOUT_MS
}

fn default_termination_grace_ms() -> u64 {
    DEFAULT_TERMINATION_GRACE_MS
}

fn default_result_format() -> String {
    DEFAULT_RESULT_FORMAT.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ControllerConfig {
    /// Explicit engine executable. When set, PATH is not searched.
    #[serde(default)]
    pub engine_path: Option<PathBuf>,
    #[serde(default = "default_engine_args")]
    pub engine_args: Vec<String>,
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,
    #[serde(default = "default_termination_grace_ms")]
    pub termination_grace_ms: u64,
    #[serde(default = "default_result_format")]
    pub result_format: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            engine_path: None,
            engine_args: default_engine_args(),
            startup_timeout_ms: DEFAULT_STARTUP_TIMEOUT_MS,
            termination_grace_ms: DEFAULT_TERMINATION_GRACE_MS,
            result_format: default_result_format(),
        }
    }
}

impl ControllerConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms.max(1))
    }

    pub fn termination_grace(&self) -> Duration {
        Duration::from_millis(self.termination_grace_ms)
    }
}

pub fn parse_controller_config(raw: &str) -> Result<ControllerConfig> {
    toml::from_str::<ControllerConfig>(raw).context("failed to parse controller config")
}

pub fn load_controller_config(path: &Path) -> Result<ControllerConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read controller config {}", path.display()))?;
    parse_controller_config(&raw)
        .with_context(|| format!("invalid controller config {}", path.display()))
}

/// Per-launch overrides layered over [`ControllerConfig`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionConfig {
    pub engine_path: Option<PathBuf>,
    pub args: Option<Vec<String>>,
    pub working_directory: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

impl SessionConfig {
    /// Runs the engine next to `model_file` so relative input paths resolve.
    pub fn for_model_file(model_file: &Path) -> Self {
        Self {
            working_directory: model_file
                .parent()
                .filter(|parent| !parent.as_os_str().is_empty())
                .map(Path::to_path_buf),
            ..Self::default()
        }
    }

    pub fn with_engine_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.engine_path = Some(path.into());
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = Some(args.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }
}
