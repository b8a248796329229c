use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use serde::Deserialize;

use crate::engine::executor::StepExecutor;
use crate::engine::{PoolConfig, WorkPools, WorkflowManager};
use crate::storage::Journal;

pub const DEFAULT_CONFIG_FILE: &str = "detailflow.yaml";
pub const DEFAULT_STORE_DIR: &str = "data/runs";

pub const ENV_HIGH_PARALLELISM: &str = "DETAILFLOW_HIGH_PARALLELISM";
pub const ENV_DEFAULT_PARALLELISM: &str = "DETAILFLOW_DEFAULT_PARALLELISM";
pub const ENV_LOW_PARALLELISM: &str = "DETAILFLOW_LOW_PARALLELISM";

/// Configuration loaded from `detailflow.yaml`.
/// All fields are optional; missing fields fall back to CLI/env/defaults.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct DetailflowConfig {
    pub store_dir: Option<String>,
    pub high_parallelism: Option<usize>,
    pub default_parallelism: Option<usize>,
    pub low_parallelism: Option<usize>,
    /// Timeout applied to steps that do not declare their own.
    pub step_timeout_s: Option<u64>,
}

impl DetailflowConfig {
    /// Load configuration from a YAML file.
    ///
    /// - If `path` is `Some`, load that specific file (error if missing).
    /// - If `path` is `None`, auto-detect `detailflow.yaml` in cwd; return defaults if absent.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file_path = match path {
            Some(p) => {
                if !p.exists() {
                    anyhow::bail!("Config file not found: {}", p.display());
                }
                p.to_path_buf()
            }
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if !default_path.exists() {
                    return Ok(Self::default());
                }
                default_path.to_path_buf()
            }
        };

        let contents = std::fs::read_to_string(&file_path)
            .with_context(|| format!("Failed to read config file: {}", file_path.display()))?;

        let config: DetailflowConfig = serde_yml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", file_path.display()))?;

        Ok(config)
    }

    /// Journal directory: CLI flag, then config file, then the default.
    pub fn store_dir(&self, cli_override: Option<&Path>) -> PathBuf {
        match cli_override {
            Some(dir) => dir.to_path_buf(),
            None => PathBuf::from(self.store_dir.as_deref().unwrap_or(DEFAULT_STORE_DIR)),
        }
    }

    pub fn step_timeout(&self) -> Option<Duration> {
        self.step_timeout_s.map(Duration::from_secs)
    }

    /// Pool limits from this file with process environment overrides applied.
    pub fn pool_config(&self) -> Result<PoolConfig> {
        PoolConfig::from_config(self, |key| std::env::var(key).ok())
    }

    /// Build a manager over `journal` with this configuration's pools and
    /// default step timeout.
    pub fn manager(&self, journal: Arc<dyn Journal>) -> Result<WorkflowManager> {
        let pools = Arc::new(WorkPools::new(self.pool_config()?));
        let executor = match self.step_timeout() {
            Some(timeout) => StepExecutor::with_default_timeout(timeout),
            None => StepExecutor::new(),
        };
        Ok(WorkflowManager::with_executor(journal, pools, executor))
    }
}

impl PoolConfig {
    /// Resolve pool limits: environment beats the config file, which beats
    /// the built-in defaults. Zero is raised to 1.
    pub fn from_config<F>(config: &DetailflowConfig, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = PoolConfig::default();

        let resolve = |key: &str, file: Option<usize>, fallback: usize| -> Result<usize> {
            let value = match env(key) {
                Some(raw) => raw
                    .trim()
                    .parse::<usize>()
                    .with_context(|| format!("Invalid value for {}: {}", key, raw))?,
                None => file.unwrap_or(fallback),
            };
            Ok(value.max(1))
        };

        Ok(PoolConfig {
            high: resolve(ENV_HIGH_PARALLELISM, config.high_parallelism, defaults.high)?,
            default: resolve(
                ENV_DEFAULT_PARALLELISM,
                config.default_parallelism,
                defaults.default,
            )?,
            low: resolve(ENV_LOW_PARALLELISM, config.low_parallelism, defaults.low)?,
        })
    }
}
