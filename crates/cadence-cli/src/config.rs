//! `cadence.toml` loading.
//!
//! Every section and every key is optional. Missing values fall back to the
//! library defaults, so an empty file is a valid configuration.

use cadence_core::{CadenceError, CadenceResult};
use cadence_orchestrator::{
    EstimationConfig, GitConfig, MaxJobs, OrchestratorConfig, RetryConfig, WatcherConfig,
    WorkerConfig,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CadenceConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    #[serde(default)]
    pub estimation: EstimationConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub git: GitConfig,
    #[serde(default)]
    pub watcher: WatcherConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// The `[orchestrator]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorSection {
    /// A positive integer, or `"auto"` to size from free memory and CPUs.
    #[serde(default)]
    pub max_jobs: MaxJobs,
    #[serde(default = "default_max_jobs_hard_limit")]
    pub max_jobs_hard_limit: usize,
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default = "default_tmp_dir")]
    pub tmp_dir: PathBuf,
    #[serde(default = "default_parallelism")]
    pub default_parallelism: u32,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_gate_failures")]
    pub max_gate_failures: u32,
    #[serde(default)]
    pub researcher: bool,
    #[serde(default)]
    pub auditor: bool,
}

fn default_max_jobs_hard_limit() -> usize {
    4
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".cadence/state")
}

fn default_tmp_dir() -> PathBuf {
    PathBuf::from("/tmp/cadence")
}

fn default_parallelism() -> u32 {
    cadence_core::job::DEFAULT_PARALLELISM
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_max_gate_failures() -> u32 {
    2
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_jobs: MaxJobs::default(),
            max_jobs_hard_limit: default_max_jobs_hard_limit(),
            state_dir: default_state_dir(),
            tmp_dir: default_tmp_dir(),
            default_parallelism: default_parallelism(),
            poll_interval_ms: default_poll_interval_ms(),
            max_gate_failures: default_max_gate_failures(),
            researcher: false,
            auditor: false,
        }
    }
}

/// The `[logging]` table. `RUST_LOG` wins over `level` when set.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl CadenceConfig {
    /// Concrete job capacity. `"auto"` samples the host.
    pub fn resolve_max_jobs(&self) -> usize {
        self.orchestrator.max_jobs.resolve(
            &self.estimation,
            self.orchestrator.default_parallelism,
            self.orchestrator.max_jobs_hard_limit,
        )
    }

    /// Library configuration for a control loop admitting `max_jobs` jobs.
    pub fn orchestrator_config(&self, max_jobs: usize) -> OrchestratorConfig {
        let section = &self.orchestrator;
        OrchestratorConfig {
            max_jobs,
            default_parallelism: section.default_parallelism,
            poll_interval: Duration::from_millis(section.poll_interval_ms),
            max_gate_failures: section.max_gate_failures,
            researcher: section.researcher,
            auditor: section.auditor,
            tmp_dir: section.tmp_dir.clone(),
            retry: self.retry.clone(),
            git: self.git.clone(),
            watcher: self.watcher.clone(),
        }
    }
}

/// Read and parse a TOML config file.
pub fn parse_config(path: &Path) -> CadenceResult<CadenceConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        CadenceError::Config(format!(
            "Failed to read config '{}': {}",
            path.display(),
            e
        ))
    })?;
    toml::from_str(&content).map_err(|e| {
        CadenceError::Config(format!(
            "Failed to parse config '{}': {}",
            path.display(),
            e
        ))
    })
}
