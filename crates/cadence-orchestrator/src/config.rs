use cadence_git::LockOptions;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

// --- Retry ---

/// Retry policy for transient failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay in seconds, indexed by retry attempt.
    #[serde(default = "default_backoff_sequence")]
    pub backoff_sequence: Vec<u64>,
    /// Upper bound in seconds for any delay.
    #[serde(default = "default_backoff_cap")]
    pub backoff_cap: u64,
}

fn default_max_retries() -> u32 {
    10
}

fn default_backoff_sequence() -> Vec<u64> {
    vec![10, 30, 60, 120, 240, 480, 600]
}

fn default_backoff_cap() -> u64 {
    600
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_sequence: default_backoff_sequence(),
            backoff_cap: default_backoff_cap(),
        }
    }
}

// --- Git ---

/// Branch names and develop-lock tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitConfig {
    #[serde(default = "default_main_branch")]
    pub main_branch: String,
    #[serde(default = "default_develop_branch")]
    pub develop_branch: String,
    #[serde(default = "default_lock_stale_ms")]
    pub lock_stale_ms: u64,
    #[serde(default = "default_lock_retries")]
    pub lock_retries: u32,
    #[serde(default = "default_lock_retry_interval_ms")]
    pub lock_retry_interval_ms: u64,
}

fn default_main_branch() -> String {
    "main".to_string()
}

fn default_develop_branch() -> String {
    "develop".to_string()
}

fn default_lock_stale_ms() -> u64 {
    60_000
}

fn default_lock_retries() -> u32 {
    3
}

fn default_lock_retry_interval_ms() -> u64 {
    500
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            main_branch: default_main_branch(),
            develop_branch: default_develop_branch(),
            lock_stale_ms: default_lock_stale_ms(),
            lock_retries: default_lock_retries(),
            lock_retry_interval_ms: default_lock_retry_interval_ms(),
        }
    }
}

impl GitConfig {
    pub fn lock_options(&self) -> LockOptions {
        LockOptions {
            stale_ms: self.lock_stale_ms,
            retries: self.lock_retries,
            retry_interval: Duration::from_millis(self.lock_retry_interval_ms),
        }
    }
}

// --- Watcher ---

/// How the task watcher observes scratch directories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatcherConfig {
    /// Use the polling backend instead of native file-system events.
    #[serde(default)]
    pub use_polling: bool,
    #[serde(default = "default_watch_poll_ms")]
    pub poll_interval_ms: u64,
}

fn default_watch_poll_ms() -> u64 {
    1000
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            use_polling: false,
            poll_interval_ms: default_watch_poll_ms(),
        }
    }
}

// --- Estimation ---

/// Inputs to the `max_jobs = "auto"` resource estimate. Sizes in GiB.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimationConfig {
    #[serde(default = "default_base_gb")]
    pub base_gb: f64,
    #[serde(default = "default_gb_per_agent")]
    pub gb_per_agent: f64,
    #[serde(default = "default_gb_per_job_overhead")]
    pub gb_per_job_overhead: f64,
    #[serde(default = "default_mem_per_job_gb")]
    pub mem_per_job_gb: f64,
    #[serde(default = "default_min_cpu_per_job")]
    pub min_cpu_per_job: f64,
}

fn default_base_gb() -> f64 {
    2.0
}

fn default_gb_per_agent() -> f64 {
    0.8
}

fn default_gb_per_job_overhead() -> f64 {
    1.0
}

fn default_mem_per_job_gb() -> f64 {
    6.0
}

fn default_min_cpu_per_job() -> f64 {
    4.0
}

impl Default for EstimationConfig {
    fn default() -> Self {
        Self {
            base_gb: default_base_gb(),
            gb_per_agent: default_gb_per_agent(),
            gb_per_job_overhead: default_gb_per_job_overhead(),
            mem_per_job_gb: default_mem_per_job_gb(),
            min_cpu_per_job: default_min_cpu_per_job(),
        }
    }
}

// --- Worker ---

/// External worker process settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Program followed by its arguments. The task brief arrives on stdin.
    #[serde(default = "default_worker_command")]
    pub command: Vec<String>,
    #[serde(default = "default_worker_timeout")]
    pub timeout_seconds: u64,
}

fn default_worker_command() -> Vec<String> {
    ["claude", "-p", "--output-format", "json"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_worker_timeout() -> u64 {
    600
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            command: default_worker_command(),
            timeout_seconds: default_worker_timeout(),
        }
    }
}

// --- Orchestrator ---

/// Everything the control loop needs.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Concurrently active jobs allowed by the scheduler.
    pub max_jobs: usize,
    /// Workers per phase for jobs that do not specify one.
    pub default_parallelism: u32,
    pub poll_interval: Duration,
    /// Auditor FAIL verdicts tolerated on one phase before the job fails.
    pub max_gate_failures: u32,
    /// Plan a researcher task ahead of the spec workers.
    pub researcher: bool,
    /// Plan an auditor task after every phase's workers.
    pub auditor: bool,
    /// Scratch root; each job writes to `{tmp_dir}/{job_id}/`.
    pub tmp_dir: PathBuf,
    pub retry: RetryConfig,
    pub git: GitConfig,
    pub watcher: WatcherConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_jobs: 4,
            default_parallelism: cadence_core::job::DEFAULT_PARALLELISM,
            poll_interval: Duration::from_millis(2000),
            max_gate_failures: 2,
            researcher: false,
            auditor: false,
            tmp_dir: std::env::temp_dir().join("cadence"),
            retry: RetryConfig::default(),
            git: GitConfig::default(),
            watcher: WatcherConfig::default(),
        }
    }
}
