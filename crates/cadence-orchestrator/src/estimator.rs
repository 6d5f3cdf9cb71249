use crate::config::EstimationConfig;
use serde::{Deserialize, Serialize};
use sysinfo::System;
use tracing::info;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Free memory and CPU count of the host.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SystemResources {
    pub free_memory_gb: f64,
    pub cpu_count: usize,
}

impl SystemResources {
    /// Sample the current host.
    pub fn detect() -> Self {
        let mut system = System::new_all();
        system.refresh_memory();
        Self {
            free_memory_gb: system.available_memory() as f64 / BYTES_PER_GB,
            cpu_count: system.cpus().len().max(1),
        }
    }
}

/// How many jobs fit on a host with `resources`.
///
/// One job runs `1 + parallelism` agents. After reserving memory for the
/// engine and one job's agents, the remaining memory and the CPU count each
/// bound the job count; the smaller bound wins, capped at `hard_limit` and
/// never below one.
pub fn estimate_max_jobs(
    resources: &SystemResources,
    config: &EstimationConfig,
    parallelism: u32,
    hard_limit: usize,
) -> usize {
    let agents_per_job = 1.0 + f64::from(parallelism);
    let reservation =
        config.base_gb + agents_per_job * config.gb_per_agent + config.gb_per_job_overhead;
    let effective = (resources.free_memory_gb - reservation).max(0.0);

    let by_memory = if config.mem_per_job_gb > 0.0 {
        (effective / config.mem_per_job_gb).floor() as usize
    } else {
        hard_limit
    };
    let by_cpu = if config.min_cpu_per_job > 0.0 {
        (resources.cpu_count as f64 / config.min_cpu_per_job).floor() as usize
    } else {
        hard_limit
    };

    by_memory.min(by_cpu).min(hard_limit).max(1)
}

/// `max_jobs` as written in configuration: a number or `"auto"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MaxJobs {
    Fixed(usize),
    Named(String),
}

impl Default for MaxJobs {
    fn default() -> Self {
        MaxJobs::Named("auto".into())
    }
}

impl MaxJobs {
    /// Resolve to a concrete limit. Anything other than a positive number
    /// is estimated from the host.
    pub fn resolve(&self, config: &EstimationConfig, parallelism: u32, hard_limit: usize) -> usize {
        match self {
            MaxJobs::Fixed(n) if *n > 0 => *n,
            _ => {
                let resources = SystemResources::detect();
                let max_jobs = estimate_max_jobs(&resources, config, parallelism, hard_limit);
                info!(
                    free_memory_gb = format!("{:.1}", resources.free_memory_gb),
                    cpus = resources.cpu_count,
                    max_jobs,
                    "Estimated job capacity"
                );
                max_jobs
            }
        }
    }
}
