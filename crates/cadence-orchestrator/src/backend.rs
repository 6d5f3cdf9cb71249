use crate::config::WorkerConfig;
use async_trait::async_trait;
use cadence_core::{CadenceError, CadenceResult, Job, Phase, Task, WorkerRole};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::task::AbortHandle;
use tracing::{info, warn};

/// Runs tasks out of process.
///
/// A launched task must eventually leave `{tmp}/{job_id}/{task_id}.json`
/// followed by a `{task_id}.done` or `{task_id}.error` sentinel in the same
/// directory; the task watcher picks them up from there.
#[async_trait]
pub trait WorkerBackend: Send + Sync {
    /// Start `task`. Returns once the worker is running, not when it finishes.
    async fn launch_task(&self, job: &Job, task: &Task) -> CadenceResult<()>;

    /// Tear down whatever is still running for `job_id`.
    async fn cleanup(&self, job_id: &str) -> CadenceResult<()>;
}

/// Scratch directory of one job.
pub fn job_dir(tmp_dir: &Path, job_id: &str) -> PathBuf {
    tmp_dir.join(job_id)
}

/// What a worker receives on stdin.
#[derive(Debug, Clone, Serialize)]
pub struct TaskBrief<'a> {
    pub job_id: &'a str,
    pub task_id: &'a str,
    pub role: WorkerRole,
    pub phase: Phase,
    pub repo_root: &'a Path,
    pub objective: &'a str,
    pub inputs: &'a [String],
    pub constraints: &'a [String],
    pub acceptance_criteria: &'a [String],
}

impl<'a> TaskBrief<'a> {
    pub fn new(job: &'a Job, task: &'a Task) -> Self {
        Self {
            job_id: &task.job_id,
            task_id: &task.task_id,
            role: task.assignee,
            phase: task.phase,
            repo_root: &job.repo_root,
            objective: &task.objective,
            inputs: &task.inputs,
            constraints: &task.constraints,
            acceptance_criteria: &task.acceptance_criteria,
        }
    }
}

/// Spawns the configured command once per task.
///
/// The brief is written to the child's stdin as JSON and its stdout is
/// redirected into the task's output file. A child that exceeds the timeout
/// is killed and reported through an `.error` sentinel.
pub struct CommandBackend {
    config: WorkerConfig,
    tmp_dir: PathBuf,
    running: Mutex<HashMap<String, Vec<AbortHandle>>>,
}

impl CommandBackend {
    pub fn new(config: WorkerConfig, tmp_dir: impl Into<PathBuf>) -> Self {
        Self {
            config,
            tmp_dir: tmp_dir.into(),
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Children still tracked for `job_id`.
    pub fn running_count(&self, job_id: &str) -> usize {
        self.running
            .lock()
            .get(job_id)
            .map(|handles| handles.iter().filter(|h| !h.is_finished()).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl WorkerBackend for CommandBackend {
    async fn launch_task(&self, job: &Job, task: &Task) -> CadenceResult<()> {
        let Some((program, args)) = self.config.command.split_first() else {
            return Err(CadenceError::Config("worker command is empty".into()));
        };

        let dir = job_dir(&self.tmp_dir, &task.job_id);
        tokio::fs::create_dir_all(&dir).await?;
        let output_path = dir.join(format!("{}.json", task.task_id));
        let stdout = std::fs::File::create(&output_path)?;
        let brief = serde_json::to_vec(&TaskBrief::new(job, task))?;

        let mut child = Command::new(program)
            .args(args)
            .current_dir(&job.repo_root)
            .stdin(Stdio::piped())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                CadenceError::Orchestrator(format!("Failed to launch worker '{program}': {e}"))
            })?;
        info!(
            job_id = %task.job_id,
            task_id = %task.task_id,
            role = %task.assignee,
            pid = child.id().unwrap_or_default(),
            "Worker launched"
        );

        let stdin = child.stdin.take();
        let timeout = Duration::from_secs(self.config.timeout_seconds);
        let task_id = task.task_id.clone();
        let handle = tokio::spawn(async move {
            if let Some(mut stdin) = stdin {
                if let Err(e) = stdin.write_all(&brief).await {
                    warn!(task_id = %task_id, error = %e, "Failed to write task brief");
                }
            }

            let outcome = match tokio::time::timeout(timeout, child.wait_with_output()).await {
                Ok(Ok(output)) if output.status.success() => Ok(()),
                Ok(Ok(output)) => {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    let tail = tail_chars(stderr.trim(), 2000);
                    Err(if tail.is_empty() {
                        format!("Worker exited with {}", output.status)
                    } else {
                        tail
                    })
                }
                Ok(Err(e)) => Err(format!("Worker process error: {e}")),
                Err(_) => Err(format!("Worker timeout after {}s", timeout.as_secs())),
            };

            let written = match &outcome {
                Ok(()) => write_sentinel(&dir, &task_id, "done", "").await,
                Err(message) => write_sentinel(&dir, &task_id, "error", message).await,
            };
            if let Err(e) = written {
                warn!(task_id = %task_id, error = %e, "Failed to write sentinel");
            }
        });

        let mut running = self.running.lock();
        let handles = running.entry(task.job_id.clone()).or_default();
        handles.retain(|h| !h.is_finished());
        handles.push(handle.abort_handle());
        Ok(())
    }

    async fn cleanup(&self, job_id: &str) -> CadenceResult<()> {
        let handles = self.running.lock().remove(job_id).unwrap_or_default();
        let aborted = handles.iter().filter(|h| !h.is_finished()).count();
        for handle in handles {
            handle.abort();
        }
        if aborted > 0 {
            info!(job_id = %job_id, aborted, "Stopped remaining workers");
        }
        Ok(())
    }
}

/// Write `{task_id}.{kind}` via a hidden temp file so the watcher never sees
/// a partially written sentinel.
async fn write_sentinel(dir: &Path, task_id: &str, kind: &str, contents: &str) -> std::io::Result<()> {
    let tmp = dir.join(format!(".{task_id}.{kind}.tmp"));
    tokio::fs::write(&tmp, contents).await?;
    tokio::fs::rename(&tmp, dir.join(format!("{task_id}.{kind}"))).await
}

fn tail_chars(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    text.chars().skip(count.saturating_sub(max_chars)).collect()
}
