use crate::store::{JobFilter, StateStore, StoreResult};
use async_trait::async_trait;
use cadence_core::{Job, Report, StoreError, Task, TraceEntry};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

/// File-based state store.
///
/// ```text
/// {root}/jobs/{job_id}/job.json
/// {root}/jobs/{job_id}/tasks/{task_id}.json
/// {root}/jobs/{job_id}/reports/{task_id}.json
/// {root}/jobs/{job_id}/trace.jsonl
/// ```
///
/// Record writes go to a sibling temp file that is renamed over the target,
/// so readers never observe a half-written record.
pub struct FileStateStore {
    root: PathBuf,
    trace_lock: Mutex<()>,
}

impl FileStateStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub async fn new(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let store = Self {
            root: root.into(),
            trace_lock: Mutex::new(()),
        };
        store.initialize().await?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn jobs_dir(&self) -> PathBuf {
        self.root.join("jobs")
    }

    fn job_dir(&self, job_id: &str) -> StoreResult<PathBuf> {
        Ok(self.jobs_dir().join(checked_key(job_id)?))
    }

    fn job_path(&self, job_id: &str) -> StoreResult<PathBuf> {
        Ok(self.job_dir(job_id)?.join("job.json"))
    }

    fn task_path(&self, job_id: &str, task_id: &str) -> StoreResult<PathBuf> {
        Ok(self
            .job_dir(job_id)?
            .join("tasks")
            .join(format!("{}.json", checked_key(task_id)?)))
    }

    fn report_path(&self, job_id: &str, task_id: &str) -> StoreResult<PathBuf> {
        Ok(self
            .job_dir(job_id)?
            .join("reports")
            .join(format!("{}.json", checked_key(task_id)?)))
    }

    fn trace_path(&self, job_id: &str) -> StoreResult<PathBuf> {
        Ok(self.job_dir(job_id)?.join("trace.jsonl"))
    }
}

/// Keys become path components, so only a conservative alphabet is allowed.
fn checked_key(key: &str) -> StoreResult<&str> {
    let valid = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(key)
    } else {
        Err(StoreError::NotFound(format!("invalid key {key:?}")))
    }
}

async fn exists(path: &Path) -> StoreResult<bool> {
    Ok(tokio::fs::try_exists(path).await?)
}

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

async fn write_atomic<T: Serialize>(path: &Path, value: &T) -> StoreResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_vec_pretty(value)?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| StoreError::Io(format!("bad record path {}", path.display())))?;
    // One temp file per write: concurrent writers to a record must not share it.
    let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
    let tmp = path.with_file_name(format!(".{file_name}.{}.{seq}.tmp", std::process::id()));
    let written = match tokio::fs::write(&tmp, json).await {
        Ok(()) => tokio::fs::rename(&tmp, path).await,
        Err(e) => Err(e),
    };
    if let Err(e) = written {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

async fn read_record<T: DeserializeOwned>(path: &Path, what: &str) -> StoreResult<T> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(StoreError::NotFound(what.to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

/// Read every `*.json` record in `dir`. A missing directory is empty.
async fn read_dir_records<T: DeserializeOwned>(dir: &Path) -> StoreResult<Vec<T>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut out = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_record = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(".json") && !n.starts_with('.'));
        if is_record {
            out.push(read_record(&path, &path.display().to_string()).await?);
        }
    }
    Ok(out)
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn initialize(&self) -> StoreResult<()> {
        tokio::fs::create_dir_all(self.jobs_dir()).await?;
        Ok(())
    }

    async fn create_job(&self, job: &Job) -> StoreResult<()> {
        let path = self.job_path(&job.job_id)?;
        if exists(&path).await? {
            return Err(StoreError::AlreadyExists(format!("job {}", job.job_id)));
        }
        write_atomic(&path, job).await
    }

    async fn get_job(&self, job_id: &str) -> StoreResult<Job> {
        read_record(&self.job_path(job_id)?, &format!("job {job_id}")).await
    }

    async fn update_job(&self, job: &Job) -> StoreResult<()> {
        let path = self.job_path(&job.job_id)?;
        if !exists(&path).await? {
            return Err(StoreError::NotFound(format!("job {}", job.job_id)));
        }
        write_atomic(&path, job).await
    }

    async fn list_jobs(&self, filter: &JobFilter) -> StoreResult<Vec<Job>> {
        let mut entries = match tokio::fs::read_dir(self.jobs_dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut jobs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path().join("job.json");
            match read_record::<Job>(&path, "job").await {
                Ok(job) => jobs.push(job),
                // A directory without job.json is a job whose create is in flight.
                Err(StoreError::NotFound(_)) => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable job record");
                }
            }
        }
        Ok(filter.apply(jobs))
    }

    async fn create_task(&self, task: &Task) -> StoreResult<()> {
        let path = self.task_path(&task.job_id, &task.task_id)?;
        if exists(&path).await? {
            return Err(StoreError::AlreadyExists(format!(
                "task {}/{}",
                task.job_id, task.task_id
            )));
        }
        write_atomic(&path, task).await
    }

    async fn get_task(&self, job_id: &str, task_id: &str) -> StoreResult<Task> {
        read_record(
            &self.task_path(job_id, task_id)?,
            &format!("task {job_id}/{task_id}"),
        )
        .await
    }

    async fn update_task(&self, task: &Task) -> StoreResult<()> {
        let path = self.task_path(&task.job_id, &task.task_id)?;
        if !exists(&path).await? {
            return Err(StoreError::NotFound(format!(
                "task {}/{}",
                task.job_id, task.task_id
            )));
        }
        write_atomic(&path, task).await
    }

    async fn list_tasks(&self, job_id: &str) -> StoreResult<Vec<Task>> {
        let mut tasks: Vec<Task> =
            read_dir_records(&self.job_dir(job_id)?.join("tasks")).await?;
        tasks.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.task_id.cmp(&b.task_id))
        });
        Ok(tasks)
    }

    async fn create_report(&self, report: &Report) -> StoreResult<()> {
        let path = self.report_path(&report.job_id, &report.task_id)?;
        if exists(&path).await? {
            return Err(StoreError::AlreadyExists(format!(
                "report {}/{}",
                report.job_id, report.task_id
            )));
        }
        write_atomic(&path, report).await
    }

    async fn get_report(&self, job_id: &str, task_id: &str) -> StoreResult<Report> {
        read_record(
            &self.report_path(job_id, task_id)?,
            &format!("report {job_id}/{task_id}"),
        )
        .await
    }

    async fn list_reports(&self, job_id: &str) -> StoreResult<Vec<Report>> {
        let mut reports: Vec<Report> =
            read_dir_records(&self.job_dir(job_id)?.join("reports")).await?;
        reports.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.task_id.cmp(&b.task_id))
        });
        Ok(reports)
    }

    async fn append_trace(&self, entry: &TraceEntry) -> StoreResult<()> {
        let path = self.trace_path(&entry.job_id)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let _guard = self.trace_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn traces(&self, job_id: &str) -> StoreResult<Vec<TraceEntry>> {
        let path = self.trace_path(job_id)?;
        let data = match tokio::fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let entries = data
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(serde_json::from_str)
            .collect::<Result<Vec<TraceEntry>, _>>()?;
        Ok(entries)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
