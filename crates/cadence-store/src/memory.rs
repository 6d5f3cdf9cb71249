use crate::store::{JobFilter, StateStore, StoreResult};
use async_trait::async_trait;
use cadence_core::{Job, Report, StoreError, Task, TraceEntry};
use parking_lot::RwLock;
use std::collections::HashMap;

type TaskKey = (String, String);

#[derive(Default)]
struct Tables {
    jobs: HashMap<String, Job>,
    tasks: HashMap<TaskKey, Task>,
    reports: HashMap<TaskKey, Report>,
    traces: HashMap<String, Vec<TraceEntry>>,
}

/// In-memory state store. Nothing survives the process.
#[derive(Default)]
pub struct MemoryStateStore {
    tables: RwLock<Tables>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn key(job_id: &str, task_id: &str) -> TaskKey {
    (job_id.to_string(), task_id.to_string())
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn initialize(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn create_job(&self, job: &Job) -> StoreResult<()> {
        let mut tables = self.tables.write();
        if tables.jobs.contains_key(&job.job_id) {
            return Err(StoreError::AlreadyExists(format!("job {}", job.job_id)));
        }
        tables.jobs.insert(job.job_id.clone(), job.clone());
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> StoreResult<Job> {
        self.tables
            .read()
            .jobs
            .get(job_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("job {job_id}")))
    }

    async fn update_job(&self, job: &Job) -> StoreResult<()> {
        let mut tables = self.tables.write();
        match tables.jobs.get_mut(&job.job_id) {
            Some(slot) => {
                *slot = job.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("job {}", job.job_id))),
        }
    }

    async fn list_jobs(&self, filter: &JobFilter) -> StoreResult<Vec<Job>> {
        let jobs = self.tables.read().jobs.values().cloned().collect();
        Ok(filter.apply(jobs))
    }

    async fn create_task(&self, task: &Task) -> StoreResult<()> {
        let mut tables = self.tables.write();
        let k = key(&task.job_id, &task.task_id);
        if tables.tasks.contains_key(&k) {
            return Err(StoreError::AlreadyExists(format!(
                "task {}/{}",
                task.job_id, task.task_id
            )));
        }
        tables.tasks.insert(k, task.clone());
        Ok(())
    }

    async fn get_task(&self, job_id: &str, task_id: &str) -> StoreResult<Task> {
        self.tables
            .read()
            .tasks
            .get(&key(job_id, task_id))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("task {job_id}/{task_id}")))
    }

    async fn update_task(&self, task: &Task) -> StoreResult<()> {
        let mut tables = self.tables.write();
        match tables.tasks.get_mut(&key(&task.job_id, &task.task_id)) {
            Some(slot) => {
                *slot = task.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!(
                "task {}/{}",
                task.job_id, task.task_id
            ))),
        }
    }

    async fn list_tasks(&self, job_id: &str) -> StoreResult<Vec<Task>> {
        let mut tasks: Vec<Task> = self
            .tables
            .read()
            .tasks
            .values()
            .filter(|t| t.job_id == job_id)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.task_id.cmp(&b.task_id))
        });
        Ok(tasks)
    }

    async fn create_report(&self, report: &Report) -> StoreResult<()> {
        let mut tables = self.tables.write();
        let k = key(&report.job_id, &report.task_id);
        if tables.reports.contains_key(&k) {
            return Err(StoreError::AlreadyExists(format!(
                "report {}/{}",
                report.job_id, report.task_id
            )));
        }
        tables.reports.insert(k, report.clone());
        Ok(())
    }

    async fn get_report(&self, job_id: &str, task_id: &str) -> StoreResult<Report> {
        self.tables
            .read()
            .reports
            .get(&key(job_id, task_id))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("report {job_id}/{task_id}")))
    }

    async fn list_reports(&self, job_id: &str) -> StoreResult<Vec<Report>> {
        let mut reports: Vec<Report> = self
            .tables
            .read()
            .reports
            .values()
            .filter(|r| r.job_id == job_id)
            .cloned()
            .collect();
        reports.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.task_id.cmp(&b.task_id))
        });
        Ok(reports)
    }

    async fn append_trace(&self, entry: &TraceEntry) -> StoreResult<()> {
        self.tables
            .write()
            .traces
            .entry(entry.job_id.clone())
            .or_default()
            .push(entry.clone());
        Ok(())
    }

    async fn traces(&self, job_id: &str) -> StoreResult<Vec<TraceEntry>> {
        Ok(self
            .tables
            .read()
            .traces
            .get(job_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use cadence_core::{JobInput, JobStatus};

    #[tokio::test]
    async fn test_returns_value_copies() {
        let store = MemoryStateStore::new();
        let job = Job::new(JobInput::new("p", "/tmp/r")).unwrap();
        store.create_job(&job).await.unwrap();

        let mut copy = store.get_job(&job.job_id).await.unwrap();
        copy.status = JobStatus::Failed;
        assert_eq!(
            store.get_job(&job.job_id).await.unwrap().status,
            JobStatus::Received
        );

        store.update_job(&copy).await.unwrap();
        assert_eq!(
            store.get_job(&job.job_id).await.unwrap().status,
            JobStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_duplicate_and_missing() {
        let store = MemoryStateStore::new();
        let job = Job::new(JobInput::new("p", "/tmp/r")).unwrap();
        store.create_job(&job).await.unwrap();
        assert!(matches!(
            store.create_job(&job).await,
            Err(StoreError::AlreadyExists(_))
        ));
        assert!(store.get_task(&job.job_id, "nope").await.unwrap_err().is_not_found());
    }
}
