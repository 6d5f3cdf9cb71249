use async_trait::async_trait;
use cadence_core::{Job, JobStatus, Report, StoreError, Task, TraceEntry};

pub type StoreResult<T> = Result<T, StoreError>;

/// Selection for [`StateStore::list_jobs`]. Results are ordered by creation
/// time, oldest first, before `offset`/`limit` are applied.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    /// Keep only jobs in one of these statuses. Empty means all.
    pub statuses: Vec<JobStatus>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl JobFilter {
    /// Jobs in exactly one status.
    pub fn status(status: JobStatus) -> Self {
        Self {
            statuses: vec![status],
            ..Default::default()
        }
    }

    /// Jobs in any of `statuses`.
    pub fn statuses(statuses: &[JobStatus]) -> Self {
        Self {
            statuses: statuses.to_vec(),
            ..Default::default()
        }
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.statuses.is_empty() || self.statuses.contains(&job.status)
    }

    /// Sort oldest-first and apply offset/limit.
    pub fn apply(&self, mut jobs: Vec<Job>) -> Vec<Job> {
        jobs.retain(|job| self.matches(job));
        jobs.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.job_id.cmp(&b.job_id))
        });
        jobs.into_iter()
            .skip(self.offset)
            .take(self.limit.unwrap_or(usize::MAX))
            .collect()
    }
}

/// Persistence for jobs, tasks, reports and the per-job trace log.
///
/// `create_*` fails with `AlreadyExists` on a duplicate key, `get_*` and
/// `update_*` with `NotFound` when the record is missing, and every method
/// reports backing-medium failures as `Io`.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Prepare the backing medium. Idempotent.
    async fn initialize(&self) -> StoreResult<()>;

    async fn create_job(&self, job: &Job) -> StoreResult<()>;
    async fn get_job(&self, job_id: &str) -> StoreResult<Job>;
    async fn update_job(&self, job: &Job) -> StoreResult<()>;
    async fn list_jobs(&self, filter: &JobFilter) -> StoreResult<Vec<Job>>;

    async fn create_task(&self, task: &Task) -> StoreResult<()>;
    async fn get_task(&self, job_id: &str, task_id: &str) -> StoreResult<Task>;
    async fn update_task(&self, task: &Task) -> StoreResult<()>;
    /// All tasks of a job, oldest first.
    async fn list_tasks(&self, job_id: &str) -> StoreResult<Vec<Task>>;

    async fn create_report(&self, report: &Report) -> StoreResult<()>;
    async fn get_report(&self, job_id: &str, task_id: &str) -> StoreResult<Report>;
    /// All reports of a job, oldest first.
    async fn list_reports(&self, job_id: &str) -> StoreResult<Vec<Report>>;

    async fn append_trace(&self, entry: &TraceEntry) -> StoreResult<()>;
    /// The job's trace log in append order.
    async fn traces(&self, job_id: &str) -> StoreResult<Vec<TraceEntry>>;

    /// Jobs currently in one of `statuses`, oldest first.
    async fn jobs_in(&self, statuses: &[JobStatus]) -> StoreResult<Vec<Job>> {
        self.list_jobs(&JobFilter::statuses(statuses)).await
    }
}
