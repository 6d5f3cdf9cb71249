use crate::ledger::Ledger;
use cadence_core::{CadenceResult, Job, JobStatus, TraceActor, TraceEntry, TraceEventType};
use cadence_store::JobFilter;
use tokio::sync::Mutex;
use tracing::info;

/// Admission control: at most `max_jobs` jobs may be active at once.
///
/// Capacity checks and the move that consumes capacity happen under one
/// async mutex, so two concurrent admissions cannot both take the last slot.
pub struct Scheduler {
    ledger: Ledger,
    max_jobs: usize,
    admission: Mutex<()>,
}

impl Scheduler {
    pub fn new(ledger: Ledger, max_jobs: usize) -> Self {
        Self {
            ledger,
            max_jobs: max_jobs.max(1),
            admission: Mutex::new(()),
        }
    }

    pub fn max_jobs(&self) -> usize {
        self.max_jobs
    }

    /// Jobs in any active status.
    pub async fn active_job_count(&self) -> CadenceResult<usize> {
        Ok(self.ledger.store().jobs_in(&JobStatus::ACTIVE).await?.len())
    }

    pub async fn has_capacity(&self) -> CadenceResult<bool> {
        Ok(self.active_job_count().await? < self.max_jobs)
    }

    /// Admit `job` into PLANNING if there is room, otherwise park it in QUEUED.
    pub async fn schedule_job(&self, job: &Job) -> CadenceResult<Job> {
        let _admission = self.admission.lock().await;
        if self.has_capacity().await? {
            return self.promote(job).await;
        }
        if job.status == JobStatus::Queued {
            return Ok(job.clone());
        }
        let trace = TraceEntry::new(
            &job.job_id,
            TraceActor::System,
            TraceEventType::Queued,
            "Job queued (at capacity)",
        );
        let queued = self.ledger.move_job(job, JobStatus::Queued, Some(trace)).await?;
        info!(job_id = %job.job_id, max_jobs = self.max_jobs, "Job queued");
        Ok(queued)
    }

    /// Promote the oldest QUEUED job if there is room.
    pub async fn dequeue_next(&self) -> CadenceResult<Option<Job>> {
        let _admission = self.admission.lock().await;
        if !self.has_capacity().await? {
            return Ok(None);
        }
        let filter = JobFilter {
            limit: Some(1),
            ..JobFilter::status(JobStatus::Queued)
        };
        let Some(next) = self.ledger.store().list_jobs(&filter).await?.into_iter().next() else {
            return Ok(None);
        };
        self.promote(&next).await.map(Some)
    }

    async fn promote(&self, job: &Job) -> CadenceResult<Job> {
        let trace = TraceEntry::new(
            &job.job_id,
            TraceActor::System,
            TraceEventType::Delegated,
            "Job promoted to PLANNING",
        );
        self.ledger.move_job(job, JobStatus::Planning, Some(trace)).await
    }
}
