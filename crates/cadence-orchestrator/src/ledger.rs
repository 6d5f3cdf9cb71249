use crate::bus::EventBus;
use crate::events::{Event, EventKind};
use cadence_core::{
    CadenceResult, Job, JobStatus, Task, TaskStatus, TraceEntry, TransitionError,
};
use cadence_store::StateStore;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Store plus bus: the one path through which components record a status
/// change, so persistence, the trace log and the emitted event never
/// disagree.
///
/// Every write is compare-and-set on status: the caller's copy must still
/// match the stored record, otherwise the write is refused with a
/// [`TransitionError`]. A cancel from another process therefore wins over a
/// control-loop step that started from an older snapshot. Clones share one
/// write lock, which makes the check exact within a process.
#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn StateStore>,
    bus: EventBus,
    writes: Arc<Mutex<()>>,
}

impl Ledger {
    pub fn new(store: Arc<dyn StateStore>, bus: EventBus) -> Self {
        Self {
            store,
            bus,
            writes: Arc::new(Mutex::new(())),
        }
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Validate and persist a job move to `to`, append `trace` if given and
    /// emit `job:status_changed`.
    ///
    /// `prepare` may adjust the moved copy (phase, round, error fields)
    /// before it is written.
    pub async fn move_job_with(
        &self,
        job: &Job,
        to: JobStatus,
        trace: Option<TraceEntry>,
        prepare: impl FnOnce(&mut Job),
    ) -> CadenceResult<Job> {
        let mut next = job.transition(to)?;
        prepare(&mut next);
        {
            let _write = self.writes.lock().await;
            self.expect_job_status(job, to).await?;
            self.store.update_job(&next).await?;
        }
        if let Some(entry) = trace {
            self.store.append_trace(&entry).await?;
        }
        info!(
            job_id = %job.job_id,
            from = %job.status,
            to = %to,
            phase = %next.phase(),
            "Job status changed"
        );
        self.emit(
            &job.job_id,
            EventKind::JobStatusChanged {
                from: job.status,
                to,
            },
        );
        Ok(next)
    }

    pub async fn move_job(
        &self,
        job: &Job,
        to: JobStatus,
        trace: Option<TraceEntry>,
    ) -> CadenceResult<Job> {
        self.move_job_with(job, to, trace, |_| {}).await
    }

    /// Persist field changes on `job` without moving it. Refused when the
    /// stored status no longer matches.
    pub async fn update_job(&self, job: &Job) -> CadenceResult<()> {
        let _write = self.writes.lock().await;
        self.expect_job_status(job, job.status).await?;
        self.store.update_job(job).await?;
        Ok(())
    }

    /// Fail unless the job is still stored with `job.status`.
    pub async fn ensure_job_status(&self, job: &Job) -> CadenceResult<()> {
        self.expect_job_status(job, job.status).await
    }

    async fn expect_job_status(&self, job: &Job, to: JobStatus) -> CadenceResult<()> {
        let stored = self.store.get_job(&job.job_id).await?;
        if stored.status != job.status {
            debug!(
                job_id = %job.job_id,
                expected = %job.status,
                stored = %stored.status,
                "Stale job snapshot"
            );
            return Err(TransitionError {
                entity: "job",
                from: stored.status.to_string(),
                to: to.to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Validate and persist a task move, emitting `task:status_changed`.
    pub async fn move_task(&self, task: &Task, to: TaskStatus) -> CadenceResult<Task> {
        let next = task.transition(to)?;
        {
            let _write = self.writes.lock().await;
            let stored = self.store.get_task(&task.job_id, &task.task_id).await?;
            if stored.status != task.status {
                return Err(TransitionError {
                    entity: "task",
                    from: stored.status.to_string(),
                    to: to.to_string(),
                }
                .into());
            }
            self.store.update_task(&next).await?;
        }
        self.emit(
            &task.job_id,
            EventKind::TaskStatusChanged {
                task_id: task.task_id.clone(),
                from: task.status,
                to,
            },
        );
        Ok(next)
    }

    pub async fn trace(&self, entry: TraceEntry) -> CadenceResult<()> {
        self.store.append_trace(&entry).await?;
        Ok(())
    }

    pub fn emit(&self, job_id: &str, kind: EventKind) {
        self.bus.emit(Event::new(job_id, kind));
    }
}
