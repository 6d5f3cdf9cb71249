use crate::aggregator::Aggregator;
use crate::config::OrchestratorConfig;
use crate::events::EventKind;
use crate::ledger::Ledger;
use crate::retry::RetryManager;
use cadence_core::{
    truncate_chars, ApprovalRequest, CadenceError, CadenceResult, ErrorClass, Job, JobInput,
    JobStatus, Phase, PhaseDecision, Report, Task, TaskStatus, TraceActor, TraceEntry,
    TraceEventType,
};
use cadence_store::JobFilter;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

/// Retry bookkeeping shown next to a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryStatus {
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    pub error_class: Option<ErrorClass>,
    /// Set only while the job is WAITING_RETRY.
    pub next_attempt_at: Option<DateTime<Utc>>,
}

/// Everything known about one job.
#[derive(Debug, Clone, Serialize)]
pub struct JobDashboard {
    pub job: Job,
    pub tasks: Vec<Task>,
    pub reports: Vec<Report>,
    pub traces: Vec<TraceEntry>,
    pub retry: RetryStatus,
    /// Present while the job waits for a reviewer.
    pub approval: Option<ApprovalRequest>,
}

/// Job lifecycle operations for the outer surfaces (CLI, HTTP).
///
/// Each call validates the request against the job's current status and
/// goes through the same [`Ledger`] as the control loop.
pub struct JobService {
    ledger: Ledger,
    retry: RetryManager,
    aggregator: Aggregator,
    default_parallelism: u32,
    main_branch: String,
    develop_branch: String,
}

impl JobService {
    pub fn new(ledger: Ledger, config: &OrchestratorConfig) -> Self {
        Self {
            retry: RetryManager::new(config.retry.clone(), ledger.clone()),
            aggregator: Aggregator::new(ledger.store().clone()),
            default_parallelism: config.default_parallelism,
            main_branch: config.git.main_branch.clone(),
            develop_branch: config.git.develop_branch.clone(),
            ledger,
        }
    }

    /// Persist a new RECEIVED job.
    pub async fn create_job(&self, mut input: JobInput) -> CadenceResult<Job> {
        input.parallelism.get_or_insert(self.default_parallelism);
        input
            .main_branch
            .get_or_insert_with(|| self.main_branch.clone());
        input
            .develop_branch
            .get_or_insert_with(|| self.develop_branch.clone());

        let job = Job::new(input)?;
        self.ledger.store().create_job(&job).await?;
        self.ledger
            .trace(TraceEntry::new(
                &job.job_id,
                TraceActor::Web,
                TraceEventType::Received,
                format!("Job created: {}", truncate_chars(&job.user_prompt, 100)),
            ))
            .await?;
        self.ledger.emit(&job.job_id, EventKind::JobCreated);
        info!(
            job_id = %job.job_id,
            parallelism = job.parallelism,
            repo = %job.repo_root.display(),
            "Job created"
        );
        Ok(job)
    }

    /// Cancel a job and every unfinished task of it.
    ///
    /// Jobs that are committing or waiting to retry cannot be canceled.
    pub async fn cancel_job(&self, job_id: &str) -> CadenceResult<Job> {
        let job = self.ledger.store().get_job(job_id).await?;
        if !job.status.can_transition_to(JobStatus::Canceled) {
            return Err(CadenceError::InvalidRequest(format!(
                "Job {job_id} cannot be canceled while {}",
                job.status
            )));
        }
        let trace = TraceEntry::new(
            job_id,
            TraceActor::Web,
            TraceEventType::Canceled,
            format!("Job canceled while {}", job.status),
        );
        let canceled = self
            .ledger
            .move_job(&job, JobStatus::Canceled, Some(trace))
            .await?;

        for task in self.ledger.store().list_tasks(job_id).await? {
            if !task.status.is_terminal() {
                self.ledger.move_task(&task, TaskStatus::Canceled).await?;
            }
        }
        info!(job_id = %job_id, "Job canceled");
        Ok(canceled)
    }

    /// Apply a reviewer decision to the phase awaiting approval.
    pub async fn decide(
        &self,
        job_id: &str,
        phase: Phase,
        decision: PhaseDecision,
    ) -> CadenceResult<Job> {
        match decision {
            PhaseDecision::Approve => self.approve_phase(job_id, phase).await,
            PhaseDecision::Reject { reason } => self.reject_phase(job_id, phase, &reason).await,
        }
    }

    pub async fn approve_phase(&self, job_id: &str, phase: Phase) -> CadenceResult<Job> {
        let job = self.awaiting(job_id, phase).await?;
        let trace = TraceEntry::new(
            job_id,
            TraceActor::Web,
            TraceEventType::Approved,
            format!("Phase {phase} approved by user"),
        );
        let approved = self
            .ledger
            .move_job(&job, JobStatus::Approved, Some(trace))
            .await?;
        self.ledger.emit(job_id, EventKind::PhaseApproved { phase });
        info!(job_id = %job_id, phase = %phase, "Phase approved");
        Ok(approved)
    }

    /// Send the phase back to planning. The reason reaches the next round's
    /// workers.
    pub async fn reject_phase(&self, job_id: &str, phase: Phase, reason: &str) -> CadenceResult<Job> {
        let PhaseDecision::Reject { reason } = PhaseDecision::reject(reason)? else {
            return Err(CadenceError::InvalidRequest("rejection reason is required".into()));
        };
        let job = self.awaiting(job_id, phase).await?;
        let trace = TraceEntry::new(
            job_id,
            TraceActor::Web,
            TraceEventType::Rejected,
            format!("Phase {phase} rejected: {reason}"),
        );
        let replanned = self
            .ledger
            .move_job_with(&job, JobStatus::Planning, Some(trace), |next| {
                next.last_rejection = Some(reason.clone());
            })
            .await?;
        self.ledger.emit(
            job_id,
            EventKind::PhaseRejected {
                phase,
                reason: reason.clone(),
            },
        );
        info!(job_id = %job_id, phase = %phase, reason = %reason, "Phase rejected");
        Ok(replanned)
    }

    pub async fn get_job(&self, job_id: &str) -> CadenceResult<Job> {
        Ok(self.ledger.store().get_job(job_id).await?)
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> CadenceResult<Vec<Job>> {
        Ok(self.ledger.store().list_jobs(filter).await?)
    }

    /// What a reviewer needs to decide on the pending phase.
    pub async fn approval_request(&self, job_id: &str) -> CadenceResult<ApprovalRequest> {
        let job = self.ledger.store().get_job(job_id).await?;
        if job.status != JobStatus::WaitingApproval {
            return Err(CadenceError::InvalidRequest(format!(
                "Job {job_id} is not awaiting approval (status: {})",
                job.status
            )));
        }
        let aggregated = self.aggregator.aggregate(job_id, job.phase()).await?;
        Ok(ApprovalRequest {
            job_id: job.job_id,
            phase: aggregated.phase,
            diff_summary: truncate_chars(&aggregated.combined_summary, 500),
        })
    }

    pub async fn job_dashboard(&self, job_id: &str) -> CadenceResult<JobDashboard> {
        let store = self.ledger.store();
        let job = store.get_job(job_id).await?;
        let approval = if job.status == JobStatus::WaitingApproval {
            Some(self.approval_request(job_id).await?)
        } else {
            None
        };
        let retry = RetryStatus {
            retry_count: job.retry_count,
            max_retries: self.retry.config().max_retries,
            last_error: job.last_error.clone(),
            error_class: job.error_class,
            next_attempt_at: (job.status == JobStatus::WaitingRetry)
                .then(|| self.retry.next_attempt_at(&job)),
        };
        Ok(JobDashboard {
            tasks: store.list_tasks(job_id).await?,
            reports: store.list_reports(job_id).await?,
            traces: store.traces(job_id).await?,
            retry,
            approval,
            job,
        })
    }

    async fn awaiting(&self, job_id: &str, phase: Phase) -> CadenceResult<Job> {
        let job = self.ledger.store().get_job(job_id).await?;
        if job.status != JobStatus::WaitingApproval {
            return Err(CadenceError::InvalidRequest(format!(
                "Job {job_id} is not awaiting approval (status: {})",
                job.status
            )));
        }
        if job.phase() != phase {
            return Err(CadenceError::InvalidRequest(format!(
                "Job {job_id} is awaiting approval for the {} phase, not {phase}",
                job.phase()
            )));
        }
        Ok(job)
    }
}
