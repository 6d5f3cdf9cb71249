use crate::error::{CadenceError, CadenceResult, ErrorClass, TransitionError};
use crate::phase::Phase;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Workers per phase when the request does not say.
pub const DEFAULT_PARALLELISM: u32 = 2;
/// Upper bound accepted for `parallelism`.
pub const MAX_PARALLELISM: u32 = 10;

/// Pipeline status of a [`Job`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Received,
    Queued,
    Planning,
    Dispatched,
    Running,
    Aggregating,
    WaitingApproval,
    Approved,
    Committing,
    WaitingRetry,
    Completed,
    Failed,
    Canceled,
}

impl JobStatus {
    /// Every status, in pipeline order.
    pub const ALL: [JobStatus; 13] = [
        JobStatus::Received,
        JobStatus::Queued,
        JobStatus::Planning,
        JobStatus::Dispatched,
        JobStatus::Running,
        JobStatus::Aggregating,
        JobStatus::WaitingApproval,
        JobStatus::Approved,
        JobStatus::Committing,
        JobStatus::WaitingRetry,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Canceled,
    ];

    /// Statuses that count against scheduler capacity.
    pub const ACTIVE: [JobStatus; 8] = [
        JobStatus::Planning,
        JobStatus::Dispatched,
        JobStatus::Running,
        JobStatus::Aggregating,
        JobStatus::WaitingApproval,
        JobStatus::Approved,
        JobStatus::Committing,
        JobStatus::WaitingRetry,
    ];

    /// Legal next statuses. Terminal statuses return an empty slice.
    ///
    /// COMMITTING may go straight back to PLANNING when a phase other than
    /// the last one has been merged.
    pub fn legal_transitions(self) -> &'static [JobStatus] {
        use JobStatus::*;
        match self {
            Received => &[Planning, Queued, Canceled],
            Queued => &[Planning, Canceled],
            Planning => &[Dispatched, Failed, Canceled, WaitingRetry],
            Dispatched => &[Running, Failed, Canceled, WaitingRetry],
            Running => &[Aggregating, Failed, Canceled, WaitingRetry],
            Aggregating => &[WaitingApproval, Failed, Canceled, WaitingRetry],
            WaitingApproval => &[Approved, Planning, Failed, Canceled],
            Approved => &[Committing, Failed, Canceled],
            Committing => &[Completed, Planning, WaitingApproval, Failed, WaitingRetry],
            WaitingRetry => &[Planning, Running, Committing, Failed],
            Completed | Failed | Canceled => &[],
        }
    }

    /// Whether `self -> to` is a legal edge.
    pub fn can_transition_to(self, to: JobStatus) -> bool {
        self.legal_transitions().contains(&to)
    }

    /// COMPLETED, FAILED and CANCELED.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Canceled
        )
    }

    /// Whether the job occupies a scheduler slot.
    pub fn is_active(self) -> bool {
        Self::ACTIVE.contains(&self)
    }

    /// Wire name, e.g. `WAITING_APPROVAL`.
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Received => "RECEIVED",
            JobStatus::Queued => "QUEUED",
            JobStatus::Planning => "PLANNING",
            JobStatus::Dispatched => "DISPATCHED",
            JobStatus::Running => "RUNNING",
            JobStatus::Aggregating => "AGGREGATING",
            JobStatus::WaitingApproval => "WAITING_APPROVAL",
            JobStatus::Approved => "APPROVED",
            JobStatus::Committing => "COMMITTING",
            JobStatus::WaitingRetry => "WAITING_RETRY",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Canceled => "CANCELED",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.to_ascii_uppercase();
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == upper)
            .ok_or_else(|| format!("unknown job status: {s}"))
    }
}

/// Repository-relative markdown files a job writes, one per phase plus a summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobArtifacts {
    pub spec: String,
    #[serde(rename = "impl")]
    pub implementation: String,
    pub test: String,
    pub summary: String,
}

impl JobArtifacts {
    fn for_job(job_id: &str) -> Self {
        let base = format!("docs/jobs/{job_id}");
        Self {
            spec: format!("{base}/spec.md"),
            implementation: format!("{base}/impl.md"),
            test: format!("{base}/test.md"),
            summary: format!("{base}/summary.md"),
        }
    }

    /// Artifact path committed at the end of `phase`.
    pub fn for_phase(&self, phase: Phase) -> &str {
        match phase {
            Phase::Spec => &self.spec,
            Phase::Impl => &self.implementation,
            Phase::Test => &self.test,
        }
    }
}

/// Branch names and the hashes of the last commit/merge made for a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobGit {
    pub main_branch: String,
    pub develop_branch: String,
    /// Always `jobs/{job_id}`.
    pub job_branch: String,
    pub merge_policy: String,
    #[serde(default)]
    pub last_commit: Option<String>,
    #[serde(default)]
    pub last_merge: Option<String>,
}

/// Everything a caller supplies to create a job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobInput {
    pub user_prompt: String,
    pub repo_root: PathBuf,
    #[serde(default)]
    pub parallelism: Option<u32>,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub main_branch: Option<String>,
    #[serde(default)]
    pub develop_branch: Option<String>,
}

impl JobInput {
    /// Input with default parallelism and branches.
    pub fn new(user_prompt: impl Into<String>, repo_root: impl Into<PathBuf>) -> Self {
        Self {
            user_prompt: user_prompt.into(),
            repo_root: repo_root.into(),
            ..Default::default()
        }
    }

    /// Override the worker count.
    pub fn with_parallelism(mut self, parallelism: u32) -> Self {
        self.parallelism = Some(parallelism);
        self
    }

    /// Add a free-text constraint copied into every task.
    pub fn with_constraint(mut self, constraint: impl Into<String>) -> Self {
        self.constraints.push(constraint.into());
        self
    }
}

/// One user request flowing through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: JobStatus,
    pub user_prompt: String,
    pub parallelism: u32,
    pub repo_root: PathBuf,
    /// Phase being worked on. `None` only while RECEIVED or QUEUED.
    pub current_phase: Option<Phase>,
    pub artifacts: JobArtifacts,
    pub git: JobGit,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub error_class: Option<ErrorClass>,
    /// Incremented on every planning pass; tasks and reports carry the round
    /// they were produced in.
    #[serde(default)]
    pub phase_round: u32,
    /// Auditor FAIL verdicts on the current phase.
    #[serde(default)]
    pub gate_failures: u32,
    /// Where a WAITING_RETRY job resumes.
    #[serde(default)]
    pub resume_status: Option<JobStatus>,
    /// Reason given for the most recent rejection.
    #[serde(default)]
    pub last_rejection: Option<String>,
}

impl Job {
    /// Create a RECEIVED job from validated input.
    pub fn new(input: JobInput) -> CadenceResult<Self> {
        if input.user_prompt.trim().is_empty() {
            return Err(CadenceError::InvalidRequest("prompt is required".into()));
        }
        if !input.repo_root.is_absolute() {
            return Err(CadenceError::InvalidRequest(
                "repo_root must be an absolute path".into(),
            ));
        }
        let parallelism = input.parallelism.unwrap_or(DEFAULT_PARALLELISM);
        if !(1..=MAX_PARALLELISM).contains(&parallelism) {
            return Err(CadenceError::InvalidRequest(format!(
                "parallelism must be between 1 and {MAX_PARALLELISM}, got {parallelism}"
            )));
        }

        let job_id = crate::new_id();
        let now = Utc::now();
        Ok(Self {
            artifacts: JobArtifacts::for_job(&job_id),
            git: JobGit {
                main_branch: input.main_branch.unwrap_or_else(|| "main".into()),
                develop_branch: input.develop_branch.unwrap_or_else(|| "develop".into()),
                job_branch: format!("jobs/{job_id}"),
                merge_policy: "merge_commit".into(),
                last_commit: None,
                last_merge: None,
            },
            job_id,
            created_at: now,
            updated_at: now,
            status: JobStatus::Received,
            user_prompt: input.user_prompt,
            parallelism,
            repo_root: input.repo_root,
            current_phase: None,
            constraints: input.constraints,
            retry_count: 0,
            last_error: None,
            error_class: None,
            phase_round: 0,
            gate_failures: 0,
            resume_status: None,
            last_rejection: None,
        })
    }

    /// Return a copy moved to `to`, or fail if the edge is illegal.
    ///
    /// Leaving RECEIVED/QUEUED for the first time pins `current_phase` to
    /// `spec`, so the phase is always known once work has started.
    pub fn transition(&self, to: JobStatus) -> Result<Job, TransitionError> {
        if !self.status.can_transition_to(to) {
            return Err(TransitionError {
                entity: "job",
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        let mut next = self.clone();
        next.status = to;
        next.updated_at = Utc::now();
        if next.current_phase.is_none() && !matches!(to, JobStatus::Received | JobStatus::Queued) {
            next.current_phase = Some(Phase::Spec);
        }
        Ok(next)
    }

    /// Record a failure. `retry_count` only grows for transient errors.
    pub fn set_error(&mut self, message: impl Into<String>, class: ErrorClass) {
        self.last_error = Some(message.into());
        self.error_class = Some(class);
        if class == ErrorClass::Transient {
            self.retry_count += 1;
        }
        self.updated_at = Utc::now();
    }

    /// Phase being worked on, defaulting to `spec`.
    pub fn phase(&self) -> Phase {
        self.current_phase.unwrap_or(Phase::Spec)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn job() -> Job {
        Job::new(JobInput::new("Build a todo app", "/tmp/repo")).unwrap()
    }

    #[test]
    fn test_new_job_defaults() {
        let job = job();
        assert_eq!(job.status, JobStatus::Received);
        assert_eq!(job.parallelism, DEFAULT_PARALLELISM);
        assert_eq!(job.current_phase, None);
        assert_eq!(job.git.job_branch, format!("jobs/{}", job.job_id));
        assert_eq!(job.git.develop_branch, "develop");
        assert_eq!(
            job.artifacts.for_phase(Phase::Impl),
            format!("docs/jobs/{}/impl.md", job.job_id)
        );
        assert_eq!(job.retry_count, 0);
    }

    #[test]
    fn test_new_job_rejects_bad_input() {
        assert!(Job::new(JobInput::new("  ", "/tmp/repo")).is_err());
        assert!(Job::new(JobInput::new("x", "relative/repo")).is_err());
        assert!(Job::new(JobInput::new("x", "/tmp/repo").with_parallelism(0)).is_err());
        assert!(Job::new(JobInput::new("x", "/tmp/repo").with_parallelism(11)).is_err());
    }

    #[test]
    fn test_transition_table_is_exhaustive() {
        for from in JobStatus::ALL {
            for to in JobStatus::ALL {
                let mut job = job();
                job.status = from;
                let result = job.transition(to);
                assert_eq!(
                    result.is_ok(),
                    from.legal_transitions().contains(&to),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn test_terminal_statuses_have_no_exits() {
        for status in [JobStatus::Completed, JobStatus::Failed, JobStatus::Canceled] {
            assert!(status.is_terminal());
            assert!(status.legal_transitions().is_empty());
        }
    }

    #[test]
    fn test_transition_returns_copy() {
        let job = job();
        let planned = job.transition(JobStatus::Planning).unwrap();
        assert_eq!(job.status, JobStatus::Received);
        assert_eq!(planned.status, JobStatus::Planning);
        assert_eq!(planned.current_phase, Some(Phase::Spec));
        assert!(planned.updated_at >= job.updated_at);
    }

    #[test]
    fn test_queued_keeps_phase_unset() {
        let queued = job().transition(JobStatus::Queued).unwrap();
        assert_eq!(queued.current_phase, None);
    }

    #[test]
    fn test_set_error_counts_only_transient() {
        let mut job = job();
        job.set_error("timeout", ErrorClass::Transient);
        job.set_error("syntax error", ErrorClass::Permanent);
        assert_eq!(job.retry_count, 1);
        assert_eq!(job.error_class, Some(ErrorClass::Permanent));
        assert_eq!(job.last_error.as_deref(), Some("syntax error"));
    }

    #[test]
    fn test_active_statuses() {
        assert!(JobStatus::WaitingRetry.is_active());
        assert!(JobStatus::Committing.is_active());
        assert!(!JobStatus::Queued.is_active());
        assert!(!JobStatus::Received.is_active());
        assert!(!JobStatus::Completed.is_active());
    }

    #[test]
    fn test_status_wire_names() {
        assert_eq!(
            serde_json::to_string(&JobStatus::WaitingApproval).unwrap(),
            "\"WAITING_APPROVAL\""
        );
        assert_eq!("waiting_retry".parse::<JobStatus>().unwrap(), JobStatus::WaitingRetry);
    }
}
