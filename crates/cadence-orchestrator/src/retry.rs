use crate::config::RetryConfig;
use crate::events::EventKind;
use crate::ledger::Ledger;
use cadence_core::{
    truncate_chars, CadenceResult, ErrorClass, Job, JobStatus, TraceActor, TraceEntry,
    TraceEventType,
};
use chrono::{DateTime, Duration, Utc};
use regex::RegexSet;
use std::sync::LazyLock;
use tracing::{info, warn};

// --- Classification ---

const TRANSIENT_PATTERNS: &[&str] = &[
    r"(?i)timeout",
    r"(?i)ECONNREFUSED",
    r"(?i)ECONNRESET",
    r"(?i)ETIMEDOUT",
    r"(?i)rate.?limit",
    r"(?i)too many requests",
    r"503",
    r"502",
    r"(?i)lock",
    r"(?i)EAGAIN",
    r"(?i)temporary",
    r"(?i)overloaded",
    r"(?i)still in progress",
    r"(?i)Quality gate failed",
];

static TRANSIENT: LazyLock<RegexSet> =
    LazyLock::new(|| RegexSet::new(TRANSIENT_PATTERNS).unwrap_or_else(|_| RegexSet::empty()));

/// Classify a failure message. Anything not recognised as transient is
/// permanent.
pub fn classify_error(message: &str) -> ErrorClass {
    if TRANSIENT.is_match(message) {
        ErrorClass::Transient
    } else {
        ErrorClass::Permanent
    }
}

// --- Decisions ---

/// Outcome of [`RetryManager::decide`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub should_retry: bool,
    pub delay_seconds: u64,
    pub error_class: ErrorClass,
    /// The job's retry count once the decision is applied.
    pub retry_count: u32,
}

/// Classifies failures and moves jobs to WAITING_RETRY or FAILED.
pub struct RetryManager {
    config: RetryConfig,
    ledger: Ledger,
}

impl RetryManager {
    pub fn new(config: RetryConfig, ledger: Ledger) -> Self {
        Self { config, ledger }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Delay before retry number `retry_count + 1`.
    pub fn backoff_delay(&self, retry_count: u32) -> u64 {
        let sequence = &self.config.backoff_sequence;
        let Some(last) = sequence.len().checked_sub(1) else {
            return 0;
        };
        let index = (retry_count as usize).min(last);
        sequence[index].min(self.config.backoff_cap)
    }

    /// Decide by classifying `message`.
    pub fn decide(&self, job: &Job, message: &str) -> RetryDecision {
        self.decide_with_class(job, classify_error(message))
    }

    pub fn decide_with_class(&self, job: &Job, class: ErrorClass) -> RetryDecision {
        if class == ErrorClass::Permanent || job.retry_count >= self.config.max_retries {
            return RetryDecision {
                should_retry: false,
                delay_seconds: 0,
                error_class: class,
                retry_count: job.retry_count,
            };
        }
        RetryDecision {
            should_retry: true,
            delay_seconds: self.backoff_delay(job.retry_count),
            error_class: class,
            retry_count: job.retry_count + 1,
        }
    }

    /// Record `message` on the job and move it to WAITING_RETRY or FAILED.
    ///
    /// `class` overrides message classification when the caller already knows
    /// it (a typed git or lock error). A job failing while COMMITTING resumes
    /// into COMMITTING; every other failure resumes into PLANNING.
    pub async fn apply_retry(
        &self,
        job: &Job,
        message: &str,
        class: Option<ErrorClass>,
    ) -> CadenceResult<Job> {
        let class = class.unwrap_or_else(|| classify_error(message));
        let decision = self.decide_with_class(job, class);
        let resume = if job.status == JobStatus::Committing {
            JobStatus::Committing
        } else {
            JobStatus::Planning
        };

        if !decision.should_retry {
            let trace = TraceEntry::new(
                &job.job_id,
                TraceActor::System,
                TraceEventType::Failed,
                format!(
                    "Job failed ({}): {}",
                    decision.error_class,
                    truncate_chars(message, 200)
                ),
            );
            let failed = self
                .ledger
                .move_job_with(job, JobStatus::Failed, Some(trace), |next| {
                    next.set_error(message, decision.error_class);
                    next.resume_status = None;
                })
                .await?;
            warn!(
                job_id = %job.job_id,
                class = %decision.error_class,
                retry_count = failed.retry_count,
                error = %message,
                "Job failed"
            );
            self.ledger.emit(
                &job.job_id,
                EventKind::JobFailed {
                    error: message.to_string(),
                },
            );
            return Ok(failed);
        }

        let trace = TraceEntry::new(
            &job.job_id,
            TraceActor::System,
            TraceEventType::Retry,
            format!(
                "Retry {}/{} in {}s: {}",
                decision.retry_count,
                self.config.max_retries,
                decision.delay_seconds,
                truncate_chars(message, 200)
            ),
        );
        let waiting = self
            .ledger
            .move_job_with(job, JobStatus::WaitingRetry, Some(trace), |next| {
                next.set_error(message, decision.error_class);
                next.resume_status = Some(resume);
            })
            .await?;
        info!(
            job_id = %job.job_id,
            retry = decision.retry_count,
            delay_seconds = decision.delay_seconds,
            resume = %resume,
            "Job waiting to retry"
        );
        Ok(waiting)
    }

    /// When a WAITING_RETRY job becomes eligible again.
    pub fn next_attempt_at(&self, job: &Job) -> DateTime<Utc> {
        let delay = self.backoff_delay(job.retry_count.saturating_sub(1));
        job.updated_at + Duration::seconds(i64::try_from(delay).unwrap_or(i64::MAX / 1000))
    }

    pub fn is_ready(&self, job: &Job, now: DateTime<Utc>) -> bool {
        now >= self.next_attempt_at(job)
    }
}
