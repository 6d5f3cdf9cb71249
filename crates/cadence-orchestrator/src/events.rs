use cadence_core::{JobStatus, Phase, TaskStatus, WorkerRole};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Something that happened to a job, published on the [`EventBus`](crate::EventBus).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub job_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Event payloads. The serialized `type` is the event name, e.g. `task:done`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventKind {
    #[serde(rename = "job:created")]
    JobCreated,
    #[serde(rename = "job:status_changed")]
    JobStatusChanged { from: JobStatus, to: JobStatus },
    #[serde(rename = "job:completed")]
    JobCompleted,
    #[serde(rename = "job:failed")]
    JobFailed { error: String },
    #[serde(rename = "task:created")]
    TaskCreated { task_id: String, assignee: WorkerRole },
    #[serde(rename = "task:status_changed")]
    TaskStatusChanged {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },
    #[serde(rename = "task:done")]
    TaskDone {
        task_id: String,
        phase: Phase,
        role: WorkerRole,
    },
    #[serde(rename = "task:error")]
    TaskError { task_id: String, error: String },
    #[serde(rename = "phase:awaiting_approval")]
    PhaseAwaitingApproval { phase: Phase, diff_summary: String },
    #[serde(rename = "phase:approved")]
    PhaseApproved { phase: Phase },
    #[serde(rename = "phase:rejected")]
    PhaseRejected { phase: Phase, reason: String },
}

impl EventKind {
    /// Wire name used for subscription patterns.
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::JobCreated => "job:created",
            EventKind::JobStatusChanged { .. } => "job:status_changed",
            EventKind::JobCompleted => "job:completed",
            EventKind::JobFailed { .. } => "job:failed",
            EventKind::TaskCreated { .. } => "task:created",
            EventKind::TaskStatusChanged { .. } => "task:status_changed",
            EventKind::TaskDone { .. } => "task:done",
            EventKind::TaskError { .. } => "task:error",
            EventKind::PhaseAwaitingApproval { .. } => "phase:awaiting_approval",
            EventKind::PhaseApproved { .. } => "phase:approved",
            EventKind::PhaseRejected { .. } => "phase:rejected",
        }
    }
}

impl Event {
    /// Stamp `kind` for `job_id` with the current time.
    pub fn new(job_id: impl Into<String>, kind: EventKind) -> Self {
        Self {
            job_id: job_id.into(),
            timestamp: Utc::now(),
            kind,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }
}
