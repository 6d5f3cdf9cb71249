use crate::error::TransitionError;
use crate::phase::{Phase, WorkerRole};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a [`Task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl TaskStatus {
    /// Every status.
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Pending,
        TaskStatus::Assigned,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Canceled,
    ];

    /// Legal next statuses. Terminal statuses return an empty slice.
    pub fn legal_transitions(self) -> &'static [TaskStatus] {
        use TaskStatus::*;
        match self {
            Pending => &[Assigned, Canceled],
            Assigned => &[Running, Canceled],
            Running => &[Completed, Failed, Canceled],
            Completed | Failed | Canceled => &[],
        }
    }

    /// COMPLETED, FAILED and CANCELED.
    pub fn is_terminal(self) -> bool {
        self.legal_transitions().is_empty()
    }

    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Assigned => "ASSIGNED",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Canceled => "CANCELED",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fields a planner supplies for a new task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInput {
    pub job_id: String,
    pub assignee: WorkerRole,
    pub phase: Phase,
    pub round: u32,
    pub objective: String,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
}

/// One unit of work for one worker in one phase of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub job_id: String,
    pub assignee: WorkerRole,
    pub phase: Phase,
    /// Planning round of the owning job this task belongs to.
    #[serde(default)]
    pub round: u32,
    pub objective: String,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// A PENDING task with a fresh id.
    pub fn new(input: TaskInput) -> Self {
        let now = Utc::now();
        Self {
            task_id: crate::new_id(),
            job_id: input.job_id,
            assignee: input.assignee,
            phase: input.phase,
            round: input.round,
            objective: input.objective,
            inputs: input.inputs,
            constraints: input.constraints,
            acceptance_criteria: input.acceptance_criteria,
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    /// Return a copy moved to `to`, or fail if the edge is illegal.
    pub fn transition(&self, to: TaskStatus) -> Result<Task, TransitionError> {
        if !self.status.legal_transitions().contains(&to) {
            return Err(TransitionError {
                entity: "task",
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        let mut next = self.clone();
        next.status = to;
        next.updated_at = Utc::now();
        Ok(next)
    }

    /// Walk the task forward through each legal intermediate step until it
    /// reaches `to`. Used when a sentinel arrives for a task the backend never
    /// reported as started.
    pub fn advance_to(&self, to: TaskStatus) -> Result<Task, TransitionError> {
        let mut task = self.clone();
        while task.status != to {
            let step = match (task.status, to) {
                (TaskStatus::Pending, TaskStatus::Canceled)
                | (TaskStatus::Assigned, TaskStatus::Canceled) => to,
                (TaskStatus::Pending, _) => TaskStatus::Assigned,
                (TaskStatus::Assigned, _) => TaskStatus::Running,
                _ => to,
            };
            task = task.transition(step)?;
        }
        Ok(task)
    }
}
