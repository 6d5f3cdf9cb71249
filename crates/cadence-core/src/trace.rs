use crate::phase::WorkerRole;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Who produced a trace entry.
///
/// Serialized as a plain string (`system`, `git`, `worker-2`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TraceActor {
    /// A human acting through the API.
    Web,
    /// The orchestrator itself.
    System,
    /// Git lock and git operations.
    Git,
    /// The phase planner.
    Planner,
    /// A numbered worker.
    Worker(u32),
    Researcher,
    Auditor,
}

impl From<WorkerRole> for TraceActor {
    fn from(role: WorkerRole) -> Self {
        match role {
            WorkerRole::Worker(n) => TraceActor::Worker(n),
            WorkerRole::Researcher => TraceActor::Researcher,
            WorkerRole::Auditor => TraceActor::Auditor,
        }
    }
}

impl fmt::Display for TraceActor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceActor::Web => f.write_str("web"),
            TraceActor::System => f.write_str("system"),
            TraceActor::Git => f.write_str("git"),
            TraceActor::Planner => f.write_str("planner"),
            TraceActor::Worker(n) => write!(f, "worker-{n}"),
            TraceActor::Researcher => f.write_str("researcher"),
            TraceActor::Auditor => f.write_str("auditor"),
        }
    }
}

impl FromStr for TraceActor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "web" => Ok(TraceActor::Web),
            "system" => Ok(TraceActor::System),
            "git" => Ok(TraceActor::Git),
            "planner" => Ok(TraceActor::Planner),
            other => other.parse::<WorkerRole>().map(TraceActor::from),
        }
    }
}

impl TryFrom<String> for TraceActor {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TraceActor> for String {
    fn from(actor: TraceActor) -> Self {
        actor.to_string()
    }
}

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TraceEventType {
    Received,
    Queued,
    Delegated,
    Dispatched,
    Started,
    Reported,
    Aggregated,
    GatePass,
    GateFail,
    Approved,
    Rejected,
    Committed,
    Retry,
    Completed,
    Failed,
    Canceled,
}

/// Optional pointers from a trace entry to related records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceRefs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_hash: Option<String>,
}

impl TraceRefs {
    /// True when no reference is set.
    pub fn is_empty(&self) -> bool {
        self.task_id.is_none() && self.artifact_path.is_none() && self.commit_hash.is_none()
    }
}

/// Append-only audit record, one ordered log per job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub timestamp: DateTime<Utc>,
    pub job_id: String,
    pub actor: TraceActor,
    pub event_type: TraceEventType,
    pub payload_summary: String,
    #[serde(default, skip_serializing_if = "TraceRefs::is_empty")]
    pub refs: TraceRefs,
}

impl TraceEntry {
    /// New entry stamped with the current time.
    pub fn new(
        job_id: impl Into<String>,
        actor: TraceActor,
        event_type: TraceEventType,
        payload_summary: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            job_id: job_id.into(),
            actor,
            event_type,
            payload_summary: payload_summary.into(),
            refs: TraceRefs::default(),
        }
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.refs.task_id = Some(task_id.into());
        self
    }

    pub fn with_artifact(mut self, path: impl Into<String>) -> Self {
        self.refs.artifact_path = Some(path.into());
        self
    }

    pub fn with_commit(mut self, hash: impl Into<String>) -> Self {
        self.refs.commit_hash = Some(hash.into());
        self
    }
}
