use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One stage of the spec → impl → test pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Write the specification.
    Spec,
    /// Implement it.
    Impl,
    /// Test it.
    Test,
}

impl Phase {
    /// Pipeline order.
    pub const ALL: [Phase; 3] = [Phase::Spec, Phase::Impl, Phase::Test];

    /// The phase after this one, or `None` after `test`.
    pub fn next(self) -> Option<Phase> {
        match self {
            Phase::Spec => Some(Phase::Impl),
            Phase::Impl => Some(Phase::Test),
            Phase::Test => None,
        }
    }

    /// Lowercase wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Spec => "spec",
            Phase::Impl => "impl",
            Phase::Test => "test",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "spec" => Ok(Phase::Spec),
            "impl" => Ok(Phase::Impl),
            "test" => Ok(Phase::Test),
            other => Err(format!("unknown phase: {other}")),
        }
    }
}

/// Who a task is assigned to.
///
/// Serialized as its display string: `worker-1`, `researcher`, `auditor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum WorkerRole {
    /// A general worker, numbered from 1.
    Worker(u32),
    /// Gathers context before the spec phase.
    Researcher,
    /// Reviews a phase's output and may emit a gate verdict.
    Auditor,
}

impl WorkerRole {
    /// Only auditors may produce an authoritative gate verdict.
    pub fn produces_verdict(self) -> bool {
        matches!(self, WorkerRole::Auditor)
    }
}

impl fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerRole::Worker(n) => write!(f, "worker-{n}"),
            WorkerRole::Researcher => f.write_str("researcher"),
            WorkerRole::Auditor => f.write_str("auditor"),
        }
    }
}

impl FromStr for WorkerRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "researcher" => Ok(WorkerRole::Researcher),
            "auditor" => Ok(WorkerRole::Auditor),
            other => other
                .strip_prefix("worker-")
                .and_then(|n| n.parse().ok())
                .map(WorkerRole::Worker)
                .ok_or_else(|| format!("unknown worker role: {other}")),
        }
    }
}

impl TryFrom<String> for WorkerRole {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<WorkerRole> for String {
    fn from(role: WorkerRole) -> Self {
        role.to_string()
    }
}
