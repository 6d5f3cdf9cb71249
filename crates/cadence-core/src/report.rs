use crate::phase::{Phase, WorkerRole};
use crate::task::Task;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single claim a worker makes, with supporting evidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub claim: String,
    #[serde(default)]
    pub evidence: String,
    /// In `[0, 1]`.
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

fn default_confidence() -> f64 {
    0.5
}

impl Finding {
    /// Build a finding, clamping confidence into `[0, 1]`.
    pub fn new(claim: impl Into<String>, evidence: impl Into<String>, confidence: f64) -> Self {
        let confidence = if confidence.is_finite() {
            confidence.clamp(0.0, 1.0)
        } else {
            default_confidence()
        };
        Self {
            claim: claim.into(),
            evidence: evidence.into(),
            confidence,
        }
    }
}

/// A file the worker says it changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactUpdate {
    pub path: String,
    #[serde(default)]
    pub change_summary: String,
}

/// An auditor's judgement on a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GateVerdict {
    Pass,
    Fail,
}

/// One worker's structured output for one task. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub task_id: String,
    pub job_id: String,
    pub phase: Phase,
    #[serde(default)]
    pub round: u32,
    pub role: WorkerRole,
    pub summary: String,
    #[serde(default)]
    pub findings: Vec<Finding>,
    #[serde(default)]
    pub risks: Vec<String>,
    #[serde(default)]
    pub contradictions: Vec<String>,
    #[serde(default)]
    pub next_actions: Vec<String>,
    #[serde(default)]
    pub artifact_updates: Vec<ArtifactUpdate>,
    /// Only ever set on auditor reports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate_verdict: Option<GateVerdict>,
    pub created_at: DateTime<Utc>,
}

impl Report {
    /// An empty report for `task` with the given summary.
    pub fn for_task(task: &Task, summary: impl Into<String>) -> Self {
        Self {
            task_id: task.task_id.clone(),
            job_id: task.job_id.clone(),
            phase: task.phase,
            round: task.round,
            role: task.assignee,
            summary: summary.into(),
            findings: Vec::new(),
            risks: Vec::new(),
            contradictions: Vec::new(),
            next_actions: Vec::new(),
            artifact_updates: Vec::new(),
            gate_verdict: None,
            created_at: Utc::now(),
        }
    }

    /// Attach a verdict. Ignored unless the report comes from an auditor.
    pub fn with_gate_verdict(mut self, verdict: Option<GateVerdict>) -> Self {
        self.gate_verdict = if self.role.produces_verdict() {
            verdict
        } else {
            None
        };
        self
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::task::TaskInput;

    fn task(role: WorkerRole) -> Task {
        Task::new(TaskInput {
            job_id: "job1".into(),
            assignee: role,
            phase: Phase::Impl,
            round: 2,
            objective: "review".into(),
            inputs: vec![],
            constraints: vec![],
            acceptance_criteria: vec![],
        })
    }

    #[test]
    fn test_report_copies_task_identity() {
        let t = task(WorkerRole::Worker(1));
        let r = Report::for_task(&t, "done");
        assert_eq!(r.task_id, t.task_id);
        assert_eq!(r.phase, Phase::Impl);
        assert_eq!(r.round, 2);
        assert_eq!(r.role, WorkerRole::Worker(1));
    }

    #[test]
    fn test_verdict_only_kept_for_auditor() {
        let worker = Report::for_task(&task(WorkerRole::Worker(1)), "x")
            .with_gate_verdict(Some(GateVerdict::Fail));
        assert_eq!(worker.gate_verdict, None);

        let auditor = Report::for_task(&task(WorkerRole::Auditor), "x")
            .with_gate_verdict(Some(GateVerdict::Fail));
        assert_eq!(auditor.gate_verdict, Some(GateVerdict::Fail));
    }

    #[test]
    fn test_finding_confidence_is_clamped() {
        assert_eq!(Finding::new("a", "", 1.7).confidence, 1.0);
        assert_eq!(Finding::new("a", "", -0.2).confidence, 0.0);
        assert_eq!(Finding::new("a", "", f64::NAN).confidence, 0.5);
    }

    #[test]
    fn test_finding_defaults_on_deserialize() {
        let f: Finding = serde_json::from_str(r#"{"claim":"x"}"#).unwrap();
        assert_eq!(f.confidence, 0.5);
        assert_eq!(f.evidence, "");
    }
}
