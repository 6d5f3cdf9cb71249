use cadence_core::{CadenceResult, GateVerdict, Phase, Report, TaskStatus, WorkerRole};
use cadence_store::StateStore;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;

/// Outcome of a [`QualityGate::check`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GateResult {
    pub passed: bool,
    pub phase: Phase,
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub reports_received: usize,
    pub issues: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auditor_verdict: Option<GateVerdict>,
}

impl GateResult {
    /// True when an auditor explicitly failed the phase.
    pub fn auditor_failed(&self) -> bool {
        self.auditor_verdict == Some(GateVerdict::Fail)
    }
}

/// Decides whether a phase's work is complete and acceptable.
pub struct QualityGate {
    store: Arc<dyn StateStore>,
}

impl QualityGate {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Check the tasks and reports of `phase` in the job's current planning
    /// round.
    pub async fn check(&self, job_id: &str, phase: Phase) -> CadenceResult<GateResult> {
        let job = self.store.get_job(job_id).await?;
        let round = job.phase_round;

        let tasks: Vec<_> = self
            .store
            .list_tasks(job_id)
            .await?
            .into_iter()
            .filter(|t| t.phase == phase && t.round == round)
            .collect();
        let reports: Vec<_> = self
            .store
            .list_reports(job_id)
            .await?
            .into_iter()
            .filter(|r| r.phase == phase && r.round == round)
            .collect();

        let mut issues = Vec::new();

        let completed: Vec<_> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .collect();
        let failed: Vec<_> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Failed)
            .map(|t| t.task_id.as_str())
            .collect();
        if !failed.is_empty() {
            issues.push(format!(
                "{} task(s) failed: {}",
                failed.len(),
                failed.join(", ")
            ));
        }

        let reported: HashSet<&str> = reports.iter().map(|r| r.task_id.as_str()).collect();
        let missing: Vec<_> = completed
            .iter()
            .filter(|t| !reported.contains(t.task_id.as_str()))
            .map(|t| t.task_id.as_str())
            .collect();
        if !missing.is_empty() {
            issues.push(format!("Missing reports for task(s): {}", missing.join(", ")));
        }

        let in_progress = tasks.iter().filter(|t| !t.status.is_terminal()).count();
        if in_progress > 0 {
            issues.push(format!("{in_progress} task(s) still in progress"));
        }

        let auditor_tasks: HashSet<&str> = tasks
            .iter()
            .filter(|t| t.assignee == WorkerRole::Auditor)
            .map(|t| t.task_id.as_str())
            .collect();
        let auditor_report = reports
            .iter()
            .rev()
            .find(|r| auditor_tasks.contains(r.task_id.as_str()));
        let auditor_verdict = auditor_report.and_then(verdict_of);
        if let (Some(report), Some(GateVerdict::Fail)) = (auditor_report, auditor_verdict) {
            for finding in &report.findings {
                issues.push(format!(
                    "Auditor: {} (evidence: {})",
                    finding.claim, finding.evidence
                ));
            }
            for action in &report.next_actions {
                issues.push(format!("Fix required: {action}"));
            }
        }

        let passed = issues.is_empty()
            && !completed.is_empty()
            && completed.len() == tasks.len()
            && auditor_verdict != Some(GateVerdict::Fail);

        Ok(GateResult {
            passed,
            phase,
            total_tasks: tasks.len(),
            completed_tasks: completed.len(),
            reports_received: reports.len(),
            issues,
            auditor_verdict,
        })
    }
}

/// The structured verdict, else FAIL/PASS found in the summary. FAIL wins.
fn verdict_of(report: &Report) -> Option<GateVerdict> {
    if report.gate_verdict.is_some() {
        return report.gate_verdict;
    }
    let summary = report.summary.to_uppercase();
    if summary.contains("FAIL") {
        Some(GateVerdict::Fail)
    } else if summary.contains("PASS") {
        Some(GateVerdict::Pass)
    } else {
        None
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use cadence_core::{Finding, Job, JobInput, JobStatus, Task, TaskInput};
    use cadence_store::MemoryStateStore;

    struct Fixture {
        store: Arc<dyn StateStore>,
        gate: QualityGate,
        job: Job,
    }

    async fn fixture() -> Fixture {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let mut job = Job::new(JobInput::new("p", "/tmp/r")).unwrap();
        job.status = JobStatus::Aggregating;
        job.current_phase = Some(Phase::Spec);
        job.phase_round = 1;
        store.create_job(&job).await.unwrap();
        Fixture {
            gate: QualityGate::new(store.clone()),
            store,
            job,
        }
    }

    impl Fixture {
        async fn task(&self, role: WorkerRole, status: TaskStatus, round: u32) -> Task {
            let task = Task::new(TaskInput {
                job_id: self.job.job_id.clone(),
                assignee: role,
                phase: Phase::Spec,
                round,
                objective: "o".into(),
                inputs: vec![],
                constraints: vec![],
                acceptance_criteria: vec![],
            });
            let task = task.advance_to(status).unwrap();
            self.store.create_task(&task).await.unwrap();
            task
        }

        async fn report(&self, task: &Task, summary: &str, verdict: Option<GateVerdict>) {
            let report = Report::for_task(task, summary).with_gate_verdict(verdict);
            self.store.create_report(&report).await.unwrap();
        }

        async fn check(&self) -> GateResult {
            self.gate.check(&self.job.job_id, Phase::Spec).await.unwrap()
        }
    }

    #[tokio::test]
    async fn test_all_completed_with_reports_passes() {
        let f = fixture().await;
        for n in 1..=2 {
            let t = f.task(WorkerRole::Worker(n), TaskStatus::Completed, 1).await;
            f.report(&t, "done", None).await;
        }
        let result = f.check().await;
        assert!(result.passed, "{:?}", result.issues);
        assert_eq!(result.total_tasks, 2);
        assert_eq!(result.reports_received, 2);
    }

    #[tokio::test]
    async fn test_zero_tasks_never_passes() {
        let f = fixture().await;
        let result = f.check().await;
        assert!(!result.passed);
        assert!(result.issues.is_empty());
    }

    #[tokio::test]
    async fn test_running_task_is_still_in_progress() {
        let f = fixture().await;
        let done = f.task(WorkerRole::Worker(1), TaskStatus::Completed, 1).await;
        f.report(&done, "done", None).await;
        f.task(WorkerRole::Worker(2), TaskStatus::Running, 1).await;

        let result = f.check().await;
        assert!(!result.passed);
        assert_eq!(result.issues, vec!["1 task(s) still in progress".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_and_missing_reports_are_issues() {
        let f = fixture().await;
        let failed = f.task(WorkerRole::Worker(1), TaskStatus::Failed, 1).await;
        let silent = f.task(WorkerRole::Worker(2), TaskStatus::Completed, 1).await;

        let result = f.check().await;
        assert!(!result.passed);
        assert_eq!(
            result.issues,
            vec![
                format!("1 task(s) failed: {}", failed.task_id),
                format!("Missing reports for task(s): {}", silent.task_id),
            ]
        );
    }

    #[tokio::test]
    async fn test_auditor_fail_blocks_and_lists_fixes() {
        let f = fixture().await;
        let worker = f.task(WorkerRole::Worker(1), TaskStatus::Completed, 1).await;
        f.report(&worker, "done", None).await;
        let auditor = f.task(WorkerRole::Auditor, TaskStatus::Completed, 1).await;
        let mut report = Report::for_task(&auditor, "Review").with_gate_verdict(Some(GateVerdict::Fail));
        report.findings.push(Finding::new("Missing tests", "no test dir", 0.9));
        report.next_actions.push("Add tests".into());
        f.store.create_report(&report).await.unwrap();

        let result = f.check().await;
        assert!(!result.passed);
        assert!(result.auditor_failed());
        assert_eq!(
            result.issues,
            vec![
                "Auditor: Missing tests (evidence: no test dir)".to_string(),
                "Fix required: Add tests".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_auditor_verdict_from_summary() {
        let f = fixture().await;
        let auditor = f.task(WorkerRole::Auditor, TaskStatus::Completed, 1).await;
        f.report(&auditor, "Verdict: pass, all good", None).await;
        let result = f.check().await;
        assert!(result.passed);
        assert_eq!(result.auditor_verdict, Some(GateVerdict::Pass));
    }

    #[tokio::test]
    async fn test_previous_round_is_ignored() {
        let f = fixture().await;
        f.task(WorkerRole::Worker(1), TaskStatus::Failed, 0).await;
        let current = f.task(WorkerRole::Worker(1), TaskStatus::Completed, 1).await;
        f.report(&current, "done", None).await;
        assert!(f.check().await.passed);
    }
}
