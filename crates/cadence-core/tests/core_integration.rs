#![allow(clippy::unwrap_used, clippy::expect_used)]

use cadence_core::*;

fn job() -> Job {
    Job::new(
        JobInput::new("Add a login page", "/srv/repo")
            .with_parallelism(3)
            .with_constraint("no new dependencies"),
    )
    .unwrap()
}

// ---------------------------------------------------------------------------
// 1. Happy path through every phase
// ---------------------------------------------------------------------------

#[test]
fn test_job_walks_full_pipeline() {
    let mut job = job();
    for phase in Phase::ALL {
        job = job.transition(JobStatus::Planning).unwrap();
        assert_eq!(job.current_phase, Some(phase));
        for status in [
            JobStatus::Dispatched,
            JobStatus::Running,
            JobStatus::Aggregating,
            JobStatus::WaitingApproval,
            JobStatus::Approved,
            JobStatus::Committing,
        ] {
            job = job.transition(status).unwrap();
        }
        match phase.next() {
            Some(next) => job.current_phase = Some(next),
            None => job = job.transition(JobStatus::Completed).unwrap(),
        }
    }
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.current_phase, Some(Phase::Test));
    assert!(job.transition(JobStatus::Planning).is_err());
}

// ---------------------------------------------------------------------------
// 2. Rework and retry edges
// ---------------------------------------------------------------------------

#[test]
fn test_rejection_and_retry_edges() {
    let mut job = job();
    job.status = JobStatus::WaitingApproval;
    job.current_phase = Some(Phase::Impl);

    let reworked = job.transition(JobStatus::Planning).unwrap();
    assert_eq!(reworked.current_phase, Some(Phase::Impl));

    let mut committing = job.clone();
    committing.status = JobStatus::Committing;
    let waiting = committing.transition(JobStatus::WaitingRetry).unwrap();
    assert!(waiting.transition(JobStatus::Committing).is_ok());
    assert!(waiting.transition(JobStatus::Planning).is_ok());
    assert!(waiting.transition(JobStatus::Canceled).is_err());
}

// ---------------------------------------------------------------------------
// 3. Persisted shape survives a JSON roundtrip
// ---------------------------------------------------------------------------

#[test]
fn test_job_json_roundtrip_preserves_fields() {
    let mut job = job().transition(JobStatus::Planning).unwrap();
    job.set_error("connect ECONNREFUSED", ErrorClass::Transient);

    let json = serde_json::to_string_pretty(&job).unwrap();
    assert!(json.contains("\"status\": \"PLANNING\""));
    assert!(json.contains("\"error_class\": \"TRANSIENT\""));
    assert!(json.contains("\"impl\""));

    let back: Job = serde_json::from_str(&json).unwrap();
    assert_eq!(back, job);
    assert_eq!(back.constraints, vec!["no new dependencies".to_string()]);
}

// ---------------------------------------------------------------------------
// 4. Task and report agree on identity
// ---------------------------------------------------------------------------

#[test]
fn test_report_for_completed_task() {
    let job = job();
    let task = Task::new(TaskInput {
        job_id: job.job_id.clone(),
        assignee: WorkerRole::Auditor,
        phase: Phase::Spec,
        round: 1,
        objective: "audit".into(),
        inputs: vec![],
        constraints: job.constraints.clone(),
        acceptance_criteria: vec![],
    })
    .advance_to(TaskStatus::Completed)
    .unwrap();

    let mut report = Report::for_task(&task, "VERDICT: PASS").with_gate_verdict(Some(GateVerdict::Pass));
    report.findings.push(Finding::new("spec covers login", "section 2", 0.9));

    assert_eq!(report.job_id, job.job_id);
    assert_eq!(report.gate_verdict, Some(GateVerdict::Pass));

    let trace = TraceEntry::new(
        &job.job_id,
        TraceActor::from(task.assignee),
        TraceEventType::Reported,
        report.summary.clone(),
    )
    .with_task(&task.task_id);
    assert_eq!(trace.actor, TraceActor::Auditor);
    assert_eq!(trace.refs.task_id.as_deref(), Some(task.task_id.as_str()));
}
