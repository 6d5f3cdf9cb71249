use crate::aggregator::Aggregator;
use crate::backend::WorkerBackend;
use crate::bus::EventBus;
use crate::config::OrchestratorConfig;
use crate::events::{Event, EventKind};
use crate::gate::QualityGate;
use crate::ledger::Ledger;
use crate::planner::PhasePlanner;
use crate::retry::RetryManager;
use crate::scheduler::Scheduler;
use crate::watcher::TaskWatcher;
use cadence_core::{
    truncate_chars, CadenceError, CadenceResult, ErrorClass, Job, JobStatus, TaskStatus,
    TraceActor, TraceEntry, TraceEventType,
};
use cadence_git::{ArtifactFile, DevelopLock, GitOps};
use cadence_store::StateStore;
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Statuses the control loop acts on, in the order a tick visits them.
const STEPPED: [JobStatus; 8] = [
    JobStatus::Received,
    JobStatus::Planning,
    JobStatus::Dispatched,
    JobStatus::Running,
    JobStatus::Aggregating,
    JobStatus::Approved,
    JobStatus::Committing,
    JobStatus::WaitingRetry,
];

/// The control loop.
///
/// Each [`tick`](Self::tick) takes one snapshot of every job in a stepped
/// status and advances each by at most one handler, so a job never moves
/// through two phases within the same tick. [`run`](Self::run) ticks on a
/// fixed interval and additionally whenever a task finishes or a reviewer
/// acts, which keeps latency low without busy polling.
///
/// Failures inside a handler never escape the loop: they are routed to the
/// [`RetryManager`], which parks the job in WAITING_RETRY or fails it.
pub struct Orchestrator {
    config: OrchestratorConfig,
    ledger: Ledger,
    scheduler: Scheduler,
    retry: RetryManager,
    gate: QualityGate,
    aggregator: Aggregator,
    planner: PhasePlanner,
    watcher: TaskWatcher,
    backend: Arc<dyn WorkerBackend>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<dyn StateStore>,
        bus: EventBus,
        backend: Arc<dyn WorkerBackend>,
    ) -> Self {
        let ledger = Ledger::new(store.clone(), bus);
        Self {
            scheduler: Scheduler::new(ledger.clone(), config.max_jobs),
            retry: RetryManager::new(config.retry.clone(), ledger.clone()),
            gate: QualityGate::new(store.clone()),
            aggregator: Aggregator::new(store),
            planner: PhasePlanner::new(config.researcher, config.auditor),
            watcher: TaskWatcher::new(&config.tmp_dir, config.watcher.clone(), ledger.clone()),
            backend,
            ledger,
            config,
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn retry_manager(&self) -> &RetryManager {
        &self.retry
    }

    pub fn watcher(&self) -> &TaskWatcher {
        &self.watcher
    }

    // --- Lifecycle ---

    /// Move jobs whose workers died with the previous process to
    /// WAITING_RETRY. Returns how many jobs were recovered.
    pub async fn recover(&self) -> CadenceResult<usize> {
        let stale = self
            .ledger
            .store()
            .jobs_in(&[JobStatus::Running, JobStatus::Dispatched])
            .await?;
        for job in &stale {
            let from = job.status;
            let trace = TraceEntry::new(
                &job.job_id,
                TraceActor::System,
                TraceEventType::Retry,
                format!("Orchestrator restart recovery: {from} -> WAITING_RETRY"),
            );
            self.ledger
                .move_job_with(job, JobStatus::WaitingRetry, Some(trace), |next| {
                    next.last_error = Some(format!(
                        "Recovered from {from} after orchestrator restart"
                    ));
                    next.error_class = Some(ErrorClass::Transient);
                    next.resume_status = Some(JobStatus::Planning);
                })
                .await?;
            warn!(job_id = %job.job_id, from = %from, "Recovered job after restart");
        }
        Ok(stale.len())
    }

    /// Recover, then tick until `shutdown` resolves.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> CadenceResult<()> {
        let recovered = self.recover().await?;
        info!(
            recovered,
            max_jobs = self.scheduler.max_jobs(),
            poll_ms = self.config.poll_interval.as_millis() as u64,
            "Orchestrator started"
        );

        let mut events = self.ledger.bus().subscribe("*");
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => self.tick_logged().await,
                Some(event) = events.recv() => {
                    let mut wake = self.on_event(&event).await;
                    while let Ok(event) = events.try_recv() {
                        wake |= self.on_event(&event).await;
                    }
                    if wake {
                        self.tick_logged().await;
                    }
                }
            }
        }

        self.watcher.close();
        info!("Orchestrator stopped");
        Ok(())
    }

    /// Promote a queued job if there is room, then advance every job by one
    /// step.
    pub async fn tick(&self) -> CadenceResult<()> {
        if let Some(job) = self.scheduler.dequeue_next().await? {
            debug!(job_id = %job.job_id, "Dequeued job");
        }
        let jobs = self.ledger.store().jobs_in(&STEPPED).await?;
        for job in jobs {
            if let Err(e) = self.step(&job).await {
                self.handle_failure(&job, e).await;
            }
        }
        self.release_finished().await
    }

    /// Release watched jobs that reached a terminal status without this
    /// process seeing the transition, e.g. a cancel issued by another
    /// process sharing the state directory.
    async fn release_finished(&self) -> CadenceResult<()> {
        for job_id in self.watcher.watched_jobs() {
            let finished = match self.ledger.store().get_job(&job_id).await {
                Ok(job) => job.status.is_terminal(),
                Err(e) if e.is_not_found() => true,
                Err(e) => return Err(e.into()),
            };
            if finished {
                info!(job_id = %job_id, "Releasing finished job");
                self.release_job(&job_id).await;
            }
        }
        Ok(())
    }

    async fn tick_logged(&self) {
        if let Err(e) = self.tick().await {
            error!(error = %e, "Orchestrator tick failed");
        }
    }

    /// React to a bus event. Returns whether it warrants an early tick.
    async fn on_event(&self, event: &Event) -> bool {
        match &event.kind {
            EventKind::JobStatusChanged { to, .. } if to.is_terminal() => {
                self.release_job(&event.job_id).await;
                false
            }
            EventKind::JobCreated
            | EventKind::TaskDone { .. }
            | EventKind::TaskError { .. }
            | EventKind::PhaseApproved { .. }
            | EventKind::PhaseRejected { .. } => true,
            _ => false,
        }
    }

    async fn step(&self, job: &Job) -> CadenceResult<()> {
        match job.status {
            JobStatus::Received => self.scheduler.schedule_job(job).await.map(drop),
            JobStatus::Planning => self.handle_planning(job).await,
            JobStatus::Dispatched => self.handle_dispatched(job).await,
            JobStatus::Running => self.handle_running(job).await,
            JobStatus::Aggregating => self.handle_aggregating(job).await,
            JobStatus::Approved => {
                let committing = self.ledger.move_job(job, JobStatus::Committing, None).await?;
                self.handle_committing(&committing).await
            }
            JobStatus::Committing => self.handle_committing(job).await,
            JobStatus::WaitingRetry => self.handle_waiting_retry(job).await,
            _ => Ok(()),
        }
    }

    // --- Handlers ---

    /// Start a new planning round for the job's current phase.
    async fn handle_planning(&self, job: &Job) -> CadenceResult<()> {
        let phase = job.phase();
        let round = job.phase_round + 1;
        let store = self.ledger.store();

        for task in store.list_tasks(&job.job_id).await? {
            if !task.status.is_terminal() {
                self.ledger.move_task(&task, TaskStatus::Canceled).await?;
                debug!(job_id = %job.job_id, task_id = %task.task_id, "Canceled superseded task");
            }
        }

        let mut planned = job.clone();
        planned.current_phase = Some(phase);
        planned.phase_round = round;
        let tasks = self.planner.plan(store.as_ref(), &planned).await?;
        for task in &tasks {
            self.ledger.emit(
                &job.job_id,
                EventKind::TaskCreated {
                    task_id: task.task_id.clone(),
                    assignee: task.assignee,
                },
            );
        }

        let trace = TraceEntry::new(
            &job.job_id,
            TraceActor::Planner,
            TraceEventType::Dispatched,
            format!("Dispatched {} tasks for {phase} phase", tasks.len()),
        );
        self.ledger
            .move_job_with(job, JobStatus::Dispatched, Some(trace), |next| {
                next.current_phase = Some(phase);
                next.phase_round = round;
            })
            .await?;
        Ok(())
    }

    /// Launch every pending task of the current round.
    async fn handle_dispatched(&self, job: &Job) -> CadenceResult<()> {
        let pending: Vec<_> = self
            .ledger
            .store()
            .list_tasks(&job.job_id)
            .await?
            .into_iter()
            .filter(|t| {
                t.phase == job.phase()
                    && t.round == job.phase_round
                    && t.status == TaskStatus::Pending
            })
            .collect();

        self.watcher.watch_job(&job.job_id).await?;
        for task in &pending {
            self.ledger.ensure_job_status(job).await?;
            let assigned = self.ledger.move_task(task, TaskStatus::Assigned).await?;
            if let Err(e) = self.backend.launch_task(job, &assigned).await {
                self.release_job(&job.job_id).await;
                return Err(e);
            }
            let running = self.ledger.move_task(&assigned, TaskStatus::Running).await?;
            self.ledger
                .trace(
                    TraceEntry::new(
                        &job.job_id,
                        running.assignee.into(),
                        TraceEventType::Started,
                        format!("Task started: {}", truncate_chars(&running.objective, 100)),
                    )
                    .with_task(&running.task_id),
                )
                .await?;
        }

        self.ledger.move_job(job, JobStatus::Running, None).await?;
        Ok(())
    }

    /// Wait until every task of the current round is terminal.
    async fn handle_running(&self, job: &Job) -> CadenceResult<()> {
        self.watcher.watch_job(&job.job_id).await?;
        let done = self
            .watcher
            .are_all_tasks_done(&job.job_id, job.phase(), job.phase_round)
            .await?;
        if !done {
            return Ok(());
        }
        self.release_job(&job.job_id).await;
        self.ledger.move_job(job, JobStatus::Aggregating, None).await?;
        Ok(())
    }

    /// Gate the phase, then aggregate and ask for approval.
    async fn handle_aggregating(&self, job: &Job) -> CadenceResult<()> {
        let phase = job.phase();
        let gate = self.gate.check(&job.job_id, phase).await?;

        if !gate.passed {
            let message = format!("Quality gate failed: {}", gate.issues.join("; "));
            self.ledger
                .trace(TraceEntry::new(
                    &job.job_id,
                    TraceActor::System,
                    TraceEventType::GateFail,
                    truncate_chars(&message, 200),
                ))
                .await?;
            warn!(job_id = %job.job_id, phase = %phase, issues = gate.issues.len(), "Quality gate failed");

            if !gate.auditor_failed() {
                self.retry.apply_retry(job, &message, None).await?;
                return Ok(());
            }
            let mut counted = job.clone();
            counted.gate_failures += 1;
            self.ledger.update_job(&counted).await?;
            let class = if counted.gate_failures >= self.config.max_gate_failures {
                warn!(
                    job_id = %job.job_id,
                    gate_failures = counted.gate_failures,
                    "Rework limit reached"
                );
                Some(ErrorClass::Permanent)
            } else {
                None
            };
            self.retry.apply_retry(&counted, &message, class).await?;
            return Ok(());
        }

        self.ledger
            .trace(TraceEntry::new(
                &job.job_id,
                TraceActor::System,
                TraceEventType::GatePass,
                format!(
                    "Quality gate passed for {phase}: {}/{} tasks completed",
                    gate.completed_tasks, gate.total_tasks
                ),
            ))
            .await?;

        let aggregated = self.aggregator.aggregate(&job.job_id, phase).await?;
        let trace = TraceEntry::new(
            &job.job_id,
            TraceActor::Planner,
            TraceEventType::Aggregated,
            format!(
                "Aggregated {} reports for {phase}. Risks: {}, Contradictions: {}",
                aggregated.report_count,
                aggregated.all_risks.len(),
                aggregated.contradictions.len()
            ),
        );
        self.ledger
            .move_job(job, JobStatus::WaitingApproval, Some(trace))
            .await?;
        self.ledger.emit(
            &job.job_id,
            EventKind::PhaseAwaitingApproval {
                phase,
                diff_summary: truncate_chars(&aggregated.combined_summary, 500),
            },
        );
        info!(job_id = %job.job_id, phase = %phase, "Phase awaiting approval");
        Ok(())
    }

    /// Commit and merge the approved phase under the develop lock, then move
    /// on to the next phase or complete the job.
    async fn handle_committing(&self, job: &Job) -> CadenceResult<()> {
        let phase = job.phase();
        let artifact = job.artifacts.for_phase(phase).to_string();

        let lock = DevelopLock::acquire(&job.repo_root, &self.config.git.lock_options()).await?;
        let result = self.commit_and_merge(job, &artifact).await;
        lock.release();
        let (commit, merge) = result?;

        let committed = TraceEntry::new(
            &job.job_id,
            TraceActor::Git,
            TraceEventType::Committed,
            format!("Committed and merged {phase} phase to develop"),
        )
        .with_commit(&merge)
        .with_artifact(&artifact);
        let record_git = |next: &mut Job| {
            next.git.last_commit = Some(commit.clone());
            next.git.last_merge = Some(merge.clone());
        };

        match phase.next() {
            Some(next_phase) => {
                self.ledger.trace(committed).await?;
                self.ledger
                    .move_job_with(job, JobStatus::Planning, None, |next| {
                        record_git(next);
                        next.current_phase = Some(next_phase);
                        next.gate_failures = 0;
                        next.last_rejection = None;
                    })
                    .await?;
                info!(job_id = %job.job_id, from = %phase, to = %next_phase, "Phase advanced");
            }
            None => {
                self.ledger.trace(committed).await?;
                let done = TraceEntry::new(
                    &job.job_id,
                    TraceActor::System,
                    TraceEventType::Completed,
                    "All phases completed successfully",
                );
                self.ledger
                    .move_job_with(job, JobStatus::Completed, Some(done), record_git)
                    .await?;
                self.ledger.emit(&job.job_id, EventKind::JobCompleted);
                info!(job_id = %job.job_id, "Job completed");
            }
        }
        Ok(())
    }

    async fn commit_and_merge(&self, job: &Job, artifact: &str) -> CadenceResult<(String, String)> {
        let phase = job.phase();
        let git = GitOps::new(
            &job.repo_root,
            &job.git.main_branch,
            &job.git.develop_branch,
        );
        git.ensure_develop_branch().await?;
        if !git.branch_exists(&job.git.job_branch)? {
            git.create_job_branch(&job.git.job_branch).await?;
        }

        let fallback = self
            .aggregator
            .aggregate(&job.job_id, phase)
            .await?
            .to_markdown(&job.job_id);
        let commit = git
            .commit_artifacts(
                &job.git.job_branch,
                &format!("[{}] {phase} phase artifacts", job.job_id),
                &[ArtifactFile::with_fallback(artifact, fallback)],
            )
            .await?;
        let merge = git
            .merge_job_to_develop(
                &job.git.job_branch,
                &format!("Merge {} ({phase} phase)", job.git.job_branch),
            )
            .await?;
        Ok((commit, merge))
    }

    /// Resume a WAITING_RETRY job once its backoff has elapsed.
    async fn handle_waiting_retry(&self, job: &Job) -> CadenceResult<()> {
        if !self.retry.is_ready(job, Utc::now()) {
            return Ok(());
        }
        let resume = job.resume_status.unwrap_or(JobStatus::Planning);
        let trace = TraceEntry::new(
            &job.job_id,
            TraceActor::System,
            TraceEventType::Retry,
            format!("Retry {}: resuming from WAITING_RETRY", job.retry_count),
        );
        self.ledger
            .move_job_with(job, resume, Some(trace), |next| next.resume_status = None)
            .await?;
        Ok(())
    }

    // --- Failures ---

    /// Route a handler error to the retry manager.
    async fn handle_failure(&self, job: &Job, err: CadenceError) {
        let current = match self.ledger.store().get_job(&job.job_id).await {
            Ok(current) => current,
            Err(e) => {
                error!(job_id = %job.job_id, error = %err, reload_error = %e, "Job step failed");
                return;
            }
        };
        if current.status.is_terminal() {
            debug!(job_id = %job.job_id, status = %current.status, "Job finished during step");
            self.release_job(&job.job_id).await;
            return;
        }
        if matches!(err, CadenceError::Transition(_)) {
            error!(job_id = %job.job_id, status = %current.status, error = %err, "Job step raced");
            return;
        }

        let class = match &err {
            CadenceError::Git(_)
            | CadenceError::Lock(_)
            | CadenceError::Store(_)
            | CadenceError::Io(_) => Some(err.error_class()),
            _ => None,
        };
        warn!(job_id = %job.job_id, status = %current.status, error = %err, "Job step failed");
        if let Err(e) = self.retry.apply_retry(&current, &err.to_string(), class).await {
            error!(job_id = %job.job_id, error = %e, "Failed to record job failure");
        }
        self.release_job(&job.job_id).await;
    }

    /// Stop watching a job, tear down its workers and forget its
    /// idempotency keys.
    async fn release_job(&self, job_id: &str) {
        self.watcher.unwatch_job(job_id);
        self.ledger.bus().forget_keys(&format!("{job_id}:"));
        if let Err(e) = self.backend.cleanup(job_id).await {
            warn!(job_id = %job_id, error = %e, "Worker cleanup failed");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::backend::job_dir;
    use crate::config::WatcherConfig;
    use crate::service::JobService;
    use async_trait::async_trait;
    use cadence_core::{JobInput, Task};
    use cadence_store::MemoryStateStore;
    use parking_lot::Mutex;
    use std::sync::OnceLock;
    use std::time::Duration;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Recording {
        launched: Mutex<Vec<String>>,
        cleaned: Mutex<Vec<String>>,
        fail: bool,
        /// Cancels the job from inside the first launch.
        cancel_with: OnceLock<JobService>,
    }

    #[async_trait]
    impl WorkerBackend for Recording {
        async fn launch_task(&self, job: &Job, task: &Task) -> CadenceResult<()> {
            if self.fail {
                return Err(CadenceError::Orchestrator(
                    "Failed to launch worker 'nope': No such file or directory".into(),
                ));
            }
            self.launched.lock().push(task.task_id.clone());
            if let Some(service) = self.cancel_with.get() {
                service.cancel_job(&job.job_id).await?;
            }
            Ok(())
        }

        async fn cleanup(&self, job_id: &str) -> CadenceResult<()> {
            self.cleaned.lock().push(job_id.to_string());
            Ok(())
        }
    }

    fn orchestrator(tmp: &TempDir, backend: Arc<Recording>) -> (Orchestrator, Arc<dyn StateStore>) {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let config = OrchestratorConfig {
            max_jobs: 2,
            tmp_dir: tmp.path().join("tmp"),
            poll_interval: Duration::from_millis(50),
            watcher: WatcherConfig {
                use_polling: true,
                poll_interval_ms: 50,
            },
            ..Default::default()
        };
        (
            Orchestrator::new(config, store.clone(), EventBus::new(), backend),
            store,
        )
    }

    async fn job_in(store: &Arc<dyn StateStore>, status: JobStatus) -> Job {
        let mut job = Job::new(JobInput::new("Build it", "/tmp/repo")).unwrap();
        job.status = status;
        job.current_phase = Some(cadence_core::Phase::Spec);
        store.create_job(&job).await.unwrap();
        job
    }

    #[tokio::test]
    async fn test_recover_moves_stale_jobs() {
        let tmp = TempDir::new().unwrap();
        let (orch, store) = orchestrator(&tmp, Arc::new(Recording::default()));
        let running = job_in(&store, JobStatus::Running).await;
        let waiting = job_in(&store, JobStatus::WaitingApproval).await;

        assert_eq!(orch.recover().await.unwrap(), 1);
        let job = store.get_job(&running.job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::WaitingRetry);
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.error_class, Some(ErrorClass::Transient));
        assert_eq!(
            job.last_error.as_deref(),
            Some("Recovered from RUNNING after orchestrator restart")
        );
        let traces = store.traces(&running.job_id).await.unwrap();
        assert_eq!(
            traces[0].payload_summary,
            "Orchestrator restart recovery: RUNNING -> WAITING_RETRY"
        );
        assert_eq!(
            store.get_job(&waiting.job_id).await.unwrap().status,
            JobStatus::WaitingApproval
        );
    }

    #[tokio::test]
    async fn test_tick_plans_and_launches() {
        let tmp = TempDir::new().unwrap();
        let backend = Arc::new(Recording::default());
        let (orch, store) = orchestrator(&tmp, backend.clone());
        let job = job_in(&store, JobStatus::Planning).await;

        orch.tick().await.unwrap();
        let planned = store.get_job(&job.job_id).await.unwrap();
        assert_eq!(planned.status, JobStatus::Dispatched);
        assert_eq!(planned.phase_round, 1);

        orch.tick().await.unwrap();
        let running = store.get_job(&job.job_id).await.unwrap();
        assert_eq!(running.status, JobStatus::Running);
        assert_eq!(backend.launched.lock().len(), 2);
        let tasks = store.list_tasks(&job.job_id).await.unwrap();
        assert!(tasks.iter().all(|t| t.status == TaskStatus::Running));
        orch.watcher().close();
    }

    #[tokio::test]
    async fn test_replan_cancels_superseded_tasks() {
        let tmp = TempDir::new().unwrap();
        let (orch, store) = orchestrator(&tmp, Arc::new(Recording::default()));
        let job = job_in(&store, JobStatus::Planning).await;
        orch.tick().await.unwrap();

        // Rework: back to PLANNING with round-1 tasks still pending.
        let mut again = store.get_job(&job.job_id).await.unwrap();
        again.status = JobStatus::Planning;
        store.update_job(&again).await.unwrap();
        orch.tick().await.unwrap();

        let tasks = store.list_tasks(&job.job_id).await.unwrap();
        assert_eq!(tasks.len(), 4);
        assert!(tasks
            .iter()
            .filter(|t| t.round == 1)
            .all(|t| t.status == TaskStatus::Canceled));
        assert!(tasks
            .iter()
            .filter(|t| t.round == 2)
            .all(|t| t.status == TaskStatus::Pending));
    }

    #[tokio::test]
    async fn test_launch_failure_is_permanent() {
        let tmp = TempDir::new().unwrap();
        let backend = Arc::new(Recording {
            fail: true,
            ..Default::default()
        });
        let (orch, store) = orchestrator(&tmp, backend);
        let job = job_in(&store, JobStatus::Planning).await;

        orch.tick().await.unwrap();
        orch.tick().await.unwrap();
        let failed = store.get_job(&job.job_id).await.unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error_class, Some(ErrorClass::Permanent));
        orch.watcher().close();
    }

    #[tokio::test]
    async fn test_waiting_retry_resumes_after_backoff() {
        let tmp = TempDir::new().unwrap();
        let (orch, store) = orchestrator(&tmp, Arc::new(Recording::default()));
        let mut job = job_in(&store, JobStatus::WaitingRetry).await;
        job.retry_count = 1;
        job.resume_status = Some(JobStatus::Committing);
        store.update_job(&job).await.unwrap();

        orch.tick().await.unwrap();
        assert_eq!(
            store.get_job(&job.job_id).await.unwrap().status,
            JobStatus::WaitingRetry
        );

        job.updated_at = Utc::now() - chrono::Duration::seconds(11);
        store.update_job(&job).await.unwrap();
        orch.tick().await.unwrap();
        let traces = store.traces(&job.job_id).await.unwrap();
        assert_eq!(traces[0].payload_summary, "Retry 1: resuming from WAITING_RETRY");
        let resumed = store.get_job(&job.job_id).await.unwrap();
        assert_eq!(resumed.status, JobStatus::Committing);
        assert_eq!(resumed.resume_status, None);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let tmp = TempDir::new().unwrap();
        let (orch, store) = orchestrator(&tmp, Arc::new(Recording::default()));
        let job = job_in(&store, JobStatus::Planning).await;

        let shutdown = tokio::time::sleep(Duration::from_millis(300));
        tokio::time::timeout(Duration::from_secs(10), orch.run(shutdown))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            store.get_job(&job.job_id).await.unwrap().status,
            JobStatus::Running
        );
    }
    #[tokio::test]
    async fn test_cancel_during_dispatch_stays_canceled() {
        let tmp = TempDir::new().unwrap();
        let backend = Arc::new(Recording::default());
        let (orch, store) = orchestrator(&tmp, backend.clone());
        let service = JobService::new(orch.ledger().clone(), &OrchestratorConfig::default());
        assert!(backend.cancel_with.set(service).is_ok());
        let job = job_in(&store, JobStatus::Planning).await;

        orch.tick().await.unwrap();
        orch.tick().await.unwrap();

        let job = store.get_job(&job.job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Canceled);
        assert_eq!(backend.launched.lock().len(), 1);
        assert!(backend.cleaned.lock().contains(&job.job_id));
        assert!(!orch.watcher().is_watching(&job.job_id));

        let tasks = store.list_tasks(&job.job_id).await.unwrap();
        assert!(tasks.iter().all(|t| t.status == TaskStatus::Canceled));
        let traces = store.traces(&job.job_id).await.unwrap();
        assert!(traces
            .iter()
            .all(|t| t.event_type != TraceEventType::Started));
    }

    #[tokio::test]
    async fn test_cancel_from_another_service_releases_running_job() {
        let tmp = TempDir::new().unwrap();
        let backend = Arc::new(Recording::default());
        let (orch, store) = orchestrator(&tmp, backend.clone());
        let job = job_in(&store, JobStatus::Planning).await;
        orch.tick().await.unwrap();
        orch.tick().await.unwrap();
        let snapshot = store.get_job(&job.job_id).await.unwrap();
        assert_eq!(snapshot.status, JobStatus::Running);
        assert!(orch.watcher().is_watching(&job.job_id));

        // Same store, separate ledger and bus: nothing reaches this engine's bus.
        let remote = JobService::new(
            Ledger::new(store.clone(), EventBus::new()),
            &OrchestratorConfig::default(),
        );
        remote.cancel_job(&job.job_id).await.unwrap();

        orch.tick().await.unwrap();
        assert!(backend.cleaned.lock().contains(&job.job_id));
        assert!(!orch.watcher().is_watching(&job.job_id));

        // A step that started from the RUNNING snapshot cannot undo the cancel.
        let err = orch.handle_running(&snapshot).await.unwrap_err();
        assert!(matches!(err, CadenceError::Transition(_)));
        assert_eq!(
            store.get_job(&job.job_id).await.unwrap().status,
            JobStatus::Canceled
        );
        orch.watcher().close();
    }

    #[tokio::test]
    async fn test_release_forgets_idempotency_keys() {
        let tmp = TempDir::new().unwrap();
        let (orch, store) = orchestrator(&tmp, Arc::new(Recording::default()));
        let job = job_in(&store, JobStatus::Planning).await;
        orch.tick().await.unwrap();
        orch.tick().await.unwrap();

        let dir = job_dir(&tmp.path().join("tmp"), &job.job_id);
        let tasks = store.list_tasks(&job.job_id).await.unwrap();
        for task in &tasks {
            std::fs::write(dir.join(format!("{}.json", task.task_id)), r#"{"summary": "ok"}"#)
                .unwrap();
            std::fs::write(dir.join(format!("{}.done", task.task_id)), "").unwrap();
        }
        orch.watcher().scan_existing(&job.job_id).await.unwrap();
        let keys: Vec<String> = tasks
            .iter()
            .map(|t| format!("{}:{}:done", job.job_id, t.task_id))
            .collect();
        // The polling pump may hold a claim; wait for its emit.
        for _ in 0..100 {
            if keys.iter().all(|k| orch.ledger().bus().seen(k)) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(keys.iter().all(|k| orch.ledger().bus().seen(k)));

        orch.tick().await.unwrap();
        assert_eq!(
            store.get_job(&job.job_id).await.unwrap().status,
            JobStatus::Aggregating
        );
        assert!(keys.iter().all(|k| !orch.ledger().bus().seen(k)));
    }
}
