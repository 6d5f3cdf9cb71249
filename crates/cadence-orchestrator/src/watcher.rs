use crate::backend::job_dir;
use crate::config::WatcherConfig;
use crate::events::{Event, EventKind};
use crate::ledger::Ledger;
use crate::parser::report_from_output;
use cadence_core::{
    truncate_chars, CadenceError, CadenceResult, Phase, StoreError, Task, TaskStatus,
    TraceEntry, TraceEventType,
};
use notify::{PollWatcher, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const DEFAULT_ERROR: &str = "Task execution error";

/// What a sentinel file announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sentinel {
    Done,
    Error,
}

impl Sentinel {
    fn suffix(self) -> &'static str {
        match self {
            Sentinel::Done => "done",
            Sentinel::Error => "error",
        }
    }

    /// `{task_id}.done` / `{task_id}.error`; hidden temp files are ignored.
    fn parse(path: &Path) -> Option<(Sentinel, String)> {
        let name = path.file_name()?.to_str()?;
        if name.starts_with('.') {
            return None;
        }
        let (task_id, ext) = name.rsplit_once('.')?;
        let kind = match ext {
            "done" => Sentinel::Done,
            "error" => Sentinel::Error,
            _ => return None,
        };
        (!task_id.is_empty()).then(|| (kind, task_id.to_string()))
    }
}

struct Inner {
    tmp_dir: PathBuf,
    config: WatcherConfig,
    ledger: Ledger,
    watchers: Mutex<HashMap<String, Box<dyn Watcher + Send>>>,
    /// Sentinel keys claimed by a handler. A key stays claimed once its task
    /// has been settled, so repeats are ignored.
    claimed: Mutex<HashSet<String>>,
}

/// Turns worker sentinel files into task transitions, reports and events.
///
/// Each watched job directory gets a file-system watcher (native or polling)
/// feeding a channel drained by a tokio task. Every sentinel is also picked
/// up by [`scan_existing`](Self::scan_existing), which runs when a watch
/// starts and may be called again at any time; claims and idempotent
/// emission make repeated sightings harmless.
#[derive(Clone)]
pub struct TaskWatcher {
    inner: Arc<Inner>,
}

impl TaskWatcher {
    pub fn new(tmp_dir: impl Into<PathBuf>, config: WatcherConfig, ledger: Ledger) -> Self {
        Self {
            inner: Arc::new(Inner {
                tmp_dir: tmp_dir.into(),
                config,
                ledger,
                watchers: Mutex::new(HashMap::new()),
                claimed: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn is_watching(&self, job_id: &str) -> bool {
        self.inner.watchers.lock().contains_key(job_id)
    }

    /// Jobs with an active watch.
    pub fn watched_jobs(&self) -> Vec<String> {
        self.inner.watchers.lock().keys().cloned().collect()
    }

    /// Start watching `{tmp}/{job_id}/`, creating it if needed, then scan
    /// sentinels that already exist.
    pub async fn watch_job(&self, job_id: &str) -> CadenceResult<()> {
        if self.is_watching(job_id) {
            return self.scan_existing(job_id).await;
        }
        let dir = job_dir(&self.inner.tmp_dir, job_id);
        tokio::fs::create_dir_all(&dir).await?;

        let (tx, mut rx) = mpsc::unbounded_channel::<PathBuf>();
        let handler = move |res: notify::Result<notify::Event>| match res {
            Ok(event) => {
                if matches!(
                    event.kind,
                    notify::EventKind::Create(_) | notify::EventKind::Modify(_)
                ) {
                    for path in event.paths {
                        let _ = tx.send(path);
                    }
                }
            }
            Err(e) => warn!(error = %e, "File watch error"),
        };

        let mut watcher: Box<dyn Watcher + Send> = if self.inner.config.use_polling {
            let config = notify::Config::default()
                .with_poll_interval(Duration::from_millis(self.inner.config.poll_interval_ms));
            Box::new(PollWatcher::new(handler, config).map_err(watch_error)?)
        } else {
            Box::new(notify::recommended_watcher(handler).map_err(watch_error)?)
                as Box<RecommendedWatcher>
        };
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(watch_error)?;
        self.inner.watchers.lock().insert(job_id.to_string(), watcher);

        // Ends when the watcher, and with it the sender, is dropped.
        let pump = self.clone();
        let pump_job = job_id.to_string();
        tokio::spawn(async move {
            while let Some(path) = rx.recv().await {
                if let Err(e) = pump.handle_path(&pump_job, &path).await {
                    warn!(job_id = %pump_job, path = %path.display(), error = %e, "Failed to handle sentinel");
                }
            }
            debug!(job_id = %pump_job, "Sentinel pump stopped");
        });

        info!(
            job_id = %job_id,
            dir = %dir.display(),
            polling = self.inner.config.use_polling,
            "Watching job directory"
        );
        self.scan_existing(job_id).await
    }

    /// Handle every sentinel already present in the job directory.
    pub async fn scan_existing(&self, job_id: &str) -> CadenceResult<()> {
        let dir = job_dir(&self.inner.tmp_dir, job_id);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            paths.push(entry.path());
        }
        paths.sort();
        for path in paths {
            self.handle_path(job_id, &path).await?;
        }
        Ok(())
    }

    /// Stop watching one job and forget its claims.
    pub fn unwatch_job(&self, job_id: &str) {
        if self.inner.watchers.lock().remove(job_id).is_some() {
            debug!(job_id = %job_id, "Stopped watching job directory");
        }
        let prefix = format!("{job_id}:");
        self.inner.claimed.lock().retain(|key| !key.starts_with(&prefix));
    }

    /// Stop every watch.
    pub fn close(&self) {
        self.inner.watchers.lock().clear();
        self.inner.claimed.lock().clear();
    }

    /// Whether every task of `phase` in planning round `round` is terminal.
    pub async fn are_all_tasks_done(
        &self,
        job_id: &str,
        phase: Phase,
        round: u32,
    ) -> CadenceResult<bool> {
        let tasks = self.inner.ledger.store().list_tasks(job_id).await?;
        Ok(tasks
            .iter()
            .filter(|t| t.phase == phase && t.round == round)
            .all(|t| t.status.is_terminal()))
    }

    // --- Sentinel handling ---

    async fn handle_path(&self, job_id: &str, path: &Path) -> CadenceResult<()> {
        let Some((kind, task_id)) = Sentinel::parse(path) else {
            return Ok(());
        };
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Ok(());
        }

        let key = format!("{job_id}:{task_id}:{}", kind.suffix());
        if !self.inner.claimed.lock().insert(key.clone()) {
            return Ok(());
        }

        let store = self.inner.ledger.store();
        let task = match store.get_task(job_id, &task_id).await {
            Ok(task) => task,
            Err(e) if e.is_not_found() => {
                warn!(job_id = %job_id, task_id = %task_id, "Sentinel for unknown task");
                return Ok(());
            }
            Err(e) => {
                self.inner.claimed.lock().remove(&key);
                return Err(e.into());
            }
        };

        if task.status != TaskStatus::Running {
            if !task.status.is_terminal() {
                // Not started yet as far as the store knows; a later scan
                // will retry.
                self.inner.claimed.lock().remove(&key);
            }
            return Ok(());
        }

        let result = match kind {
            Sentinel::Done => self.complete_task(&task, &key).await,
            Sentinel::Error => {
                let message = match tokio::fs::read_to_string(path).await {
                    Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
                    _ => DEFAULT_ERROR.to_string(),
                };
                self.fail_task(&task, &message).await
            }
        };
        if result.is_err() {
            self.inner.claimed.lock().remove(&key);
        }
        result
    }

    async fn complete_task(&self, task: &Task, key: &str) -> CadenceResult<()> {
        let output_path =
            job_dir(&self.inner.tmp_dir, &task.job_id).join(format!("{}.json", task.task_id));
        let raw = match tokio::fs::read_to_string(&output_path).await {
            Ok(raw) => raw,
            Err(e) => {
                return self
                    .fail_task(task, &format!("Failed to read output: {e}"))
                    .await;
            }
        };

        let (report, parse_error) = report_from_output(task, &raw);
        if let Some(e) = parse_error {
            warn!(
                job_id = %task.job_id,
                task_id = %task.task_id,
                error = %e,
                "Unparseable worker output, keeping raw text"
            );
        }
        match self.inner.ledger.store().create_report(&report).await {
            Ok(()) => {}
            Err(StoreError::AlreadyExists(_)) => {
                debug!(task_id = %task.task_id, "Report already stored");
            }
            Err(e) => return Err(e.into()),
        }

        self.inner
            .ledger
            .move_task(task, TaskStatus::Completed)
            .await?;
        self.inner
            .ledger
            .trace(
                TraceEntry::new(
                    &task.job_id,
                    task.assignee.into(),
                    TraceEventType::Reported,
                    format!("Task completed: {}", truncate_chars(&task.objective, 100)),
                )
                .with_task(&task.task_id),
            )
            .await?;
        info!(job_id = %task.job_id, task_id = %task.task_id, role = %task.assignee, "Task completed");

        self.inner.ledger.bus().emit_idempotent(
            key,
            Event::new(
                &task.job_id,
                EventKind::TaskDone {
                    task_id: task.task_id.clone(),
                    phase: task.phase,
                    role: task.assignee,
                },
            ),
        );
        Ok(())
    }

    async fn fail_task(&self, task: &Task, message: &str) -> CadenceResult<()> {
        self.inner.ledger.move_task(task, TaskStatus::Failed).await?;
        self.inner
            .ledger
            .trace(
                TraceEntry::new(
                    &task.job_id,
                    task.assignee.into(),
                    TraceEventType::Failed,
                    format!("Task failed: {}", truncate_chars(message, 200)),
                )
                .with_task(&task.task_id),
            )
            .await?;
        warn!(job_id = %task.job_id, task_id = %task.task_id, error = %message, "Task failed");

        self.inner.ledger.bus().emit_idempotent(
            format!("{}:{}:error", task.job_id, task.task_id),
            Event::new(
                &task.job_id,
                EventKind::TaskError {
                    task_id: task.task_id.clone(),
                    error: message.to_string(),
                },
            ),
        );
        Ok(())
    }
}

fn watch_error(e: notify::Error) -> CadenceError {
    CadenceError::Orchestrator(format!("Failed to watch job directory: {e}"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use cadence_core::{Job, JobInput, TaskInput, WorkerRole};
    use cadence_store::{MemoryStateStore, StateStore};
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        dir: PathBuf,
        store: Arc<dyn StateStore>,
        bus: EventBus,
        watcher: TaskWatcher,
        job: Job,
    }

    async fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let bus = EventBus::new();
        let ledger = Ledger::new(store.clone(), bus.clone());
        let watcher = TaskWatcher::new(
            tmp.path(),
            WatcherConfig {
                use_polling: true,
                poll_interval_ms: 50,
            },
            ledger,
        );
        let job = Job::new(JobInput::new("p", "/tmp/r")).unwrap();
        store.create_job(&job).await.unwrap();
        Fixture {
            dir: tmp.path().join(&job.job_id),
            _tmp: tmp,
            store,
            bus,
            watcher,
            job,
        }
    }

    impl Fixture {
        async fn task(&self, status: TaskStatus) -> Task {
            let task = Task::new(TaskInput {
                job_id: self.job.job_id.clone(),
                assignee: WorkerRole::Worker(1),
                phase: Phase::Spec,
                round: 0,
                objective: "Write the spec".into(),
                inputs: vec![],
                constraints: vec![],
                acceptance_criteria: vec![],
            })
            .advance_to(status)
            .unwrap();
            self.store.create_task(&task).await.unwrap();
            task
        }

        fn write(&self, name: &str, contents: &str) {
            std::fs::create_dir_all(&self.dir).unwrap();
            std::fs::write(self.dir.join(name), contents).unwrap();
        }

        async fn status(&self, task: &Task) -> TaskStatus {
            self.store
                .get_task(&self.job.job_id, &task.task_id)
                .await
                .unwrap()
                .status
        }
    }

    #[test]
    fn test_sentinel_names() {
        assert_eq!(
            Sentinel::parse(Path::new("/x/abc.done")),
            Some((Sentinel::Done, "abc".into()))
        );
        assert_eq!(
            Sentinel::parse(Path::new("abc.error")),
            Some((Sentinel::Error, "abc".into()))
        );
        assert_eq!(Sentinel::parse(Path::new("abc.json")), None);
        assert_eq!(Sentinel::parse(Path::new(".abc.done.tmp")), None);
        assert_eq!(Sentinel::parse(Path::new(".done")), None);
    }

    #[tokio::test]
    async fn test_existing_done_is_processed_once() {
        let f = fixture().await;
        let mut rx = f.bus.subscribe("task:*");
        let task = f.task(TaskStatus::Running).await;
        f.write(&format!("{}.json", task.task_id), r#"{"summary": "spec written"}"#);
        f.write(&format!("{}.done", task.task_id), "");

        f.watcher.watch_job(&f.job.job_id).await.unwrap();
        f.watcher.scan_existing(&f.job.job_id).await.unwrap();

        assert_eq!(f.status(&task).await, TaskStatus::Completed);
        let report = f.store.get_report(&f.job.job_id, &task.task_id).await.unwrap();
        assert_eq!(report.summary, "spec written");

        let traces = f.store.traces(&f.job.job_id).await.unwrap();
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0].event_type, TraceEventType::Reported);
        assert_eq!(traces[0].payload_summary, "Task completed: Write the spec");

        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            names.push(event.name());
        }
        assert_eq!(names, vec!["task:status_changed", "task:done"]);
        f.watcher.close();
    }

    #[tokio::test]
    async fn test_unparseable_output_keeps_raw_text() {
        let f = fixture().await;
        let task = f.task(TaskStatus::Running).await;
        f.write(&format!("{}.json", task.task_id), "plain prose answer");
        f.write(&format!("{}.done", task.task_id), "");

        f.watcher.scan_existing(&f.job.job_id).await.unwrap();
        let report = f.store.get_report(&f.job.job_id, &task.task_id).await.unwrap();
        assert_eq!(report.summary, "plain prose answer");
        assert_eq!(f.status(&task).await, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_missing_output_fails_task() {
        let f = fixture().await;
        let task = f.task(TaskStatus::Running).await;
        f.write(&format!("{}.done", task.task_id), "");

        f.watcher.scan_existing(&f.job.job_id).await.unwrap();
        assert_eq!(f.status(&task).await, TaskStatus::Failed);
        let traces = f.store.traces(&f.job.job_id).await.unwrap();
        assert!(traces[0].payload_summary.starts_with("Task failed: Failed to read output"));
    }

    #[tokio::test]
    async fn test_error_sentinel_message() {
        let f = fixture().await;
        let mut rx = f.bus.subscribe("task:error");
        let with_text = f.task(TaskStatus::Running).await;
        let empty = f.task(TaskStatus::Running).await;
        f.write(&format!("{}.error", with_text.task_id), "rate limit exceeded\n");
        f.write(&format!("{}.error", empty.task_id), "");

        f.watcher.scan_existing(&f.job.job_id).await.unwrap();
        assert_eq!(f.status(&with_text).await, TaskStatus::Failed);
        assert_eq!(f.status(&empty).await, TaskStatus::Failed);

        let mut errors = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let EventKind::TaskError { error, .. } = event.kind {
                errors.push(error);
            }
        }
        errors.sort();
        assert_eq!(errors, vec![DEFAULT_ERROR.to_string(), "rate limit exceeded".into()]);
    }

    #[tokio::test]
    async fn test_sentinel_before_running_is_retried() {
        let f = fixture().await;
        let task = f.task(TaskStatus::Assigned).await;
        f.write(&format!("{}.json", task.task_id), r#"{"summary": "fast"}"#);
        f.write(&format!("{}.done", task.task_id), "");

        f.watcher.scan_existing(&f.job.job_id).await.unwrap();
        assert_eq!(f.status(&task).await, TaskStatus::Assigned);

        let running = task.transition(TaskStatus::Running).unwrap();
        f.store.update_task(&running).await.unwrap();
        f.watcher.scan_existing(&f.job.job_id).await.unwrap();
        assert_eq!(f.status(&task).await, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_live_event_is_picked_up() {
        let f = fixture().await;
        let mut rx = f.bus.subscribe("task:done");
        let task = f.task(TaskStatus::Running).await;
        f.watcher.watch_job(&f.job.job_id).await.unwrap();
        assert!(f.watcher.is_watching(&f.job.job_id));

        f.write(&format!("{}.json", task.task_id), r#"{"summary": "live"}"#);
        f.write(&format!("{}.done", task.task_id), "");

        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.name(), "task:done");
        f.watcher.unwatch_job(&f.job.job_id);
        assert!(!f.watcher.is_watching(&f.job.job_id));
    }

    #[tokio::test]
    async fn test_all_tasks_done_per_round() {
        let f = fixture().await;
        f.task(TaskStatus::Completed).await;
        assert!(f.watcher.are_all_tasks_done(&f.job.job_id, Phase::Spec, 0).await.unwrap());
        f.task(TaskStatus::Running).await;
        assert!(!f.watcher.are_all_tasks_done(&f.job.job_id, Phase::Spec, 0).await.unwrap());
        assert!(f.watcher.are_all_tasks_done(&f.job.job_id, Phase::Spec, 1).await.unwrap());
    }
}
