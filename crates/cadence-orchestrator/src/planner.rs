use cadence_core::{truncate_chars, CadenceResult, Job, Phase, Task, TaskInput, WorkerRole};
use cadence_store::StateStore;
use tracing::info;

/// Turns a job's current phase into concrete tasks.
///
/// spec: `[researcher] -> worker x N -> [auditor]`;
/// impl and test: `worker x N -> [auditor]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PhasePlanner {
    pub researcher: bool,
    pub auditor: bool,
}

impl PhasePlanner {
    pub fn new(researcher: bool, auditor: bool) -> Self {
        Self {
            researcher,
            auditor,
        }
    }

    /// Task inputs for `phase` of `job`, tagged with `round`.
    pub fn templates(&self, job: &Job, phase: Phase, round: u32) -> Vec<TaskInput> {
        let prompt = &job.user_prompt;
        let n = job.parallelism;
        let mut shared_inputs = vec![format!("User prompt: {}", truncate_chars(prompt, 500))];
        if let Some(reason) = &job.last_rejection {
            shared_inputs.push(format!("Rework requested: {reason}"));
        }

        let input = |assignee: WorkerRole,
                     objective: String,
                     inputs: Vec<String>,
                     mut constraints: Vec<String>,
                     acceptance_criteria: Vec<String>| {
            constraints.extend(job.constraints.iter().cloned());
            TaskInput {
                job_id: job.job_id.clone(),
                assignee,
                phase,
                round,
                objective,
                inputs,
                constraints,
                acceptance_criteria,
            }
        };

        let mut out = Vec::new();
        if phase == Phase::Spec && self.researcher {
            out.push(input(
                WorkerRole::Researcher,
                format!(
                    "Investigate the codebase and provide implementation analysis for: {}",
                    truncate_chars(prompt, 200)
                ),
                shared_inputs.clone(),
                strings(&["Do not make code changes", "Present at least 2 options"]),
                strings(&[
                    "Current architecture analysis provided",
                    "At least 2 implementation options compared",
                    "Recommendation with rationale given",
                    "Impact scope (files/modules) listed",
                ]),
            ));
        }

        for i in 1..=n {
            out.push(input(
                WorkerRole::Worker(i),
                format!("{phase} phase task {i}/{n}: {}", truncate_chars(prompt, 200)),
                shared_inputs.clone(),
                vec![format!("Phase: {phase}"), format!("Task {i} of {n}")],
                vec![
                    format!("Produce a valid {phase} artifact"),
                    "Follow project coding standards".into(),
                ],
            ));
        }

        if self.auditor {
            let mut inputs = shared_inputs;
            inputs.push(format!("Phase: {phase}"));
            out.push(input(
                WorkerRole::Auditor,
                format!("Quality gate review for {phase} phase: verify all outputs meet criteria"),
                inputs,
                strings(&[
                    "Must output PASS or FAIL verdict",
                    "FAIL must include specific fix instructions",
                ]),
                strings(&[
                    "Gate verdict (PASS/FAIL) provided",
                    "All checklist items evaluated",
                    "Fix instructions given for any failures",
                ]),
            ));
        }
        out
    }

    /// Create and persist PENDING tasks for the job's current phase and round.
    pub async fn plan(&self, store: &dyn StateStore, job: &Job) -> CadenceResult<Vec<Task>> {
        let phase = job.phase();
        let mut tasks = Vec::new();
        for input in self.templates(job, phase, job.phase_round) {
            let task = Task::new(input);
            store.create_task(&task).await?;
            tasks.push(task);
        }
        info!(
            job_id = %job.job_id,
            phase = %phase,
            round = job.phase_round,
            tasks = tasks.len(),
            "Planned phase"
        );
        Ok(tasks)
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use cadence_core::{JobInput, TaskStatus};
    use cadence_store::MemoryStateStore;

    fn job() -> Job {
        Job::new(
            JobInput::new("Build a todo app", "/tmp/repo")
                .with_parallelism(3)
                .with_constraint("No new dependencies"),
        )
        .unwrap()
    }

    #[test]
    fn test_workers_only_by_default() {
        let job = job();
        let tasks = PhasePlanner::default().templates(&job, Phase::Impl, 1);
        assert_eq!(tasks.len(), 3);
        assert_eq!(tasks[0].assignee, WorkerRole::Worker(1));
        assert_eq!(tasks[2].assignee, WorkerRole::Worker(3));
        assert_eq!(tasks[1].objective, "impl phase task 2/3: Build a todo app");
        assert_eq!(
            tasks[1].constraints,
            vec!["Phase: impl", "Task 2 of 3", "No new dependencies"]
        );
        assert_eq!(tasks[0].acceptance_criteria[0], "Produce a valid impl artifact");
        assert!(tasks.iter().all(|t| t.round == 1));
    }

    #[test]
    fn test_researcher_only_before_spec() {
        let job = job();
        let planner = PhasePlanner::new(true, true);
        let spec = planner.templates(&job, Phase::Spec, 0);
        assert_eq!(spec.len(), 5);
        assert_eq!(spec[0].assignee, WorkerRole::Researcher);
        assert_eq!(spec[4].assignee, WorkerRole::Auditor);
        assert!(spec[4].constraints.contains(&"Must output PASS or FAIL verdict".to_string()));

        let test = planner.templates(&job, Phase::Test, 0);
        assert_eq!(test.len(), 4);
        assert_eq!(test[3].assignee, WorkerRole::Auditor);
    }

    #[test]
    fn test_rejection_reason_reaches_workers() {
        let mut job = job();
        job.last_rejection = Some("Too vague".into());
        let tasks = PhasePlanner::default().templates(&job, Phase::Spec, 2);
        assert!(tasks[0].inputs.contains(&"Rework requested: Too vague".to_string()));
    }

    #[tokio::test]
    async fn test_plan_persists_pending_tasks() {
        let store = MemoryStateStore::new();
        let mut job = job();
        job.current_phase = Some(Phase::Spec);
        store.create_job(&job).await.unwrap();

        let tasks = PhasePlanner::default().plan(&store, &job).await.unwrap();
        assert_eq!(tasks.len(), 3);
        assert!(tasks.iter().all(|t| t.status == TaskStatus::Pending));
        assert_eq!(store.list_tasks(&job.job_id).await.unwrap().len(), 3);
    }
}
