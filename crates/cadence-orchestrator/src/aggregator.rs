use cadence_core::{CadenceError, CadenceResult, Finding, Phase, Report};
use cadence_store::StateStore;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt::Write as _;
use std::sync::Arc;

/// Decides whether two claims talk about the same thing.
pub trait ClaimSimilarity: Send + Sync {
    fn similar(&self, a: &str, b: &str) -> bool;
}

/// Word-overlap heuristic. Two claims are similar when more than half of the
/// smaller set of significant words (longer than three characters) appears
/// in the other claim. This is lexical only; it does not understand negation
/// or paraphrase.
#[derive(Debug, Clone, Copy, Default)]
pub struct LexicalOverlap;

impl LexicalOverlap {
    fn significant_words(text: &str) -> HashSet<String> {
        text.to_lowercase()
            .split_whitespace()
            .filter(|w| w.chars().count() > 3)
            .map(str::to_string)
            .collect()
    }
}

impl ClaimSimilarity for LexicalOverlap {
    fn similar(&self, a: &str, b: &str) -> bool {
        let words_a = Self::significant_words(a);
        let words_b = Self::significant_words(b);
        let min_size = words_a.len().min(words_b.len());
        if min_size == 0 {
            return false;
        }
        let overlap = words_a.intersection(&words_b).count();
        overlap as f64 / min_size as f64 > 0.5
    }
}

/// Findings whose confidence differs by more than this are in tension.
const CONFIDENCE_GAP: f64 = 0.5;

/// All reports of one phase merged into a single view.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregatedResult {
    pub phase: Phase,
    pub report_count: usize,
    pub combined_summary: String,
    pub findings: Vec<Finding>,
    pub all_risks: Vec<String>,
    pub contradictions: Vec<String>,
    pub next_actions: Vec<String>,
}

impl AggregatedResult {
    /// Markdown used as the phase artifact when workers did not write one.
    pub fn to_markdown(&self, job_id: &str) -> String {
        let mut out = format!("# {} phase summary for job {job_id}\n\n", self.phase);
        out.push_str(&self.combined_summary);
        out.push('\n');

        if !self.findings.is_empty() {
            out.push_str("\n## Findings\n\n");
            for f in &self.findings {
                let _ = writeln!(out, "- {} (confidence {}): {}", f.claim, f.confidence, f.evidence);
            }
        }
        for (title, items) in [
            ("Risks", &self.all_risks),
            ("Contradictions", &self.contradictions),
            ("Next actions", &self.next_actions),
        ] {
            if items.is_empty() {
                continue;
            }
            let _ = write!(out, "\n## {title}\n\n");
            for item in items {
                let _ = writeln!(out, "- {item}");
            }
        }
        out
    }
}

/// Merges worker reports for a phase and flags cross-report contradictions.
pub struct Aggregator {
    store: Arc<dyn StateStore>,
    similarity: Box<dyn ClaimSimilarity>,
}

impl Aggregator {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self::with_similarity(store, Box::new(LexicalOverlap))
    }

    pub fn with_similarity(store: Arc<dyn StateStore>, similarity: Box<dyn ClaimSimilarity>) -> Self {
        Self { store, similarity }
    }

    /// Aggregate the reports of `phase` from the job's current round.
    pub async fn aggregate(&self, job_id: &str, phase: Phase) -> CadenceResult<AggregatedResult> {
        let job = self.store.get_job(job_id).await?;
        let reports: Vec<Report> = self
            .store
            .list_reports(job_id)
            .await?
            .into_iter()
            .filter(|r| r.phase == phase && r.round == job.phase_round)
            .collect();
        if reports.is_empty() {
            return Err(CadenceError::Orchestrator(format!(
                "No reports found for job {job_id} phase {phase}"
            )));
        }
        Ok(self.merge(phase, &reports))
    }

    /// Merge already-loaded reports.
    pub fn merge(&self, phase: Phase, reports: &[Report]) -> AggregatedResult {
        let combined_summary = reports
            .iter()
            .enumerate()
            .map(|(i, r)| format!("[Report {}] {}", i + 1, r.summary))
            .collect::<Vec<_>>()
            .join("\n\n");

        AggregatedResult {
            phase,
            report_count: reports.len(),
            combined_summary,
            findings: reports.iter().flat_map(|r| r.findings.clone()).collect(),
            all_risks: dedup(reports.iter().flat_map(|r| r.risks.iter())),
            contradictions: self.detect_contradictions(reports),
            next_actions: dedup(reports.iter().flat_map(|r| r.next_actions.iter())),
        }
    }

    fn detect_contradictions(&self, reports: &[Report]) -> Vec<String> {
        let mut contradictions: Vec<String> = reports
            .iter()
            .flat_map(|r| r.contradictions.iter().cloned())
            .collect();

        let findings: Vec<(&str, &Finding)> = reports
            .iter()
            .flat_map(|r| r.findings.iter().map(move |f| (r.task_id.as_str(), f)))
            .collect();
        for (i, (task_a, a)) in findings.iter().enumerate() {
            for (task_b, b) in &findings[i + 1..] {
                if task_a == task_b {
                    continue;
                }
                if (a.confidence - b.confidence).abs() > CONFIDENCE_GAP
                    && self.similarity.similar(&a.claim, &b.claim)
                {
                    contradictions.push(format!(
                        "Confidence conflict: \"{}\" ({}) vs \"{}\" ({})",
                        a.claim, a.confidence, b.claim, b.confidence
                    ));
                }
            }
        }
        contradictions
    }
}

/// First occurrence wins; order preserved.
fn dedup<'a>(items: impl Iterator<Item = &'a String>) -> Vec<String> {
    let mut seen = HashSet::new();
    items
        .filter(|item| seen.insert(item.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use cadence_core::{Job, JobInput, Task, TaskInput, WorkerRole};
    use cadence_store::MemoryStateStore;

    fn task(job_id: &str, n: u32) -> Task {
        Task::new(TaskInput {
            job_id: job_id.into(),
            assignee: WorkerRole::Worker(n),
            phase: Phase::Impl,
            round: 0,
            objective: "o".into(),
            inputs: vec![],
            constraints: vec![],
            acceptance_criteria: vec![],
        })
    }

    fn report(job_id: &str, n: u32, summary: &str) -> Report {
        Report::for_task(&task(job_id, n), summary)
    }

    #[test]
    fn test_lexical_overlap() {
        let sim = LexicalOverlap;
        assert!(sim.similar(
            "The database layer needs caching",
            "database layer caching is unnecessary"
        ));
        assert!(!sim.similar("The API is fast", "Use a queue"));
        assert!(!sim.similar("a an the", "database layer"));
    }

    #[test]
    fn test_merge_dedups_and_numbers() {
        let agg = Aggregator::new(Arc::new(MemoryStateStore::new()));
        let mut a = report("j", 1, "first");
        a.risks = vec!["r1".into(), "r2".into()];
        a.next_actions = vec!["ship".into()];
        a.contradictions = vec!["self-flagged".into()];
        let mut b = report("j", 2, "second");
        b.risks = vec!["r2".into(), "r3".into()];
        b.next_actions = vec!["ship".into(), "test".into()];

        let out = agg.merge(Phase::Impl, &[a, b]);
        assert_eq!(out.report_count, 2);
        assert_eq!(out.combined_summary, "[Report 1] first\n\n[Report 2] second");
        assert_eq!(out.all_risks, vec!["r1", "r2", "r3"]);
        assert_eq!(out.next_actions, vec!["ship", "test"]);
        assert_eq!(out.contradictions, vec!["self-flagged"]);
    }

    #[test]
    fn test_confidence_conflict_across_tasks_only() {
        let agg = Aggregator::new(Arc::new(MemoryStateStore::new()));
        let mut a = report("j", 1, "a");
        a.findings = vec![
            Finding::new("Database layer needs caching", "profiling", 0.9),
            Finding::new("database layer needs caching badly", "same task", 0.1),
        ];
        let mut b = report("j", 2, "b");
        b.findings = vec![Finding::new("database layer needs caching", "guess", 0.2)];

        let out = agg.merge(Phase::Impl, &[a, b]);
        assert_eq!(
            out.contradictions,
            vec![
                "Confidence conflict: \"Database layer needs caching\" (0.9) vs \"database layer needs caching\" (0.2)"
                    .to_string()
            ]
        );
    }

    struct Always;
    impl ClaimSimilarity for Always {
        fn similar(&self, _: &str, _: &str) -> bool {
            true
        }
    }

    #[test]
    fn test_similarity_is_pluggable() {
        let agg = Aggregator::with_similarity(Arc::new(MemoryStateStore::new()), Box::new(Always));
        let mut a = report("j", 1, "a");
        a.findings = vec![Finding::new("x", "", 1.0)];
        let mut b = report("j", 2, "b");
        b.findings = vec![Finding::new("y", "", 0.0)];
        assert_eq!(agg.merge(Phase::Impl, &[a, b]).contradictions.len(), 1);
    }

    #[tokio::test]
    async fn test_aggregate_requires_reports() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let job = Job::new(JobInput::new("p", "/tmp/r")).unwrap();
        store.create_job(&job).await.unwrap();
        let agg = Aggregator::new(store.clone());

        let err = agg.aggregate(&job.job_id, Phase::Impl).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            format!("Orchestrator error: No reports found for job {} phase impl", job.job_id)
        );

        store.create_report(&report(&job.job_id, 1, "ok")).await.unwrap();
        let out = agg.aggregate(&job.job_id, Phase::Impl).await.unwrap();
        assert_eq!(out.report_count, 1);
        assert!(out.to_markdown(&job.job_id).contains("[Report 1] ok"));
    }
}
