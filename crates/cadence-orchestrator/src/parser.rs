//! Lenient parsing of worker output into [`Report`]s.
//!
//! Workers are language models driven through a CLI, so their output is only
//! loosely structured: the JSON may arrive bare, inside a fenced code block,
//! surrounded by prose, or wrapped in the CLI's `{"result": "..."}` envelope.
//! Fields that are missing or of the wrong type fall back to defaults rather
//! than failing the parse.

use cadence_core::{
    truncate_chars, ArtifactUpdate, Finding, GateVerdict, ParseError, Report, Task,
};
use serde_json::{Map, Value};

const NO_SUMMARY: &str = "No summary provided";

/// Characters of raw output kept when the output cannot be parsed.
pub const FALLBACK_SUMMARY_CHARS: usize = 500;

/// The structured part of a worker's answer.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WorkerOutput {
    pub summary: String,
    pub findings: Vec<Finding>,
    pub risks: Vec<String>,
    pub contradictions: Vec<String>,
    pub next_actions: Vec<String>,
    pub artifact_updates: Vec<ArtifactUpdate>,
    pub gate_verdict: Option<GateVerdict>,
}

impl WorkerOutput {
    /// Build the stored report for `task`.
    pub fn into_report(self, task: &Task) -> Report {
        let mut report = Report::for_task(task, self.summary);
        report.findings = self.findings;
        report.risks = self.risks;
        report.contradictions = self.contradictions;
        report.next_actions = self.next_actions;
        report.artifact_updates = self.artifact_updates;
        report.with_gate_verdict(self.gate_verdict)
    }
}

/// Parse raw worker output.
pub fn parse_worker_output(raw: &str) -> Result<WorkerOutput, ParseError> {
    let object = extract_object(raw)?;

    // CLI envelope: the model's answer is a string under `result`.
    if !object.contains_key("summary") {
        if let Some(Value::String(inner)) = object.get("result") {
            return Ok(parse_worker_output(inner).unwrap_or_else(|_| WorkerOutput {
                summary: inner.clone(),
                ..Default::default()
            }));
        }
    }
    Ok(from_object(&object))
}

/// Parse `raw`, or fall back to a report whose summary is the start of the
/// raw text.
pub fn report_from_output(task: &Task, raw: &str) -> (Report, Option<ParseError>) {
    match parse_worker_output(raw) {
        Ok(output) => (output.into_report(task), None),
        Err(e) => (
            Report::for_task(task, truncate_chars(raw, FALLBACK_SUMMARY_CHARS)),
            Some(e),
        ),
    }
}

fn extract_object(raw: &str) -> Result<Map<String, Value>, ParseError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ParseError("Empty output".into()));
    }

    // Bare JSON first, so an envelope whose string value contains a fence
    // is not cut apart.
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(trimmed) {
        return Ok(map);
    }

    let mut candidate = fenced_block(trimmed).unwrap_or(trimmed);
    if let (Some(start), Some(end)) = (candidate.find('{'), candidate.rfind('}')) {
        if end > start {
            candidate = &candidate[start..=end];
        }
    }

    match serde_json::from_str::<Value>(candidate) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(ParseError("Output is not a JSON object".into())),
        Err(e) => Err(ParseError(format!("Failed to parse JSON: {e}"))),
    }
}

/// Body of the first ``` fence, with an optional `json` tag.
fn fenced_block(text: &str) -> Option<&str> {
    let open = text.find("```")?;
    let after = &text[open + 3..];
    let after = after.strip_prefix("json").unwrap_or(after);
    let close = after.find("```")?;
    Some(after[..close].trim())
}

fn from_object(object: &Map<String, Value>) -> WorkerOutput {
    WorkerOutput {
        summary: object
            .get("summary")
            .and_then(Value::as_str)
            .unwrap_or(NO_SUMMARY)
            .to_string(),
        findings: objects(object.get("findings"))
            .map(|f| {
                Finding::new(
                    str_field(f, "claim"),
                    str_field(f, "evidence"),
                    f.get("confidence").and_then(Value::as_f64).unwrap_or(0.5),
                )
            })
            .collect(),
        risks: strings(object.get("risks")),
        contradictions: strings(object.get("contradictions")),
        next_actions: strings(object.get("next_actions")),
        artifact_updates: objects(object.get("artifact_updates"))
            .map(|a| ArtifactUpdate {
                path: str_field(a, "path"),
                change_summary: str_field(a, "change_summary"),
            })
            .collect(),
        gate_verdict: object
            .get("gate_verdict")
            .and_then(Value::as_str)
            .and_then(|v| match v.trim().to_ascii_uppercase().as_str() {
                "PASS" => Some(GateVerdict::Pass),
                "FAIL" => Some(GateVerdict::Fail),
                _ => None,
            }),
    }
}

fn str_field(object: &Map<String, Value>, key: &str) -> String {
    object
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn strings(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn objects(value: Option<&Value>) -> impl Iterator<Item = &Map<String, Value>> {
    value
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_object)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use cadence_core::{Phase, TaskInput, WorkerRole};

    fn task(role: WorkerRole) -> Task {
        Task::new(TaskInput {
            job_id: "j".into(),
            assignee: role,
            phase: Phase::Spec,
            round: 1,
            objective: "o".into(),
            inputs: vec![],
            constraints: vec![],
            acceptance_criteria: vec![],
        })
    }

    #[test]
    fn test_bare_json() {
        let out = parse_worker_output(
            r#"{"summary": "Did it", "risks": ["r", 3], "findings": [{"claim": "c", "confidence": 0.8}]}"#,
        )
        .unwrap();
        assert_eq!(out.summary, "Did it");
        assert_eq!(out.risks, vec!["r"]);
        assert_eq!(out.findings[0].claim, "c");
        assert_eq!(out.findings[0].evidence, "");
        assert_eq!(out.findings[0].confidence, 0.8);
    }

    #[test]
    fn test_fenced_and_embedded() {
        let fenced = "Here you go:\n```json\n{\"summary\": \"fenced\"}\n```\nbye";
        assert_eq!(parse_worker_output(fenced).unwrap().summary, "fenced");

        let embedded = "Result follows {\"next_actions\": [\"ship\"]} end";
        let out = parse_worker_output(embedded).unwrap();
        assert_eq!(out.summary, "No summary provided");
        assert_eq!(out.next_actions, vec!["ship"]);
    }

    #[test]
    fn test_cli_envelope() {
        let raw = r#"{"type": "result", "result": "```json\n{\"summary\": \"inner\", \"gate_verdict\": \"fail\"}\n```"}"#;
        let out = parse_worker_output(raw).unwrap();
        assert_eq!(out.summary, "inner");
        assert_eq!(out.gate_verdict, Some(GateVerdict::Fail));

        let plain = r#"{"result": "just prose"}"#;
        assert_eq!(parse_worker_output(plain).unwrap().summary, "just prose");
    }

    #[test]
    fn test_defaults_and_clamping() {
        let out = parse_worker_output(r#"{"findings": [{"claim": "x", "confidence": 7}, "junk"]}"#)
            .unwrap();
        assert_eq!(out.findings.len(), 1);
        assert_eq!(out.findings[0].confidence, 1.0);
    }

    #[test]
    fn test_garbage_is_parse_error() {
        assert!(parse_worker_output("").is_err());
        assert!(parse_worker_output("no json here").is_err());
        assert!(parse_worker_output("{not json}").is_err());
    }

    #[test]
    fn test_fallback_report_keeps_raw_text() {
        let raw = "x".repeat(600);
        let (report, err) = report_from_output(&task(WorkerRole::Worker(1)), &raw);
        assert!(err.is_some());
        assert_eq!(report.summary.len(), FALLBACK_SUMMARY_CHARS);
        assert_eq!(report.round, 1);
    }

    #[test]
    fn test_verdict_only_kept_for_auditor() {
        let raw = r#"{"summary": "ok", "gate_verdict": "PASS"}"#;
        let (worker, _) = report_from_output(&task(WorkerRole::Worker(1)), raw);
        assert_eq!(worker.gate_verdict, None);
        let (auditor, _) = report_from_output(&task(WorkerRole::Auditor), raw);
        assert_eq!(auditor.gate_verdict, Some(GateVerdict::Pass));
    }
}
