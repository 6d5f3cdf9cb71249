//! Core types and error definitions for the Cadence orchestration engine.
//!
//! This crate provides the foundational types shared across all Cadence crates:
//! the job/task domain model, the pure state machines that guard every status
//! change, the trace log vocabulary, and the unified error taxonomy.
//!
//! Nothing in here performs I/O. Persistence lives in `cadence-store`, git
//! access in `cadence-git`, and the control loop in `cadence-orchestrator`.
//!
//! # Main types
//!
//! - [`CadenceError`]: Unified error enum for all Cadence subsystems.
//! - [`CadenceResult`]: Convenience alias for `Result<T, CadenceError>`.
//! - [`Job`] / [`JobStatus`]: One user request and its pipeline state.
//! - [`Task`] / [`TaskStatus`]: One unit of work for one worker.
//! - [`Report`]: A worker's structured output for one task.
//! - [`TraceEntry`]: Append-only audit record.
//! - [`Phase`] / [`WorkerRole`]: Pipeline stage and worker identity.

/// Approval decisions for human-in-the-loop phase review.
pub mod approval;
/// Error taxonomy shared by every crate.
pub mod error;
/// The job record and its state machine.
pub mod job;
/// Pipeline phases and worker roles.
pub mod phase;
/// Worker reports.
pub mod report;
/// The task record and its state machine.
pub mod task;
/// Append-only trace entries.
pub mod trace;

pub use approval::{ApprovalRequest, PhaseDecision};
pub use error::{
    CadenceError, CadenceResult, ErrorClass, GitError, LockError, ParseError, StoreError,
    TransitionError,
};
pub use job::{Job, JobArtifacts, JobGit, JobInput, JobStatus};
pub use phase::{Phase, WorkerRole};
pub use report::{ArtifactUpdate, Finding, GateVerdict, Report};
pub use task::{Task, TaskInput, TaskStatus};
pub use trace::{TraceActor, TraceEntry, TraceEventType, TraceRefs};

use uuid::Uuid;

/// Length of the short identifiers used for jobs and tasks.
pub const ID_LEN: usize = 12;

/// Generate a short, URL-safe identifier (12 lowercase hex characters).
pub fn new_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(ID_LEN);
    id
}

/// Truncate `text` to at most `max_chars` characters without splitting a
/// multi-byte character.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_new_id_is_short_hex() {
        let id = new_id();
        assert_eq!(id.len(), ID_LEN);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, new_id());
    }

    #[test]
    fn test_truncate_chars_respects_char_boundaries() {
        assert_eq!(truncate_chars("hello", 10), "hello");
        assert_eq!(truncate_chars("hello", 3), "hel");
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("", 5), "");
    }
}
