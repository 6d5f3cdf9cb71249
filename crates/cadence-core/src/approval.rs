//! Approval types for human-in-the-loop phase review.
//!
//! A phase parks in WAITING_APPROVAL with an [`ApprovalRequest`]; a reviewer
//! answers with a [`PhaseDecision`].

use crate::error::CadenceError;
use crate::phase::Phase;
use serde::{Deserialize, Serialize};

/// What a reviewer sees when a phase is ready.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub job_id: String,
    pub phase: Phase,
    /// Aggregated summary, truncated for display.
    pub diff_summary: String,
}

/// The decision made by a human reviewer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "lowercase")]
pub enum PhaseDecision {
    /// Commit the phase and move on.
    Approve,
    /// Re-plan the same phase. A reason is mandatory.
    Reject { reason: String },
}

impl PhaseDecision {
    /// Build a rejection, refusing blank reasons.
    pub fn reject(reason: impl Into<String>) -> Result<Self, CadenceError> {
        let reason = reason.into();
        if reason.trim().is_empty() {
            return Err(CadenceError::InvalidRequest(
                "rejection reason is required".into(),
            ));
        }
        Ok(PhaseDecision::Reject {
            reason: reason.trim().to_string(),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_reject_requires_reason() {
        assert!(PhaseDecision::reject("").is_err());
        assert!(PhaseDecision::reject("   ").is_err());
        assert_eq!(
            PhaseDecision::reject(" needs tests ").unwrap(),
            PhaseDecision::Reject {
                reason: "needs tests".into()
            }
        );
    }

    #[test]
    fn test_decision_serde() {
        let json = serde_json::to_string(&PhaseDecision::Approve).unwrap();
        assert_eq!(json, r#"{"decision":"approve"}"#);
        let back: PhaseDecision =
            serde_json::from_str(r#"{"decision":"reject","reason":"no"}"#).unwrap();
        assert_eq!(back, PhaseDecision::Reject { reason: "no".into() });
    }
}
