//! Escalation manager: cooperative pauses that wait on a human.
//!
//! Two capabilities, polymorphic over the backend:
//! - `wait_for_resolution` — a stage hit something it cannot decide;
//!   block until a human resolves it (or the wait times out, which
//!   fail-safes to abort).
//! - `request_approval` — supervised mode's per-stage gate.
//!
//! The file-polling backend is the reference implementation; the terminal
//! backend answers both capabilities with interactive prompts.

pub mod file;
pub mod terminal;

pub use file::FileEscalationBackend;
pub use terminal::TerminalEscalationBackend;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::stage::{ArtifactBody, Stage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationStatus {
    Pending,
    Resolved,
    TimedOut,
}

/// A persisted escalation record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Escalation {
    pub id: String,
    pub pipeline_id: String,
    pub stage: Stage,
    pub issue: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<ArtifactBody>,
    pub created_at: DateTime<Utc>,
    pub status: EscalationStatus,
}

/// A human's answer to an escalation. `abort = true` ends the pipeline;
/// otherwise `context` is injected into the stage's input artifact under
/// the reserved resolution key and the stage re-executes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Resolution {
    #[serde(default)]
    pub abort: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<ArtifactBody>,
}

impl Resolution {
    pub fn aborted() -> Self {
        Self {
            abort: true,
            context: None,
        }
    }
}

/// A human's answer to a supervised approval gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalResult {
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
}

/// The backend capability set.
#[async_trait]
pub trait EscalationManager: Send + Sync {
    /// Record an escalation and block until it is resolved or the
    /// configured maximum wait elapses (timeout ⇒ `abort = true`).
    async fn wait_for_resolution(
        &self,
        pipeline_id: &str,
        stage: Stage,
        issue: &str,
        context: Option<ArtifactBody>,
    ) -> Result<Resolution>;

    /// Present a stage artifact for approval and block for the verdict.
    async fn request_approval(
        &self,
        pipeline_id: &str,
        stage: Stage,
        artifact: &ArtifactBody,
    ) -> Result<ApprovalResult>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_defaults_to_continue() {
        let resolution: Resolution = serde_yaml::from_str("context:\n  answer: yes\n").unwrap();
        assert!(!resolution.abort);
        assert!(resolution.context.is_some());
    }

    #[test]
    fn test_escalation_yaml_round_trip() {
        let escalation = Escalation {
            id: "ESC-20250101000000".to_string(),
            pipeline_id: "PL-20250101000000-abcd1234".to_string(),
            stage: Stage::Clarify,
            issue: "two blocking questions".to_string(),
            context: None,
            created_at: Utc::now(),
            status: EscalationStatus::Pending,
        };
        let yaml = serde_yaml::to_string(&escalation).unwrap();
        let back: Escalation = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.id, escalation.id);
        assert_eq!(back.status, EscalationStatus::Pending);
    }
}
