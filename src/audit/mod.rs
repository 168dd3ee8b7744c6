//! Append-only audit log: record types, the per-pipeline writer, and
//! replay/fork support.
//!
//! Every observable step of a pipeline — LLM calls, tool calls,
//! verifications, state transitions — lands here as a numbered record.
//! The log is the source of truth for diagnosis, cost accounting, replay,
//! and fork-from-step.

pub mod log;
pub mod replay;

pub use log::AuditLog;
pub use replay::{ReplaySummary, fork_from_step, replay_tool_actions};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::stage::Stage;

/// What kind of step a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    LlmCall,
    ToolCall,
    Verification,
    StateTransition,
}

/// One audit log entry. Step numbers increase monotonically within a
/// pipeline; the writer assigns them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRecord {
    pub step: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    pub kind: ActionKind,
    /// One-line human summary; full payloads go in `detail`.
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_hash: Option<String>,
    /// Full structured payload (tool name, params, complete result text).
    /// Present on tool calls so they can be replayed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
    #[serde(default)]
    pub tokens: u64,
    #[serde(default)]
    pub cost_usd: f64,
}

/// A record before the writer assigns its step number and timestamp.
#[derive(Debug, Clone)]
pub struct NewAction {
    pub stage: Option<Stage>,
    pub kind: ActionKind,
    pub summary: String,
    pub input_hash: Option<String>,
    pub output_hash: Option<String>,
    pub detail: Option<serde_json::Value>,
    pub tokens: u64,
    pub cost_usd: f64,
}

impl NewAction {
    pub fn new(kind: ActionKind, summary: impl Into<String>) -> Self {
        Self {
            stage: None,
            kind,
            summary: summary.into(),
            input_hash: None,
            output_hash: None,
            detail: None,
            tokens: 0,
            cost_usd: 0.0,
        }
    }

    pub fn stage(mut self, stage: Stage) -> Self {
        self.stage = Some(stage);
        self
    }

    pub fn input_hash(mut self, hash: impl Into<String>) -> Self {
        self.input_hash = Some(hash.into());
        self
    }

    pub fn output_hash(mut self, hash: impl Into<String>) -> Self {
        self.output_hash = Some(hash.into());
        self
    }

    pub fn detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }

    pub fn usage(mut self, tokens: u64, cost_usd: f64) -> Self {
        self.tokens = tokens;
        self.cost_usd = cost_usd;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_action_builder_sets_fields() {
        let action = NewAction::new(ActionKind::ToolCall, "write_file src/lib.rs")
            .stage(Stage::Green)
            .input_hash("abc")
            .usage(120, 0.002);
        assert_eq!(action.kind, ActionKind::ToolCall);
        assert_eq!(action.stage, Some(Stage::Green));
        assert_eq!(action.input_hash.as_deref(), Some("abc"));
        assert_eq!(action.tokens, 120);
    }

    #[test]
    fn test_action_record_json_round_trip() {
        let record = ActionRecord {
            step: 7,
            timestamp: Utc::now(),
            stage: Some(Stage::Red),
            kind: ActionKind::Verification,
            summary: "red->green contract ok".to_string(),
            input_hash: Some("aa".to_string()),
            output_hash: None,
            detail: None,
            tokens: 0,
            cost_usd: 0.0,
        };
        let line = serde_json::to_string(&record).unwrap();
        let back: ActionRecord = serde_json::from_str(&line).unwrap();
        assert_eq!(back.step, 7);
        assert_eq!(back.kind, ActionKind::Verification);
        assert_eq!(back.stage, Some(Stage::Red));
    }
}
