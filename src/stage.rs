//! Stage identity and per-stage execution results.
//!
//! A stage is one named step in a pipeline's configured sequence. The set of
//! stages is closed: intake, clarify, analyze, spec, red, green, refactor,
//! deliver. Each stage is implemented by exactly one executor registered
//! under its name, and produces one artifact per execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::llm::TokenUsage;

/// In-memory artifact body: the stage-specific fields of an artifact.
///
/// Bodies are plain JSON maps in memory (so model output parses straight
/// into them) and are persisted as YAML by the artifact store.
pub type ArtifactBody = serde_json::Map<String, serde_json::Value>;

/// Reserved key under which the controller injects an escalation
/// resolution's context before re-executing a stage.
pub const RESOLUTION_KEY: &str = "agentforge.resolution";

/// Reserved key under which the controller injects operator feedback from a
/// rejected supervised approval before re-executing a stage.
pub const FEEDBACK_KEY: &str = "agentforge.feedback";

/// The closed set of pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Intake,
    Clarify,
    Analyze,
    Spec,
    Red,
    Green,
    Refactor,
    Deliver,
}

impl Stage {
    /// All stages, in canonical pipeline order.
    pub fn all() -> &'static [Stage] {
        &[
            Stage::Intake,
            Stage::Clarify,
            Stage::Analyze,
            Stage::Spec,
            Stage::Red,
            Stage::Green,
            Stage::Refactor,
            Stage::Deliver,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Intake => "intake",
            Stage::Clarify => "clarify",
            Stage::Analyze => "analyze",
            Stage::Spec => "spec",
            Stage::Red => "red",
            Stage::Green => "green",
            Stage::Refactor => "refactor",
            Stage::Deliver => "deliver",
        }
    }

    /// Artifact type tag carried in the metadata envelope of this stage's
    /// output.
    pub fn artifact_type(&self) -> &'static str {
        match self {
            Stage::Intake => "intake_report",
            Stage::Clarify => "clarification",
            Stage::Analyze => "analysis",
            Stage::Spec => "specification",
            Stage::Red => "test_suite",
            Stage::Green => "implementation",
            Stage::Refactor => "refactoring",
            Stage::Deliver => "deliverable",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "intake" => Ok(Stage::Intake),
            "clarify" => Ok(Stage::Clarify),
            "analyze" => Ok(Stage::Analyze),
            "spec" => Ok(Stage::Spec),
            "red" => Ok(Stage::Red),
            "green" => Ok(Stage::Green),
            "refactor" => Ok(Stage::Refactor),
            "deliver" => Ok(Stage::Deliver),
            _ => anyhow::bail!(
                "Unknown stage '{}'. Valid stages: intake, clarify, analyze, spec, red, green, refactor, deliver",
                s
            ),
        }
    }
}

/// Execution status of a single stage attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// Outcome of one stage execution, returned by an executor to the
/// controller. Escalation is signalled by a present `escalation_reason`
/// with status `Pending` — the stage has not concluded, it is waiting on a
/// human.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: Stage,
    pub status: StageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<ArtifactBody>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation_reason: Option<String>,
    #[serde(default)]
    pub duration_secs: f64,
    /// Token/cost spent by this execution, folded into the pipeline
    /// counters by the controller.
    #[serde(default)]
    pub usage: TokenUsage,
}

impl StageResult {
    pub fn completed(stage: Stage, artifact: ArtifactBody) -> Self {
        Self {
            stage,
            status: StageStatus::Completed,
            artifact: Some(artifact),
            error: None,
            escalation_reason: None,
            duration_secs: 0.0,
            usage: TokenUsage::default(),
        }
    }

    pub fn failed(stage: Stage, error: impl Into<String>) -> Self {
        Self {
            stage,
            status: StageStatus::Failed,
            artifact: None,
            error: Some(error.into()),
            escalation_reason: None,
            duration_secs: 0.0,
            usage: TokenUsage::default(),
        }
    }

    /// An escalated result may carry a partial artifact so the re-run can
    /// pick up where the stage left off.
    pub fn escalated(
        stage: Stage,
        reason: impl Into<String>,
        partial: Option<ArtifactBody>,
    ) -> Self {
        Self {
            stage,
            status: StageStatus::Pending,
            artifact: partial,
            error: None,
            escalation_reason: Some(reason.into()),
            duration_secs: 0.0,
            usage: TokenUsage::default(),
        }
    }

    pub fn with_duration(mut self, secs: f64) -> Self {
        self.duration_secs = secs;
        self
    }

    /// The stage concluded successfully.
    pub fn success(&self) -> bool {
        self.status == StageStatus::Completed
    }

    /// The stage is waiting on human resolution.
    pub fn escalated_to_human(&self) -> bool {
        self.escalation_reason.is_some()
    }
}

/// Metadata envelope persisted alongside every artifact body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactEnvelope {
    pub stage: Stage,
    pub artifact_type: String,
    pub schema_version: u32,
    pub created_at: DateTime<Utc>,
}

impl ArtifactEnvelope {
    pub fn for_stage(stage: Stage) -> Self {
        Self {
            stage,
            artifact_type: stage.artifact_type().to_string(),
            schema_version: 1,
            created_at: Utc::now(),
        }
    }
}

/// A complete stored artifact: envelope plus stage-specific body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredArtifact {
    pub meta: ArtifactEnvelope,
    pub body: ArtifactBody,
}
