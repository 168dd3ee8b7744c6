//! Pipeline state: the persistent record of one execution of a template
//! against one user request.
//!
//! `PipelineState` is mutated only by the controller and round-trips
//! losslessly through YAML so a crashed process can resume from the last
//! persisted value. The status state machine is enforced here so illegal
//! transitions are caught at the source.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::stage::{ArtifactBody, Stage};
use crate::template::PipelineConfig;

/// Pipeline lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Pending,
    Running,
    Paused,
    AwaitingApproval,
    Completed,
    Failed,
    Aborted,
}

impl PipelineStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineStatus::Completed | PipelineStatus::Failed | PipelineStatus::Aborted
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStatus::Pending => "pending",
            PipelineStatus::Running => "running",
            PipelineStatus::Paused => "paused",
            PipelineStatus::AwaitingApproval => "awaiting_approval",
            PipelineStatus::Completed => "completed",
            PipelineStatus::Failed => "failed",
            PipelineStatus::Aborted => "aborted",
        }
    }

    /// Whether the state machine permits `from → to`.
    ///
    /// Failed and aborted are reachable from any non-terminal status; the
    /// remaining edges are the cooperative loop transitions.
    pub fn can_transition(from: PipelineStatus, to: PipelineStatus) -> bool {
        use PipelineStatus::*;
        if from.is_terminal() {
            return false;
        }
        match to {
            Failed | Aborted => true,
            Running => matches!(from, Pending | Running | Paused | AwaitingApproval),
            Paused | AwaitingApproval => from == Running,
            Completed => matches!(from, Pending | Running),
            Pending => false,
        }
    }
}

impl std::fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for PipelineStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(PipelineStatus::Pending),
            "running" => Ok(PipelineStatus::Running),
            "paused" => Ok(PipelineStatus::Paused),
            "awaiting_approval" => Ok(PipelineStatus::AwaitingApproval),
            "completed" => Ok(PipelineStatus::Completed),
            "failed" => Ok(PipelineStatus::Failed),
            "aborted" => Ok(PipelineStatus::Aborted),
            _ => anyhow::bail!("Unknown pipeline status '{}'", s),
        }
    }
}

/// Persistent state of one pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineState {
    pub id: String,
    pub user_request: String,
    #[serde(default)]
    pub initial_context: ArtifactBody,
    pub status: PipelineStatus,
    pub current_stage_index: usize,
    pub config: PipelineConfig,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub completed_stages: Vec<Stage>,
    #[serde(default)]
    pub approved_stages: Vec<Stage>,
    /// Iterations executed per stage, keyed by stage name.
    #[serde(default)]
    pub iteration_counts: BTreeMap<String, u32>,
    /// Latest artifact file name per completed stage, keyed by stage name.
    #[serde(default)]
    pub stage_artifacts: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_feedback: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_artifact: Option<ArtifactBody>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PipelineState {
    pub fn new(
        id: String,
        user_request: String,
        initial_context: ArtifactBody,
        config: PipelineConfig,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            user_request,
            initial_context,
            status: PipelineStatus::Pending,
            current_stage_index: 0,
            config,
            created_at: now,
            updated_at: now,
            completed_at: None,
            tokens_used: 0,
            cost_usd: 0.0,
            completed_stages: Vec::new(),
            approved_stages: Vec::new(),
            iteration_counts: BTreeMap::new(),
            stage_artifacts: BTreeMap::new(),
            pending_feedback: None,
            pending_artifact: None,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Stage at `current_stage_index`, or `None` once past the end.
    pub fn current_stage(&self) -> Option<Stage> {
        self.config.stages.get(self.current_stage_index).copied()
    }

    /// Apply a status transition, rejecting edges the state machine does
    /// not allow.
    pub fn transition(&mut self, to: PipelineStatus) -> Result<()> {
        if !PipelineStatus::can_transition(self.status, to) {
            anyhow::bail!(
                "Illegal pipeline transition {} -> {} for {}",
                self.status,
                to,
                self.id
            );
        }
        self.status = to;
        self.updated_at = Utc::now();
        if to == PipelineStatus::Completed {
            self.completed_at = Some(self.updated_at);
        }
        Ok(())
    }

    /// Record a stage completion: appends to `completed_stages`, links the
    /// artifact file, and advances the stage index.
    pub fn mark_stage_completed(&mut self, stage: Stage, artifact_file: String) {
        self.completed_stages.push(stage);
        self.stage_artifacts.insert(stage.as_str().to_string(), artifact_file);
        self.current_stage_index += 1;
        self.updated_at = Utc::now();
    }

    pub fn iteration_count(&self, stage: Stage) -> u32 {
        self.iteration_counts
            .get(stage.as_str())
            .copied()
            .unwrap_or(0)
    }

    /// Increment and return the iteration counter for a stage.
    pub fn bump_iteration(&mut self, stage: Stage) -> u32 {
        let count = self
            .iteration_counts
            .entry(stage.as_str().to_string())
            .or_insert(0);
        *count += 1;
        *count
    }

    pub fn add_usage(&mut self, tokens: u64, cost_usd: f64) {
        self.tokens_used += tokens;
        self.cost_usd += cost_usd;
        self.updated_at = Utc::now();
    }

    /// Minimal record written into the state store index.
    pub fn summary(&self) -> PipelineSummary {
        PipelineSummary {
            id: self.id.clone(),
            template: self.config.template.clone(),
            status: self.status,
            created_at: self.created_at,
            updated_at: self.updated_at,
            current_stage: self.current_stage().map(|s| s.as_str().to_string()),
        }
    }
}

/// Index entry for pipeline listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSummary {
    pub id: String,
    pub template: String,
    pub status: PipelineStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<String>,
}

/// Returned by the controller's `execute`/`resume` operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    pub pipeline_id: String,
    pub status: PipelineStatus,
    /// The final stage's artifact when the run completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deliverable: Option<ArtifactBody>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub completed_stages: Vec<Stage>,
    pub tokens_used: u64,
    pub cost_usd: f64,
    pub duration_secs: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::{PipelineConfig, RunOverrides, builtin};

    fn make_state() -> PipelineState {
        let template = builtin("implement").unwrap();
        let config = PipelineConfig::from_template(&template, &RunOverrides::default(), None);
        PipelineState::new(
            "PL-20250101000000-abcd1234".to_string(),
            "Add OAuth2 authentication".to_string(),
            ArtifactBody::new(),
            config,
        )
    }

    #[test]
    fn test_new_state_is_pending_at_stage_zero() {
        let state = make_state();
        assert_eq!(state.status, PipelineStatus::Pending);
        assert_eq!(state.current_stage_index, 0);
        assert_eq!(state.current_stage(), Some(Stage::Intake));
        assert!(state.completed_stages.is_empty());
    }

    #[test]
    fn test_transition_pending_to_running() {
        let mut state = make_state();
        state.transition(PipelineStatus::Running).unwrap();
        assert_eq!(state.status, PipelineStatus::Running);
    }

    #[test]
    fn test_transition_rejects_pending_to_paused() {
        let mut state = make_state();
        assert!(state.transition(PipelineStatus::Paused).is_err());
    }

    #[test]
    fn test_terminal_states_are_frozen() {
        let mut state = make_state();
        state.transition(PipelineStatus::Running).unwrap();
        state.transition(PipelineStatus::Completed).unwrap();
        assert!(state.transition(PipelineStatus::Running).is_err());
        assert!(state.transition(PipelineStatus::Failed).is_err());
    }

    #[test]
    fn test_any_nonterminal_can_fail_or_abort() {
        for status in [
            PipelineStatus::Pending,
            PipelineStatus::Running,
            PipelineStatus::Paused,
            PipelineStatus::AwaitingApproval,
        ] {
            assert!(PipelineStatus::can_transition(status, PipelineStatus::Failed));
            assert!(PipelineStatus::can_transition(status, PipelineStatus::Aborted));
        }
    }

    #[test]
    fn test_pause_and_approval_only_from_running() {
        assert!(PipelineStatus::can_transition(
            PipelineStatus::Running,
            PipelineStatus::Paused
        ));
        assert!(!PipelineStatus::can_transition(
            PipelineStatus::Paused,
            PipelineStatus::AwaitingApproval
        ));
        assert!(PipelineStatus::can_transition(
            PipelineStatus::AwaitingApproval,
            PipelineStatus::Running
        ));
    }

    #[test]
    fn test_completed_sets_completed_at() {
        let mut state = make_state();
        state.transition(PipelineStatus::Running).unwrap();
        assert!(state.completed_at.is_none());
        state.transition(PipelineStatus::Completed).unwrap();
        assert!(state.completed_at.is_some());
    }

    #[test]
    fn test_mark_stage_completed_advances_index() {
        let mut state = make_state();
        state.mark_stage_completed(Stage::Intake, "00-intake.yaml".to_string());
        assert_eq!(state.current_stage_index, 1);
        assert_eq!(state.completed_stages, vec![Stage::Intake]);
        assert_eq!(
            state.stage_artifacts.get("intake").map(String::as_str),
            Some("00-intake.yaml")
        );
        assert_eq!(state.current_stage(), Some(Stage::Clarify));
    }

    #[test]
    fn test_bump_iteration_counts_per_stage() {
        let mut state = make_state();
        assert_eq!(state.iteration_count(Stage::Spec), 0);
        assert_eq!(state.bump_iteration(Stage::Spec), 1);
        assert_eq!(state.bump_iteration(Stage::Spec), 2);
        assert_eq!(state.bump_iteration(Stage::Green), 1);
        assert_eq!(state.iteration_count(Stage::Spec), 2);
    }

    #[test]
    fn test_add_usage_accumulates() {
        let mut state = make_state();
        state.add_usage(1200, 0.018);
        state.add_usage(800, 0.012);
        assert_eq!(state.tokens_used, 2000);
        assert!((state.cost_usd - 0.030).abs() < 1e-9);
    }

    #[test]
    fn test_state_yaml_round_trip_is_lossless() {
        let mut state = make_state();
        state.transition(PipelineStatus::Running).unwrap();
        state.mark_stage_completed(Stage::Intake, "00-intake.yaml".to_string());
        state.bump_iteration(Stage::Clarify);
        state.pending_feedback = Some("include rate limiting".to_string());
        state.add_usage(5000, 0.07);

        let yaml = serde_yaml::to_string(&state).unwrap();
        let back: PipelineState = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back, state);

        // Serialize-load-serialize must produce identical bytes.
        let yaml2 = serde_yaml::to_string(&back).unwrap();
        assert_eq!(yaml, yaml2);
    }

    #[test]
    fn test_summary_reflects_current_stage() {
        let mut state = make_state();
        state.mark_stage_completed(Stage::Intake, "00-intake.yaml".to_string());
        let summary = state.summary();
        assert_eq!(summary.template, "implement");
        assert_eq!(summary.current_stage.as_deref(), Some("clarify"));
    }
}
