//! Bounded-token stage context.
//!
//! Each stage execution gets a fresh `StageContext` assembled from
//! persisted state — never an accumulated conversation history. The
//! builder enforces a per-slot token budget so the serialized context
//! stays inside a fixed window no matter how many stages have already
//! run. Token counts are estimated at four characters per token.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::audit::ActionRecord;
use crate::pipeline::PipelineState;
use crate::stage::{ArtifactBody, Stage};
use crate::store::ArtifactStore;

/// Character cap applied to error text inside the recent-action window.
const ERROR_CHAR_CAP: usize = 500;

/// How many recent actions are fed back into context.
const RECENT_ACTION_WINDOW: usize = 3;

/// Rough token estimate: one token per four characters, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Per-slot token allocation. The defaults sum to 8 000.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ContextBudget {
    pub task_frame: usize,
    pub upstream_artifact: usize,
    pub recent_actions: usize,
    pub verification: usize,
    pub available_actions: usize,
    pub system_prompt: usize,
}

impl Default for ContextBudget {
    fn default() -> Self {
        Self {
            task_frame: 500,
            upstream_artifact: 4500,
            recent_actions: 1000,
            verification: 200,
            available_actions: 800,
            system_prompt: 1000,
        }
    }
}

impl ContextBudget {
    pub fn total(&self) -> usize {
        self.task_frame
            + self.upstream_artifact
            + self.recent_actions
            + self.verification
            + self.available_actions
            + self.system_prompt
    }
}

/// The bounded input handed to an executor for one execution. Rebuildable
/// from state plus the artifact store; never persisted on its own.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub pipeline_id: String,
    pub template: String,
    pub stage: Stage,
    pub stage_index: usize,
    pub input_artifact: ArtifactBody,
    pub user_request: String,
    pub project_dir: PathBuf,
    pub state_dir: PathBuf,
    /// Stages already completed, in order.
    pub completed_stages: Vec<Stage>,
    /// Compressed read-only copies of completed-stage artifacts.
    pub completed_artifacts: BTreeMap<String, ArtifactBody>,
    /// Iteration number for the current stage (1 on first run).
    pub iteration: u32,
    pub previous_feedback: Option<String>,
    /// One-line summaries of the last few audit records.
    pub recent_actions: Vec<String>,
    pub verification_summary: Option<String>,
    pub available_tools: Vec<String>,
    pub timeout_secs: Option<u64>,
    pub budget: ContextBudget,
}

impl StageContext {
    /// Estimated token footprint of the prompt-rendered sections. Must not
    /// exceed `budget.total()` minus the executor-owned system prompt slot.
    pub fn estimated_tokens(&self) -> usize {
        let frame = estimate_tokens(&self.user_request)
            + estimate_tokens(&self.template)
            + estimate_tokens(self.stage.as_str());
        let artifact = estimate_tokens(
            &serde_json::to_string(&self.input_artifact).unwrap_or_default(),
        );
        let actions: usize = self.recent_actions.iter().map(|a| estimate_tokens(a)).sum();
        let verification = self
            .verification_summary
            .as_deref()
            .map(estimate_tokens)
            .unwrap_or(0);
        let tools: usize = self.available_tools.iter().map(|t| estimate_tokens(t)).sum();
        frame + artifact + actions + verification + tools
    }
}

/// Builds stage contexts from persisted state. Deterministic: identical
/// state yields an identical context.
pub struct ContextBuilder {
    budget: ContextBudget,
    project_dir: PathBuf,
    state_dir: PathBuf,
}

impl ContextBuilder {
    pub fn new(project_dir: PathBuf, state_dir: PathBuf) -> Self {
        Self {
            budget: ContextBudget::default(),
            project_dir,
            state_dir,
        }
    }

    pub fn with_budget(mut self, budget: ContextBudget) -> Self {
        self.budget = budget;
        self
    }

    /// Assemble the context for executing `stage` at `stage_index`.
    pub fn build(
        &self,
        state: &PipelineState,
        stage: Stage,
        stage_index: usize,
        input_artifact: &ArtifactBody,
        artifacts: &ArtifactStore,
        recent: &[ActionRecord],
        verification_summary: Option<String>,
        available_tools: Vec<String>,
        timeout_secs: Option<u64>,
    ) -> StageContext {
        let input_artifact = compress_artifact(
            upstream_stage(state, stage_index),
            input_artifact,
            self.budget.upstream_artifact,
        );

        let mut completed_artifacts = BTreeMap::new();
        for done in &state.completed_stages {
            if let Some(file) = state.stage_artifacts.get(done.as_str())
                && let Ok(stored) = artifacts.read(&state.id, file)
            {
                // Keep only the load-bearing fields of earlier artifacts;
                // the upstream artifact is the one that gets real budget.
                completed_artifacts.insert(
                    done.as_str().to_string(),
                    compress_artifact(Some(*done), &stored.body, self.budget.verification),
                );
            }
        }

        let recent_actions = recent
            .iter()
            .rev()
            .take(RECENT_ACTION_WINDOW)
            .rev()
            .map(summarize_action)
            .collect();

        StageContext {
            pipeline_id: state.id.clone(),
            template: state.config.template.clone(),
            stage,
            stage_index,
            input_artifact,
            user_request: state.user_request.clone(),
            project_dir: self.project_dir.clone(),
            state_dir: self.state_dir.clone(),
            completed_stages: state.completed_stages.clone(),
            completed_artifacts,
            // The controller increments the counter before building the
            // context; a standalone build still reports iteration 1.
            iteration: state.iteration_count(stage).max(1),
            previous_feedback: state.pending_feedback.clone(),
            recent_actions,
            verification_summary: verification_summary
                .map(|v| truncate_chars(&v, self.budget.verification * 4)),
            available_tools,
            timeout_secs,
            budget: self.budget,
        }
    }
}

/// The stage whose artifact feeds `stage_index` (none for the first stage,
/// whose input is the initial context).
fn upstream_stage(state: &PipelineState, stage_index: usize) -> Option<Stage> {
    if stage_index == 0 {
        None
    } else {
        state.config.stages.get(stage_index - 1).copied()
    }
}

/// One-line summary of an audit record for the action window. Error text
/// is capped so a failing tool call cannot flood the context.
pub fn summarize_action(record: &ActionRecord) -> String {
    let line = format!(
        "[{}] {:?}: {}",
        record.step,
        record.kind,
        record.summary.replace('\n', " ")
    );
    truncate_chars(&line, ERROR_CHAR_CAP)
}

/// Fields worth keeping when an artifact must be cut down to fit its slot.
fn keep_fields(stage: Stage) -> &'static [&'static str] {
    match stage {
        Stage::Intake => &["detected_scope", "priority", "clarifying_questions", "summary"],
        Stage::Clarify => &[
            "clarified_requirements",
            "ready_for_analysis",
            "remaining_questions",
        ],
        Stage::Analyze => &["analysis", "components", "affected_files", "risks"],
        Stage::Spec => &["components", "acceptance_criteria", "test_cases"],
        Stage::Red => &["test_files", "test_results"],
        Stage::Green => &["implementation_files", "test_results", "all_tests_pass"],
        Stage::Refactor => &["refactored_files", "test_results", "tests_pass"],
        Stage::Deliver => &["deliverable_type", "reference", "summary"],
    }
}

/// Pass the artifact through whole when it fits; otherwise apply the
/// stage's keep-list and truncate any remaining oversized strings.
pub fn compress_artifact(
    stage: Option<Stage>,
    body: &ArtifactBody,
    slot_tokens: usize,
) -> ArtifactBody {
    let serialized = serde_json::to_string(body).unwrap_or_default();
    if estimate_tokens(&serialized) <= slot_tokens {
        return body.clone();
    }

    let mut compact = ArtifactBody::new();
    match stage {
        Some(stage) => {
            for key in keep_fields(stage) {
                if let Some(value) = body.get(*key) {
                    compact.insert((*key).to_string(), value.clone());
                }
            }
        }
        None => {
            compact = body.clone();
        }
    }

    // Still too large (or no keep-list applied): clamp string values until
    // the estimate fits. Floor of 64 chars so a field is never erased.
    let char_cap = (slot_tokens * 4 / compact.len().max(1)).max(64);
    for value in compact.values_mut() {
        clamp_value(value, char_cap);
    }
    compact
}

fn clamp_value(value: &mut serde_json::Value, char_cap: usize) {
    match value {
        serde_json::Value::String(s) => {
            if s.chars().count() > char_cap {
                *s = truncate_chars(s, char_cap);
            }
        }
        serde_json::Value::Array(items) => {
            for item in items.iter_mut() {
                clamp_value(item, char_cap);
            }
        }
        serde_json::Value::Object(map) => {
            for item in map.values_mut() {
                clamp_value(item, char_cap);
            }
        }
        _ => {}
    }
}

fn truncate_chars(text: &str, cap: usize) -> String {
    if text.chars().count() <= cap {
        text.to_string()
    } else {
        let kept: String = text.chars().take(cap.saturating_sub(1)).collect();
        format!("{kept}…")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{ActionKind, ActionRecord};
    use crate::template::{PipelineConfig, RunOverrides, builtin};
    use chrono::Utc;
    use tempfile::tempdir;

    fn make_state() -> PipelineState {
        let template = builtin("implement").unwrap();
        let config = PipelineConfig::from_template(&template, &RunOverrides::default(), None);
        PipelineState::new(
            "PL-20250101000000-ctx00001".to_string(),
            "Add OAuth2 authentication".to_string(),
            ArtifactBody::new(),
            config,
        )
    }

    fn make_record(step: u64, summary: &str) -> ActionRecord {
        ActionRecord {
            step,
            timestamp: Utc::now(),
            stage: Some(Stage::Green),
            kind: ActionKind::ToolCall,
            summary: summary.to_string(),
            input_hash: None,
            output_hash: None,
            detail: None,
            tokens: 0,
            cost_usd: 0.0,
        }
    }

    #[test]
    fn test_estimate_tokens_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn test_default_budget_totals_8000() {
        assert_eq!(ContextBudget::default().total(), 8000);
    }

    #[test]
    fn test_small_artifact_passes_through_whole() {
        let mut body = ArtifactBody::new();
        body.insert("detected_scope".into(), serde_json::json!("bug_fix"));
        body.insert("extra_field".into(), serde_json::json!("kept as-is"));
        let out = compress_artifact(Some(Stage::Intake), &body, 4500);
        assert_eq!(out, body);
    }

    #[test]
    fn test_oversized_artifact_is_cut_to_keep_list() {
        let mut body = ArtifactBody::new();
        body.insert("components".into(), serde_json::json!(["auth", "tokens"]));
        body.insert("noise".into(), serde_json::json!("x".repeat(40_000)));
        let out = compress_artifact(Some(Stage::Spec), &body, 100);
        assert!(out.contains_key("components"));
        assert!(!out.contains_key("noise"));
    }

    #[test]
    fn test_oversized_strings_are_clamped() {
        let mut body = ArtifactBody::new();
        body.insert(
            "test_results".into(),
            serde_json::json!("f".repeat(100_000)),
        );
        let out = compress_artifact(Some(Stage::Red), &body, 250);
        let text = out["test_results"].as_str().unwrap();
        assert!(text.chars().count() <= 1000 + 1);
    }

    #[test]
    fn test_summarize_action_is_single_capped_line() {
        let record = make_record(4, &format!("error: {}", "e".repeat(2000)));
        let line = summarize_action(&record);
        assert!(!line.contains('\n'));
        assert!(line.chars().count() <= 500);
        assert!(line.starts_with("[4]"));
    }

    #[test]
    fn test_build_keeps_last_three_actions_in_order() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let state = make_state();
        let builder = ContextBuilder::new(dir.path().to_path_buf(), dir.path().join("state"));
        let records: Vec<ActionRecord> =
            (1..=5).map(|i| make_record(i, &format!("action {i}"))).collect();

        let ctx = builder.build(
            &state,
            Stage::Intake,
            0,
            &ArtifactBody::new(),
            &store,
            &records,
            None,
            vec![],
            None,
        );
        assert_eq!(ctx.recent_actions.len(), 3);
        assert!(ctx.recent_actions[0].contains("action 3"));
        assert!(ctx.recent_actions[2].contains("action 5"));
    }

    #[test]
    fn test_build_is_deterministic_for_same_state() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let state = make_state();
        let builder = ContextBuilder::new(dir.path().to_path_buf(), dir.path().join("state"));
        let mut input = ArtifactBody::new();
        input.insert("summary".into(), serde_json::json!("short"));

        let a = builder.build(
            &state, Stage::Clarify, 1, &input, &store, &[], None, vec![], None,
        );
        let b = builder.build(
            &state, Stage::Clarify, 1, &input, &store, &[], None, vec![], None,
        );
        assert_eq!(a.input_artifact, b.input_artifact);
        assert_eq!(a.recent_actions, b.recent_actions);
        assert_eq!(a.iteration, b.iteration);
    }

    #[test]
    fn test_context_stays_within_budget_for_huge_upstream() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let state = make_state();
        let builder = ContextBuilder::new(dir.path().to_path_buf(), dir.path().join("state"));

        let mut huge = ArtifactBody::new();
        huge.insert("analysis".into(), serde_json::json!("a".repeat(200_000)));
        huge.insert("irrelevant".into(), serde_json::json!("b".repeat(200_000)));

        let ctx = builder.build(
            &state,
            Stage::Spec,
            3,
            &huge,
            &store,
            &[],
            Some("ok".to_string()),
            vec!["read_file".to_string()],
            None,
        );
        let budget = ctx.budget;
        assert!(
            ctx.estimated_tokens() <= budget.total() - budget.system_prompt,
            "context of {} tokens exceeds non-system budget {}",
            ctx.estimated_tokens(),
            budget.total() - budget.system_prompt
        );
    }

    #[test]
    fn test_iteration_mirrors_the_bumped_counter() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let mut state = make_state();
        let builder = ContextBuilder::new(dir.path().to_path_buf(), dir.path().join("state"));

        let fresh = builder.build(
            &state,
            Stage::Spec,
            3,
            &ArtifactBody::new(),
            &store,
            &[],
            None,
            vec![],
            None,
        );
        assert_eq!(fresh.iteration, 1);

        state.bump_iteration(Stage::Spec);
        state.bump_iteration(Stage::Spec);
        let rerun = builder.build(
            &state,
            Stage::Spec,
            3,
            &ArtifactBody::new(),
            &store,
            &[],
            None,
            vec![],
            None,
        );
        assert_eq!(rerun.iteration, 2);
    }
}
