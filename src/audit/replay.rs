//! Replay and fork support over the audit log.
//!
//! - `replay_tool_actions`: re-apply the recorded mutating tool calls
//!   (file writes, edits, git) onto a fresh workspace — no LLM calls.
//! - `fork_from_step`: copy state and artifacts through step N into a new
//!   pipeline id, positioned to resume at the following stage.
//!
//! Both rely on the structured `detail` payload the bridge and controller
//! attach to their records.

use anyhow::{Context, Result};
use std::str::FromStr;

use super::{ActionKind, ActionRecord, AuditLog};
use crate::bridge::ToolBridge;
use crate::ids::new_pipeline_id;
use crate::pipeline::{PipelineState, PipelineStatus};
use crate::stage::Stage;
use crate::store::{ArtifactStore, StateStore};

/// Tools that mutate the workspace deterministically and are therefore
/// replayable. Read-only and environment-dependent tools are skipped.
const REPLAYABLE_TOOLS: &[&str] = &["write_file", "edit_file", "git"];

#[derive(Debug, Clone, Default)]
pub struct ReplaySummary {
    pub applied: usize,
    pub skipped: usize,
    pub failures: Vec<String>,
}

/// Re-apply recorded tool calls through `bridge` (which targets the copy
/// of the workspace being replayed onto). Records that are not replayable
/// tool calls are counted as skipped.
pub async fn replay_tool_actions(
    records: &[ActionRecord],
    bridge: &ToolBridge,
    replay_pipeline_id: &str,
) -> ReplaySummary {
    let mut summary = ReplaySummary::default();

    for record in records {
        let replayable = record.kind == ActionKind::ToolCall
            && record
                .detail
                .as_ref()
                .and_then(|d| d.get("tool"))
                .and_then(|t| t.as_str())
                .is_some_and(|tool| REPLAYABLE_TOOLS.contains(&tool));
        if !replayable {
            summary.skipped += 1;
            continue;
        }

        let detail = record.detail.as_ref().expect("checked above");
        let tool = detail["tool"].as_str().expect("checked above").to_string();
        let params = detail.get("params").cloned().unwrap_or_default();

        let outcome = bridge
            .run(replay_pipeline_id, record.stage, &tool, params)
            .await;
        if outcome.ok {
            summary.applied += 1;
        } else {
            summary.failures.push(format!(
                "step {}: {} failed: {}",
                record.step,
                tool,
                outcome.error.unwrap_or_default()
            ));
        }
    }
    summary
}

/// Create a new pipeline that owns copies of everything the source
/// pipeline had produced through audit step `step`, ready to resume at the
/// first stage not yet completed at that point.
pub fn fork_from_step(
    state_store: &StateStore,
    artifact_store: &ArtifactStore,
    audit: &AuditLog,
    pipeline_id: &str,
    step: u64,
) -> Result<PipelineState> {
    let source = state_store
        .load(pipeline_id)?
        .with_context(|| format!("Pipeline {pipeline_id} not found"))?;
    let records = audit.load(pipeline_id)?;

    // Stage completions are recorded as state transitions carrying the
    // completed stage and its artifact file.
    let mut completed: Vec<(Stage, String)> = Vec::new();
    for record in records.iter().filter(|r| r.step <= step) {
        if record.kind != ActionKind::StateTransition {
            continue;
        }
        let Some(detail) = record.detail.as_ref() else {
            continue;
        };
        let (Some(stage), Some(file)) = (
            detail.get("completed_stage").and_then(|v| v.as_str()),
            detail.get("artifact_file").and_then(|v| v.as_str()),
        ) else {
            continue;
        };
        completed.push((Stage::from_str(stage)?, file.to_string()));
    }

    let mut fork = PipelineState::new(
        new_pipeline_id(),
        source.user_request.clone(),
        source.initial_context.clone(),
        source.config.clone(),
    );

    for (stage, file) in &completed {
        let artifact = artifact_store.read(pipeline_id, file)?;
        let index = fork.current_stage_index;
        let written = artifact_store.write(&fork.id, index, 1, &artifact)?;
        fork.mark_stage_completed(*stage, written.file_name);
    }

    state_store.save(&fork)?;
    Ok(fork)
}

/// Whether a forked pipeline still has stages to run.
pub fn fork_is_resumable(fork: &PipelineState) -> bool {
    fork.status == PipelineStatus::Pending
        && fork.current_stage_index < fork.config.stages.len()
}
