//! Console rendering for the CLI: live run progress and status tables.

use console::{Emoji, style};
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

use crate::pipeline::{PipelineState, PipelineStatus, PipelineSummary};

static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK] ");
static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR] ");
static PAUSE: Emoji<'_, '_> = Emoji("⏸ ", "[PAUSED] ");

/// Spinner shown while a pipeline run is in flight. Caller finishes or
/// clears it when `execute` returns.
pub fn run_spinner(message: &str) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("{prefix:.bold.dim} {spinner} {msg}")
            .unwrap(),
    );
    spinner.set_prefix("Pipeline");
    spinner.set_message(message.to_string());
    spinner.enable_steady_tick(Duration::from_millis(120));
    spinner
}

fn status_glyph(status: PipelineStatus) -> String {
    match status {
        PipelineStatus::Completed => format!("{CHECK}{}", style("completed").green()),
        PipelineStatus::Failed => format!("{CROSS}{}", style("failed").red()),
        PipelineStatus::Aborted => format!("{CROSS}{}", style("aborted").red().dim()),
        PipelineStatus::Paused | PipelineStatus::AwaitingApproval => {
            format!("{PAUSE}{}", style(status.as_str()).yellow())
        }
        status => style(status.as_str()).cyan().to_string(),
    }
}

/// Detailed view for `status`.
pub fn print_status(state: &PipelineState, verbose: bool) {
    println!("{} {}", style("Pipeline").bold(), style(&state.id).cyan());
    println!("  Template:  {}", state.config.template);
    println!("  Status:    {}", status_glyph(state.status));
    println!("  Request:   {}", state.user_request);
    match state.current_stage() {
        Some(stage) => println!(
            "  Stage:     {} ({}/{})",
            stage,
            state.current_stage_index + 1,
            state.config.stages.len()
        ),
        None => println!("  Stage:     — (all {} done)", state.config.stages.len()),
    }
    println!(
        "  Completed: {}",
        if state.completed_stages.is_empty() {
            "none".to_string()
        } else {
            state
                .completed_stages
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(" → ")
        }
    );
    println!(
        "  Usage:     {} tokens, ${:.4}",
        state.tokens_used, state.cost_usd
    );
    if let Some(error) = &state.error {
        println!("  Error:     {}", style(error).red());
    }
    if let Some(feedback) = &state.pending_feedback {
        println!("  Feedback:  {feedback}");
    }
    if verbose {
        println!("  Created:   {}", state.created_at.to_rfc3339());
        println!("  Updated:   {}", state.updated_at.to_rfc3339());
        for (stage, file) in &state.stage_artifacts {
            println!("  Artifact:  {stage} -> {file}");
        }
    }
}

/// One-line-per-pipeline view for `pipelines`.
pub fn print_pipeline_list(summaries: &[PipelineSummary]) {
    if summaries.is_empty() {
        println!("No pipelines found.");
        return;
    }
    for summary in summaries {
        println!(
            "{}  {:<18} {:<10} {}",
            style(&summary.id).cyan(),
            status_glyph(summary.status),
            summary.template,
            summary
                .current_stage
                .as_deref()
                .unwrap_or("-"),
        );
    }
}
