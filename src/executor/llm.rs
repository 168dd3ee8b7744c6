//! LLM-driven stage executor.
//!
//! One stage execution is one task-level interaction with the provider:
//! compose a system prompt and user message from the bounded context, make
//! the call, and parse an artifact out of the response. There is no outer
//! conversation history; multi-turn reasoning happens inside the single
//! call via tools, not by growing state across stages.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use super::{ExecutorDescriptor, StageExecutor};
use crate::context::StageContext;
use crate::llm::{ChatMessage, LlmProvider, LlmResponse, ToolSpec};
use crate::stage::{ArtifactBody, FEEDBACK_KEY, RESOLUTION_KEY, Stage, StageResult};
use crate::util::parse_artifact_text;

/// Key a model may set in its artifact to request human escalation instead
/// of concluding the stage.
pub const ESCALATE_KEY: &str = "escalation_reason";

/// The per-stage half of an LLM executor: prompts, tool list, and response
/// parsing. `LlmExecutor` supplies the lifecycle around it.
pub trait LlmStage: Send + Sync {
    fn stage(&self) -> Stage;

    fn required_inputs(&self) -> Vec<String> {
        Vec::new()
    }

    fn produced_outputs(&self) -> Vec<String> {
        Vec::new()
    }

    fn system_prompt(&self, ctx: &StageContext) -> String {
        format!(
            "You are the {} stage of an automated software-delivery pipeline. \
             Work only from the provided context. Reply with a single fenced \
             yaml block containing the stage artifact. Include the fields: {}. \
             If you cannot proceed without human input, set the field \
             '{ESCALATE_KEY}' to a short description of what you need.",
            ctx.stage,
            self.produced_outputs().join(", "),
        )
    }

    fn user_message(&self, ctx: &StageContext) -> String {
        let mut message = format!(
            "## REQUEST\n{}\n\n## STAGE\n{} (iteration {})\n",
            ctx.user_request, ctx.stage, ctx.iteration
        );
        if !ctx.input_artifact.is_empty() {
            let yaml = serde_yaml::to_string(&ctx.input_artifact).unwrap_or_default();
            message.push_str(&format!("\n## INPUT ARTIFACT\n```yaml\n{yaml}```\n"));
        }
        if let Some(feedback) = ctx
            .previous_feedback
            .as_deref()
            .or_else(|| ctx.input_artifact.get(FEEDBACK_KEY).and_then(|v| v.as_str()))
        {
            message.push_str(&format!("\n## OPERATOR FEEDBACK\n{feedback}\n"));
        }
        if let Some(resolution) = ctx.input_artifact.get(RESOLUTION_KEY) {
            message.push_str(&format!(
                "\n## ESCALATION RESOLUTION\n```json\n{resolution}\n```\n"
            ));
        }
        if !ctx.recent_actions.is_empty() {
            message.push_str("\n## RECENT ACTIONS\n");
            for action in &ctx.recent_actions {
                message.push_str(&format!("- {action}\n"));
            }
        }
        if let Some(verification) = &ctx.verification_summary {
            message.push_str(&format!("\n## VERIFICATION\n{verification}\n"));
        }
        message
    }

    fn tools(&self) -> Vec<ToolSpec> {
        Vec::new()
    }

    /// Default parse order: a tool invocation named `emit_artifact`, then
    /// embedded YAML/JSON in the response text.
    fn parse_response(&self, response: &LlmResponse, _ctx: &StageContext) -> Option<ArtifactBody> {
        for call in &response.tool_calls {
            if call.name == "emit_artifact"
                && let Some(map) = call.params.as_object()
            {
                return Some(map.clone());
            }
        }
        parse_artifact_text(&response.text)
    }
}

/// Generic executor over any `LlmStage`.
pub struct LlmExecutor<S: LlmStage> {
    stage_impl: S,
    provider: Arc<dyn LlmProvider>,
}

impl<S: LlmStage> LlmExecutor<S> {
    pub fn new(stage_impl: S, provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            stage_impl,
            provider,
        }
    }
}

#[async_trait]
impl<S: LlmStage> StageExecutor for LlmExecutor<S> {
    fn descriptor(&self) -> ExecutorDescriptor {
        ExecutorDescriptor {
            stage: self.stage_impl.stage(),
            required_inputs: self.stage_impl.required_inputs(),
            produced_outputs: self.stage_impl.produced_outputs(),
        }
    }

    async fn execute(&self, ctx: &StageContext) -> Result<StageResult> {
        let stage = ctx.stage;
        let system = self.stage_impl.system_prompt(ctx);
        let user = self.stage_impl.user_message(ctx);
        let tools = self.stage_impl.tools();

        // Provider faults propagate as Err so the controller's retry
        // budget applies.
        let response = self
            .provider
            .chat(&system, &[ChatMessage::user(user)], &tools)
            .await?;
        debug!(
            pipeline = %ctx.pipeline_id,
            %stage,
            tokens = response.usage.total_tokens(),
            "llm call finished"
        );

        let mut result = match self.stage_impl.parse_response(&response, ctx) {
            Some(mut artifact) => match take_escalation(&mut artifact) {
                Some(reason) => {
                    let partial = (!artifact.is_empty()).then_some(artifact);
                    StageResult::escalated(stage, reason, partial)
                }
                None => StageResult::completed(stage, artifact),
            },
            None => StageResult::failed(
                stage,
                "could not parse an artifact from the model response",
            ),
        };
        result.usage = response.usage;
        Ok(result)
    }
}

/// Remove and return the escalation reason when the model asked for one.
fn take_escalation(artifact: &mut ArtifactBody) -> Option<String> {
    let reason = artifact.get(ESCALATE_KEY)?.as_str()?.to_string();
    artifact.remove(ESCALATE_KEY);
    if reason.trim().is_empty() {
        None
    } else {
        Some(reason)
    }
}

/// Data-driven `LlmStage` covering all eight stages with generic prompts.
/// Deployments with bespoke prompt bodies register their own `LlmStage`
/// implementations instead.
pub struct GenericLlmStage {
    stage: Stage,
}

impl GenericLlmStage {
    pub fn new(stage: Stage) -> Self {
        Self { stage }
    }
}

impl LlmStage for GenericLlmStage {
    fn stage(&self) -> Stage {
        self.stage
    }

    fn required_inputs(&self) -> Vec<String> {
        let fields: &[&str] = match self.stage {
            Stage::Intake | Stage::Clarify | Stage::Analyze | Stage::Deliver => &[],
            Stage::Spec => &["analysis"],
            Stage::Red => &["components"],
            Stage::Green => &["test_files"],
            Stage::Refactor => &["implementation_files"],
        };
        fields.iter().map(|f| f.to_string()).collect()
    }

    fn produced_outputs(&self) -> Vec<String> {
        let fields: &[&str] = match self.stage {
            Stage::Intake => &["detected_scope", "priority"],
            Stage::Clarify => &["clarified_requirements", "ready_for_analysis"],
            Stage::Analyze => &["analysis"],
            Stage::Spec => &["components"],
            Stage::Red => &["test_files", "test_results"],
            Stage::Green => &["implementation_files", "all_tests_pass"],
            Stage::Refactor => &["tests_pass"],
            Stage::Deliver => &["deliverable_type"],
        };
        fields.iter().map(|f| f.to_string()).collect()
    }
}
