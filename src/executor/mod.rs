//! Stage executor capability set and the lifecycle driver.
//!
//! An executor moves through five phases: initialize → validate_input →
//! execute → validate_output → finalize. The driver (`run_stage`) owns
//! that sequencing so concrete executors only implement the pieces they
//! care about. Business outcomes are `StageResult` values; only unexpected
//! faults surface as `Err`, and the controller's retry budget covers
//! those.

pub mod contract;
pub mod llm;
pub mod registry;

pub use contract::{ContractExecutor, ContractOutcome, ContractRunner};
pub use llm::{GenericLlmStage, LlmExecutor, LlmStage};
pub use registry::StageRegistry;

use anyhow::Result;
use async_trait::async_trait;
use std::time::Instant;
use tracing::debug;

use crate::context::StageContext;
use crate::stage::{ArtifactBody, ArtifactEnvelope, Stage, StageResult, StoredArtifact};
use crate::store::{ArtifactStore, WrittenArtifact};
use crate::validator::{ArtifactValidator, VerificationResult};

/// What an executor declares about itself: its stage, the input fields it
/// needs, and the output fields it promises.
#[derive(Debug, Clone)]
pub struct ExecutorDescriptor {
    pub stage: Stage,
    pub required_inputs: Vec<String>,
    pub produced_outputs: Vec<String>,
}

impl ExecutorDescriptor {
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            required_inputs: Vec::new(),
            produced_outputs: Vec::new(),
        }
    }

    pub fn requires(mut self, fields: &[&str]) -> Self {
        self.required_inputs = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn produces(mut self, fields: &[&str]) -> Self {
        self.produced_outputs = fields.iter().map(|f| f.to_string()).collect();
        self
    }
}

/// The executor capability set. `execute` is the only phase without a
/// usable default.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    fn descriptor(&self) -> ExecutorDescriptor;

    /// Optional setup before input validation.
    async fn initialize(&self, _ctx: &StageContext) -> Result<()> {
        Ok(())
    }

    /// Default: every declared required input must be present in the
    /// input artifact. Returns the missing field names.
    fn validate_input(&self, ctx: &StageContext) -> Vec<String> {
        self.descriptor()
            .required_inputs
            .iter()
            .filter(|field| !ctx.input_artifact.contains_key(*field))
            .cloned()
            .collect()
    }

    /// The stage's actual work.
    async fn execute(&self, ctx: &StageContext) -> Result<StageResult>;

    /// Default: declared output fields must be present, then the stage's
    /// artifact-type rules apply.
    fn validate_output(&self, artifact: &ArtifactBody) -> VerificationResult {
        let descriptor = self.descriptor();
        let mut result = VerificationResult::ok();
        for field in &descriptor.produced_outputs {
            if !artifact.contains_key(field) {
                result
                    .errors
                    .push(format!("missing declared output field '{field}'"));
            }
        }
        result.merge(ArtifactValidator::new().validate_stage_output(descriptor.stage, artifact));
        result
    }

    /// Optional teardown after the artifact has been persisted.
    async fn finalize(&self, _ctx: &StageContext, _result: &StageResult) -> Result<()> {
        Ok(())
    }
}

/// A stage execution plus the receipt for its persisted artifact.
/// `retryable` is true only for executor faults — validation failures
/// concluded the stage and never retry.
#[derive(Debug, Clone)]
pub struct StageOutcome {
    pub result: StageResult,
    pub written: Option<WrittenArtifact>,
    pub retryable: bool,
}

impl StageOutcome {
    fn concluded(result: StageResult) -> Self {
        Self {
            result,
            written: None,
            retryable: false,
        }
    }

    fn fault(result: StageResult) -> Self {
        Self {
            result,
            written: None,
            retryable: true,
        }
    }
}

/// Drive one executor through its lifecycle. A completed result has its
/// artifact persisted under `{pipeline_id}/{index:02}-{stage}.yaml`
/// (iteration-tagged on re-runs) before `finalize` runs.
pub async fn run_stage(
    executor: &dyn StageExecutor,
    ctx: &StageContext,
    artifacts: &ArtifactStore,
) -> StageOutcome {
    let stage = ctx.stage;
    let started = Instant::now();
    debug!(pipeline = %ctx.pipeline_id, %stage, iteration = ctx.iteration, "stage starting");

    if let Err(err) = executor.initialize(ctx).await {
        return StageOutcome::fault(
            StageResult::failed(stage, format!("initialize failed: {err:#}"))
                .with_duration(started.elapsed().as_secs_f64()),
        );
    }

    let missing = executor.validate_input(ctx);
    if !missing.is_empty() {
        return StageOutcome::concluded(
            StageResult::failed(
                stage,
                format!("required input fields missing: {}", missing.join(", ")),
            )
            .with_duration(started.elapsed().as_secs_f64()),
        );
    }

    let mut result = match executor.execute(ctx).await {
        Ok(result) => result,
        Err(err) => {
            return StageOutcome::fault(
                StageResult::failed(stage, format!("{err:#}"))
                    .with_duration(started.elapsed().as_secs_f64()),
            );
        }
    };
    result.duration_secs = started.elapsed().as_secs_f64();

    // Escalations skip output validation: the stage has not concluded.
    if result.escalated_to_human() {
        return StageOutcome::concluded(result);
    }

    // An executor-reported failure (e.g. unparseable response) may succeed
    // on retry.
    if !result.success() {
        return StageOutcome::fault(result);
    }

    let Some(artifact) = result.artifact.clone() else {
        return StageOutcome::fault(
            StageResult::failed(stage, "executor reported success without an artifact")
                .with_duration(started.elapsed().as_secs_f64()),
        );
    };

    let verification = executor.validate_output(&artifact);
    if !verification.valid() {
        return StageOutcome::concluded(
            StageResult::failed(
                stage,
                format!("output validation failed: {}", verification.errors.join("; ")),
            )
            .with_duration(started.elapsed().as_secs_f64()),
        );
    }

    let stored = StoredArtifact {
        meta: ArtifactEnvelope::for_stage(stage),
        body: artifact,
    };
    let written = match artifacts.write(&ctx.pipeline_id, ctx.stage_index, ctx.iteration, &stored) {
        Ok(written) => written,
        Err(err) => {
            return StageOutcome::concluded(
                StageResult::failed(stage, format!("artifact persistence failed: {err:#}"))
                    .with_duration(started.elapsed().as_secs_f64()),
            );
        }
    };

    if let Err(err) = executor.finalize(ctx, &result).await {
        return StageOutcome::concluded(
            StageResult::failed(stage, format!("finalize failed: {err:#}"))
                .with_duration(started.elapsed().as_secs_f64()),
        );
    }

    StageOutcome {
        result,
        written: Some(written),
        retryable: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextBudget, StageContext};
    use serde_json::json;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    pub(crate) fn make_ctx(stage: Stage, input: ArtifactBody) -> StageContext {
        StageContext {
            pipeline_id: "PL-20250101000000-exec0001".to_string(),
            template: "implement".to_string(),
            stage,
            stage_index: 0,
            input_artifact: input,
            user_request: "Add OAuth2 authentication".to_string(),
            project_dir: std::env::temp_dir(),
            state_dir: std::env::temp_dir(),
            completed_stages: Vec::new(),
            completed_artifacts: BTreeMap::new(),
            iteration: 1,
            previous_feedback: None,
            recent_actions: Vec::new(),
            verification_summary: None,
            available_tools: Vec::new(),
            timeout_secs: None,
            budget: ContextBudget::default(),
        }
    }

    struct FixedExecutor {
        descriptor: ExecutorDescriptor,
        artifact: ArtifactBody,
    }

    #[async_trait]
    impl StageExecutor for FixedExecutor {
        fn descriptor(&self) -> ExecutorDescriptor {
            self.descriptor.clone()
        }

        async fn execute(&self, ctx: &StageContext) -> Result<StageResult> {
            Ok(StageResult::completed(ctx.stage, self.artifact.clone()))
        }
    }

    struct FaultyExecutor;

    #[async_trait]
    impl StageExecutor for FaultyExecutor {
        fn descriptor(&self) -> ExecutorDescriptor {
            ExecutorDescriptor::new(Stage::Intake)
        }

        async fn execute(&self, _ctx: &StageContext) -> Result<StageResult> {
            anyhow::bail!("provider unavailable")
        }
    }

    fn intake_body() -> ArtifactBody {
        json!({"detected_scope": "bug_fix", "priority": "low"})
            .as_object()
            .unwrap()
            .clone()
    }

    #[tokio::test]
    async fn test_run_stage_persists_artifact_on_success() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let executor = FixedExecutor {
            descriptor: ExecutorDescriptor::new(Stage::Intake).produces(&["detected_scope"]),
            artifact: intake_body(),
        };
        let ctx = make_ctx(Stage::Intake, ArtifactBody::new());

        let outcome = run_stage(&executor, &ctx, &store).await;
        assert!(outcome.result.success());
        let written = outcome.written.unwrap();
        assert_eq!(written.file_name, "00-intake.yaml");
        assert!(store.read(&ctx.pipeline_id, &written.file_name).is_ok());
    }

    #[tokio::test]
    async fn test_missing_required_input_fails_before_execute() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let executor = FixedExecutor {
            descriptor: ExecutorDescriptor::new(Stage::Clarify).requires(&["detected_scope"]),
            artifact: ArtifactBody::new(),
        };
        let ctx = make_ctx(Stage::Clarify, ArtifactBody::new());

        let outcome = run_stage(&executor, &ctx, &store).await;
        assert!(!outcome.result.success());
        assert!(
            outcome
                .result
                .error
                .unwrap()
                .contains("required input fields missing: detected_scope")
        );
        assert!(outcome.written.is_none());
    }

    #[tokio::test]
    async fn test_executor_exception_becomes_failed_result() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let ctx = make_ctx(Stage::Intake, ArtifactBody::new());
        let outcome = run_stage(&FaultyExecutor, &ctx, &store).await;
        assert!(!outcome.result.success());
        assert!(outcome.result.error.unwrap().contains("provider unavailable"));
    }

    #[tokio::test]
    async fn test_output_validation_failure_blocks_persistence() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let executor = FixedExecutor {
            descriptor: ExecutorDescriptor::new(Stage::Intake).produces(&["not_produced"]),
            artifact: intake_body(),
        };
        let ctx = make_ctx(Stage::Intake, ArtifactBody::new());

        let outcome = run_stage(&executor, &ctx, &store).await;
        assert!(!outcome.result.success());
        assert!(outcome.written.is_none());
        assert!(store.list(&ctx.pipeline_id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_escalated_result_passes_through_unvalidated() {
        struct EscalatingExecutor;

        #[async_trait]
        impl StageExecutor for EscalatingExecutor {
            fn descriptor(&self) -> ExecutorDescriptor {
                ExecutorDescriptor::new(Stage::Clarify)
            }

            async fn execute(&self, ctx: &StageContext) -> Result<StageResult> {
                Ok(StageResult::escalated(
                    ctx.stage,
                    "two blocking questions need answers",
                    None,
                ))
            }
        }

        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let ctx = make_ctx(Stage::Clarify, ArtifactBody::new());
        let outcome = run_stage(&EscalatingExecutor, &ctx, &store).await;
        assert!(outcome.result.escalated_to_human());
        assert!(outcome.written.is_none());
    }

    #[tokio::test]
    async fn test_success_without_artifact_is_a_failure() {
        struct EmptyExecutor;

        #[async_trait]
        impl StageExecutor for EmptyExecutor {
            fn descriptor(&self) -> ExecutorDescriptor {
                ExecutorDescriptor::new(Stage::Intake)
            }

            async fn execute(&self, ctx: &StageContext) -> Result<StageResult> {
                let mut result = StageResult::completed(ctx.stage, ArtifactBody::new());
                result.artifact = None;
                Ok(result)
            }
        }

        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let ctx = make_ctx(Stage::Intake, ArtifactBody::new());
        let outcome = run_stage(&EmptyExecutor, &ctx, &store).await;
        assert!(!outcome.result.success());
        assert!(outcome.result.error.unwrap().contains("without an artifact"));
    }

    #[tokio::test]
    async fn test_rerun_iteration_writes_tagged_file() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let executor = FixedExecutor {
            descriptor: ExecutorDescriptor::new(Stage::Intake),
            artifact: intake_body(),
        };
        let mut ctx = make_ctx(Stage::Intake, ArtifactBody::new());

        let first = run_stage(&executor, &ctx, &store).await;
        ctx.iteration = 2;
        let second = run_stage(&executor, &ctx, &store).await;

        assert_eq!(first.written.unwrap().file_name, "00-intake.yaml");
        assert_eq!(second.written.unwrap().file_name, "00-intake.iter2.yaml");
    }
}
