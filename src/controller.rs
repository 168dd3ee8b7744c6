//! Pipeline controller: the top-level orchestrator.
//!
//! Owns the run loop that drives a pipeline from creation (or its resume
//! point) to a terminal status: execute each stage with bounded retry,
//! pause on escalation, gate on supervised approval, validate the output
//! artifact against the next transition's contract, and persist progress
//! before acknowledging it. Single-threaded per pipeline; concurrency
//! exists only across pipelines, each guarded by the workspace lock.

use anyhow::{Context as _, Result};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::audit::{ActionKind, AuditLog, NewAction};
use crate::config::Config;
use crate::context::ContextBuilder;
use crate::errors::KernelError;
use crate::escalation::EscalationManager;
use crate::executor::{StageOutcome, StageRegistry, run_stage};
use crate::ids::new_pipeline_id;
use crate::pipeline::{PipelineResult, PipelineState, PipelineStatus, PipelineSummary};
use crate::stage::{ArtifactBody, FEEDBACK_KEY, RESOLUTION_KEY, Stage, StageResult};
use crate::store::{ArtifactStore, StateStore, WorkspaceLock, content_hash};
use crate::template::{PipelineConfig, PipelineTemplate, RunOverrides};
use crate::validator::ArtifactValidator;

/// Parameters for `execute`: a fresh run or a resumption.
#[derive(Debug, Clone, Default)]
pub struct ExecuteRequest {
    pub user_request: String,
    pub pipeline_type: String,
    pub initial_context: Option<ArtifactBody>,
    pub resume_pipeline_id: Option<String>,
    pub overrides: RunOverrides,
}

pub struct PipelineController {
    config: Config,
    registry: StageRegistry,
    escalation: Arc<dyn EscalationManager>,
    state_store: StateStore,
    artifact_store: ArtifactStore,
    audit: Arc<AuditLog>,
    validator: ArtifactValidator,
    context_builder: ContextBuilder,
}

/// What one stage execution asked the loop to do next.
enum StageVerdict {
    Completed {
        result: StageResult,
        artifact_file: String,
        artifact_hash: String,
    },
    Failed {
        error: String,
    },
    Aborted,
}

impl PipelineController {
    pub fn new(
        config: Config,
        registry: StageRegistry,
        escalation: Arc<dyn EscalationManager>,
    ) -> Self {
        let state_store = StateStore::new(&config.state_dir);
        let artifact_store = ArtifactStore::new(&config.artifacts_dir);
        let audit = Arc::new(AuditLog::new(&config.audit_dir));
        let context_builder =
            ContextBuilder::new(config.project_dir.clone(), config.state_dir.clone());
        Self {
            config,
            registry,
            escalation,
            state_store,
            artifact_store,
            audit,
            validator: ArtifactValidator::new(),
            context_builder,
        }
    }

    pub fn audit(&self) -> Arc<AuditLog> {
        self.audit.clone()
    }

    pub fn artifact_store(&self) -> &ArtifactStore {
        &self.artifact_store
    }

    pub fn state_store(&self) -> &StateStore {
        &self.state_store
    }

    /// Start a new run or resume a persisted one. Returns when the
    /// pipeline reaches a terminal status (or an unanswered pause became a
    /// controlled stop). Template-not-found and a busy workspace are the
    /// only precondition errors; runtime failures land in the result with
    /// status `Failed` and progress preserved on disk.
    pub async fn execute(&self, request: ExecuteRequest) -> Result<PipelineResult, KernelError> {
        let _lock = WorkspaceLock::acquire(&self.config.state_dir)?;
        self.config
            .ensure_directories()
            .map_err(KernelError::Persistence)?;

        let state = match &request.resume_pipeline_id {
            Some(pipeline_id) => {
                let state = self
                    .state_store
                    .load(pipeline_id)
                    .map_err(KernelError::Persistence)?
                    .ok_or_else(|| KernelError::PipelineNotFound {
                        pipeline_id: pipeline_id.clone(),
                    })?;
                if state.is_terminal() {
                    // Resume of a finished pipeline is a no-op returning
                    // the same result.
                    return Ok(self.result_from_state(&state, 0.0));
                }
                info!(pipeline = %state.id, status = %state.status, "resuming pipeline");
                state
            }
            None => self.create_pipeline(&request)?,
        };

        Ok(self.run_loop(state).await)
    }

    fn create_pipeline(&self, request: &ExecuteRequest) -> Result<PipelineState, KernelError> {
        let template = PipelineTemplate::load(&self.config, &request.pipeline_type)
            .map_err(|_| KernelError::TemplateNotFound {
                name: request.pipeline_type.clone(),
            })?;
        let config = PipelineConfig::from_template(
            &template,
            &request.overrides,
            self.config.settings().cost.max_per_pipeline_usd,
        );

        let mut initial_context = request.initial_context.clone().unwrap_or_default();
        // Every intake gets a request id; callers may have assigned one.
        initial_context
            .entry("request_id".to_string())
            .or_insert_with(|| serde_json::Value::String(crate::ids::new_request_id()));

        let mut state = PipelineState::new(
            new_pipeline_id(),
            request.user_request.clone(),
            initial_context,
            config,
        );
        state.current_stage_index = state.config.start_index(request.overrides.skip_to);

        self.state_store.save(&state).map_err(KernelError::Persistence)?;
        self.append_audit(
            &state.id,
            NewAction::new(
                ActionKind::StateTransition,
                format!("pipeline created (template {})", state.config.template),
            ),
        );
        info!(pipeline = %state.id, template = %state.config.template, "pipeline created");
        Ok(state)
    }

    /// The §4.1 run loop. Any fault that cannot be retried marks the
    /// pipeline failed and returns; progress persisted so far stays.
    async fn run_loop(&self, mut state: PipelineState) -> PipelineResult {
        let run_started = Instant::now();
        let total_stages = state.config.stages.len();

        // Resumption re-reads the upstream artifact from disk so a crash
        // between stages sees byte-identical input.
        let mut current_artifact = match self.upstream_artifact(&state) {
            Ok(artifact) => artifact,
            Err(err) => {
                return self.fail(state, format!("failed to load upstream artifact: {err:#}"), run_started);
            }
        };

        while state.current_stage_index < total_stages {
            // Boundary checks: external abort, wall clock, cost cap.
            if self.abort_requested(&state.id) {
                self.clear_abort_marker(&state.id);
                return self.abort_inline(state, "abort requested", run_started);
            }
            if run_started.elapsed().as_secs_f64() > state.config.timeout_secs as f64 {
                let err = KernelError::TimeoutExceeded {
                    elapsed_secs: run_started.elapsed().as_secs(),
                    limit_secs: state.config.timeout_secs,
                };
                return self.fail(state, err.to_string(), run_started);
            }
            if let Some(cap) = state.config.max_cost_usd
                && state.cost_usd > cap
            {
                let err = KernelError::CostCapExceeded {
                    spent: state.cost_usd,
                    cap,
                };
                return self.fail(state, err.to_string(), run_started);
            }

            let stage = state.config.stages[state.current_stage_index];

            if state.transition(PipelineStatus::Running).is_err() {
                return self.fail(
                    state,
                    "pipeline entered the run loop in a non-resumable status".to_string(),
                    run_started,
                );
            }
            if let Err(err) = self.state_store.save(&state) {
                return self.fail(state, format!("persistence failure: {err:#}"), run_started);
            }

            let verdict = self
                .run_single_stage(&mut state, stage, &current_artifact)
                .await;

            match verdict {
                StageVerdict::Aborted => {
                    return self.result_from_state(&state, run_started.elapsed().as_secs_f64());
                }
                StageVerdict::Failed { error } => {
                    return self.fail(state, error, run_started);
                }
                StageVerdict::Completed {
                    result,
                    artifact_file,
                    artifact_hash,
                } => {
                    let artifact = result.artifact.clone().unwrap_or_default();

                    // Supervised gate before the stage is acknowledged.
                    if self.needs_approval(&state, stage) {
                        match self
                            .run_approval_gate(&mut state, stage, &artifact)
                            .await
                        {
                            ApprovalVerdict::Approved => {}
                            ApprovalVerdict::Rerun => continue,
                            ApprovalVerdict::Aborted => {
                                return self.result_from_state(
                                    &state,
                                    run_started.elapsed().as_secs_f64(),
                                );
                            }
                            ApprovalVerdict::Fault(error) => {
                                return self.fail(state, error, run_started);
                            }
                        }
                    }

                    state.mark_stage_completed(stage, artifact_file.clone());
                    state.pending_feedback = None;
                    state.pending_artifact = None;
                    if let Err(err) = self.state_store.save(&state) {
                        return self.fail(state, format!("persistence failure: {err:#}"), run_started);
                    }
                    self.append_audit(
                        &state.id,
                        NewAction::new(
                            ActionKind::StateTransition,
                            format!("stage {stage} completed"),
                        )
                        .stage(stage)
                        .output_hash(artifact_hash)
                        .detail(serde_json::json!({
                            "completed_stage": stage.as_str(),
                            "artifact_file": artifact_file,
                        })),
                    );
                    current_artifact = artifact;

                    if state.config.exit_after == Some(stage) {
                        info!(pipeline = %state.id, %stage, "early exit stage reached");
                        break;
                    }
                }
            }
        }

        if state.transition(PipelineStatus::Completed).is_err() {
            return self.fail(
                state,
                "could not finalize pipeline status".to_string(),
                run_started,
            );
        }
        if let Err(err) = self.state_store.save(&state) {
            return self.fail(state, format!("persistence failure: {err:#}"), run_started);
        }
        self.append_audit(
            &state.id,
            NewAction::new(ActionKind::StateTransition, "pipeline completed"),
        );
        info!(pipeline = %state.id, "pipeline completed");

        let mut result = self.result_from_state(&state, run_started.elapsed().as_secs_f64());

        // A run that ends on the spec stage persists its specification for
        // later `implement --from-spec` use and exposes the spec id.
        if state.completed_stages.last() == Some(&Stage::Spec)
            && let Ok(spec_id) = self.persist_spec(&state, &current_artifact)
        {
            current_artifact.insert(
                "spec_id".to_string(),
                serde_json::Value::String(spec_id),
            );
        }

        result.deliverable = Some(current_artifact);
        result
    }

    /// Write the final spec artifact under `specs/<SPEC-id>.yaml`.
    fn persist_spec(&self, state: &PipelineState, artifact: &ArtifactBody) -> Result<String> {
        let spec_id = crate::ids::new_spec_id();
        std::fs::create_dir_all(&self.config.specs_dir)
            .context("Failed to create specs directory")?;
        let stored = crate::stage::StoredArtifact {
            meta: crate::stage::ArtifactEnvelope::for_stage(Stage::Spec),
            body: artifact.clone(),
        };
        let yaml = serde_yaml::to_string(&stored).context("Failed to serialize spec")?;
        std::fs::write(self.config.spec_file(&spec_id), yaml)
            .context("Failed to write spec file")?;
        self.append_audit(
            &state.id,
            NewAction::new(
                ActionKind::StateTransition,
                format!("specification persisted as {spec_id}"),
            ),
        );
        Ok(spec_id)
    }

    /// Execute one stage to a verdict: bounded retries, escalation
    /// pause/resume, transition validation.
    async fn run_single_stage(
        &self,
        state: &mut PipelineState,
        stage: Stage,
        upstream: &ArtifactBody,
    ) -> StageVerdict {
        let mut input = upstream.clone();
        if let Some(feedback) = &state.pending_feedback {
            input.insert(
                FEEDBACK_KEY.to_string(),
                serde_json::Value::String(feedback.clone()),
            );
        }

        loop {
            match self.execute_with_retry(state, stage, &input).await {
                Err(error) => return StageVerdict::Failed { error },
                Ok(outcome) if outcome.result.escalated_to_human() => {
                    let reason = outcome
                        .result
                        .escalation_reason
                        .clone()
                        .unwrap_or_else(|| "unspecified escalation".to_string());
                    match self
                        .pause_for_resolution(state, stage, &reason, outcome.result.artifact.clone())
                        .await
                    {
                        PauseVerdict::Resume(context) => {
                            if let Some(context) = context {
                                input.insert(
                                    RESOLUTION_KEY.to_string(),
                                    serde_json::Value::Object(context),
                                );
                            }
                            continue;
                        }
                        PauseVerdict::Aborted => return StageVerdict::Aborted,
                        PauseVerdict::Fault(error) => return StageVerdict::Failed { error },
                    }
                }
                Ok(outcome) => {
                    // Success: validate against the next transition before
                    // the stage is acknowledged.
                    let artifact = outcome.result.artifact.clone().unwrap_or_default();
                    let next = state.config.stages.get(state.current_stage_index + 1);
                    if let Some(next) = next {
                        let verification =
                            self.validator.validate_transition(stage, *next, &artifact);
                        self.append_audit(
                            &state.id,
                            NewAction::new(
                                ActionKind::Verification,
                                format!("{stage}->{next}: {}", verification.summary()),
                            )
                            .stage(stage),
                        );
                        for warning in &verification.warnings {
                            warn!(pipeline = %state.id, %stage, warning, "verification warning");
                        }
                        if !verification.valid() {
                            // Artifact healing is reserved; v1 logs and fails.
                            return StageVerdict::Failed {
                                error: format!(
                                    "transition {stage}->{next} rejected the artifact: {}",
                                    verification.errors.join("; ")
                                ),
                            };
                        }
                    }

                    let Some(written) = outcome.written else {
                        return StageVerdict::Failed {
                            error: format!("stage {stage} completed without a persisted artifact"),
                        };
                    };
                    return StageVerdict::Completed {
                        result: outcome.result,
                        artifact_file: written.file_name,
                        artifact_hash: written.hash,
                    };
                }
            }
        }
    }

    /// Up to `max_retries_per_stage` retries on executor faults. Returns
    /// the successful or escalated result, or `Err` with the last error
    /// once the budget is spent. Validation failures do not retry.
    async fn execute_with_retry(
        &self,
        state: &mut PipelineState,
        stage: Stage,
        input: &ArtifactBody,
    ) -> Result<StageOutcome, String> {
        let Some(executor) = self.registry.get(stage) else {
            return Err(format!("no executor for stage {stage}"));
        };

        let iteration = state.bump_iteration(stage);
        if state.config.max_iterations_per_stage > 0
            && iteration > state.config.max_iterations_per_stage
        {
            return Err(format!(
                "stage {stage} exhausted its iteration budget ({} iterations)",
                state.config.max_iterations_per_stage
            ));
        }
        // The bumped counter is persisted before execution so a crash
        // after the artifact write resumes onto a fresh iteration tag.
        self.state_store
            .save(state)
            .map_err(|err| format!("persistence failure: {err:#}"))?;

        let stage_override = state.config.stage_override(&self.config, stage);
        let recent = self.audit.tail(&state.id, 3).unwrap_or_default();
        let verification_summary = recent
            .iter()
            .rev()
            .find(|r| r.kind == ActionKind::Verification)
            .map(|r| r.summary.clone());
        let input_hash = content_hash(
            serde_json::to_string(input).unwrap_or_default().as_bytes(),
        );

        let attempts = state.config.max_retries_per_stage + 1;
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            let ctx = self.context_builder.build(
                state,
                stage,
                state.current_stage_index,
                input,
                &self.artifact_store,
                &recent,
                verification_summary.clone(),
                stage_override.tools.clone(),
                stage_override.timeout_secs,
            );

            let outcome = run_stage(executor.as_ref(), &ctx, &self.artifact_store).await;
            state.add_usage(
                outcome.result.usage.total_tokens(),
                outcome.result.usage.cost_usd,
            );

            self.append_audit(
                &state.id,
                NewAction::new(
                    ActionKind::LlmCall,
                    format!(
                        "stage {stage} attempt {attempt}/{attempts}: {}",
                        match (&outcome.result.success(), &outcome.result.escalation_reason) {
                            (true, _) => "completed".to_string(),
                            (_, Some(reason)) => format!("escalated ({reason})"),
                            _ => outcome.result.error.clone().unwrap_or_default(),
                        }
                    ),
                )
                .stage(stage)
                .input_hash(input_hash.clone())
                .usage(outcome.result.usage.total_tokens(), outcome.result.usage.cost_usd),
            );

            if outcome.result.success() || outcome.result.escalated_to_human() {
                return Ok(outcome);
            }

            last_error = outcome
                .result
                .error
                .clone()
                .unwrap_or_else(|| "unknown stage failure".to_string());

            if !outcome.retryable {
                break;
            }
            warn!(pipeline = %state.id, %stage, attempt, error = %last_error, "stage attempt failed");
        }

        Err(format!("stage {stage} failed: {last_error}"))
    }

    /// Escalation pause: persist paused status, block on the backend, and
    /// translate the resolution.
    async fn pause_for_resolution(
        &self,
        state: &mut PipelineState,
        stage: Stage,
        reason: &str,
        partial: Option<ArtifactBody>,
    ) -> PauseVerdict {
        if let Err(err) = state.transition(PipelineStatus::Paused) {
            return PauseVerdict::Fault(err.to_string());
        }
        if let Err(err) = self.state_store.save(state) {
            return PauseVerdict::Fault(format!("persistence failure: {err:#}"));
        }
        self.append_audit(
            &state.id,
            NewAction::new(
                ActionKind::StateTransition,
                format!("paused: stage {stage} escalated: {reason}"),
            )
            .stage(stage),
        );

        let resolution = match self
            .escalation
            .wait_for_resolution(&state.id, stage, reason, partial)
            .await
        {
            Ok(resolution) => resolution,
            Err(err) => return PauseVerdict::Fault(format!("escalation backend failed: {err:#}")),
        };

        if resolution.abort {
            if state.transition(PipelineStatus::Aborted).is_ok() {
                state.error = Some(format!("aborted during escalation at stage {stage}"));
                let _ = self.state_store.save(state);
            }
            self.append_audit(
                &state.id,
                NewAction::new(ActionKind::StateTransition, "aborted by escalation resolution")
                    .stage(stage),
            );
            return PauseVerdict::Aborted;
        }

        if let Err(err) = state.transition(PipelineStatus::Running) {
            return PauseVerdict::Fault(err.to_string());
        }
        if let Err(err) = self.state_store.save(state) {
            return PauseVerdict::Fault(format!("persistence failure: {err:#}"));
        }
        PauseVerdict::Resume(resolution.context)
    }

    fn needs_approval(&self, state: &PipelineState, stage: Stage) -> bool {
        state.config.supervised
            && state.config.exit_after != Some(stage)
            && state.current_stage_index + 1 < state.config.stages.len()
    }

    /// Supervised gate: persist awaiting_approval with the pending
    /// artifact, block for the verdict, and translate it.
    async fn run_approval_gate(
        &self,
        state: &mut PipelineState,
        stage: Stage,
        artifact: &ArtifactBody,
    ) -> ApprovalVerdict {
        if let Err(err) = state.transition(PipelineStatus::AwaitingApproval) {
            return ApprovalVerdict::Fault(err.to_string());
        }
        state.pending_artifact = Some(artifact.clone());
        if let Err(err) = self.state_store.save(state) {
            return ApprovalVerdict::Fault(format!("persistence failure: {err:#}"));
        }

        let approval = match self
            .escalation
            .request_approval(&state.id, stage, artifact)
            .await
        {
            Ok(approval) => approval,
            Err(err) => return ApprovalVerdict::Fault(format!("approval backend failed: {err:#}")),
        };

        state.pending_artifact = None;
        if approval.approved {
            state.approved_stages.push(stage);
            if let Err(err) = state.transition(PipelineStatus::Running) {
                return ApprovalVerdict::Fault(err.to_string());
            }
            if let Err(err) = self.state_store.save(state) {
                return ApprovalVerdict::Fault(format!("persistence failure: {err:#}"));
            }
            self.append_audit(
                &state.id,
                NewAction::new(ActionKind::StateTransition, format!("stage {stage} approved"))
                    .stage(stage),
            );
            return ApprovalVerdict::Approved;
        }

        match approval.feedback {
            Some(feedback) if !feedback.trim().is_empty() => {
                // Rejection with feedback: same stage re-runs with the
                // feedback visible under the reserved key.
                state.pending_feedback = Some(feedback);
                if let Err(err) = state.transition(PipelineStatus::Running) {
                    return ApprovalVerdict::Fault(err.to_string());
                }
                if let Err(err) = self.state_store.save(state) {
                    return ApprovalVerdict::Fault(format!("persistence failure: {err:#}"));
                }
                self.append_audit(
                    &state.id,
                    NewAction::new(
                        ActionKind::StateTransition,
                        format!("stage {stage} rejected with feedback; re-running"),
                    )
                    .stage(stage),
                );
                ApprovalVerdict::Rerun
            }
            _ => {
                // Outright rejection is a user abort.
                if state.transition(PipelineStatus::Aborted).is_ok() {
                    state.error = Some(format!("approval rejected at stage {stage}"));
                    let _ = self.state_store.save(state);
                }
                self.append_audit(
                    &state.id,
                    NewAction::new(
                        ActionKind::StateTransition,
                        format!("stage {stage} rejected without feedback; aborting"),
                    )
                    .stage(stage),
                );
                ApprovalVerdict::Aborted
            }
        }
    }

    /// The artifact feeding the current stage: initial context for index
    /// 0, the previous stage's persisted artifact otherwise. A pipeline
    /// started mid-sequence (`--skip-to`) has no upstream artifact on
    /// disk; its initial context stands in (e.g. a persisted spec).
    fn upstream_artifact(&self, state: &PipelineState) -> Result<ArtifactBody> {
        if state.current_stage_index == 0 {
            return Ok(state.initial_context.clone());
        }
        let upstream = state.config.stages[state.current_stage_index - 1];
        match state.stage_artifacts.get(upstream.as_str()) {
            Some(file) => Ok(self.artifact_store.read(&state.id, file)?.body),
            None => Ok(state.initial_context.clone()),
        }
    }

    /// File name and hash of the most recent artifact written for (stage,
    /// current iteration).
    fn last_written(&self, state: &PipelineState, stage: Stage) -> Option<(String, String)> {
        let file_name = ArtifactStore::file_name(
            state.current_stage_index,
            stage,
            state.iteration_count(stage),
        );
        let artifact = self.artifact_store.read(&state.id, &file_name).ok()?;
        let yaml = serde_yaml::to_string(&artifact).ok()?;
        Some((file_name, content_hash(yaml.as_bytes())))
    }

    fn fail(
        &self,
        mut state: PipelineState,
        error: String,
        run_started: Instant,
    ) -> PipelineResult {
        warn!(pipeline = %state.id, %error, "pipeline failed");
        if state.transition(PipelineStatus::Failed).is_ok() {
            state.error = Some(error.clone());
            if let Err(save_err) = self.state_store.save(&state) {
                warn!(pipeline = %state.id, %save_err, "failed to persist failure state");
            }
        }
        self.append_audit(
            &state.id,
            NewAction::new(ActionKind::StateTransition, format!("pipeline failed: {error}")),
        );
        self.result_from_state(&state, run_started.elapsed().as_secs_f64())
    }

    fn abort_inline(
        &self,
        mut state: PipelineState,
        reason: &str,
        run_started: Instant,
    ) -> PipelineResult {
        if state.transition(PipelineStatus::Aborted).is_ok() {
            state.error = Some(reason.to_string());
            let _ = self.state_store.save(&state);
        }
        self.append_audit(
            &state.id,
            NewAction::new(ActionKind::StateTransition, format!("pipeline aborted: {reason}")),
        );
        self.result_from_state(&state, run_started.elapsed().as_secs_f64())
    }

    fn result_from_state(&self, state: &PipelineState, duration_secs: f64) -> PipelineResult {
        let deliverable = if state.status == PipelineStatus::Completed {
            state
                .completed_stages
                .last()
                .and_then(|stage| state.stage_artifacts.get(stage.as_str()))
                .and_then(|file| self.artifact_store.read(&state.id, file).ok())
                .map(|stored| stored.body)
                .or_else(|| Some(state.initial_context.clone()))
        } else {
            None
        };
        PipelineResult {
            pipeline_id: state.id.clone(),
            status: state.status,
            deliverable,
            error: state.error.clone(),
            completed_stages: state.completed_stages.clone(),
            tokens_used: state.tokens_used,
            cost_usd: state.cost_usd,
            duration_secs,
        }
    }

    fn append_audit(&self, pipeline_id: &str, action: NewAction) {
        if let Err(err) = self.audit.append(pipeline_id, action) {
            warn!(pipeline = pipeline_id, %err, "audit append failed");
        }
    }

    // ── Control operations ──────────────────────────────────────────────

    pub fn get_status(&self, pipeline_id: &str) -> Result<Option<PipelineState>> {
        self.state_store.load(pipeline_id)
    }

    pub fn list(
        &self,
        status_filter: Option<PipelineStatus>,
        limit: usize,
    ) -> Result<Vec<PipelineSummary>> {
        self.state_store.list(status_filter, limit)
    }

    /// Abort a non-terminal pipeline. If another process owns the
    /// workspace, an abort marker is left for it to honor at the next
    /// stage boundary; otherwise the state transitions immediately.
    pub fn abort(&self, pipeline_id: &str, reason: &str) -> Result<bool> {
        let Some(mut state) = self.state_store.load(pipeline_id)? else {
            return Ok(false);
        };
        if state.is_terminal() {
            return Ok(false);
        }

        match WorkspaceLock::acquire(&self.config.state_dir) {
            Ok(_lock) => {
                state.transition(PipelineStatus::Aborted)?;
                state.error = Some(reason.to_string());
                self.state_store.save(&state)?;
                self.append_audit(
                    pipeline_id,
                    NewAction::new(
                        ActionKind::StateTransition,
                        format!("pipeline aborted: {reason}"),
                    ),
                );
                Ok(true)
            }
            Err(KernelError::WorkspaceLocked { .. }) => {
                // A live controller owns it; leave a marker it checks at
                // the next boundary.
                std::fs::write(self.abort_marker(pipeline_id), reason)
                    .context("Failed to write abort marker")?;
                Ok(true)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Approve a pipeline waiting on a supervised gate. With a live owner
    /// the answer travels through the escalation backend's resolution
    /// file; with no owner the stage is completed directly from the
    /// pending artifact and the pipeline is left resumable.
    pub fn approve(&self, pipeline_id: &str) -> Result<bool> {
        let Some(state) = self.state_store.load(pipeline_id)? else {
            return Ok(false);
        };
        if state.status != PipelineStatus::AwaitingApproval {
            return Ok(false);
        }

        if self.answer_pending_escalation(pipeline_id, "approved: true\n")? {
            return Ok(true);
        }

        // No live owner: apply the approval directly.
        let _lock = match WorkspaceLock::acquire(&self.config.state_dir) {
            Ok(lock) => lock,
            Err(_) => return Ok(false),
        };
        let Some(mut state) = self.state_store.load(pipeline_id)? else {
            return Ok(false);
        };
        let Some(stage) = state.current_stage() else {
            return Ok(false);
        };
        let Some((artifact_file, artifact_hash)) = self.last_written(&state, stage) else {
            return Ok(false);
        };

        state.approved_stages.push(stage);
        state.pending_artifact = None;
        state.transition(PipelineStatus::Running)?;
        state.mark_stage_completed(stage, artifact_file.clone());
        self.state_store.save(&state)?;
        self.append_audit(
            pipeline_id,
            NewAction::new(ActionKind::StateTransition, format!("stage {stage} approved"))
                .stage(stage)
                .output_hash(artifact_hash)
                .detail(serde_json::json!({
                    "completed_stage": stage.as_str(),
                    "artifact_file": artifact_file,
                })),
        );
        Ok(true)
    }

    /// Reject the pending artifact: with feedback the stage re-runs on
    /// resume, without feedback (or with `abort`) the pipeline aborts.
    pub fn reject(&self, pipeline_id: &str, feedback: Option<&str>, abort: bool) -> Result<bool> {
        let Some(state) = self.state_store.load(pipeline_id)? else {
            return Ok(false);
        };
        if state.status != PipelineStatus::AwaitingApproval {
            return Ok(false);
        }

        let answer = match (abort, feedback) {
            (true, _) | (false, None) => "approved: false\n".to_string(),
            (false, Some(feedback)) => {
                format!("approved: false\nfeedback: {}\n", serde_yaml::to_string(feedback)?.trim())
            }
        };
        if self.answer_pending_escalation(pipeline_id, &answer)? {
            return Ok(true);
        }

        let _lock = match WorkspaceLock::acquire(&self.config.state_dir) {
            Ok(lock) => lock,
            Err(_) => return Ok(false),
        };
        let Some(mut state) = self.state_store.load(pipeline_id)? else {
            return Ok(false);
        };
        match (abort, feedback) {
            (true, _) | (false, None) => {
                state.transition(PipelineStatus::Aborted)?;
                state.error = Some("approval rejected".to_string());
            }
            (false, Some(feedback)) => {
                state.pending_feedback = Some(feedback.to_string());
                state.pending_artifact = None;
                state.transition(PipelineStatus::Running)?;
            }
        }
        self.state_store.save(&state)?;
        Ok(true)
    }

    /// Stash feedback for the next execution of the current stage. Only
    /// meaningful while paused or awaiting approval.
    pub fn provide_feedback(&self, pipeline_id: &str, feedback: &str) -> Result<bool> {
        let Some(mut state) = self.state_store.load(pipeline_id)? else {
            return Ok(false);
        };
        if !matches!(
            state.status,
            PipelineStatus::Paused | PipelineStatus::AwaitingApproval
        ) {
            return Ok(false);
        }
        state.pending_feedback = Some(feedback.to_string());
        self.state_store.save(&state)?;
        Ok(true)
    }

    /// Write a resolution file for the newest pending escalation of this
    /// pipeline, unblocking a live owner polling for it. Returns false
    /// when no pending record exists.
    fn answer_pending_escalation(&self, pipeline_id: &str, answer: &str) -> Result<bool> {
        let records = crate::escalation::file::list_escalations(&self.config.escalations_dir)?;
        let Some(pending) = records.iter().find(|r| {
            r.pipeline_id == pipeline_id && r.status == crate::escalation::EscalationStatus::Pending
        }) else {
            return Ok(false);
        };
        let path = self
            .config
            .escalations_dir
            .join(format!("{}.resolution.yaml", pending.id));
        std::fs::write(&path, answer)
            .with_context(|| format!("Failed to write resolution {}", path.display()))?;
        Ok(true)
    }

    fn abort_marker(&self, pipeline_id: &str) -> std::path::PathBuf {
        self.config.state_dir.join(format!("{pipeline_id}.abort"))
    }

    fn abort_requested(&self, pipeline_id: &str) -> bool {
        self.abort_marker(pipeline_id).exists()
    }

    fn clear_abort_marker(&self, pipeline_id: &str) {
        let _ = std::fs::remove_file(self.abort_marker(pipeline_id));
    }
}

enum PauseVerdict {
    Resume(Option<ArtifactBody>),
    Aborted,
    Fault(String),
}

enum ApprovalVerdict {
    Approved,
    Rerun,
    Aborted,
    Fault(String),
}
