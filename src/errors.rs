//! Typed error hierarchy for the AgentForge kernel.
//!
//! Three top-level enums cover the three subsystems:
//! - `KernelError` — pipeline-level failures raised by the controller
//! - `StageFailure` — per-stage execution failures
//! - `ToolError` — tool bridge dispatch failures
//!
//! Business outcomes (a stage concluding unsuccessfully, an escalation, a
//! rejected approval) are not errors; they travel as `StageResult` /
//! `ApprovalResult` values. These enums are reserved for genuine faults.

use thiserror::Error;

/// Errors raised by the pipeline controller.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("Pipeline template '{name}' not found")]
    TemplateNotFound { name: String },

    #[error("Pipeline {pipeline_id} not found")]
    PipelineNotFound { pipeline_id: String },

    #[error("Cost cap exceeded: spent ${spent:.4} of ${cap:.4} cap")]
    CostCapExceeded { spent: f64, cap: f64 },

    #[error("Pipeline timeout exceeded: {elapsed_secs}s elapsed, limit {limit_secs}s")]
    TimeoutExceeded { elapsed_secs: u64, limit_secs: u64 },

    #[error("Workspace already locked by another pipeline at {}", path.display())]
    WorkspaceLocked { path: std::path::PathBuf },

    #[error("Persistence failure: {0}")]
    Persistence(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Failures from a single stage execution.
#[derive(Debug, Error)]
pub enum StageFailure {
    #[error("Stage {stage}: required input fields missing: {}", missing.join(", "))]
    InputValidation { stage: String, missing: Vec<String> },

    #[error("Stage {stage}: output validation failed: {}", errors.join("; "))]
    OutputValidation { stage: String, errors: Vec<String> },

    #[error("Stage {stage} failed after {attempts} attempt(s): {message}")]
    Executor {
        stage: String,
        attempts: u32,
        message: String,
    },

    #[error("No executor registered for stage '{stage}'")]
    NoExecutor { stage: String },

    #[error("Stage {stage}: could not parse an artifact from the model response")]
    UnparseableResponse { stage: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the tool bridge.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Unknown tool '{name}'")]
    UnknownTool { name: String },

    #[error("Tool '{name}' timed out after {timeout_secs}s")]
    Timeout { name: String, timeout_secs: u64 },

    #[error("Tool '{name}' failed: {message}")]
    HandlerFailed { name: String, message: String },

    #[error("Tool '{name}': invalid parameters: {message}")]
    InvalidParams { name: String, message: String },
}
