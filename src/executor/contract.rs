//! Contract-wrapping stage executor.
//!
//! Reuses an existing external contract as a stage without rewriting it:
//! input artifact fields map onto the contract's inputs, the contract
//! runner executes, and its outputs map back into the stage artifact.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::{ExecutorDescriptor, StageExecutor};
use crate::context::StageContext;
use crate::stage::{ArtifactBody, Stage, StageResult};

/// Result of one contract run.
#[derive(Debug, Clone)]
pub struct ContractOutcome {
    pub ok: bool,
    pub outputs: ArtifactBody,
    pub errors: Vec<String>,
}

/// External contract runner, consumed as an opaque capability.
#[async_trait]
pub trait ContractRunner: Send + Sync {
    async fn run(&self, contract_id: &str, inputs: &ArtifactBody) -> Result<ContractOutcome>;
}

/// Stage executor backed by a named external contract.
pub struct ContractExecutor {
    stage: Stage,
    contract_id: String,
    runner: Arc<dyn ContractRunner>,
    /// artifact field → contract input name
    input_map: BTreeMap<String, String>,
    /// contract output name → artifact field
    output_map: BTreeMap<String, String>,
}

impl ContractExecutor {
    pub fn new(stage: Stage, contract_id: impl Into<String>, runner: Arc<dyn ContractRunner>) -> Self {
        Self {
            stage,
            contract_id: contract_id.into(),
            runner,
            input_map: BTreeMap::new(),
            output_map: BTreeMap::new(),
        }
    }

    /// Map an input artifact field onto a contract input.
    pub fn map_input(mut self, artifact_field: &str, contract_input: &str) -> Self {
        self.input_map
            .insert(artifact_field.to_string(), contract_input.to_string());
        self
    }

    /// Map a contract output back into an artifact field.
    pub fn map_output(mut self, contract_output: &str, artifact_field: &str) -> Self {
        self.output_map
            .insert(contract_output.to_string(), artifact_field.to_string());
        self
    }

    fn build_inputs(&self, ctx: &StageContext) -> ArtifactBody {
        let mut inputs = ArtifactBody::new();
        if self.input_map.is_empty() {
            // No mapping declared: the contract sees the artifact as-is.
            inputs = ctx.input_artifact.clone();
        } else {
            for (artifact_field, contract_input) in &self.input_map {
                if let Some(value) = ctx.input_artifact.get(artifact_field) {
                    inputs.insert(contract_input.clone(), value.clone());
                }
            }
        }
        inputs
    }

    fn build_artifact(&self, outcome: &ContractOutcome) -> ArtifactBody {
        if self.output_map.is_empty() {
            return outcome.outputs.clone();
        }
        let mut artifact = ArtifactBody::new();
        for (contract_output, artifact_field) in &self.output_map {
            if let Some(value) = outcome.outputs.get(contract_output) {
                artifact.insert(artifact_field.clone(), value.clone());
            }
        }
        artifact
    }
}

#[async_trait]
impl StageExecutor for ContractExecutor {
    fn descriptor(&self) -> ExecutorDescriptor {
        ExecutorDescriptor {
            stage: self.stage,
            required_inputs: self.input_map.keys().cloned().collect(),
            produced_outputs: Vec::new(),
        }
    }

    async fn execute(&self, ctx: &StageContext) -> Result<StageResult> {
        let inputs = self.build_inputs(ctx);
        let outcome = self.runner.run(&self.contract_id, &inputs).await?;

        if !outcome.ok {
            return Ok(StageResult::failed(
                ctx.stage,
                format!(
                    "contract '{}' failed: {}",
                    self.contract_id,
                    outcome.errors.join("; ")
                ),
            ));
        }
        Ok(StageResult::completed(ctx.stage, self.build_artifact(&outcome)))
    }

    /// Contract outputs are validated by the transition contract, not by
    /// declared-field checks; the stage rules still apply.
    fn validate_output(&self, artifact: &ArtifactBody) -> crate::validator::VerificationResult {
        crate::validator::ArtifactValidator::new().validate_stage_output(self.stage, artifact)
    }
}
