//! Pipeline templates and the runtime `PipelineConfig`.
//!
//! A template is the named, ordered stage list plus defaults loaded from
//! `.agentforge/pipelines/<name>.yaml`. At start time the controller merges
//! the template with CLI/API overrides into a `PipelineConfig`, which is
//! embedded in the pipeline state and immutable for the rest of the run.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use crate::config::Config;
use crate::settings::expand_env;
use crate::stage::Stage;

/// How the deliver stage hands off its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    #[default]
    Commit,
    Pr,
    Files,
    Patch,
}

impl std::fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeliveryMode::Commit => "commit",
            DeliveryMode::Pr => "pr",
            DeliveryMode::Files => "files",
            DeliveryMode::Patch => "patch",
        };
        write!(f, "{s}")
    }
}

impl FromStr for DeliveryMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "commit" => Ok(DeliveryMode::Commit),
            "pr" => Ok(DeliveryMode::Pr),
            "files" => Ok(DeliveryMode::Files),
            "patch" => Ok(DeliveryMode::Patch),
            _ => anyhow::bail!("Invalid delivery mode '{}'. Valid: commit, pr, files, patch", s),
        }
    }
}

/// Per-stage overrides, from a template's `stage_config` section or from
/// `.agentforge/config/stages/<stage>.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageOverride {
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_iterations: Option<u32>,
    /// Tool names this stage's executor may invoke through the bridge.
    #[serde(default)]
    pub tools: Vec<String>,
}

/// Template defaults applied when the caller does not override them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateDefaults {
    #[serde(default)]
    pub supervised: bool,
    #[serde(default)]
    pub exit_after: Option<Stage>,
    #[serde(default)]
    pub iteration_enabled: bool,
    #[serde(default = "default_max_iterations")]
    pub max_iterations_per_stage: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_max_iterations() -> u32 {
    5
}

fn default_timeout_secs() -> u64 {
    3600
}

impl Default for TemplateDefaults {
    fn default() -> Self {
        Self {
            supervised: false,
            exit_after: None,
            iteration_enabled: false,
            max_iterations_per_stage: default_max_iterations(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Exit conditions a template can declare beyond the stage sequence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExitConditions {
    #[serde(default)]
    pub max_cost_usd: Option<f64>,
    /// Abort instead of pausing when a stage escalates.
    #[serde(default)]
    pub abort_on_escalation: bool,
}

/// A named pipeline template as persisted under `pipelines/<name>.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineTemplate {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub stages: Vec<Stage>,
    #[serde(default)]
    pub defaults: TemplateDefaults,
    #[serde(default)]
    pub stage_config: BTreeMap<String, StageOverride>,
    #[serde(default)]
    pub exit_conditions: ExitConditions,
    /// Input-artifact fields the first stage requires to be present in the
    /// initial context (for templates that resume from prior artifacts).
    #[serde(default)]
    pub required_context: Vec<String>,
}

impl PipelineTemplate {
    /// Load a template by name: file under `pipelines/` first, built-in
    /// fallback second.
    pub fn load(config: &Config, name: &str) -> Result<Self> {
        let path = config.template_file(name);
        if path.exists() {
            return Self::load_file(&path);
        }
        builtin(name).ok_or_else(|| {
            anyhow::anyhow!(
                "Pipeline template '{}' not found (no {} and no built-in)",
                name,
                path.display()
            )
        })
    }

    pub fn load_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read template {}", path.display()))?;
        let template: PipelineTemplate = serde_yaml::from_str(&expand_env(&raw))
            .with_context(|| format!("Failed to parse template {}", path.display()))?;
        template.validate()?;
        Ok(template)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let yaml = serde_yaml::to_string(self).context("Failed to serialize template")?;
        std::fs::write(path, yaml)
            .with_context(|| format!("Failed to write template {}", path.display()))?;
        Ok(())
    }

    /// Structural checks: non-duplicate stages, exit_after present in the
    /// sequence, stage_config keys referring to known stages.
    pub fn validate(&self) -> Result<()> {
        if self.stages.windows(2).any(|w| w[0] == w[1]) {
            anyhow::bail!("Template '{}' repeats a stage consecutively", self.name);
        }
        if let Some(exit) = self.defaults.exit_after
            && !self.stages.contains(&exit)
        {
            anyhow::bail!(
                "Template '{}': exit_after stage '{}' is not in the sequence",
                self.name,
                exit
            );
        }
        for key in self.stage_config.keys() {
            Stage::from_str(key)
                .with_context(|| format!("Template '{}': unknown stage_config key", self.name))?;
        }
        Ok(())
    }
}

/// Built-in templates available without any files on disk.
pub fn builtin(name: &str) -> Option<PipelineTemplate> {
    match name {
        "implement" => Some(PipelineTemplate {
            name: "implement".to_string(),
            description: "Full request-to-delivery pipeline".to_string(),
            stages: vec![
                Stage::Intake,
                Stage::Clarify,
                Stage::Analyze,
                Stage::Spec,
                Stage::Red,
                Stage::Green,
                Stage::Refactor,
                Stage::Deliver,
            ],
            defaults: TemplateDefaults {
                iteration_enabled: true,
                ..TemplateDefaults::default()
            },
            stage_config: BTreeMap::new(),
            exit_conditions: ExitConditions::default(),
            required_context: Vec::new(),
        }),
        "design" => Some(PipelineTemplate {
            name: "design".to_string(),
            description: "Design-only pipeline, exits after spec".to_string(),
            stages: vec![Stage::Intake, Stage::Clarify, Stage::Analyze, Stage::Spec],
            defaults: TemplateDefaults {
                exit_after: Some(Stage::Spec),
                ..TemplateDefaults::default()
            },
            stage_config: BTreeMap::new(),
            exit_conditions: ExitConditions::default(),
            required_context: Vec::new(),
        }),
        _ => None,
    }
}

/// Caller overrides merged into the template at start time. Applies only
/// before first execution; resumption reuses the persisted config.
#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    pub supervised: Option<bool>,
    pub exit_after: Option<Stage>,
    pub iterate: Option<bool>,
    pub delivery_mode: Option<DeliveryMode>,
    pub timeout_secs: Option<u64>,
    /// Begin execution at this stage (e.g. `implement --skip-to red`).
    pub skip_to: Option<Stage>,
}

/// Immutable-for-the-run configuration embedded in the pipeline state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub template: String,
    pub stages: Vec<Stage>,
    #[serde(default)]
    pub exit_after: Option<Stage>,
    #[serde(default)]
    pub supervised: bool,
    #[serde(default)]
    pub iteration_enabled: bool,
    pub max_iterations_per_stage: u32,
    /// Retries per stage on executor error; attempts = retries + 1.
    #[serde(default = "default_max_retries")]
    pub max_retries_per_stage: u32,
    pub timeout_secs: u64,
    #[serde(default)]
    pub max_cost_usd: Option<f64>,
    #[serde(default)]
    pub delivery_mode: DeliveryMode,
    #[serde(default)]
    pub stage_config: BTreeMap<String, StageOverride>,
}

fn default_max_retries() -> u32 {
    2
}

impl PipelineConfig {
    /// Merge a template with run overrides and global cost settings.
    pub fn from_template(
        template: &PipelineTemplate,
        overrides: &RunOverrides,
        global_cost_cap: Option<f64>,
    ) -> Self {
        let max_cost_usd = template.exit_conditions.max_cost_usd.or(global_cost_cap);
        Self {
            template: template.name.clone(),
            stages: template.stages.clone(),
            exit_after: overrides.exit_after.or(template.defaults.exit_after),
            supervised: overrides.supervised.unwrap_or(template.defaults.supervised),
            iteration_enabled: overrides
                .iterate
                .unwrap_or(template.defaults.iteration_enabled),
            max_iterations_per_stage: template.defaults.max_iterations_per_stage,
            max_retries_per_stage: default_max_retries(),
            timeout_secs: overrides
                .timeout_secs
                .unwrap_or(template.defaults.timeout_secs),
            max_cost_usd,
            delivery_mode: overrides.delivery_mode.unwrap_or_default(),
            stage_config: template.stage_config.clone(),
        }
    }

    /// Effective per-stage override, merging the template's `stage_config`
    /// section with a standalone `config/stages/<stage>.yaml` file.
    pub fn stage_override(&self, config: &Config, stage: Stage) -> StageOverride {
        let mut merged = self
            .stage_config
            .get(stage.as_str())
            .cloned()
            .unwrap_or_default();
        let path = config.stage_config_file(stage.as_str());
        if path.exists()
            && let Ok(raw) = std::fs::read_to_string(&path)
            && let Ok(file_override) = serde_yaml::from_str::<StageOverride>(&expand_env(&raw))
        {
            if merged.timeout_secs.is_none() {
                merged.timeout_secs = file_override.timeout_secs;
            }
            if merged.max_iterations.is_none() {
                merged.max_iterations = file_override.max_iterations;
            }
            if merged.tools.is_empty() {
                merged.tools = file_override.tools;
            }
        }
        merged
    }

    /// Index of the first stage to execute, honoring `skip_to`.
    pub fn start_index(&self, skip_to: Option<Stage>) -> usize {
        match skip_to {
            Some(stage) => self
                .stages
                .iter()
                .position(|s| *s == stage)
                .unwrap_or(0),
            None => 0,
        }
    }
}
