//! Global settings loaded from `.agentforge/config/settings.yaml`.
//!
//! Settings cover the concerns that apply to every pipeline: LLM provider
//! selection, cost caps, supervised-by-default, auto-commit, and the
//! escalation backend. Values support `${VAR}` environment expansion so API
//! keys never live in the file itself.

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::OnceLock;

/// LLM provider settings. The kernel never talks to a provider directly;
/// these values select and configure the provider adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSettings {
    /// Adapter kind: "command" shells out to an agent CLI, "scripted"
    /// replays canned responses (tests and offline smoke runs).
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Command for the "command" adapter.
    #[serde(default = "default_command")]
    pub command: String,
    #[serde(default = "default_command_args")]
    pub args: Vec<String>,
    #[serde(default = "default_model")]
    pub model: String,
    /// API key handed to adapters that need one, expanded from the
    /// environment at load time.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
}

fn default_provider() -> String {
    "command".to_string()
}

fn default_command() -> String {
    "claude".to_string()
}

fn default_command_args() -> Vec<String> {
    vec!["--print".to_string()]
}

fn default_model() -> String {
    "claude-sonnet-4-5".to_string()
}

fn default_max_output_tokens() -> u32 {
    8192
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            command: default_command(),
            args: default_command_args(),
            model: default_model(),
            api_key: None,
            max_output_tokens: default_max_output_tokens(),
        }
    }
}

/// Cost caps consulted by the controller at stage boundaries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostSettings {
    #[serde(default)]
    pub max_per_pipeline_usd: Option<f64>,
    #[serde(default)]
    pub max_daily_usd: Option<f64>,
}

/// Which escalation backend answers `wait_for_resolution` / `request_approval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EscalationBackendKind {
    /// Write escalation YAML files and poll for sibling resolution files.
    #[default]
    File,
    /// Prompt the operator in the terminal.
    Terminal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationSettings {
    #[serde(default)]
    pub backend: EscalationBackendKind,
    /// Maximum wait before an unresolved escalation becomes an abort.
    #[serde(default = "default_escalation_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

fn default_escalation_timeout() -> u64 {
    86_400
}

fn default_poll_interval() -> u64 {
    3
}

impl Default for EscalationSettings {
    fn default() -> Self {
        Self {
            backend: EscalationBackendKind::default(),
            timeout_secs: default_escalation_timeout(),
            poll_interval_secs: default_poll_interval(),
        }
    }
}

/// Top-level settings.yaml contents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub llm: LlmSettings,
    #[serde(default)]
    pub cost: CostSettings,
    #[serde(default)]
    pub escalation: EscalationSettings,
    /// Pause for approval after every stage unless overridden per run.
    #[serde(default)]
    pub supervised_by_default: bool,
    /// Allow the deliver stage to create commits without prompting.
    #[serde(default)]
    pub auto_commit: bool,
}

impl Settings {
    /// Load settings from a YAML file, applying `${VAR}` expansion to the
    /// raw text before parsing.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file {}", path.display()))?;
        let expanded = expand_env(&raw);
        serde_yaml::from_str(&expanded)
            .with_context(|| format!("Failed to parse settings file {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let yaml = serde_yaml::to_string(self).context("Failed to serialize settings")?;
        std::fs::write(path, yaml)
            .with_context(|| format!("Failed to write settings file {}", path.display()))?;
        Ok(())
    }
}

/// Expand `${VAR}` references against the process environment. Unset
/// variables expand to the empty string so a missing optional key does not
/// poison the whole file.
pub fn expand_env(raw: &str) -> String {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let re = PATTERN.get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap());
    re.replace_all(raw, |caps: &regex::Captures<'_>| {
        std::env::var(&caps[1]).unwrap_or_default()
    })
    .into_owned()
}

/// The default settings.yaml written by `config init`.
pub fn default_settings_yaml() -> String {
    r#"# AgentForge global settings
llm:
  provider: command
  command: claude
  args: ["--print"]
  model: claude-sonnet-4-5
  api_key: ${ANTHROPIC_API_KEY}
  max_output_tokens: 8192

cost:
  max_per_pipeline_usd: null
  max_daily_usd: null

escalation:
  backend: file
  timeout_secs: 86400
  poll_interval_secs: 3

supervised_by_default: false
auto_commit: false
"#
    .to_string()
}
