//! Runtime configuration for the AgentForge kernel.
//!
//! Bridges the persisted settings under `.agentforge/` with the runtime
//! needs of the controller: resolved directory paths for every store plus
//! the loaded global settings.
//!
//! On-disk layout under the project directory:
//!
//! ```text
//! .agentforge/
//! ├── config/
//! │   ├── settings.yaml        global settings
//! │   └── stages/<stage>.yaml  per-stage overrides
//! ├── pipelines/<template>.yaml
//! ├── pipeline/
//! │   ├── active/<id>.yaml
//! │   ├── completed/<id>.yaml
//! │   └── index.yaml
//! ├── artifacts/<id>/NN-<stage>.yaml
//! ├── escalations/<esc_id>.yaml
//! ├── specs/<spec_id>.yaml
//! └── audit/<id>.log
//! ```

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::settings::Settings;

/// Resolved paths and loaded settings for one project directory.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub base_dir: PathBuf,
    pub settings_file: PathBuf,
    pub stage_config_dir: PathBuf,
    pub templates_dir: PathBuf,
    pub state_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub escalations_dir: PathBuf,
    pub specs_dir: PathBuf,
    pub audit_dir: PathBuf,
    pub verbose: bool,
    settings: Settings,
}

impl Config {
    /// Resolve the layout for `project_dir` and load settings.yaml if it
    /// exists (defaults otherwise).
    pub fn new(project_dir: PathBuf, verbose: bool) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let base_dir = project_dir.join(".agentforge");
        let config_dir = base_dir.join("config");
        let settings_file = config_dir.join("settings.yaml");

        let settings = if settings_file.exists() {
            Settings::load(&settings_file)?
        } else {
            Settings::default()
        };

        Ok(Self {
            stage_config_dir: config_dir.join("stages"),
            templates_dir: base_dir.join("pipelines"),
            state_dir: base_dir.join("pipeline"),
            artifacts_dir: base_dir.join("artifacts"),
            escalations_dir: base_dir.join("escalations"),
            specs_dir: base_dir.join("specs"),
            audit_dir: base_dir.join("audit"),
            project_dir,
            base_dir,
            settings_file,
            verbose,
            settings,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Create every directory the stores expect. Idempotent.
    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [
            &self.stage_config_dir,
            &self.templates_dir,
            &self.state_dir.join("active"),
            &self.state_dir.join("completed"),
            &self.artifacts_dir,
            &self.escalations_dir,
            &self.specs_dir,
            &self.audit_dir,
        ] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create directory {}", dir.display()))?;
        }
        Ok(())
    }

    /// Whether the project has been initialized (`config init` ran).
    pub fn is_initialized(project_dir: &Path) -> bool {
        project_dir.join(".agentforge/config/settings.yaml").exists()
    }

    /// Path of a named pipeline template file.
    pub fn template_file(&self, name: &str) -> PathBuf {
        self.templates_dir.join(format!("{name}.yaml"))
    }

    /// Path of a per-stage override file.
    pub fn stage_config_file(&self, stage: &str) -> PathBuf {
        self.stage_config_dir.join(format!("{stage}.yaml"))
    }

    /// Path of a persisted spec artifact, referenced by `implement --from-spec`.
    pub fn spec_file(&self, spec_id: &str) -> PathBuf {
        self.specs_dir.join(format!("{spec_id}.yaml"))
    }
}
