//! Interactive terminal escalation backend.
//!
//! Answers both escalation capabilities with dialoguer prompts in the
//! operator's terminal. Intended for supervised interactive runs; headless
//! runs use the file backend.

use anyhow::Result;
use async_trait::async_trait;
use console::style;
use dialoguer::{Input, Select, theme::ColorfulTheme};

use super::{ApprovalResult, EscalationManager, Resolution};
use crate::stage::{ArtifactBody, Stage};

#[derive(Debug, Default)]
pub struct TerminalEscalationBackend;

impl TerminalEscalationBackend {
    pub fn new() -> Self {
        Self
    }

    fn prompt_resolution(issue: &str) -> Result<Resolution> {
        println!();
        println!("  {} {}", style("Escalation:").yellow().bold(), issue);

        let options = &["Provide resolution context", "Abort pipeline"];
        let selection = Select::with_theme(&ColorfulTheme::default())
            .with_prompt("How should the pipeline proceed?")
            .items(options)
            .default(0)
            .interact()?;

        if selection == 1 {
            return Ok(Resolution::aborted());
        }

        let raw: String = Input::with_theme(&ColorfulTheme::default())
            .with_prompt("Resolution context (JSON object, empty for none)")
            .allow_empty(true)
            .interact_text()?;

        let context = if raw.trim().is_empty() {
            None
        } else {
            serde_json::from_str::<serde_json::Value>(&raw)
                .ok()
                .and_then(|v| v.as_object().cloned())
        };
        Ok(Resolution {
            abort: false,
            context,
        })
    }

    fn prompt_approval(stage: Stage, artifact: &ArtifactBody) -> Result<ApprovalResult> {
        println!();
        println!(
            "  {} stage {} produced:",
            style("Approval:").cyan().bold(),
            style(stage).bold()
        );
        let yaml = serde_yaml::to_string(artifact).unwrap_or_default();
        for line in yaml.lines().take(40) {
            println!("    {line}");
        }

        let options = &["Approve", "Reject with feedback", "Reject and abort"];
        let selection = Select::with_theme(&ColorfulTheme::default())
            .with_prompt("Approve this artifact?")
            .items(options)
            .default(0)
            .interact()?;

        match selection {
            0 => Ok(ApprovalResult {
                approved: true,
                feedback: None,
            }),
            1 => {
                let feedback: String = Input::with_theme(&ColorfulTheme::default())
                    .with_prompt("Feedback for the re-run")
                    .interact_text()?;
                Ok(ApprovalResult {
                    approved: false,
                    feedback: Some(feedback),
                })
            }
            _ => Ok(ApprovalResult {
                approved: false,
                feedback: None,
            }),
        }
    }
}

#[async_trait]
impl EscalationManager for TerminalEscalationBackend {
    async fn wait_for_resolution(
        &self,
        _pipeline_id: &str,
        _stage: Stage,
        issue: &str,
        _context: Option<ArtifactBody>,
    ) -> Result<Resolution> {
        // Blocking prompt on purpose: the pipeline is paused either way.
        let issue = issue.to_string();
        tokio::task::spawn_blocking(move || Self::prompt_resolution(&issue)).await?
    }

    async fn request_approval(
        &self,
        _pipeline_id: &str,
        stage: Stage,
        artifact: &ArtifactBody,
    ) -> Result<ApprovalResult> {
        let artifact = artifact.clone();
        tokio::task::spawn_blocking(move || Self::prompt_approval(stage, &artifact)).await?
    }
}
