use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use agentforge::config::Config;
use agentforge::controller::{ExecuteRequest, PipelineController};
use agentforge::escalation::{
    EscalationManager, FileEscalationBackend, TerminalEscalationBackend,
};
use agentforge::executor::StageRegistry;
use agentforge::llm::{CommandProvider, LlmProvider, ScriptedProvider};
use agentforge::pipeline::{PipelineResult, PipelineStatus};
use agentforge::settings::{EscalationBackendKind, default_settings_yaml};
use agentforge::stage::{ArtifactBody, Stage};
use agentforge::template::{DeliveryMode, PipelineTemplate, RunOverrides, builtin};
use agentforge::ui;

/// Exit codes: 0 success or expected pause, 1 usage error, 2 operation not
/// applicable, 3 pipeline failed, 4 aborted.
const EXIT_OK: u8 = 0;
const EXIT_USAGE: u8 = 1;
const EXIT_NOT_APPLICABLE: u8 = 2;
const EXIT_FAILED: u8 = 3;
const EXIT_ABORTED: u8 = 4;

#[derive(Parser)]
#[command(name = "agentforge")]
#[command(version, about = "Autonomous software-development pipeline")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Launch a new pipeline with the default `implement` template
    Start {
        request: String,
        /// Pause for approval after each stage
        #[arg(long)]
        supervised: bool,
        /// Stop after the named stage
        #[arg(long)]
        exit_after: Option<String>,
        /// Enable per-stage iteration loops
        #[arg(long)]
        iterate: bool,
        #[arg(long)]
        delivery_mode: Option<String>,
        /// Pipeline timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Design-only pipeline (exits after spec)
    Design { request: String },
    /// Implement a request, optionally from a persisted spec
    Implement {
        request: Option<String>,
        /// Start from a persisted specification artifact
        #[arg(long)]
        from_spec: Option<String>,
        /// Begin execution at the named stage (red or green)
        #[arg(long)]
        skip_to: Option<String>,
    },
    /// Show pipeline state (most recent when no id given)
    Status { pipeline_id: Option<String> },
    /// Resume a paused or approval-blocked pipeline
    Resume {
        pipeline_id: String,
        #[arg(long)]
        feedback: Option<String>,
    },
    /// Approve the pending stage artifact
    Approve { pipeline_id: String },
    /// Reject the pending stage artifact
    Reject {
        pipeline_id: String,
        #[arg(long)]
        feedback: Option<String>,
        /// End the pipeline instead of re-running the stage
        #[arg(long)]
        abort: bool,
    },
    /// Abort a pipeline
    Abort {
        pipeline_id: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// List pipelines
    Pipelines {
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Show or export persisted artifacts
    Artifacts {
        pipeline_id: String,
        #[arg(long)]
        stage: Option<String>,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Configuration management
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Scaffold .agentforge/ with default settings and templates
    Init,
    /// Show the effective configuration
    Show,
    /// Validate settings and templates
    Validate,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let project_dir = match &cli.project_dir {
        Some(dir) => dir.clone(),
        None => match std::env::current_dir() {
            Ok(dir) => dir,
            Err(err) => {
                eprintln!("Error: failed to resolve current directory: {err}");
                return ExitCode::from(EXIT_USAGE);
            }
        },
    };

    match run(cli, project_dir).await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::from(EXIT_USAGE)
        }
    }
}

async fn run(cli: Cli, project_dir: PathBuf) -> Result<u8> {
    match &cli.command {
        Commands::Start {
            request,
            supervised,
            exit_after,
            iterate,
            delivery_mode,
            timeout,
        } => {
            let overrides = RunOverrides {
                supervised: supervised.then_some(true),
                exit_after: parse_stage_opt(exit_after.as_deref())?,
                iterate: iterate.then_some(true),
                delivery_mode: delivery_mode
                    .as_deref()
                    .map(DeliveryMode::from_str)
                    .transpose()?,
                timeout_secs: *timeout,
                skip_to: None,
            };
            run_pipeline(&project_dir, cli.verbose, request, "implement", None, overrides).await
        }
        Commands::Design { request } => {
            run_pipeline(
                &project_dir,
                cli.verbose,
                request,
                "design",
                None,
                RunOverrides::default(),
            )
            .await
        }
        Commands::Implement {
            request,
            from_spec,
            skip_to,
        } => {
            let config = Config::new(project_dir.clone(), cli.verbose)?;
            let initial_context = match from_spec {
                Some(spec_id) => Some(load_spec_context(&config, spec_id)?),
                None => None,
            };
            let request_text = match (request, from_spec) {
                (Some(text), _) => text.clone(),
                (None, Some(spec_id)) => format!("Implement persisted specification {spec_id}"),
                (None, None) => {
                    anyhow::bail!("implement requires a request or --from-spec <spec_id>")
                }
            };
            let overrides = RunOverrides {
                skip_to: parse_stage_opt(skip_to.as_deref())?,
                ..RunOverrides::default()
            };
            run_pipeline(
                &project_dir,
                cli.verbose,
                &request_text,
                "implement",
                initial_context,
                overrides,
            )
            .await
        }
        Commands::Status { pipeline_id } => {
            cmd_status(&project_dir, cli.verbose, pipeline_id.as_deref())
        }
        Commands::Resume {
            pipeline_id,
            feedback,
        } => cmd_resume(&project_dir, cli.verbose, pipeline_id, feedback.as_deref()).await,
        Commands::Approve { pipeline_id } => {
            let controller = build_controller(&project_dir, cli.verbose)?;
            if controller.approve(pipeline_id)? {
                println!("Approved {pipeline_id}");
                Ok(EXIT_OK)
            } else {
                eprintln!("Pipeline {pipeline_id} is not awaiting approval");
                Ok(EXIT_NOT_APPLICABLE)
            }
        }
        Commands::Reject {
            pipeline_id,
            feedback,
            abort,
        } => {
            let controller = build_controller(&project_dir, cli.verbose)?;
            if controller.reject(pipeline_id, feedback.as_deref(), *abort)? {
                println!("Rejected {pipeline_id}");
                Ok(EXIT_OK)
            } else {
                eprintln!("Pipeline {pipeline_id} is not awaiting approval");
                Ok(EXIT_NOT_APPLICABLE)
            }
        }
        Commands::Abort {
            pipeline_id,
            reason,
        } => {
            let controller = build_controller(&project_dir, cli.verbose)?;
            let reason = reason.as_deref().unwrap_or("aborted by user");
            if controller.abort(pipeline_id, reason)? {
                println!("Aborted {pipeline_id}");
                Ok(EXIT_OK)
            } else {
                eprintln!("Pipeline {pipeline_id} is not running");
                Ok(EXIT_NOT_APPLICABLE)
            }
        }
        Commands::Pipelines { status, limit } => {
            let controller = build_controller(&project_dir, cli.verbose)?;
            let filter = status
                .as_deref()
                .map(PipelineStatus::from_str)
                .transpose()?;
            let summaries = controller.list(filter, *limit)?;
            ui::print_pipeline_list(&summaries);
            Ok(EXIT_OK)
        }
        Commands::Artifacts {
            pipeline_id,
            stage,
            output,
        } => cmd_artifacts(
            &project_dir,
            cli.verbose,
            pipeline_id,
            stage.as_deref(),
            output.as_deref(),
        ),
        Commands::Config { command } => cmd_config(&project_dir, cli.verbose, command),
    }
}

fn parse_stage_opt(raw: Option<&str>) -> Result<Option<Stage>> {
    raw.map(Stage::from_str).transpose()
}

fn make_provider(config: &Config) -> Arc<dyn LlmProvider> {
    let llm = &config.settings().llm;
    match llm.provider.as_str() {
        "scripted" => Arc::new(ScriptedProvider::new(Vec::new())),
        _ => Arc::new(CommandProvider::new(llm.command.clone(), llm.args.clone())),
    }
}

fn make_escalation(config: &Config) -> Arc<dyn EscalationManager> {
    let settings = &config.settings().escalation;
    match settings.backend {
        EscalationBackendKind::Terminal => Arc::new(TerminalEscalationBackend::new()),
        EscalationBackendKind::File => Arc::new(FileEscalationBackend::new(
            config.escalations_dir.clone(),
            Duration::from_secs(settings.timeout_secs),
            Duration::from_secs(settings.poll_interval_secs.max(1)),
        )),
    }
}

fn build_controller(project_dir: &std::path::Path, verbose: bool) -> Result<PipelineController> {
    let config = Config::new(project_dir.to_path_buf(), verbose)?;
    let provider = make_provider(&config);
    let registry = StageRegistry::with_llm_defaults(provider);
    let escalation = make_escalation(&config);
    Ok(PipelineController::new(config, registry, escalation))
}

fn load_spec_context(config: &Config, spec_id: &str) -> Result<ArtifactBody> {
    let path = config.spec_file(spec_id);
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("Spec {spec_id} not found at {}", path.display()))?;
    let stored: agentforge::stage::StoredArtifact =
        serde_yaml::from_str(&raw).with_context(|| format!("Failed to parse spec {spec_id}"))?;
    Ok(stored.body)
}

fn result_exit_code(result: &PipelineResult) -> u8 {
    match result.status {
        PipelineStatus::Failed => EXIT_FAILED,
        PipelineStatus::Aborted => EXIT_ABORTED,
        _ => EXIT_OK,
    }
}

fn print_result(result: &PipelineResult) {
    match result.status {
        PipelineStatus::Completed => {
            println!(
                "Pipeline {} completed ({} stage(s), {} tokens, ${:.4})",
                result.pipeline_id,
                result.completed_stages.len(),
                result.tokens_used,
                result.cost_usd
            );
            if let Some(deliverable) = &result.deliverable
                && let Some(spec_id) = deliverable.get("spec_id").and_then(|v| v.as_str())
            {
                println!("Specification saved as {spec_id}");
            }
        }
        PipelineStatus::Failed => {
            println!(
                "Pipeline {} failed: {}",
                result.pipeline_id,
                result.error.as_deref().unwrap_or("unknown error")
            );
        }
        PipelineStatus::Aborted => {
            println!("Pipeline {} aborted", result.pipeline_id);
        }
        status => {
            println!("Pipeline {} is {status}", result.pipeline_id);
        }
    }
}

async fn run_pipeline(
    project_dir: &std::path::Path,
    verbose: bool,
    request: &str,
    template: &str,
    initial_context: Option<ArtifactBody>,
    overrides: RunOverrides,
) -> Result<u8> {
    let controller = build_controller(project_dir, verbose)?;
    let spinner = ui::run_spinner(&format!("running {template} pipeline"));
    let result = controller
        .execute(ExecuteRequest {
            user_request: request.to_string(),
            pipeline_type: template.to_string(),
            initial_context,
            resume_pipeline_id: None,
            overrides,
        })
        .await;
    spinner.finish_and_clear();
    let result = result?;
    print_result(&result);
    Ok(result_exit_code(&result))
}

async fn cmd_resume(
    project_dir: &std::path::Path,
    verbose: bool,
    pipeline_id: &str,
    feedback: Option<&str>,
) -> Result<u8> {
    let controller = build_controller(project_dir, verbose)?;
    if let Some(feedback) = feedback {
        controller.provide_feedback(pipeline_id, feedback)?;
    }
    let spinner = ui::run_spinner(&format!("resuming {pipeline_id}"));
    let result = controller
        .execute(ExecuteRequest {
            resume_pipeline_id: Some(pipeline_id.to_string()),
            ..ExecuteRequest::default()
        })
        .await;
    spinner.finish_and_clear();
    let result = result?;
    print_result(&result);
    Ok(result_exit_code(&result))
}

fn cmd_status(
    project_dir: &std::path::Path,
    verbose: bool,
    pipeline_id: Option<&str>,
) -> Result<u8> {
    let controller = build_controller(project_dir, verbose)?;
    let id = match pipeline_id {
        Some(id) => id.to_string(),
        None => match controller.state_store().latest()? {
            Some(summary) => summary.id,
            None => {
                println!("No pipelines found.");
                return Ok(EXIT_OK);
            }
        },
    };
    match controller.get_status(&id)? {
        Some(state) => {
            ui::print_status(&state, verbose);
            Ok(EXIT_OK)
        }
        None => {
            eprintln!("Pipeline {id} not found");
            Ok(EXIT_NOT_APPLICABLE)
        }
    }
}

fn cmd_artifacts(
    project_dir: &std::path::Path,
    verbose: bool,
    pipeline_id: &str,
    stage: Option<&str>,
    output: Option<&std::path::Path>,
) -> Result<u8> {
    let controller = build_controller(project_dir, verbose)?;
    let store = controller.artifact_store();
    let files = store.list(pipeline_id)?;
    if files.is_empty() {
        eprintln!("No artifacts for pipeline {pipeline_id}");
        return Ok(EXIT_NOT_APPLICABLE);
    }

    let selected: Vec<&String> = match stage {
        Some(stage) => files
            .iter()
            .filter(|f| f.contains(&format!("-{stage}")))
            .collect(),
        None => files.iter().collect(),
    };
    if selected.is_empty() {
        eprintln!("No artifact for stage {} in {pipeline_id}", stage.unwrap_or("?"));
        return Ok(EXIT_NOT_APPLICABLE);
    }

    for file in selected {
        let artifact = store.read(pipeline_id, file)?;
        let yaml = serde_yaml::to_string(&artifact)?;
        match output {
            Some(path) => {
                std::fs::write(path, &yaml)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                println!("Wrote {file} to {}", path.display());
            }
            None => {
                println!("# {file}");
                println!("{yaml}");
            }
        }
    }
    Ok(EXIT_OK)
}

fn cmd_config(
    project_dir: &std::path::Path,
    verbose: bool,
    command: &ConfigCommands,
) -> Result<u8> {
    match command {
        ConfigCommands::Init => {
            let config = Config::new(project_dir.to_path_buf(), verbose)?;
            config.ensure_directories()?;
            if config.settings_file.exists() {
                println!("Settings already exist at {}", config.settings_file.display());
            } else {
                std::fs::write(&config.settings_file, default_settings_yaml())
                    .context("Failed to write default settings")?;
                println!("Wrote {}", config.settings_file.display());
            }
            for name in ["implement", "design"] {
                let path = config.template_file(name);
                if !path.exists() {
                    builtin(name)
                        .expect("built-in template")
                        .save(&path)?;
                    println!("Wrote {}", path.display());
                }
            }
            println!("Initialized AgentForge project");
            Ok(EXIT_OK)
        }
        ConfigCommands::Show => {
            let config = Config::new(project_dir.to_path_buf(), verbose)?;
            let yaml = serde_yaml::to_string(config.settings())?;
            println!("# {}", config.settings_file.display());
            println!("{yaml}");
            Ok(EXIT_OK)
        }
        ConfigCommands::Validate => {
            let config = Config::new(project_dir.to_path_buf(), verbose)?;
            let mut problems = 0usize;
            if !config.settings_file.exists() {
                println!("warning: no settings.yaml (defaults in effect); run `config init`");
            }
            if config.templates_dir.exists() {
                for entry in std::fs::read_dir(&config.templates_dir)? {
                    let path = entry?.path();
                    if path.extension().is_none_or(|e| e != "yaml") {
                        continue;
                    }
                    match PipelineTemplate::load_file(&path) {
                        Ok(template) => {
                            println!(
                                "ok: template '{}' ({} stages)",
                                template.name,
                                template.stages.len()
                            );
                        }
                        Err(err) => {
                            problems += 1;
                            println!("error: {}: {err:#}", path.display());
                        }
                    }
                }
            }
            if problems == 0 {
                println!("Configuration valid");
                Ok(EXIT_OK)
            } else {
                Ok(EXIT_USAGE)
            }
        }
    }
}
