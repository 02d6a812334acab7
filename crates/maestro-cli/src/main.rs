//! The `maestro` binary: runs, resumes, and inspects multi-agent task
//! orchestrations configured in `maestro.toml`.

mod executor;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use executor::{CommandExecutor, ExecutorConfig};
use maestro_checkpoint::CheckpointManager;
use maestro_core::{
    ChannelSink, ExecutionMode, MaestroError, MaestroResult, ModeOverrides, ProgressEvent,
    ProgressEventKind, PromptChannel, PromptDecision, PromptRequest,
};
use maestro_orchestrator::{
    AgentProfile, ControllerConfig, DependencyGraph, RunOptions, StageController,
    StaticProfileResolver,
};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "maestro", about = "Maestro — stage-based multi-agent task orchestration")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "maestro.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one agent on a task
    Run {
        /// Agent name from the config
        agent: String,
        /// Task text
        task: String,
        /// Pause for confirmation at checkpoint stages
        #[arg(long)]
        interactive: bool,
        /// Answer checkpoint prompts automatically
        #[arg(long)]
        auto_confirm: bool,
        /// Print partial output as it arrives
        #[arg(long)]
        stream: bool,
        /// Disable checkpoint persistence
        #[arg(long)]
        no_checkpoint: bool,
        /// Per-stage timeout in seconds (overrides config)
        #[arg(long)]
        stage_timeout: Option<u64>,
    },
    /// Run every configured agent in dependency order
    Orchestrate {
        /// Task text
        task: String,
    },
    /// Resume an interrupted run from its checkpoint
    Resume {
        /// The run to resume
        run_id: String,
        /// Override the stored interactive flag
        #[arg(long)]
        interactive: Option<bool>,
        /// Override the stored streaming flag
        #[arg(long)]
        stream: Option<bool>,
    },
    /// Show the dependency graph as parallel execution levels
    Graph,
    /// Manage persisted runs
    Runs {
        #[command(subcommand)]
        action: RunsAction,
    },
}

#[derive(Subcommand)]
enum RunsAction {
    /// List persisted runs, most recently updated first
    List,
    /// Print one run's checkpoint as JSON
    Show {
        /// The run to show
        run_id: String,
    },
    /// Delete one run's checkpoint and artifacts
    Delete {
        /// The run to delete
        run_id: String,
    },
    /// Remove runs older than the retention window
    Clean {
        /// Retention window in days (overrides config)
        #[arg(long)]
        days: Option<u32>,
    },
}

#[derive(Deserialize)]
struct MaestroConfig {
    #[serde(default = "default_data_dir")]
    data_dir: PathBuf,
    #[serde(default)]
    retention_days: Option<u32>,
    #[serde(default)]
    executor: ExecutorConfig,
    #[serde(default)]
    controller: ControllerConfig,
    #[serde(default)]
    agents: Vec<AgentProfile>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

/// Asks for a y/N answer on the terminal.
struct CliPrompt;

#[async_trait]
impl PromptChannel for CliPrompt {
    async fn request_decision(&self, request: PromptRequest) -> MaestroResult<PromptDecision> {
        println!("\n{}", request.message);
        println!("Continue? [y/N]");
        let line = tokio::task::spawn_blocking(|| {
            let mut buf = String::new();
            std::io::stdin().read_line(&mut buf).map(|_| buf)
        })
        .await
        .map_err(|e| MaestroError::Orchestrator(format!("prompt task failed: {e}")))?
        .map_err(MaestroError::Io)?;
        let answer = line.trim();
        if answer.eq_ignore_ascii_case("y") || answer.eq_ignore_ascii_case("yes") {
            Ok(PromptDecision::Continue)
        } else {
            Ok(PromptDecision::Abort)
        }
    }
}

fn spawn_progress_printer(
    mut rx: mpsc::Receiver<ProgressEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event.kind {
                ProgressEventKind::StageStart => {
                    println!("[{}] stage '{}' started", event.run_id, event.stage_name);
                }
                ProgressEventKind::StageProgress(chunk) => {
                    println!("  {chunk}");
                }
                ProgressEventKind::StageComplete => {
                    println!("[{}] stage '{}' completed", event.run_id, event.stage_name);
                }
                ProgressEventKind::StageError(message) => {
                    eprintln!(
                        "[{}] stage '{}' failed: {message}",
                        event.run_id, event.stage_name
                    );
                }
                ProgressEventKind::Checkpoint => {
                    println!(
                        "[{}] checkpoint saved after '{}'",
                        event.run_id, event.stage_name
                    );
                }
                ProgressEventKind::UserPrompt(_) => {}
            }
        }
    })
}

async fn checkpoint_manager(config: &MaestroConfig) -> anyhow::Result<CheckpointManager> {
    let mut manager = CheckpointManager::new(config.data_dir.join("runs")).await?;
    if let Some(days) = config.retention_days {
        manager = manager.with_retention_days(days)?;
    }
    Ok(manager)
}

async fn build_controller(config: &MaestroConfig) -> anyhow::Result<StageController> {
    let resolver = Arc::new(StaticProfileResolver::from_profiles(config.agents.clone())?);
    let checkpoints = Arc::new(checkpoint_manager(config).await?);
    let provider = Arc::new(CommandExecutor::new(config.executor.clone()));
    Ok(StageController::new(
        resolver,
        provider,
        checkpoints,
        config.controller.clone(),
    )?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config_str = tokio::fs::read_to_string(&cli.config).await.map_err(|e| {
        anyhow::anyhow!(
            "Failed to read config file '{}': {}",
            cli.config.display(),
            e
        )
    })?;
    let config: MaestroConfig = toml::from_str(&config_str)?;

    match cli.command {
        Commands::Run {
            agent,
            task,
            interactive,
            auto_confirm,
            stream,
            no_checkpoint,
            stage_timeout,
        } => {
            let mode = ExecutionMode {
                interactive,
                streaming: stream,
                resumable: !no_checkpoint,
                auto_confirm,
            };
            let (sink, rx) = ChannelSink::bounded(256);
            let printer = spawn_progress_printer(rx);
            let controller = build_controller(&config)
                .await?
                .with_sink(Arc::new(sink))
                .with_prompt_channel(Arc::new(CliPrompt));

            let options = RunOptions {
                stage_timeout_secs: stage_timeout,
                ..RunOptions::default()
            };
            let result = controller.run(&agent, &task, mode, options).await;
            drop(controller);
            printer.await?;

            let report = result?;
            println!("\nrun {} finished: {:?}", report.run_id, report.outcome);
            if let Some(output) = report.final_output() {
                println!("\n{output}");
            }
        }
        Commands::Orchestrate { task } => {
            let (sink, rx) = ChannelSink::bounded(256);
            let printer = spawn_progress_printer(rx);
            let controller = Arc::new(build_controller(&config).await?.with_sink(Arc::new(sink)));

            let result = Arc::clone(&controller)
                .run_graph(&config.agents, &task, ExecutionMode::resumable())
                .await;
            drop(controller);
            printer.await?;

            let reports = result?;
            println!("\n{} agent run(s) finished:", reports.len());
            for report in &reports {
                println!(
                    "  {} — {} ({:?}, {} output(s))",
                    report.agent,
                    report.run_id,
                    report.outcome,
                    report.previous_outputs.len()
                );
            }
        }
        Commands::Resume {
            run_id,
            interactive,
            stream,
        } => {
            let overrides = ModeOverrides {
                interactive,
                streaming: stream,
                auto_confirm: None,
            };
            let (sink, rx) = ChannelSink::bounded(256);
            let printer = spawn_progress_printer(rx);
            let controller = build_controller(&config)
                .await?
                .with_sink(Arc::new(sink))
                .with_prompt_channel(Arc::new(CliPrompt));

            let result = controller
                .resume(&run_id, overrides, RunOptions::default())
                .await;
            drop(controller);
            printer.await?;

            let report = result?;
            println!("\nrun {} finished: {:?}", report.run_id, report.outcome);
            if let Some(output) = report.final_output() {
                println!("\n{output}");
            }
        }
        Commands::Graph => {
            let graph = DependencyGraph::build(&config.agents);
            graph.detect_cycles()?;
            if graph.is_empty() {
                println!("No agents configured.");
                println!("Configure agents in maestro.toml under [[agents]]");
            } else {
                for (level, agents) in graph.levels() {
                    println!("level {level}: {}", agents.join(", "));
                }
            }
        }
        Commands::Runs { action } => {
            let manager = checkpoint_manager(&config).await?;
            match action {
                RunsAction::List => {
                    let summaries = manager.list().await?;
                    if summaries.is_empty() {
                        println!("No persisted runs.");
                    } else {
                        for summary in &summaries {
                            println!(
                                "{}  {}  {}  {}/{} stages  updated {}",
                                summary.run_id,
                                summary.agent,
                                summary.status,
                                summary.completed_stages,
                                summary.total_stages,
                                summary.updated_at.to_rfc3339()
                            );
                        }
                    }
                }
                RunsAction::Show { run_id } => {
                    let data = manager.load(&run_id).await?;
                    println!("{}", serde_json::to_string_pretty(&data)?);
                }
                RunsAction::Delete { run_id } => {
                    manager.delete(&run_id).await?;
                    println!("deleted run {run_id}");
                }
                RunsAction::Clean { days } => {
                    let manager = match days {
                        Some(days) => manager.with_retention_days(days)?,
                        None => manager,
                    };
                    let removed = manager.cleanup().await?;
                    if removed.is_empty() {
                        println!("Nothing to clean.");
                    } else {
                        println!("removed {} expired run(s):", removed.len());
                        for run_id in &removed {
                            println!("  {run_id}");
                        }
                    }
                }
            }
        }
    }

    Ok(())
}
