//! Kairos EDA - command-line front end
//!
//! # Overview
//!
//! This binary drives the library the way the desktop front end does, from a terminal.
//! It initializes:
//! - Logging infrastructure (daily file rotation, console output with `--debug`)
//! - Tokio async runtime (4 worker threads for tool processes)
//! - Configuration loading ([`ConfigManager`])
//! - The [`StagePipeline`] and a printer for its events
//!
//! # Commands
//!
//! - `kairos detect [--save]`: probe the toolchain, optionally persisting detected paths
//! - `kairos run <stage> --project <file.kproj>`: run one stage
//! - `kairos flow --project <file.kproj> [--stop-on-failure]`: run all six stages
//! - `kairos config show` / `kairos config set <tool> <path>`
//! - `kairos setup [<target>]`: install tools inside the bridge environment, then re-detect;
//!   with no target, report whether the bridge itself needs installing
//!
//! Ctrl-C stops the running stage, flow or setup (the tool's whole process tree is killed). Stage
//! outcomes are appended to the project's build history.

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use kairos_eda::logging::{DEFAULT_LOG_DIR, DEFAULT_LOG_PREFIX, setup_logging_with_console};
use kairos_eda::models::{BuildRecord, ToolKind};
use kairos_eda::services::installer::SetupTarget;
use kairos_eda::{
    APP_NAME, ConfigManager, FlowStatus, LogSeverity, PipelineEvent, ProjectConfig,
    StageKind, StageOutcome, StagePipeline, VERSION,
};
use std::future::Future;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Parser)]
#[command(name = "kairos")]
#[command(author, version, about = "Kairos EDA - open-source ASIC flow runner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration directory (defaults to the user config dir)
    #[arg(long, global = true)]
    config_dir: Option<Utf8PathBuf>,

    /// Debug logging, mirrored to the console
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect installed EDA tools
    Detect {
        /// Persist detected tool paths to toolchain.yaml
        #[arg(long)]
        save: bool,
    },

    /// Run a single stage
    Run {
        /// synthesis, floorplan, placement, cts, routing or verification
        stage: String,

        /// Project file (.kproj)
        #[arg(short, long)]
        project: Utf8PathBuf,
    },

    /// Run the complete flow
    Flow {
        /// Project file (.kproj)
        #[arg(short, long)]
        project: Utf8PathBuf,

        /// Abort at the first failed stage
        #[arg(long)]
        stop_on_failure: bool,
    },

    /// Install EDA tools inside the bridge environment
    Setup {
        /// docker, yosys, openroad, openroad-image, flow-image or all
        target: Option<String>,

        /// Persist re-detected tool paths to toolchain.yaml
        #[arg(long)]
        save: bool,
    },

    /// Show or change tool paths
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the toolchain configuration and pipeline settings
    Show,

    /// Set the binary path for a tool
    Set { tool: String, path: String },
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let config_dir = match &cli.config_dir {
        Some(dir) => dir.clone(),
        None => ConfigManager::default_dir()?,
    };
    let log_dir = config_dir.join(DEFAULT_LOG_DIR);
    let _guard =
        setup_logging_with_console(log_dir.as_str(), DEFAULT_LOG_PREFIX, cli.debug, cli.debug)?;

    tracing::info!("Starting {} v{}", APP_NAME, VERSION);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(4)
        .thread_name("kairos-worker")
        .build()?;

    let manager = ConfigManager::new(&config_dir)?;
    let result = runtime.block_on(run(cli.command, manager));

    runtime.shutdown_timeout(Duration::from_secs(5));
    tracing::info!("Shutdown complete");

    result
}

async fn run(command: Commands, manager: ConfigManager) -> Result<ExitCode> {
    match command {
        Commands::Config { action } => configure(action, &manager),
        Commands::Detect { save } => {
            let pipeline = build_pipeline(&manager, None)?;
            let report = drive(&pipeline, pipeline.detect_tools()).await;
            println!("\n{}", report.summary());
            if save {
                pipeline.toolchain().save_config()?;
                println!("Saved tool paths to {}", manager.toolchain_path());
            }
            pipeline.metrics().log_summary();
            Ok(ExitCode::SUCCESS)
        }
        Commands::Setup { target, save } => {
            let pipeline = build_pipeline(&manager, None)?;
            let Some(target) = target else {
                let check = pipeline.bridge_install_check().await;
                println!("{}", check.message);
                if let Some(command) = check.command {
                    println!("Run from an elevated prompt: {}", command);
                }
                let targets: Vec<_> = SetupTarget::ALL.iter().map(|t| t.name()).collect();
                println!("Setup targets: {}", targets.join(", "));
                return Ok(ExitCode::SUCCESS);
            };
            let target: SetupTarget = target.parse()?;
            stop_on_ctrl_c(&pipeline);

            let outcome = drive(&pipeline, pipeline.run_setup(target)).await;
            if outcome.is_success() {
                let report = drive(&pipeline, pipeline.detect_tools()).await;
                println!("\n{}", report.summary());
                if save {
                    pipeline.toolchain().save_config()?;
                    println!("Saved tool paths to {}", manager.toolchain_path());
                }
            }
            pipeline.metrics().log_summary();
            Ok(exit_code(outcome.is_success()))
        }
        Commands::Run { stage, project } => {
            let mut project_config = manager.load_project(&project)?;
            let pipeline = build_pipeline(&manager, None)?;
            stop_on_ctrl_c(&pipeline);

            let outcome = drive(
                &pipeline,
                pipeline.run_stage_named(&stage, Some(&project_config)),
            )
            .await;

            if let Ok(kind) = stage.parse::<StageKind>() {
                record_outcome(&mut project_config, kind, &outcome);
                manager.save_project(&mut project_config)?;
            }
            pipeline.metrics().log_summary();

            Ok(exit_code(outcome.is_success()))
        }
        Commands::Flow {
            project,
            stop_on_failure,
        } => {
            let mut project_config = manager.load_project(&project)?;
            let pipeline = build_pipeline(&manager, Some(stop_on_failure))?;
            stop_on_ctrl_c(&pipeline);

            let outcome = drive(&pipeline, pipeline.run_complete_flow(Some(&project_config))).await;

            for (stage, stage_outcome) in &outcome.stages {
                record_outcome(&mut project_config, *stage, stage_outcome);
            }
            if !outcome.stages.is_empty() {
                manager.save_project(&mut project_config)?;
            }
            pipeline.metrics().log_summary();

            let all_passed = outcome.status == FlowStatus::Finished
                && outcome.stages.iter().all(|(_, o)| o.is_success());
            Ok(exit_code(all_passed))
        }
    }
}

fn build_pipeline(manager: &ConfigManager, stop_on_failure: Option<bool>) -> Result<Arc<StagePipeline>> {
    let mut settings = manager.load_settings()?;
    if let Some(stop) = stop_on_failure {
        settings.stop_on_failure = settings.stop_on_failure || stop;
    }
    let pipeline = StagePipeline::with_system_tools(manager.clone(), settings)
        .context("Failed to initialize the stage pipeline")?;
    Ok(Arc::new(pipeline))
}

fn configure(action: ConfigAction, manager: &ConfigManager) -> Result<ExitCode> {
    match action {
        ConfigAction::Show => {
            let toolchain = manager.load_toolchain_config()?;
            let settings = manager.load_settings()?;
            println!("Configuration: {}", manager.config_dir());
            for tool in ToolKind::ALL {
                let path = toolchain.path(tool);
                let shown = if path.is_empty() { "(not set)" } else { path };
                println!("  {:<10} {}", tool.display_name(), shown);
            }
            println!("  {:<10} {}", "PDK", toolchain.pdk_path);
            println!("  {:<10} {}", "Bridge", toolchain.use_bridge);
            println!("Workspace: {}", settings.workspace_root());
            println!("Stop on failure: {}", settings.stop_on_failure);
            Ok(ExitCode::SUCCESS)
        }
        ConfigAction::Set { tool, path } => {
            let kind: ToolKind = tool.parse()?;
            let mut toolchain = manager.load_toolchain_config()?;
            toolchain.set_path(kind, path.trim());
            manager.save_toolchain_config(&toolchain)?;
            println!("{} -> {}", kind.display_name(), toolchain.path(kind));
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Ctrl-C cancels whatever the pipeline is running.
fn stop_on_ctrl_c(pipeline: &Arc<StagePipeline>) {
    let pipeline = Arc::clone(pipeline);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            pipeline.stop();
        }
    });
}

/// Await an operation while printing its events, then flush whatever is still queued.
async fn drive<F: Future>(pipeline: &StagePipeline, operation: F) -> F::Output {
    let mut events = pipeline.subscribe();
    tokio::pin!(operation);

    let output = loop {
        tokio::select! {
            output = &mut operation => break output,
            received = events.recv() => match received {
                Ok(event) => print_event(&event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Event printer lagged, {} events skipped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => {}
            },
        }
    };

    while let Ok(event) = events.try_recv() {
        print_event(&event);
    }
    output
}

fn print_event(event: &PipelineEvent) {
    match event {
        PipelineEvent::Log { message, severity } => match severity {
            LogSeverity::Info => println!("  {}", message),
            LogSeverity::Success => println!("✓ {}", message),
            LogSeverity::Stage => println!("\n{}", message),
            LogSeverity::Warning => println!("⚠ {}", message),
            LogSeverity::Error => eprintln!("✗ {}", message),
        },
        PipelineEvent::Progress { stage, percent } => println!("[{}] {}%", stage, percent),
        PipelineEvent::SetupProgress { percent } => println!("[setup] {}%", percent),
        PipelineEvent::StageCompleted {
            metric,
            value,
            status,
            ..
        } => println!("  {:<10} {:<16} {}", metric, value, status),
    }
}

fn record_outcome(project: &mut ProjectConfig, stage: StageKind, outcome: &StageOutcome) {
    let record = match outcome {
        StageOutcome::Rejected => return,
        StageOutcome::Completed { metrics } => metrics
            .iter()
            .fold(BuildRecord::new(stage, true), |record, metric| {
                record.with_metric(metric.metric.clone(), metric.value.clone())
            }),
        StageOutcome::Failed { reason } => {
            BuildRecord::new(stage, false).with_metric("Error", reason.clone())
        }
        StageOutcome::Cancelled => BuildRecord::new(stage, false).with_metric("Status", "Cancelled"),
    };
    project.record_build(record);
}

fn exit_code(success: bool) -> ExitCode {
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
