//! The stage pipeline: single-flight execution of flow stages with cancellation.
//!
//! [`StagePipeline`] is the entry point a front end drives. It exposes four operations:
//!
//! - [`run_stage`](StagePipeline::run_stage): one stage against a project
//! - [`run_complete_flow`](StagePipeline::run_complete_flow): all six stages in order,
//!   sharing one run directory
//! - [`stop`](StagePipeline::stop): cancel whatever is running
//! - [`detect_tools`](StagePipeline::detect_tools): probe the toolchain and write detected
//!   paths back into the configuration
//! - [`run_setup`](StagePipeline::run_setup): install missing tools inside the bridge
//!   environment, cancellable through [`stop`](StagePipeline::stop) like a stage
//!
//! Progress is reported through [`PipelineEvent`](crate::state::PipelineEvent)s on the
//! [`StateManager`] broadcast channel. No failure crosses these operations as an error:
//! tool failures become Error logs and a [`StageOutcome`], and unexpected faults (I/O
//! errors, panics) are caught, logged, and still leave the pipeline Idle.

mod stages;

use crate::config::ConfigManager;
use crate::metrics::Metrics;
use crate::models::{PipelineSettings, ProjectConfig, StageKind};
use crate::services::installer::{self, BridgeInstallCheck, SetupOutcome, SetupTarget, ToolchainInstaller};
use crate::services::{
    BridgeEnvironment, DetectionReport, ProcessRunner, ReportParser, SystemProcessRunner,
    Toolchain, ToolchainDetector,
};
use crate::state::{LogSeverity, PipelineEvent, RunKind, StateManager};
use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use chrono::Local;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use stages::StageReport;

/// One result record of a stage, as carried by a StageCompleted event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageMetric {
    pub metric: String,
    pub value: String,
    pub status: String,
}

impl StageMetric {
    pub fn new(
        metric: impl Into<String>,
        value: impl Into<String>,
        status: impl Into<String>,
    ) -> Self {
        Self {
            metric: metric.into(),
            value: value.into(),
            status: status.into(),
        }
    }

    pub fn pass(metric: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(metric, value, "✓ Pass")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Completed { metrics: Vec<StageMetric> },
    Failed { reason: String },
    Cancelled,
    /// Not started: already running, no project, or unknown stage
    Rejected,
}

impl StageOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, StageOutcome::Completed { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStatus {
    Finished,
    Cancelled,
    /// A stage failed while `stop_on_failure` was set
    StoppedOnFailure(StageKind),
    /// An unexpected fault ended the flow; already logged at Error
    Aborted,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowOutcome {
    pub status: FlowStatus,
    pub stages: Vec<(StageKind, StageOutcome)>,
}

impl FlowOutcome {
    fn rejected() -> Self {
        Self {
            status: FlowStatus::Rejected,
            stages: Vec::new(),
        }
    }
}

/// Drives flow stages against the configured toolchain.
pub struct StagePipeline {
    toolchain: Arc<Toolchain>,
    runner: Arc<dyn ProcessRunner>,
    bridge: Arc<BridgeEnvironment>,
    state: StateManager,
    metrics: Arc<Metrics>,
    settings: PipelineSettings,
    reports: ReportParser,
}

impl StagePipeline {
    pub fn new(
        toolchain: Arc<Toolchain>,
        runner: Arc<dyn ProcessRunner>,
        bridge: Arc<BridgeEnvironment>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            toolchain,
            runner,
            bridge,
            state: StateManager::new(),
            metrics: Arc::new(Metrics::new()),
            settings,
            reports: ReportParser::new(),
        }
    }

    /// Pipeline backed by real processes, with the toolchain loaded from `manager`.
    pub fn with_system_tools(manager: ConfigManager, settings: PipelineSettings) -> Result<Self> {
        let runner: Arc<dyn ProcessRunner> = Arc::new(SystemProcessRunner::new());
        let launcher = manager.load_toolchain_config()?.bridge_launcher;
        let bridge = Arc::new(BridgeEnvironment::new(Arc::clone(&runner), launcher));
        let detector = ToolchainDetector::new(
            Arc::clone(&runner),
            Arc::clone(&bridge),
            Duration::from_secs(settings.probe_timeout_secs),
        );
        let toolchain = Arc::new(Toolchain::load(manager, detector)?);
        Ok(Self::new(toolchain, runner, bridge, settings))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.state.subscribe()
    }

    pub fn state(&self) -> &StateManager {
        &self.state
    }

    pub fn toolchain(&self) -> &Arc<Toolchain> {
        &self.toolchain
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Run a single stage by name. Unknown names are rejected with an Error log.
    pub async fn run_stage_named(
        &self,
        stage_name: &str,
        project: Option<&ProjectConfig>,
    ) -> StageOutcome {
        match stage_name.parse::<StageKind>() {
            Ok(stage) => self.run_stage(stage, project).await,
            Err(e) => {
                self.state.error(e.to_string());
                StageOutcome::Rejected
            }
        }
    }

    pub async fn run_stage(&self, stage: StageKind, project: Option<&ProjectConfig>) -> StageOutcome {
        let Some(guard) = self.state.try_begin(RunKind::Stage(stage)) else {
            self.state.warning("Another stage is already running. Please wait.");
            return StageOutcome::Rejected;
        };
        let Some(project) = project else {
            self.state
                .error("No project loaded. Please create or open a project first.");
            return StageOutcome::Rejected;
        };

        let token = guard.token().clone();
        let label = format!("{}", stage);
        let outcome = self
            .guarded(&label, async {
                let run_root = self.create_run_root(project)?;
                Ok::<_, anyhow::Error>(
                    self.execute_stage_logged(stage, project, &run_root, &token)
                        .await,
                )
            })
            .await
            .unwrap_or_else(|reason| StageOutcome::Failed { reason });

        drop(guard);
        outcome
    }

    pub async fn run_complete_flow(&self, project: Option<&ProjectConfig>) -> FlowOutcome {
        let Some(guard) = self.state.try_begin(RunKind::CompleteFlow) else {
            self.state.warning("Flow already running.");
            return FlowOutcome::rejected();
        };
        let Some(project) = project else {
            self.state.error("No project loaded.");
            return FlowOutcome::rejected();
        };

        self.metrics.record_flow();
        let token = guard.token().clone();
        let outcome = self
            .guarded("complete flow", self.execute_flow(project, &token))
            .await
            .unwrap_or_else(|_| FlowOutcome {
                status: FlowStatus::Aborted,
                stages: Vec::new(),
            });

        drop(guard);
        outcome
    }

    /// Install `target` inside the bridge environment. Shares the single-flight slot with
    /// stages, so a running flow rejects setup and the other way round.
    pub async fn run_setup(&self, target: SetupTarget) -> SetupOutcome {
        let Some(guard) = self.state.try_begin(RunKind::Setup) else {
            self.state.warning("Another operation is already running. Please wait.");
            return SetupOutcome::Rejected;
        };

        let token = guard.token().clone();
        let config = self.toolchain.config();
        let installer = ToolchainInstaller::new(&self.bridge, &self.state, &token);
        let outcome = self
            .guarded("toolchain setup", async {
                Ok::<_, anyhow::Error>(installer.install(target, &config).await)
            })
            .await
            .unwrap_or_else(|reason| SetupOutcome::Failed { reason });
        tracing::info!("Setup of {} finished: {:?}", target, outcome);

        drop(guard);
        outcome
    }

    /// Whether the bridge environment itself still needs installing.
    pub async fn bridge_install_check(&self) -> BridgeInstallCheck {
        installer::check_bridge_installation(&self.bridge).await
    }

    /// Cancel the running stage, flow or setup, if any.
    pub fn stop(&self) {
        if !self.state.cancel_active() {
            tracing::debug!("Stop requested with nothing running");
        }
        self.state.warning("Stopping current operation...");
    }

    /// Probe the toolchain, write detected paths into the configuration, and narrate.
    pub async fn detect_tools(&self) -> DetectionReport {
        self.metrics.record_detection();
        let detection = AssertUnwindSafe(self.toolchain.detect()).catch_unwind().await;
        match detection {
            Ok(report) => {
                for line in report.narration.iter().filter(|line| !line.trim().is_empty()) {
                    self.state.info(line.clone());
                }
                report
            }
            Err(panic) => {
                self.state
                    .error(format!("Error during tool detection: {}", panic_message(&*panic)));
                DetectionReport::empty()
            }
        }
    }

    async fn execute_flow(
        &self,
        project: &ProjectConfig,
        token: &CancellationToken,
    ) -> Result<FlowOutcome> {
        let run_root = self.create_run_root(project)?;
        let pause = Duration::from_millis(self.settings.inter_stage_pause_ms);
        let mut stages = Vec::new();
        let mut status = FlowStatus::Finished;

        for (index, stage) in StageKind::FLOW_ORDER.into_iter().enumerate() {
            if token.is_cancelled() {
                status = FlowStatus::Cancelled;
                break;
            }

            self.state.log(
                format!("=== Starting {} stage ===", stage.name()),
                LogSeverity::Stage,
            );
            let outcome = self
                .execute_stage_logged(stage, project, &run_root, token)
                .await;

            let cancelled = outcome == StageOutcome::Cancelled;
            let failed = matches!(outcome, StageOutcome::Failed { .. });
            stages.push((stage, outcome));

            if cancelled {
                status = FlowStatus::Cancelled;
                break;
            }
            if failed && self.settings.stop_on_failure {
                status = FlowStatus::StoppedOnFailure(stage);
                break;
            }

            if index + 1 < StageKind::FLOW_ORDER.len() && !pause.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(pause) => {}
                    _ = token.cancelled() => {}
                }
            }
        }

        match status {
            FlowStatus::Finished => self
                .state
                .log("=== Complete flow finished ===", LogSeverity::Success),
            FlowStatus::Cancelled => self.state.warning("Flow was cancelled by user."),
            FlowStatus::StoppedOnFailure(stage) => self
                .state
                .error(format!("Flow stopped: {} failed", stage)),
            FlowStatus::Aborted | FlowStatus::Rejected => {}
        }

        Ok(FlowOutcome { status, stages })
    }

    /// Run one stage and translate its report into events and an outcome.
    ///
    /// Order on success: narration, success log, Progress(100), then StageCompleted records.
    async fn execute_stage_logged(
        &self,
        stage: StageKind,
        project: &ProjectConfig,
        run_root: &Utf8Path,
        token: &CancellationToken,
    ) -> StageOutcome {
        let report = match self.execute_stage(stage, project, run_root, token).await {
            Ok(report) => report,
            Err(e) => {
                let reason = format!("{:#}", e);
                self.state.error(format!("Error during {}: {}", stage, reason));
                self.metrics.record_stage_failed();
                return StageOutcome::Failed { reason };
            }
        };

        if report.result.success {
            self.state
                .success(format!("{} completed successfully!", stage));
            self.state.progress(stage, 100);
            for record in &report.metrics {
                self.state.stage_completed(
                    stage,
                    record.metric.clone(),
                    record.value.clone(),
                    record.status.clone(),
                );
            }
            self.metrics.record_stage_completed();
            StageOutcome::Completed {
                metrics: report.metrics,
            }
        } else if report.result.is_cancelled() || token.is_cancelled() {
            self.state.warning(format!("{} stage was cancelled.", stage));
            self.metrics.record_stage_cancelled();
            StageOutcome::Cancelled
        } else {
            let reason = report.result.error_message();
            self.state.error(format!("{} failed: {}", stage, reason));
            self.metrics.record_stage_failed();
            StageOutcome::Failed { reason }
        }
    }

    async fn execute_stage(
        &self,
        stage: StageKind,
        project: &ProjectConfig,
        run_root: &Utf8Path,
        token: &CancellationToken,
    ) -> Result<StageReport> {
        let stage_dir = project.stage_dir(stage);
        std::fs::create_dir_all(&stage_dir)
            .with_context(|| format!("Failed to create stage directory: {}", stage_dir))?;
        let run_dir = run_root.join(stage.name());
        std::fs::create_dir_all(&run_dir)
            .with_context(|| format!("Failed to create run directory: {}", run_dir))?;

        self.state.info(format!("Working directory: {}", stage_dir));
        self.state.info(format!("Run directory: {}", run_dir));
        self.state.info(format!("PDK: {}", project.pdk));

        stages::execute(self, stage, project, &stage_dir, &run_dir, token).await
    }

    /// `<workspace>/<project dir name>/run_<yyyyMMdd_HHmmss>`, created if needed.
    fn create_run_root(&self, project: &ProjectConfig) -> Result<Utf8PathBuf> {
        let run_root = self
            .settings
            .workspace_root()
            .join(project.dir_name())
            .join(format!("run_{}", Local::now().format("%Y%m%d_%H%M%S")));
        std::fs::create_dir_all(&run_root)
            .with_context(|| format!("Failed to create run directory: {}", run_root))?;
        Ok(run_root)
    }

    /// Catch errors and panics at the operation boundary, logging them at Error.
    async fn guarded<T, F>(&self, label: &str, operation: F) -> std::result::Result<T, String>
    where
        F: Future<Output = Result<T>>,
    {
        match AssertUnwindSafe(operation).catch_unwind().await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                let reason = format!("{:#}", e);
                self.state.error(format!("Error during {}: {}", label, reason));
                Err(reason)
            }
            Err(panic) => {
                let reason = panic_message(&*panic);
                self.state.error(format!("Error during {}: {}", label, reason));
                Err(reason)
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("unexpected fault: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("unexpected fault: {}", message)
    } else {
        "unexpected fault".to_string()
    }
}
