// Per-stage executors: precondition checks, script emission and tool invocation.
//
// Executors narrate through the pipeline's StateManager and leave the success log,
// final progress and result records to the caller.

use super::{StageMetric, StagePipeline};
use crate::models::{OutputLine, OutputStream, ProjectConfig, StageKind, ToolFailure, ToolKind, ToolResult};
use crate::services::bridge::{host_to_bridge_path, quote};
use crate::services::scripts::{self, PathStyle, StageScript};
use crate::services::{OutputSink, ProcessRequest};
use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// What an executor hands back: the deciding tool result plus result records.
#[derive(Debug, Clone)]
pub struct StageReport {
    pub result: ToolResult,
    pub metrics: Vec<StageMetric>,
}

impl StageReport {
    fn from_result(result: ToolResult) -> Self {
        Self {
            result,
            metrics: Vec::new(),
        }
    }
}

/// One command-line argument, rendered for whichever side runs the tool.
#[derive(Debug, Clone)]
enum ToolArg {
    Flag(String),
    Path(Utf8PathBuf),
    /// Netgen's `"<file> <cell>"` pair
    Cell(Utf8PathBuf, String),
}

impl ToolArg {
    fn flag(value: &str) -> Self {
        ToolArg::Flag(value.to_string())
    }

    fn render(&self, style: PathStyle) -> String {
        match self {
            ToolArg::Flag(value) => value.clone(),
            ToolArg::Path(path) => style.render(path),
            ToolArg::Cell(path, cell) => format!("{} {}", style.render(path), cell),
        }
    }
}

/// Working locations of one stage execution.
struct StageDirs<'a> {
    stage: &'a Utf8Path,
    run: &'a Utf8Path,
}

pub(super) async fn execute(
    pipeline: &StagePipeline,
    stage: StageKind,
    project: &ProjectConfig,
    stage_dir: &Utf8Path,
    run_dir: &Utf8Path,
    token: &CancellationToken,
) -> Result<StageReport> {
    let dirs = StageDirs {
        stage: stage_dir,
        run: run_dir,
    };
    let executor = StageExecutor {
        pipeline,
        project,
        dirs,
        token,
    };
    match stage {
        StageKind::Synthesis => executor.synthesis().await,
        StageKind::Floorplan => executor.floorplan().await,
        StageKind::Placement => executor.placement().await,
        StageKind::Cts => executor.clock_tree().await,
        StageKind::Routing => executor.routing().await,
        StageKind::Verification => executor.verification().await,
    }
}

struct StageExecutor<'a> {
    pipeline: &'a StagePipeline,
    project: &'a ProjectConfig,
    dirs: StageDirs<'a>,
    token: &'a CancellationToken,
}

impl StageExecutor<'_> {
    async fn synthesis(&self) -> Result<StageReport> {
        let stage = StageKind::Synthesis;
        let state = &self.pipeline.state;
        state.info("Starting Yosys synthesis...");
        state.progress(stage, 10);

        if self.project.rtl_files.is_empty() {
            return Ok(StageReport::from_result(ToolResult::failed(
                ToolFailure::MissingSources,
            )));
        }

        state.info(format!("RTL files: {}", self.project.rtl_files.len()));
        for file in &self.project.rtl_files {
            state.info(format!("  - {}", file.file_name().unwrap_or(file.as_str())));
        }
        state.progress(stage, 30);

        let script = self.write_script(stage)?;
        state.info("Running synthesis...");
        let result = self
            .invoke(
                ToolKind::Yosys,
                vec![ToolArg::flag("-s"), ToolArg::Path(self.dirs.stage.join(script.file_name))],
            )
            .await;
        if !result.success {
            return Ok(StageReport::from_result(result));
        }
        state.progress(stage, 90);

        let mut metrics = Vec::new();
        let netlist = self.dirs.stage.join("netlist.v");
        if netlist.exists() {
            state.success(format!("Generated netlist: {}", netlist));
        } else {
            state.warning(format!("Yosys finished but {} was not written", netlist));
        }

        let stats = self.pipeline.reports.synthesis_stats(&result.stdout);
        if let Some(cells) = stats.cells {
            metrics.push(StageMetric::pass("Cells", cells.to_string()));
        }
        if let Some(area) = stats.chip_area {
            metrics.push(StageMetric::pass("Area", format!("{:.2} um²", area)));
        }

        Ok(StageReport { result, metrics })
    }

    async fn floorplan(&self) -> Result<StageReport> {
        let stage = StageKind::Floorplan;
        let state = &self.pipeline.state;
        state.info("Starting OpenROAD floorplanning...");
        state.progress(stage, 10);

        if let Some(missing) = self.check_input(stage) {
            return Ok(missing);
        }

        let constraints = &self.project.constraints;
        state.info(format!(
            "Die size: {} x {} um",
            constraints.floorplan_width_um, constraints.floorplan_height_um
        ));
        state.info(format!(
            "Target utilization: {:.0}%",
            constraints.utilization * 100.0
        ));
        state.progress(stage, 40);

        let result = self.run_openroad(stage).await?;
        if !result.success {
            return Ok(StageReport::from_result(result));
        }
        state.info("Die area defined, I/O pins placed");

        let die_area_mm2 = constraints.floorplan_width_um * constraints.floorplan_height_um / 1_000_000.0;
        Ok(StageReport {
            result,
            metrics: vec![StageMetric::pass(
                "Die Area",
                format!("{:.3} mm²", die_area_mm2),
            )],
        })
    }

    async fn placement(&self) -> Result<StageReport> {
        let stage = StageKind::Placement;
        let state = &self.pipeline.state;
        state.info("Starting OpenROAD placement...");
        state.progress(stage, 10);

        if let Some(missing) = self.check_input(stage) {
            return Ok(missing);
        }
        state.progress(stage, 30);
        state.info("Global placement...");

        self.completed_status(self.run_openroad(stage).await?)
    }

    async fn clock_tree(&self) -> Result<StageReport> {
        let stage = StageKind::Cts;
        let state = &self.pipeline.state;
        state.info("Starting Clock Tree Synthesis...");
        state.progress(stage, 10);

        if let Some(missing) = self.check_input(stage) {
            return Ok(missing);
        }

        let constraints = &self.project.constraints;
        state.info(format!("Clock net: {}", constraints.clock_port));
        state.info(format!("Target period: {} ns", constraints.clock_period_ns));
        state.progress(stage, 40);

        self.completed_status(self.run_openroad(stage).await?)
    }

    async fn routing(&self) -> Result<StageReport> {
        let stage = StageKind::Routing;
        let state = &self.pipeline.state;
        state.info("Starting OpenROAD routing...");
        state.progress(stage, 10);

        if let Some(missing) = self.check_input(stage) {
            return Ok(missing);
        }

        state.info(format!(
            "Routing layers: {}",
            self.project.constraints.routing_layers
        ));
        state.progress(stage, 30);
        state.info("Global routing...");
        state.progress(stage, 60);
        state.info("Detailed routing...");

        self.completed_status(self.run_openroad(stage).await?)
    }

    /// DRC with Magic, then LVS with Netgen when it is configured.
    async fn verification(&self) -> Result<StageReport> {
        let stage = StageKind::Verification;
        let state = &self.pipeline.state;
        state.info("Starting Design Verification...");
        state.progress(stage, 10);

        if let Some(missing) = self.check_input(stage) {
            return Ok(missing);
        }

        state.info("Running DRC check with Magic...");
        state.progress(stage, 30);
        let script = self.write_script(stage)?;
        let drc = self
            .invoke(
                ToolKind::Magic,
                vec![
                    ToolArg::flag("-noconsole"),
                    ToolArg::flag("-dnull"),
                    ToolArg::Path(self.dirs.stage.join(script.file_name)),
                ],
            )
            .await;
        if !drc.success {
            return Ok(StageReport::from_result(drc));
        }

        let mut metrics = Vec::new();
        match self.pipeline.reports.drc_violations(&drc.stdout) {
            Some(0) => {
                state.success("DRC check passed");
                metrics.push(StageMetric::pass("DRC", "Clean"));
            }
            None => {
                state.warning("DRC finished without reporting a violation count");
                metrics.push(StageMetric::new("DRC", "Unknown", "⚠ N/A"));
            }
            Some(count) => {
                state.warning(format!("DRC reported {} violations", count));
                metrics.push(StageMetric::new(
                    "DRC",
                    format!("{} violations", count),
                    "✗ Fail",
                ));
            }
        }
        state.progress(stage, 60);

        let layout = self.dirs.stage.join("layout.spice");
        let netgen_configured = self.pipeline.toolchain.resolve(ToolKind::Netgen).is_some();
        if !netgen_configured || !layout.exists() {
            state.warning("LVS check skipped: Netgen not configured or no extracted layout");
            metrics.push(StageMetric::new("LVS", "Pending", "⚠ N/A"));
            return Ok(StageReport { result: drc, metrics });
        }

        state.info("Running LVS check with Netgen...");
        state.progress(stage, 80);
        let netlist = self
            .dirs
            .stage
            .parent()
            .unwrap_or(self.dirs.stage)
            .join(StageKind::Synthesis.name())
            .join("netlist.v");
        let top = &self.project.top_module;
        let lvs = self
            .invoke(
                ToolKind::Netgen,
                vec![
                    ToolArg::flag("-batch"),
                    ToolArg::flag("lvs"),
                    ToolArg::Cell(layout, top.clone()),
                    ToolArg::Cell(netlist, top.clone()),
                ],
            )
            .await;
        if lvs.is_cancelled() {
            return Ok(StageReport::from_result(lvs));
        }

        if !lvs.success {
            state.warning(format!("LVS check failed: {}", lvs.error_message()));
            metrics.push(StageMetric::new("LVS", "Error", "✗ Fail"));
        } else {
            match self.pipeline.reports.lvs_match(&lvs.stdout) {
                Some(false) => {
                    state.warning("LVS: netlists do not match");
                    metrics.push(StageMetric::new("LVS", "Mismatch", "✗ Fail"));
                }
                Some(true) => {
                    state.success("LVS check passed");
                    metrics.push(StageMetric::pass("LVS", "Match"));
                }
                None => {
                    state.warning("LVS finished without a verdict");
                    metrics.push(StageMetric::new("LVS", "Unknown", "⚠ N/A"));
                }
            }
        }

        Ok(StageReport { result: drc, metrics })
    }

    fn completed_status(&self, result: ToolResult) -> Result<StageReport> {
        let metrics = if result.success {
            vec![StageMetric::pass("Status", "Complete")]
        } else {
            Vec::new()
        };
        Ok(StageReport { result, metrics })
    }

    /// `None` when the upstream artifact exists, otherwise the failed report.
    fn check_input(&self, stage: StageKind) -> Option<StageReport> {
        let (upstream, artifact) = stage.required_input()?;
        let path = scripts::input_artifact_path(stage, self.dirs.stage)?;
        if path.exists() {
            tracing::debug!("Found {} at {}", artifact, path);
            return None;
        }
        Some(StageReport::from_result(ToolResult::failed(
            ToolFailure::ArtifactMissing {
                artifact: artifact.to_string(),
                upstream,
            },
        )))
    }

    async fn run_openroad(&self, stage: StageKind) -> Result<ToolResult> {
        let script = self.write_script(stage)?;
        Ok(self
            .invoke(
                ToolKind::OpenRoad,
                vec![
                    ToolArg::flag("-exit"),
                    ToolArg::Path(self.dirs.stage.join(script.file_name)),
                ],
            )
            .await)
    }

    fn path_style(&self) -> PathStyle {
        if self.pipeline.toolchain.config().use_bridge {
            PathStyle::Bridge
        } else {
            PathStyle::Host
        }
    }

    /// Generate the stage script and write it to the stage and run directories.
    fn write_script(&self, stage: StageKind) -> Result<StageScript> {
        let config = self.pipeline.toolchain.config();
        let pdk_root = Some(config.pdk_path.trim())
            .filter(|root| !root.is_empty())
            .map(Utf8Path::new);
        let script = scripts::generate(
            stage,
            self.project,
            self.dirs.stage,
            self.path_style(),
            pdk_root,
        );
        for dir in [self.dirs.stage, self.dirs.run] {
            let path = dir.join(script.file_name);
            std::fs::write(&path, &script.contents)
                .with_context(|| format!("Failed to write script: {}", path))?;
        }
        self.pipeline
            .state
            .info(format!("Generated script: {}", script.file_name));
        Ok(script)
    }

    async fn invoke(&self, tool: ToolKind, args: Vec<ToolArg>) -> ToolResult {
        let Some(resolved) = self.pipeline.toolchain.resolve(tool) else {
            return ToolResult::failed(ToolFailure::NotConfigured(tool));
        };

        let sink = output_sink(self.pipeline);
        let started = Instant::now();
        let result = if resolved.in_bridge {
            let command = std::iter::once(quote(&host_to_bridge_path(&resolved.program)))
                .chain(args.iter().map(|arg| quote(&arg.render(PathStyle::Bridge))))
                .collect::<Vec<_>>()
                .join(" ");
            self.pipeline
                .bridge
                .run_tool(&command, Some(self.dirs.stage), Some(sink), self.token.clone())
                .await
        } else {
            let request = ProcessRequest::new(&resolved.program)
                .args(args.iter().map(|arg| arg.render(PathStyle::Host)))
                .current_dir(self.dirs.stage.to_path_buf());
            self.pipeline
                .runner
                .run(request, Some(sink), self.token.clone())
                .await
        };
        self.pipeline.metrics.record_process(started.elapsed());

        tracing::debug!(
            "{} finished: success={}, exit_code={:?}",
            tool,
            result.success,
            result.exit_code
        );
        result
    }
}

/// Forward tool output as log events: stdout at Info, stderr at Warning.
fn output_sink(pipeline: &StagePipeline) -> OutputSink {
    let state = pipeline.state.clone();
    Arc::new(move |line: OutputLine| {
        let text = line.text.trim_end();
        if text.trim().is_empty() {
            return;
        }
        match line.stream {
            OutputStream::Stdout => state.info(text),
            OutputStream::Stderr => state.warning(text),
        }
    })
}
