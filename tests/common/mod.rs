//! Shared fixtures for integration tests: a runner that simulates the EDA tools, and a
//! pipeline wired to it inside a scratch directory.

#![allow(dead_code)]

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use kairos_eda::models::{
    OutputLine, OutputStream, PipelineSettings, ProjectConfig, ToolFailure, ToolResult,
    ToolchainConfig,
};
use kairos_eda::services::{
    BridgeEnvironment, OutputSink, ProcessRequest, ProcessRunner, Toolchain, ToolchainDetector,
};
use kairos_eda::state::PipelineEvent;
use kairos_eda::StagePipeline;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{Notify, broadcast};
use tokio_util::sync::CancellationToken;

/// Stands in for Yosys, OpenROAD, Magic and Netgen.
///
/// Each invocation is recorded. In simulate mode the runner writes the artifact the real
/// tool would produce, keyed on the script passed to it, and prints a short report.
pub struct RecordingRunner {
    calls: Mutex<Vec<ProcessRequest>>,
    failing_scripts: HashSet<&'static str>,
    /// Replacement stdout per script
    stdout_overrides: HashMap<&'static str, &'static str>,
    hang: bool,
    started: Notify,
}

impl RecordingRunner {
    pub fn simulate() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            failing_scripts: HashSet::new(),
            stdout_overrides: HashMap::new(),
            hang: false,
            started: Notify::new(),
        }
    }

    /// Every invocation blocks until cancelled.
    pub fn hanging() -> Self {
        Self {
            hang: true,
            ..Self::simulate()
        }
    }

    /// Invocations of `script` exit with code 1.
    pub fn failing_on(script: &'static str) -> Self {
        let mut runner = Self::simulate();
        runner.failing_scripts.insert(script);
        runner
    }

    /// `script` prints `stdout` instead of its usual report; its artifact is still written.
    pub fn with_stdout(mut self, script: &'static str, stdout: &'static str) -> Self {
        self.stdout_overrides.insert(script, stdout);
        self
    }

    pub fn calls(&self) -> Vec<ProcessRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Script file names in invocation order.
    pub fn scripts_run(&self) -> Vec<String> {
        self.calls().iter().filter_map(script_name).collect()
    }

    /// Resolves once some invocation has started.
    pub async fn wait_started(&self) {
        self.started.notified().await;
    }
}

fn script_name(request: &ProcessRequest) -> Option<String> {
    request
        .args
        .iter()
        .filter_map(|arg| Utf8Path::new(arg).file_name())
        .find(|name| name.ends_with(".ys") || name.ends_with(".tcl"))
        .map(str::to_string)
        .or_else(|| (request.program == "netgen").then(|| "lvs".to_string()))
}

/// Artifact and stdout a simulated tool produces for a script.
fn simulated_output(script: &str) -> (Option<&'static str>, &'static str) {
    match script {
        "synthesis.ys" => (
            Some("netlist.v"),
            "Number of cells:                 42\nChip area for module '\\top': 120.500000\n",
        ),
        "floorplan.tcl" => (Some("floorplan.def"), "Floorplan complete\n"),
        "placement.tcl" => (Some("placement.def"), "Placement complete\n"),
        "cts.tcl" => (Some("cts.def"), "CTS complete\n"),
        "routing.tcl" => (Some("routed.def"), "Routing complete\n"),
        "drc.tcl" => (Some("layout.spice"), "DRC violations: 0\n"),
        "lvs" => (None, "Final result: Circuits match uniquely.\n"),
        _ => (None, ""),
    }
}

#[async_trait]
impl ProcessRunner for RecordingRunner {
    async fn run(
        &self,
        request: ProcessRequest,
        sink: Option<OutputSink>,
        cancel: CancellationToken,
    ) -> ToolResult {
        self.calls.lock().unwrap().push(request.clone());
        self.started.notify_one();

        if self.hang {
            cancel.cancelled().await;
            return ToolResult::failed(ToolFailure::Cancelled);
        }

        let script = script_name(&request).unwrap_or_default();
        if self.failing_scripts.contains(script.as_str()) {
            return ToolResult::from_exit(Some(1), String::new(), "simulated failure".to_string());
        }

        let (artifact, default_stdout) = simulated_output(&script);
        let stdout = self
            .stdout_overrides
            .get(script.as_str())
            .copied()
            .unwrap_or(default_stdout);
        if let (Some(artifact), Some(dir)) = (artifact, &request.working_dir) {
            std::fs::write(dir.join(artifact), "simulated\n").unwrap();
        }
        if let Some(sink) = &sink {
            for line in stdout.lines() {
                sink(OutputLine {
                    stream: OutputStream::Stdout,
                    text: line.to_string(),
                });
            }
        }
        ToolResult::from_exit(Some(0), stdout.to_string(), String::new())
    }
}

pub struct Harness {
    pub pipeline: Arc<StagePipeline>,
    pub runner: Arc<RecordingRunner>,
    pub project: ProjectConfig,
    pub workspace: Utf8PathBuf,
    _temp: TempDir,
}

impl Harness {
    pub fn new(runner: RecordingRunner) -> Self {
        Self::with_settings(runner, |_| {})
    }

    pub fn with_settings(runner: RecordingRunner, adjust: impl FnOnce(&mut PipelineSettings)) -> Self {
        let temp = TempDir::new().unwrap();
        let base = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();

        let root = base.join("counter");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("counter.v"), "module top(input clk); endmodule\n").unwrap();
        let mut project = ProjectConfig::new("counter", root);
        project.add_rtl_file("counter.v").unwrap();

        let mut toolchain_config = ToolchainConfig::default();
        toolchain_config.yosys_path = "yosys".to_string();
        toolchain_config.openroad_path = "openroad".to_string();
        toolchain_config.magic_path = "magic".to_string();
        toolchain_config.netgen_path = "netgen".to_string();

        let runner = Arc::new(runner);
        let dyn_runner: Arc<dyn ProcessRunner> = runner.clone();
        let bridge = Arc::new(BridgeEnvironment::unavailable(Arc::clone(&dyn_runner)));
        let detector =
            ToolchainDetector::new(Arc::clone(&dyn_runner), Arc::clone(&bridge), Duration::from_secs(1));
        let toolchain = Arc::new(Toolchain::new(toolchain_config, detector));

        let workspace = base.join("workspace");
        let mut settings = PipelineSettings {
            inter_stage_pause_ms: 0,
            workspace_dir: Some(workspace.clone()),
            ..PipelineSettings::default()
        };
        adjust(&mut settings);

        let pipeline = Arc::new(StagePipeline::new(toolchain, dyn_runner, bridge, settings));
        Self {
            pipeline,
            runner,
            project,
            workspace,
            _temp: temp,
        }
    }
}

/// Everything queued on a receiver right now.
pub fn drain(rx: &mut broadcast::Receiver<PipelineEvent>) -> Vec<PipelineEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
