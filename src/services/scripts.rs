// Control-script generation for each flow stage.
//
// Generation is pure: the same stage, project, working directory and path style always
// produce byte-identical script text. Upstream artifacts are read from the sibling stage
// directory; outputs land in the stage's own working directory.

use crate::models::{ProjectConfig, StageKind};
use crate::services::bridge::host_to_bridge_path;
use camino::{Utf8Path, Utf8PathBuf};
use std::fmt::Write as _;

pub const SKY130_LIBERTY: &str = "sky130_fd_sc_hd__tt_025C_1v80.lib";
pub const SKY130_TECH_LEF: &str = "sky130_fd_sc_hd.tlef";
pub const SKY130_CELL_LEF: &str = "sky130_fd_sc_hd_merged.lef";

/// Which side of the bridge the script will be executed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathStyle {
    Host,
    Bridge,
}

impl PathStyle {
    pub fn render(self, path: &Utf8Path) -> String {
        match self {
            PathStyle::Host => path.to_string(),
            PathStyle::Bridge => host_to_bridge_path(path.as_str()),
        }
    }
}

/// A generated script: its fixed file name and its contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageScript {
    pub file_name: &'static str,
    pub contents: String,
}

/// Where a stage reads its upstream artifact from: `<working dir>/../<upstream>/<artifact>`.
pub fn input_artifact_path(stage: StageKind, working_dir: &Utf8Path) -> Option<Utf8PathBuf> {
    let (upstream, artifact) = stage.required_input()?;
    let stages_root = working_dir.parent().unwrap_or(working_dir);
    Some(stages_root.join(upstream.name()).join(artifact))
}

/// RTL sources resolved against the project root.
pub fn rtl_sources(project: &ProjectConfig) -> Vec<Utf8PathBuf> {
    project
        .rtl_files
        .iter()
        .map(|file| {
            if file.is_absolute() || looks_like_drive_path(file.as_str()) {
                file.clone()
            } else {
                project.root.join(file)
            }
        })
        .collect()
}

fn looks_like_drive_path(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic()
}

/// Resolves liberty and LEF names against the configured PDK root, if any.
#[derive(Debug, Clone, Copy)]
struct TechFiles<'a> {
    pdk_root: Option<&'a Utf8Path>,
    style: PathStyle,
}

impl TechFiles<'_> {
    fn path(self, name: &str) -> String {
        match self.pdk_root {
            Some(root) => self.style.render(&root.join(name)),
            None => name.to_string(),
        }
    }
}

/// Script for `stage`. Technology files are bare names unless `pdk_root` is given.
pub fn generate(
    stage: StageKind,
    project: &ProjectConfig,
    working_dir: &Utf8Path,
    style: PathStyle,
    pdk_root: Option<&Utf8Path>,
) -> StageScript {
    let tech = TechFiles { pdk_root, style };
    let contents = match stage {
        StageKind::Synthesis => synthesis_script(project, working_dir, style, tech),
        StageKind::Verification => drc_script(project, working_dir, style, tech),
        _ => openroad_script(stage, project, working_dir, style, tech),
    };
    StageScript {
        file_name: stage.script_name(),
        contents,
    }
}

fn synthesis_script(
    project: &ProjectConfig,
    working_dir: &Utf8Path,
    style: PathStyle,
    tech: TechFiles<'_>,
) -> String {
    let mut script = String::new();
    let _ = writeln!(script, "# Yosys synthesis script generated by Kairos EDA");
    let _ = writeln!(script, "# Project: {}", project.name);

    for source in rtl_sources(project) {
        let _ = writeln!(script, "read_verilog \"{}\"", style.render(&source));
    }

    let _ = writeln!(script, "hierarchy -check -top {}", project.top_module);
    let _ = writeln!(script, "proc; opt; fsm; opt; memory; opt");

    if project.is_sky130() {
        let _ = writeln!(script, "# Sky130 technology mapping");
        let _ = writeln!(script, "techmap -map +/techmap.v");
        let _ = writeln!(script, "abc -liberty {}", tech.path(SKY130_LIBERTY));
    } else {
        let _ = writeln!(script, "# Generic technology mapping");
        let _ = writeln!(script, "techmap");
        let _ = writeln!(script, "abc");
    }

    let _ = writeln!(script, "clean");
    let _ = writeln!(
        script,
        "write_verilog -noattr \"{}\"",
        style.render(&working_dir.join("netlist.v"))
    );
    let _ = writeln!(
        script,
        "write_json \"{}\"",
        style.render(&working_dir.join("netlist.json"))
    );
    let _ = writeln!(script, "stat");
    script
}

fn openroad_script(
    stage: StageKind,
    project: &ProjectConfig,
    working_dir: &Utf8Path,
    style: PathStyle,
    tech: TechFiles<'_>,
) -> String {
    let constraints = &project.constraints;
    let mut script = String::new();
    let _ = writeln!(script, "# OpenROAD script generated by Kairos EDA");
    let _ = writeln!(script, "# Stage: {}", stage.name());
    let _ = writeln!(script);
    let _ = writeln!(script, "read_lef {}", tech.path(SKY130_TECH_LEF));
    let _ = writeln!(script, "read_lef {}", tech.path(SKY130_CELL_LEF));

    let input = input_artifact_path(stage, working_dir)
        .map(|path| style.render(&path))
        .unwrap_or_default();

    match stage {
        StageKind::Floorplan => {
            let _ = writeln!(
                script,
                "# Floorplan: {}x{} um",
                constraints.floorplan_width_um, constraints.floorplan_height_um
            );
            let _ = writeln!(script, "read_verilog {{{}}}", input);
            let _ = writeln!(script, "link_design {}", project.top_module);
            let _ = writeln!(
                script,
                "initialize_floorplan -utilization {:.1} \\",
                constraints.utilization * 100.0
            );
            let _ = writeln!(script, "  -aspect_ratio 1 \\");
            let _ = writeln!(script, "  -core_space 2");
        }
        StageKind::Placement => {
            let _ = writeln!(script, "read_def {{{}}}", input);
            let _ = writeln!(script, "global_placement");
            let _ = writeln!(script, "detailed_placement");
        }
        StageKind::Cts => {
            let _ = writeln!(script, "read_def {{{}}}", input);
            let _ = writeln!(
                script,
                "create_clock -name {port} -period {} [get_ports {port}]",
                constraints.clock_period_ns,
                port = constraints.clock_port
            );
            let _ = writeln!(script, "clock_tree_synthesis");
        }
        StageKind::Routing => {
            let _ = writeln!(script, "# Routing layers: {}", constraints.routing_layers);
            let _ = writeln!(script, "read_def {{{}}}", input);
            let _ = writeln!(script, "global_route");
            let _ = writeln!(script, "detailed_route");
        }
        StageKind::Synthesis | StageKind::Verification => {}
    }

    if let Some(artifact) = stage.output_artifact() {
        let _ = writeln!(script, "write_def {}", artifact);
    }
    script
}

fn drc_script(
    project: &ProjectConfig,
    working_dir: &Utf8Path,
    style: PathStyle,
    tech: TechFiles<'_>,
) -> String {
    let routed = input_artifact_path(StageKind::Verification, working_dir)
        .map(|path| style.render(&path))
        .unwrap_or_default();

    let mut script = String::new();
    let _ = writeln!(script, "# Magic DRC script generated by Kairos EDA");
    let _ = writeln!(script, "lef read {}", tech.path(SKY130_CELL_LEF));
    let _ = writeln!(script, "def read {{{}}}", routed);
    let _ = writeln!(script, "load {}", project.top_module);
    let _ = writeln!(script, "drc on");
    let _ = writeln!(script, "drc check");
    let _ = writeln!(script, "drc catchup");
    let _ = writeln!(script, "set drc_count [drc list count total]");
    let _ = writeln!(script, "puts \"DRC violations: $drc_count\"");
    let _ = writeln!(script, "extract all");
    let _ = writeln!(script, "ext2spice lvs");
    let _ = writeln!(script, "ext2spice -o layout.spice");
    let _ = writeln!(script, "quit -noprompt");
    script
}
