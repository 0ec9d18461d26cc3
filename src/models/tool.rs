use crate::models::StageKind;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// External EDA programs the core knows how to find and drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolKind {
    /// Logic synthesis
    Yosys,
    /// Floorplan, placement, clock tree synthesis and routing
    OpenRoad,
    /// Static timing analysis
    OpenSta,
    /// Design rule checks and layout extraction
    Magic,
    /// Layout-vs-schematic comparison
    Netgen,
    /// Layout viewer
    KLayout,
}

/// Container images that carry the complete flow in one image.
pub const FLOW_IMAGES: [&str; 2] = ["efabless/openlane", "efabless/openlane2"];

impl ToolKind {
    /// Every tracked tool, in detection order.
    pub const ALL: [ToolKind; 6] = [
        ToolKind::Yosys,
        ToolKind::OpenRoad,
        ToolKind::OpenSta,
        ToolKind::Magic,
        ToolKind::Netgen,
        ToolKind::KLayout,
    ];

    pub fn display_name(self) -> &'static str {
        match self {
            ToolKind::Yosys => "Yosys",
            ToolKind::OpenRoad => "OpenROAD",
            ToolKind::OpenSta => "OpenSTA",
            ToolKind::Magic => "Magic",
            ToolKind::Netgen => "Netgen",
            ToolKind::KLayout => "KLayout",
        }
    }

    /// Executable name looked up on PATH.
    pub fn command(self) -> &'static str {
        match self {
            ToolKind::Yosys => "yosys",
            ToolKind::OpenRoad => "openroad",
            ToolKind::OpenSta => "sta",
            ToolKind::Magic => "magic",
            ToolKind::Netgen => "netgen",
            ToolKind::KLayout => "klayout",
        }
    }

    /// Flag that makes the tool print its version and exit.
    pub fn version_flag(self) -> &'static str {
        match self {
            ToolKind::Yosys => "--version",
            ToolKind::OpenRoad => "-version",
            ToolKind::OpenSta => "-version",
            ToolKind::Magic => "--version",
            ToolKind::Netgen => "-batch",
            ToolKind::KLayout => "-v",
        }
    }

    /// Candidate install directories for the deep scan, in probe order.
    ///
    /// `$HOME` is expanded inside the bridge environment. Source-build locations under the
    /// home directory come before the generic system prefixes.
    pub fn search_paths(self) -> &'static [&'static str] {
        match self {
            ToolKind::Yosys => &[
                "$HOME/yosys/build",
                "$HOME/yosys",
                "/opt/yosys",
                "/usr/local/yosys",
                "$HOME/.local/yosys",
                "/tools/yosys",
                "/usr/local/bin",
                "/usr/bin",
            ],
            ToolKind::OpenRoad => &[
                "$HOME/OpenROAD/build/bin",
                "/opt/openroad",
                "/usr/local/openroad",
                "$HOME/openroad",
                "$HOME/.local/openroad",
                "/tools/openroad",
                "/usr/local/bin",
                "/usr/bin",
            ],
            ToolKind::OpenSta => &[
                "$HOME/OpenSTA/build",
                "/opt/opensta",
                "/usr/local/opensta",
                "$HOME/.local/opensta",
                "/tools/opensta",
                "/usr/local/bin",
                "/usr/bin",
            ],
            ToolKind::Magic => &[
                "$HOME/magic/build",
                "/opt/magic",
                "/usr/local/magic",
                "$HOME/.local/magic",
                "/tools/magic",
                "/usr/local/bin",
                "/usr/bin",
            ],
            ToolKind::Netgen => &[
                "$HOME/netgen/build",
                "/opt/netgen",
                "/usr/local/netgen",
                "$HOME/.local/netgen",
                "/tools/netgen",
                "/usr/local/bin",
                "/usr/bin",
            ],
            ToolKind::KLayout => &[
                "$HOME/klayout/build-release",
                "/opt/klayout",
                "/usr/local/klayout",
                "$HOME/.local/klayout",
                "/tools/klayout",
                "/usr/local/bin",
                "/usr/bin",
            ],
        }
    }

    /// Well-known container image that ships this tool.
    pub fn container_image(self) -> Option<&'static str> {
        match self {
            ToolKind::Yosys => Some("hdlc/yosys"),
            ToolKind::OpenRoad => Some("openroad/openroad"),
            ToolKind::OpenSta => Some("openroad/opensta"),
            ToolKind::Magic => Some("hdlc/magic"),
            ToolKind::Netgen => Some("hdlc/netgen"),
            ToolKind::KLayout => None,
        }
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown tool: {0}")]
pub struct ToolParseError(pub String);

/// Accepts the command name (`sta`) or the display name (`OpenSTA`), any case.
impl FromStr for ToolKind {
    type Err = ToolParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        ToolKind::ALL
            .into_iter()
            .find(|kind| {
                kind.command().eq_ignore_ascii_case(wanted)
                    || kind.display_name().eq_ignore_ascii_case(wanted)
            })
            .ok_or_else(|| ToolParseError(s.to_string()))
    }
}

/// How a detected tool is installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstallType {
    /// Found on the host PATH
    PathResident,
    /// Found inside the bridge environment
    BridgeResident,
    /// Found inside a source build tree
    CompiledBuild,
    /// Available only as a container image
    ContainerImage,
}

impl InstallType {
    /// Whether a tool installed this way is executed through the bridge.
    pub fn runs_in_bridge(self) -> bool {
        matches!(self, InstallType::BridgeResident | InstallType::CompiledBuild)
    }
}

impl fmt::Display for InstallType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            InstallType::PathResident => "native (in PATH)",
            InstallType::BridgeResident => "bridge environment",
            InstallType::CompiledBuild => "compiled from source",
            InstallType::ContainerImage => "container image",
        };
        f.write_str(label)
    }
}

/// Result of probing one tool during a detection pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInfo {
    pub kind: ToolKind,
    pub name: String,
    pub available: bool,
    pub version: String,
    pub install_type: Option<InstallType>,
    /// Command, absolute path or `docker:<image>` the tool was found at
    pub location: Option<String>,
}

impl ToolInfo {
    pub fn found(
        kind: ToolKind,
        install_type: InstallType,
        version: impl Into<String>,
        location: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            name: kind.display_name().to_string(),
            available: true,
            version: version.into(),
            install_type: Some(install_type),
            location: Some(location.into()),
        }
    }

    pub fn missing(kind: ToolKind) -> Self {
        Self {
            kind,
            name: kind.display_name().to_string(),
            available: false,
            version: String::new(),
            install_type: None,
            location: None,
        }
    }
}

/// Per-tool detection results keyed by tool, in detection order.
///
/// Counts and the missing list are derived from the per-tool flags on every call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetectedTools {
    tools: IndexMap<ToolKind, ToolInfo>,
}

impl DetectedTools {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, info: ToolInfo) {
        self.tools.insert(info.kind, info);
    }

    pub fn get(&self, kind: ToolKind) -> Option<&ToolInfo> {
        self.tools.get(&kind)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ToolInfo> {
        self.tools.values()
    }

    pub fn is_available(&self, kind: ToolKind) -> bool {
        self.get(kind).is_some_and(|info| info.available)
    }

    pub fn total(&self) -> usize {
        self.tools.len()
    }

    pub fn found_count(&self) -> usize {
        self.tools.values().filter(|info| info.available).count()
    }

    pub fn all_tools_found(&self) -> bool {
        self.found_count() == self.total()
    }

    pub fn missing_tools(&self) -> Vec<ToolKind> {
        self.tools
            .values()
            .filter(|info| !info.available)
            .map(|info| info.kind)
            .collect()
    }
}

/// Coarse capability tier derived from a detection pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationMode {
    Unavailable,
    Basic,
    Standard,
}

impl OperationMode {
    /// Standard when synthesis or place-and-route is usable, Basic when only an all-in-one
    /// flow image exists, Unavailable otherwise.
    pub fn from_tools(tools: &DetectedTools, has_flow_image: bool) -> Self {
        if tools.is_available(ToolKind::Yosys) || tools.is_available(ToolKind::OpenRoad) {
            OperationMode::Standard
        } else if has_flow_image {
            OperationMode::Basic
        } else {
            OperationMode::Unavailable
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            OperationMode::Standard => "STANDARD MODE - Full toolchain available",
            OperationMode::Basic => "BASIC MODE - OpenLane container only",
            OperationMode::Unavailable => "UNAVAILABLE - No tools detected",
        }
    }
}

impl fmt::Display for OperationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            OperationMode::Unavailable => "Unavailable",
            OperationMode::Basic => "Basic",
            OperationMode::Standard => "Standard",
        };
        f.write_str(label)
    }
}

/// Why a tool invocation did not succeed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ToolFailure {
    #[error("{0} not configured. Please set the path in Settings.")]
    NotConfigured(ToolKind),

    #[error("{artifact} not found. Please run {upstream} first.")]
    ArtifactMissing {
        artifact: String,
        upstream: StageKind,
    },

    #[error("No RTL files in project. Please add Verilog files first.")]
    MissingSources,

    #[error("Tool execution failed: could not start {program}: {reason}")]
    SpawnFailure { program: String, reason: String },

    #[error("{}", exit_message(.code, .stderr))]
    NonZeroExit { code: Option<i32>, stderr: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Bridge environment is not available")]
    BridgeUnavailable,
}

fn exit_message(code: &Option<i32>, stderr: &str) -> String {
    if !stderr.is_empty() {
        return stderr.to_string();
    }
    match code {
        Some(code) => format!("process exited with code {}", code),
        None => "process was terminated by a signal".to_string(),
    }
}

/// Outcome of one external program invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolResult {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub failure: Option<ToolFailure>,
}

impl ToolResult {
    /// Build a result from a finished process. Success means exit code 0.
    pub fn from_exit(exit_code: Option<i32>, stdout: String, stderr: String) -> Self {
        let success = exit_code == Some(0);
        let failure = (!success).then(|| ToolFailure::NonZeroExit {
            code: exit_code,
            stderr: stderr.trim().to_string(),
        });
        Self {
            success,
            exit_code,
            stdout,
            stderr,
            failure,
        }
    }

    /// A result for an invocation that never produced an exit code.
    pub fn failed(failure: ToolFailure) -> Self {
        Self {
            success: false,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            failure: Some(failure),
        }
    }

    /// A successful result for composite steps that did not run a single process.
    pub fn succeeded() -> Self {
        Self {
            success: true,
            exit_code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
            failure: None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.failure, Some(ToolFailure::Cancelled))
    }

    /// Human-readable failure message; empty on success.
    pub fn error_message(&self) -> String {
        self.failure
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default()
    }

    /// First non-empty line of stdout, falling back to stderr.
    pub fn first_line(&self) -> Option<&str> {
        self.stdout
            .lines()
            .chain(self.stderr.lines())
            .map(str::trim)
            .find(|line| !line.is_empty())
    }
}

/// Which pipe a line of tool output arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One line of streamed tool output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub text: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_from_str() {
        assert_eq!("yosys".parse::<ToolKind>(), Ok(ToolKind::Yosys));
        assert_eq!("OpenROAD".parse::<ToolKind>(), Ok(ToolKind::OpenRoad));
        assert_eq!("sta".parse::<ToolKind>(), Ok(ToolKind::OpenSta));
        assert_eq!(
            "vivado".parse::<ToolKind>(),
            Err(ToolParseError("vivado".to_string()))
        );
    }

    fn tools_with(available: &[ToolKind]) -> DetectedTools {
        let mut tools = DetectedTools::new();
        for kind in ToolKind::ALL {
            if available.contains(&kind) {
                tools.insert(ToolInfo::found(kind, InstallType::PathResident, "1.0", kind.command()));
            } else {
                tools.insert(ToolInfo::missing(kind));
            }
        }
        tools
    }

    #[test]
    fn test_counts_follow_flags() {
        let tools = tools_with(&[ToolKind::Yosys, ToolKind::Magic]);
        assert_eq!(tools.total(), 6);
        assert_eq!(tools.found_count(), 2);
        assert!(!tools.all_tools_found());
        assert_eq!(tools.missing_tools().len(), 4);

        let all = tools_with(&ToolKind::ALL);
        assert!(all.all_tools_found());
        assert!(all.missing_tools().is_empty());
    }

    #[test]
    fn test_operation_mode_rules() {
        assert_eq!(
            OperationMode::from_tools(&tools_with(&[ToolKind::OpenRoad]), false),
            OperationMode::Standard
        );
        assert_eq!(
            OperationMode::from_tools(&tools_with(&[ToolKind::Yosys]), true),
            OperationMode::Standard
        );
        assert_eq!(
            OperationMode::from_tools(&tools_with(&[ToolKind::Magic]), true),
            OperationMode::Basic
        );
        assert_eq!(
            OperationMode::from_tools(&tools_with(&[ToolKind::Magic, ToolKind::Netgen]), false),
            OperationMode::Unavailable
        );
    }

    #[test]
    fn test_from_exit() {
        let ok = ToolResult::from_exit(Some(0), "done\n".into(), String::new());
        assert!(ok.success);
        assert_eq!(ok.failure, None);

        let bad = ToolResult::from_exit(Some(2), String::new(), "  ERROR: no top\n".into());
        assert!(!bad.success);
        assert_eq!(bad.exit_code, Some(2));
        assert_eq!(bad.error_message(), "ERROR: no top");

        let silent = ToolResult::from_exit(Some(3), String::new(), String::new());
        assert_eq!(silent.error_message(), "process exited with code 3");
    }

    #[test]
    fn test_first_line_prefers_stdout() {
        let result = ToolResult::from_exit(
            Some(0),
            "\nYosys 0.38 (git sha1 543faed)\nmore\n".into(),
            "warning\n".into(),
        );
        assert_eq!(result.first_line(), Some("Yosys 0.38 (git sha1 543faed)"));

        let stderr_only = ToolResult::from_exit(Some(1), String::new(), "KLayout 0.28\n".into());
        assert_eq!(stderr_only.first_line(), Some("KLayout 0.28"));
    }

    #[test]
    fn test_failure_messages() {
        assert_eq!(
            ToolFailure::NotConfigured(ToolKind::Yosys).to_string(),
            "Yosys not configured. Please set the path in Settings."
        );
        let missing = ToolFailure::ArtifactMissing {
            artifact: "netlist.v".into(),
            upstream: StageKind::Synthesis,
        };
        assert_eq!(
            missing.to_string(),
            "netlist.v not found. Please run Synthesis first."
        );
    }
}
