use crate::models::ToolKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// One step of the RTL-to-GDSII flow.
///
/// The set is closed: every stage has an entry in [`StageKind::FLOW_ORDER`], a working
/// directory name, the tool that executes it and (except for the first and last stage)
/// the artifact it hands to its successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Synthesis,
    Floorplan,
    Placement,
    Cts,
    Routing,
    Verification,
}

/// Returned when a stage name does not match any [`StageKind`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown stage: {0}")]
pub struct StageParseError(pub String);

impl StageKind {
    /// Fixed execution order of a complete flow.
    pub const FLOW_ORDER: [StageKind; 6] = [
        StageKind::Synthesis,
        StageKind::Floorplan,
        StageKind::Placement,
        StageKind::Cts,
        StageKind::Routing,
        StageKind::Verification,
    ];

    /// Lowercase identifier, also used as the stage's directory name.
    pub fn name(self) -> &'static str {
        match self {
            StageKind::Synthesis => "synthesis",
            StageKind::Floorplan => "floorplan",
            StageKind::Placement => "placement",
            StageKind::Cts => "cts",
            StageKind::Routing => "routing",
            StageKind::Verification => "verification",
        }
    }

    /// Name shown in progress and stage-completed events.
    pub fn display_name(self) -> &'static str {
        match self {
            StageKind::Synthesis => "Synthesis",
            StageKind::Floorplan => "Floorplan",
            StageKind::Placement => "Placement",
            StageKind::Cts => "CTS",
            StageKind::Routing => "Routing",
            StageKind::Verification => "Verification",
        }
    }

    /// Primary tool that executes this stage.
    pub fn tool(self) -> ToolKind {
        match self {
            StageKind::Synthesis => ToolKind::Yosys,
            StageKind::Floorplan | StageKind::Placement | StageKind::Cts | StageKind::Routing => {
                ToolKind::OpenRoad
            }
            StageKind::Verification => ToolKind::Magic,
        }
    }

    /// File this stage writes into its working directory for the next stage to read.
    pub fn output_artifact(self) -> Option<&'static str> {
        match self {
            StageKind::Synthesis => Some("netlist.v"),
            StageKind::Floorplan => Some("floorplan.def"),
            StageKind::Placement => Some("placement.def"),
            StageKind::Cts => Some("cts.def"),
            StageKind::Routing => Some("routed.def"),
            StageKind::Verification => None,
        }
    }

    /// The stage whose output this stage consumes.
    pub fn upstream(self) -> Option<StageKind> {
        match self {
            StageKind::Synthesis => None,
            StageKind::Floorplan => Some(StageKind::Synthesis),
            StageKind::Placement => Some(StageKind::Floorplan),
            StageKind::Cts => Some(StageKind::Placement),
            StageKind::Routing => Some(StageKind::Cts),
            StageKind::Verification => Some(StageKind::Routing),
        }
    }

    /// Upstream stage and the artifact filename this stage requires from it.
    pub fn required_input(self) -> Option<(StageKind, &'static str)> {
        let upstream = self.upstream()?;
        upstream.output_artifact().map(|artifact| (upstream, artifact))
    }

    /// Name of the control script generated for this stage.
    pub fn script_name(self) -> &'static str {
        match self {
            StageKind::Synthesis => "synthesis.ys",
            StageKind::Floorplan => "floorplan.tcl",
            StageKind::Placement => "placement.tcl",
            StageKind::Cts => "cts.tcl",
            StageKind::Routing => "routing.tcl",
            StageKind::Verification => "drc.tcl",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl FromStr for StageKind {
    type Err = StageParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        match wanted.as_str() {
            "clock-tree-synthesis" | "clock_tree_synthesis" => Ok(StageKind::Cts),
            "route" => Ok(StageKind::Routing),
            _ => StageKind::FLOW_ORDER
                .into_iter()
                .find(|stage| stage.name() == wanted)
                .ok_or_else(|| StageParseError(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_order_is_fixed() {
        let names: Vec<_> = StageKind::FLOW_ORDER.iter().map(|s| s.name()).collect();
        assert_eq!(
            names,
            ["synthesis", "floorplan", "placement", "cts", "routing", "verification"]
        );
    }

    #[test]
    fn test_artifact_chain() {
        assert_eq!(
            StageKind::Floorplan.required_input(),
            Some((StageKind::Synthesis, "netlist.v"))
        );
        assert_eq!(
            StageKind::Placement.required_input(),
            Some((StageKind::Floorplan, "floorplan.def"))
        );
        assert_eq!(
            StageKind::Cts.required_input(),
            Some((StageKind::Placement, "placement.def"))
        );
        assert_eq!(
            StageKind::Routing.required_input(),
            Some((StageKind::Cts, "cts.def"))
        );
        assert_eq!(
            StageKind::Verification.required_input(),
            Some((StageKind::Routing, "routed.def"))
        );
        assert_eq!(StageKind::Synthesis.required_input(), None);
    }

    #[test]
    fn test_parse_stage_names() {
        assert_eq!("Synthesis".parse::<StageKind>(), Ok(StageKind::Synthesis));
        assert_eq!(" cts ".parse::<StageKind>(), Ok(StageKind::Cts));
        assert_eq!(
            "clock-tree-synthesis".parse::<StageKind>(),
            Ok(StageKind::Cts)
        );
        assert_eq!(
            "lithography".parse::<StageKind>(),
            Err(StageParseError("lithography".to_string()))
        );
    }

    #[test]
    fn test_stage_tools() {
        assert_eq!(StageKind::Synthesis.tool(), ToolKind::Yosys);
        assert_eq!(StageKind::Routing.tool(), ToolKind::OpenRoad);
        assert_eq!(StageKind::Verification.tool(), ToolKind::Magic);
    }
}
