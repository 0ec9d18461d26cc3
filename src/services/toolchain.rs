use crate::config::ConfigManager;
use crate::models::{InstallType, StageKind, ToolKind, ToolchainConfig};
use crate::services::detection::{DetectionReport, ToolchainDetector};
use anyhow::{Context, Result};
use std::sync::{PoisonError, RwLock};

/// A configured binary and where it must run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTool {
    pub tool: ToolKind,
    pub program: String,
    /// Execute inside the bridge environment rather than on the host
    pub in_bridge: bool,
}

/// Tool paths, detection and persistence behind one handle.
///
/// The configuration is read-shared; only [`save_config`](Self::save_config) writes it
/// to disk.
pub struct Toolchain {
    config: RwLock<ToolchainConfig>,
    manager: Option<ConfigManager>,
    detector: ToolchainDetector,
    last_report: RwLock<Option<DetectionReport>>,
}

impl Toolchain {
    /// Toolchain with an in-memory configuration and no backing file.
    pub fn new(config: ToolchainConfig, detector: ToolchainDetector) -> Self {
        Self {
            config: RwLock::new(config),
            manager: None,
            detector,
            last_report: RwLock::new(None),
        }
    }

    /// Toolchain loaded from, and saved back to, the manager's `toolchain.yaml`.
    pub fn load(manager: ConfigManager, detector: ToolchainDetector) -> Result<Self> {
        let config = manager.load_toolchain_config()?;
        Ok(Self {
            config: RwLock::new(config),
            manager: Some(manager),
            detector,
            last_report: RwLock::new(None),
        })
    }

    pub fn config(&self) -> ToolchainConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn update_config<F>(&self, update: F)
    where
        F: FnOnce(&mut ToolchainConfig),
    {
        let mut config = self.config.write().unwrap_or_else(PoisonError::into_inner);
        update(&mut config);
    }

    pub fn save_config(&self) -> Result<()> {
        let manager = self
            .manager
            .as_ref()
            .context("Toolchain has no configuration file to save to")?;
        manager.save_toolchain_config(&self.config())
    }

    pub fn detector(&self) -> &ToolchainDetector {
        &self.detector
    }

    /// Run a detection pass and write the detected locations back into the configuration.
    pub async fn detect(&self) -> DetectionReport {
        let report = self.detector.detect().await;
        self.update_config(|config| apply_detection(config, &report));
        *self
            .last_report
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(report.clone());
        report
    }

    pub fn last_report(&self) -> Option<DetectionReport> {
        self.last_report
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The configured binary for a tool, or `None` when its path is empty.
    pub fn resolve(&self, tool: ToolKind) -> Option<ResolvedTool> {
        let config = self.config.read().unwrap_or_else(PoisonError::into_inner);
        let program = config.path(tool).trim();
        if program.is_empty() {
            return None;
        }
        Some(ResolvedTool {
            tool,
            program: program.to_string(),
            in_bridge: config.use_bridge,
        })
    }

    /// Usable tools for a stage according to the last detection pass.
    pub fn tools_for_stage(&self, stage: StageKind) -> Vec<String> {
        self.last_report()
            .map(|report| report.tools_for_stage(stage))
            .unwrap_or_default()
    }
}

fn is_primary(tool: ToolKind) -> bool {
    matches!(tool, ToolKind::Yosys | ToolKind::OpenRoad)
}

/// Merge a detection report into the configuration.
///
/// The bridge flag is switched on when a primary tool exists only inside the bridge, and
/// is never switched off here. Only locations usable from the active side are written;
/// container hits leave the path untouched.
pub fn apply_detection(config: &mut ToolchainConfig, report: &DetectionReport) {
    let found = || report.tools.iter().filter(|info| info.available);

    let primary_on_host = found().any(|info| {
        is_primary(info.kind) && info.install_type == Some(InstallType::PathResident)
    });
    let primary_in_bridge = found().any(|info| {
        is_primary(info.kind) && info.install_type.is_some_and(InstallType::runs_in_bridge)
    });

    if !config.use_bridge && !primary_on_host && primary_in_bridge {
        tracing::info!("Primary tools found only in the bridge environment, enabling bridge execution");
        config.use_bridge = true;
    }

    for info in found() {
        let (Some(install), Some(location)) = (info.install_type, &info.location) else {
            continue;
        };
        let usable = match install {
            InstallType::ContainerImage => false,
            InstallType::PathResident => !config.use_bridge,
            InstallType::BridgeResident | InstallType::CompiledBuild => config.use_bridge,
        };
        if usable && config.path(info.kind) != location.as_str() {
            tracing::info!("{} path set to {}", info.kind, location);
            config.set_path(info.kind, location.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DetectedTools, ToolInfo};
    use crate::services::bridge::BridgeStatus;

    fn report(found: Vec<ToolInfo>) -> DetectionReport {
        let mut tools = DetectedTools::new();
        for kind in ToolKind::ALL {
            match found.iter().find(|info| info.kind == kind) {
                Some(info) => tools.insert(info.clone()),
                None => tools.insert(ToolInfo::missing(kind)),
            }
        }
        DetectionReport {
            tools,
            flow_images: Vec::new(),
            bridge: BridgeStatus::unavailable(),
            docker_available: false,
            narration: Vec::new(),
        }
    }

    #[test]
    fn test_host_tools_written_back() {
        let mut config = ToolchainConfig::default();
        apply_detection(
            &mut config,
            &report(vec![
                ToolInfo::found(ToolKind::Yosys, InstallType::PathResident, "0.38", "yosys"),
                ToolInfo::found(ToolKind::Magic, InstallType::BridgeResident, "8.3", "/usr/bin/magic"),
            ]),
        );
        assert!(!config.use_bridge);
        assert_eq!(config.yosys_path, "yosys");
        assert_eq!(config.magic_path, "");
    }

    #[test]
    fn test_bridge_only_primary_enables_bridge() {
        let mut config = ToolchainConfig::default();
        apply_detection(
            &mut config,
            &report(vec![
                ToolInfo::found(
                    ToolKind::OpenRoad,
                    InstallType::CompiledBuild,
                    "v2.0",
                    "/home/dev/OpenROAD/build/bin/openroad",
                ),
                ToolInfo::found(ToolKind::Magic, InstallType::BridgeResident, "8.3", "/usr/bin/magic"),
                ToolInfo::found(ToolKind::KLayout, InstallType::PathResident, "0.28", "klayout"),
                ToolInfo::found(
                    ToolKind::Netgen,
                    InstallType::ContainerImage,
                    "container image",
                    "docker:hdlc/netgen",
                ),
            ]),
        );
        assert!(config.use_bridge);
        assert_eq!(config.openroad_path, "/home/dev/OpenROAD/build/bin/openroad");
        assert_eq!(config.magic_path, "/usr/bin/magic");
        assert_eq!(config.klayout_path, "");
        assert_eq!(config.netgen_path, "");
    }

    #[test]
    fn test_bridge_flag_never_cleared() {
        let mut config = ToolchainConfig {
            use_bridge: true,
            ..Default::default()
        };
        apply_detection(
            &mut config,
            &report(vec![ToolInfo::found(
                ToolKind::Yosys,
                InstallType::PathResident,
                "0.38",
                "yosys",
            )]),
        );
        assert!(config.use_bridge);
        assert_eq!(config.yosys_path, "");
    }
}
