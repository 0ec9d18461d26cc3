use crate::models::ToolKind;
use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

/// Persisted tool locations, loaded from `toolchain.yaml`.
///
/// An empty path means "not configured"; detection fills these in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolchainConfig {
    pub yosys_path: String,
    pub openroad_path: String,
    pub opensta_path: String,
    pub magic_path: String,
    pub netgen_path: String,
    pub klayout_path: String,
    pub pdk_path: String,
    /// Run tools inside the bridge environment instead of on the host
    pub use_bridge: bool,
    pub container_image: String,
    /// Program used to reach the bridge environment
    pub bridge_launcher: String,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            yosys_path: String::new(),
            openroad_path: String::new(),
            opensta_path: String::new(),
            magic_path: String::new(),
            netgen_path: String::new(),
            klayout_path: String::new(),
            pdk_path: String::new(),
            use_bridge: false,
            container_image: "efabless/openlane:latest".to_string(),
            bridge_launcher: "wsl".to_string(),
        }
    }
}

impl ToolchainConfig {
    pub fn path(&self, tool: ToolKind) -> &str {
        match tool {
            ToolKind::Yosys => &self.yosys_path,
            ToolKind::OpenRoad => &self.openroad_path,
            ToolKind::OpenSta => &self.opensta_path,
            ToolKind::Magic => &self.magic_path,
            ToolKind::Netgen => &self.netgen_path,
            ToolKind::KLayout => &self.klayout_path,
        }
    }

    pub fn set_path(&mut self, tool: ToolKind, path: impl Into<String>) {
        let slot = match tool {
            ToolKind::Yosys => &mut self.yosys_path,
            ToolKind::OpenRoad => &mut self.openroad_path,
            ToolKind::OpenSta => &mut self.opensta_path,
            ToolKind::Magic => &mut self.magic_path,
            ToolKind::Netgen => &mut self.netgen_path,
            ToolKind::KLayout => &mut self.klayout_path,
        };
        *slot = path.into();
    }

    pub fn is_configured(&self, tool: ToolKind) -> bool {
        !self.path(tool).trim().is_empty()
    }
}

/// Runtime knobs for the stage pipeline.
///
/// Layered by [`ConfigManager::load_settings`](crate::config::ConfigManager::load_settings):
/// built-in defaults, then `settings.yaml`, then `KAIROS_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Abort a complete flow at the first failed stage
    pub stop_on_failure: bool,
    pub inter_stage_pause_ms: u64,
    /// Upper bound for each detection probe process
    pub probe_timeout_secs: u64,
    /// Root of the centralized run directories; `None` uses the documents folder
    pub workspace_dir: Option<Utf8PathBuf>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            stop_on_failure: false,
            inter_stage_pause_ms: 500,
            probe_timeout_secs: 15,
            workspace_dir: None,
        }
    }
}

impl PipelineSettings {
    /// Centralized workspace root, `<documents>/KairosEDA_Directory` unless overridden.
    pub fn workspace_root(&self) -> Utf8PathBuf {
        if let Some(dir) = &self.workspace_dir {
            return dir.clone();
        }
        dirs::document_dir()
            .or_else(dirs::home_dir)
            .and_then(|p| Utf8PathBuf::from_path_buf(p).ok())
            .unwrap_or_else(|| Utf8PathBuf::from("."))
            .join("KairosEDA_Directory")
    }
}
