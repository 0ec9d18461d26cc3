use crate::models::StageKind;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Local};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Directory under the project root that holds per-stage working directories.
pub const OUTPUT_DIR_NAME: &str = "kairos_output";

/// Extension of saved project files.
pub const PROJECT_EXTENSION: &str = "kproj";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProjectError {
    #[error("RTL file already in project: {0}")]
    DuplicateSource(Utf8PathBuf),

    #[error("RTL file not in project: {0}")]
    UnknownSource(Utf8PathBuf),
}

/// Physical design targets handed to the stage scripts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Constraints {
    pub clock_period_ns: f64,
    pub voltage_v: f64,
    pub power_budget_mw: f64,
    pub floorplan_width_um: f64,
    pub floorplan_height_um: f64,
    /// Core utilization, 0.0 to 1.0
    pub utilization: f64,
    pub routing_layers: u32,
    pub clock_port: String,
}

impl Default for Constraints {
    fn default() -> Self {
        Self {
            clock_period_ns: 10.0,
            voltage_v: 1.8,
            power_budget_mw: 100.0,
            floorplan_width_um: 1000.0,
            floorplan_height_um: 1000.0,
            utilization: 0.7,
            routing_layers: 6,
            clock_port: "clk".to_string(),
        }
    }
}

/// One entry of a project's build history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildRecord {
    pub stage: StageKind,
    pub timestamp: DateTime<Local>,
    pub success: bool,
    #[serde(default)]
    pub metrics: IndexMap<String, String>,
}

impl BuildRecord {
    pub fn new(stage: StageKind, success: bool) -> Self {
        Self {
            stage,
            timestamp: Local::now(),
            success,
            metrics: IndexMap::new(),
        }
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.metrics.insert(name.into(), value.into());
        self
    }
}

/// A design project as handed to the pipeline.
///
/// The pipeline only reads it. Persistence goes through
/// [`ConfigManager::save_project`](crate::config::ConfigManager::save_project).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub name: String,
    pub root: Utf8PathBuf,
    #[serde(default)]
    pub rtl_files: Vec<Utf8PathBuf>,
    #[serde(default = "default_pdk")]
    pub pdk: String,
    #[serde(default = "default_top_module")]
    pub top_module: String,
    #[serde(default)]
    pub constraints: Constraints,
    #[serde(default)]
    pub build_history: Vec<BuildRecord>,
    pub created: DateTime<Local>,
    pub last_modified: DateTime<Local>,
}

fn default_pdk() -> String {
    "sky130".to_string()
}

fn default_top_module() -> String {
    "top".to_string()
}

impl ProjectConfig {
    pub fn new(name: impl Into<String>, root: impl Into<Utf8PathBuf>) -> Self {
        let now = Local::now();
        Self {
            name: name.into(),
            root: root.into(),
            rtl_files: Vec::new(),
            pdk: default_pdk(),
            top_module: default_top_module(),
            constraints: Constraints::default(),
            build_history: Vec::new(),
            created: now,
            last_modified: now,
        }
    }

    /// Append an RTL source. The list keeps insertion order and rejects duplicates.
    pub fn add_rtl_file(&mut self, path: impl Into<Utf8PathBuf>) -> Result<(), ProjectError> {
        let path = path.into();
        if self.rtl_files.contains(&path) {
            return Err(ProjectError::DuplicateSource(path));
        }
        self.rtl_files.push(path);
        Ok(())
    }

    pub fn remove_rtl_file(&mut self, path: &Utf8Path) -> Result<(), ProjectError> {
        let index = self
            .rtl_files
            .iter()
            .position(|p| p == path)
            .ok_or_else(|| ProjectError::UnknownSource(path.to_path_buf()))?;
        self.rtl_files.remove(index);
        Ok(())
    }

    pub fn set_pdk(&mut self, pdk: impl Into<String>) {
        self.pdk = pdk.into();
    }

    pub fn record_build(&mut self, record: BuildRecord) {
        self.build_history.push(record);
    }

    /// `<root>/kairos_output`
    pub fn output_dir(&self) -> Utf8PathBuf {
        self.root.join(OUTPUT_DIR_NAME)
    }

    /// `<root>/kairos_output/<stage>`
    pub fn stage_dir(&self, stage: StageKind) -> Utf8PathBuf {
        self.output_dir().join(stage.name())
    }

    /// `<root>/<name>.kproj`, using [`dir_name`](Self::dir_name)
    pub fn project_file(&self) -> Utf8PathBuf {
        self.root
            .join(format!("{}.{}", self.dir_name(), PROJECT_EXTENSION))
    }

    /// The project name as a single path component.
    ///
    /// Separators, drive colons and control characters become `_`; a name that is empty,
    /// `.` or `..` after trimming becomes `project`.
    pub fn dir_name(&self) -> String {
        let cleaned: String = self
            .name
            .trim()
            .chars()
            .map(|c| match c {
                '/' | '\\' | ':' => '_',
                c if c.is_control() => '_',
                c => c,
            })
            .collect();
        match cleaned.as_str() {
            "" | "." | ".." => "project".to_string(),
            _ => cleaned,
        }
    }

    /// Drop repeated RTL entries, keeping the first occurrence. Returns how many went.
    ///
    /// [`add_rtl_file`](Self::add_rtl_file) already refuses duplicates; this covers lists
    /// that arrive through deserialization.
    pub fn dedup_rtl_files(&mut self) -> usize {
        let before = self.rtl_files.len();
        let mut seen = std::collections::HashSet::new();
        self.rtl_files.retain(|file| seen.insert(file.clone()));
        before - self.rtl_files.len()
    }

    /// Whether the PDK id names a SkyWater 130nm kit (case-insensitive).
    pub fn is_sky130(&self) -> bool {
        self.pdk.to_ascii_lowercase().contains("sky130")
    }
}
