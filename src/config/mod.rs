use crate::models::{PipelineSettings, ProjectConfig, ToolchainConfig};
use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use chrono::Local;
use std::fs;

pub const TOOLCHAIN_FILE: &str = "toolchain.yaml";
pub const SETTINGS_FILE: &str = "settings.yaml";
pub const ENV_PREFIX: &str = "KAIROS";

/// Configuration manager for loading and saving YAML configuration files.
///
/// Manages:
/// - Toolchain config (`toolchain.yaml`): per-tool paths, bridge usage, PDK root
/// - Pipeline settings (`settings.yaml`), layered with `KAIROS_*` environment variables
/// - Project files (`<root>/<name>.kproj`) on behalf of the project owner
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config_dir: Utf8PathBuf,
    toolchain_path: Utf8PathBuf,
    settings_path: Utf8PathBuf,
}

impl ConfigManager {
    /// Create a new ConfigManager with the specified configuration directory.
    ///
    /// The directory is created if it does not exist yet.
    pub fn new<P: AsRef<Utf8Path>>(config_dir: P) -> Result<Self> {
        let config_dir = config_dir.as_ref().to_path_buf();

        if !config_dir.exists() {
            fs::create_dir_all(&config_dir)
                .with_context(|| format!("Failed to create config directory: {}", config_dir))?;
        }

        Ok(Self {
            toolchain_path: config_dir.join(TOOLCHAIN_FILE),
            settings_path: config_dir.join(SETTINGS_FILE),
            config_dir,
        })
    }

    /// `<user config dir>/KairosEDA`
    pub fn default_dir() -> Result<Utf8PathBuf> {
        let base = dirs::config_dir().context("No user configuration directory on this system")?;
        let base = Utf8PathBuf::from_path_buf(base)
            .map_err(|p| anyhow::anyhow!("Configuration directory is not UTF-8: {}", p.display()))?;
        Ok(base.join("KairosEDA"))
    }

    /// Load the toolchain configuration, or defaults if the file doesn't exist.
    pub fn load_toolchain_config(&self) -> Result<ToolchainConfig> {
        if !self.toolchain_path.exists() {
            tracing::warn!(
                "Toolchain config file not found at {}, using defaults",
                self.toolchain_path
            );
            return Ok(ToolchainConfig::default());
        }

        let file_contents = fs::read_to_string(&self.toolchain_path).with_context(|| {
            format!("Failed to read toolchain config: {}", self.toolchain_path)
        })?;

        let config: ToolchainConfig = serde_yaml_ng::from_str(&file_contents).with_context(|| {
            format!("Failed to parse toolchain config: {}", self.toolchain_path)
        })?;

        tracing::info!("Loaded toolchain config from {}", self.toolchain_path);
        Ok(config)
    }

    pub fn save_toolchain_config(&self, config: &ToolchainConfig) -> Result<()> {
        let yaml_string = serde_yaml_ng::to_string(config)
            .context("Failed to serialize toolchain config to YAML")?;

        fs::write(&self.toolchain_path, yaml_string).with_context(|| {
            format!("Failed to write toolchain config: {}", self.toolchain_path)
        })?;

        tracing::info!("Saved toolchain config to {}", self.toolchain_path);
        Ok(())
    }

    /// Load pipeline settings: defaults, then `settings.yaml`, then `KAIROS_*` variables.
    pub fn load_settings(&self) -> Result<PipelineSettings> {
        self.load_settings_with(
            config::Environment::with_prefix(ENV_PREFIX).try_parsing(true),
        )
    }

    fn load_settings_with(&self, environment: config::Environment) -> Result<PipelineSettings> {
        let settings = config::Config::builder()
            .add_source(
                config::File::new(self.settings_path.as_str(), config::FileFormat::Yaml)
                    .required(false),
            )
            .add_source(environment)
            .build()
            .with_context(|| format!("Failed to layer pipeline settings from {}", self.settings_path))?
            .try_deserialize::<PipelineSettings>()
            .context("Failed to parse pipeline settings")?;

        tracing::debug!("Pipeline settings: {:?}", settings);
        Ok(settings)
    }

    pub fn save_settings(&self, settings: &PipelineSettings) -> Result<()> {
        let yaml_string = serde_yaml_ng::to_string(settings)
            .context("Failed to serialize pipeline settings to YAML")?;

        fs::write(&self.settings_path, yaml_string)
            .with_context(|| format!("Failed to write settings: {}", self.settings_path))?;

        tracing::info!("Saved pipeline settings to {}", self.settings_path);
        Ok(())
    }

    pub fn load_project(&self, path: &Utf8Path) -> Result<ProjectConfig> {
        let file_contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read project: {}", path))?;

        let mut project: ProjectConfig = serde_yaml_ng::from_str(&file_contents)
            .with_context(|| format!("Failed to parse project: {}", path))?;

        let dropped = project.dedup_rtl_files();
        if dropped > 0 {
            tracing::warn!("Dropped {} duplicate RTL entries from {}", dropped, path);
        }

        tracing::info!("Loaded project '{}' from {}", project.name, path);
        Ok(project)
    }

    /// Save a project to `<root>/<name>.kproj`, stamping its last-modified time.
    pub fn save_project(&self, project: &mut ProjectConfig) -> Result<Utf8PathBuf> {
        project.last_modified = Local::now();

        fs::create_dir_all(&project.root)
            .with_context(|| format!("Failed to create project directory: {}", project.root))?;

        let path = project.project_file();
        let yaml_string =
            serde_yaml_ng::to_string(project).context("Failed to serialize project to YAML")?;

        fs::write(&path, yaml_string)
            .with_context(|| format!("Failed to write project: {}", path))?;

        tracing::info!("Saved project '{}' to {}", project.name, path);
        Ok(path)
    }

    pub fn config_dir(&self) -> &Utf8Path {
        &self.config_dir
    }

    pub fn toolchain_path(&self) -> &Utf8Path {
        &self.toolchain_path
    }

    pub fn settings_path(&self) -> &Utf8Path {
        &self.settings_path
    }
}
