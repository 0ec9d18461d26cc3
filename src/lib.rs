// Kairos EDA - toolchain discovery and stage orchestration for open-source ASIC flows
//
// This is the library crate containing the detection, process and pipeline logic.
// The binary crate (main.rs) provides a command-line front end.

pub mod config;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod pipeline;
pub mod services;
pub mod state;

// Re-export commonly used types for convenience
pub use config::ConfigManager;
pub use models::{PipelineSettings, ProjectConfig, StageKind, ToolKind, ToolchainConfig};
pub use pipeline::{FlowOutcome, FlowStatus, StageMetric, StageOutcome, StagePipeline};
pub use state::{LogSeverity, PipelineEvent, StateManager};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
