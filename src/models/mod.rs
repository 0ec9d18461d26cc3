//! Data models for the Kairos EDA core.
//!
//! - [`StageKind`]: the closed set of flow stages, their tools and artifact contract
//! - [`ToolKind`], [`ToolInfo`], [`DetectedTools`], [`OperationMode`]: detection results
//! - [`ToolResult`] and [`ToolFailure`]: the outcome of one external program invocation
//! - [`ProjectConfig`]: the design being built, handed to the pipeline by reference
//! - [`ToolchainConfig`] and [`PipelineSettings`]: persisted tool paths and runtime knobs
//!
//! Everything here is plain data. Process spawning and event delivery live in
//! [`services`](crate::services) and [`pipeline`](crate::pipeline).

pub mod config;
pub mod project;
pub mod stage;
pub mod tool;

pub use config::{PipelineSettings, ToolchainConfig};
pub use project::{BuildRecord, Constraints, ProjectConfig, ProjectError, OUTPUT_DIR_NAME};
pub use stage::{StageKind, StageParseError};
pub use tool::{
    DetectedTools, FLOW_IMAGES, InstallType, OperationMode, OutputLine, OutputStream, ToolFailure,
    ToolInfo, ToolKind, ToolParseError, ToolResult,
};
