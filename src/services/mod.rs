//! Services module - tool discovery and external process plumbing.
//!
//! Everything in here is framework-agnostic and knows nothing about stages being
//! single-flight or about event delivery; that lives in [`pipeline`](crate::pipeline).
//!
//! # Components
//!
//! - [`ProcessRunner`] / [`SystemProcessRunner`]: spawn one program, stream its output
//!   line by line to an optional sink, and return a [`ToolResult`](crate::models::ToolResult).
//!   Cancellation kills the whole process tree.
//! - [`BridgeEnvironment`]: run shell commands inside the POSIX bridge (WSL on Windows),
//!   with every interpolated value shell-escaped, and translate paths between
//!   `C:\x` and `/mnt/c/x`.
//! - [`ToolchainDetector`]: probe each tool through host PATH, bridge PATH, a deep scan of
//!   install directories and container images, producing a [`DetectionReport`].
//! - [`Toolchain`]: the configured tool paths, detection write-back and persistence.
//! - [`scripts`]: pure stage script generation.
//! - [`ToolchainInstaller`]: step plans that build or pull missing tools inside the bridge.
//! - [`ReportParser`]: pulls cell counts, chip area and DRC counts out of tool output.
//!
//! # Probe order
//!
//! 1. `<cmd> <version flag>` on the host; exit code 0 or 1 counts as found
//! 2. `command -v <cmd>` in the bridge, confirmed by running the tool once
//! 3. `test -f` over the tool's candidate directories (and their `bin/`)
//! 4. `docker images -q <image>` when docker exists in the bridge

pub mod bridge;
pub mod detection;
pub mod installer;
pub mod process;
pub mod report;
pub mod scripts;
pub mod toolchain;

pub use bridge::{BridgeEnvironment, BridgeStatus, bridge_to_host_path, host_to_bridge_path};
pub use detection::{DetectionReport, ToolchainDetector};
pub use installer::{SetupOutcome, SetupTarget, ToolchainInstaller};
pub use process::{OutputSink, ProcessRequest, ProcessRunner, SystemProcessRunner};
pub use report::{ReportParser, SynthesisStats};
pub use scripts::{PathStyle, StageScript};
pub use toolchain::{ResolvedTool, Toolchain};
