use crate::models::{
    DetectedTools, FLOW_IMAGES, InstallType, OperationMode, StageKind, ToolInfo, ToolKind,
    ToolResult,
};
use crate::services::bridge::{BridgeEnvironment, BridgeStatus, quote};
use crate::services::process::{ProcessRequest, ProcessRunner};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

/// Everything one detection pass learned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectionReport {
    pub tools: DetectedTools,
    /// All-in-one flow images present in the bridge's container registry
    pub flow_images: Vec<String>,
    pub bridge: BridgeStatus,
    pub docker_available: bool,
    /// Human-readable account of the pass, advisory only
    pub narration: Vec<String>,
}

impl DetectionReport {
    /// A report in which nothing was found.
    pub fn empty() -> Self {
        let mut tools = DetectedTools::new();
        for kind in ToolKind::ALL {
            tools.insert(ToolInfo::missing(kind));
        }
        Self {
            tools,
            flow_images: Vec::new(),
            bridge: BridgeStatus::unavailable(),
            docker_available: false,
            narration: Vec::new(),
        }
    }

    pub fn has_flow_image(&self) -> bool {
        !self.flow_images.is_empty()
    }

    pub fn mode(&self) -> OperationMode {
        OperationMode::from_tools(&self.tools, self.has_flow_image())
    }

    /// Names of the usable tools for a stage, flow image last.
    pub fn tools_for_stage(&self, stage: StageKind) -> Vec<String> {
        let candidates: &[ToolKind] = match stage {
            StageKind::Synthesis => &[ToolKind::Yosys],
            StageKind::Floorplan | StageKind::Placement | StageKind::Cts | StageKind::Routing => {
                &[ToolKind::OpenRoad]
            }
            StageKind::Verification => &[ToolKind::Magic, ToolKind::Netgen],
        };
        let mut names: Vec<String> = candidates
            .iter()
            .filter(|kind| self.tools.is_available(**kind))
            .map(|kind| kind.display_name().to_string())
            .collect();
        if self.has_flow_image() {
            names.push("OpenLane".to_string());
        }
        names
    }

    /// Multi-line status summary for display.
    pub fn summary(&self) -> String {
        let mode = self.mode();
        if mode == OperationMode::Unavailable {
            return "No EDA toolchain detected. Please install the EDA tools natively or in the bridge environment.".to_string();
        }

        let mut summary = format!(
            "Mode: {}\nTools available: {}/{}\n",
            mode,
            self.tools.found_count(),
            self.tools.total()
        );
        if self.has_flow_image() {
            summary.push_str("OpenLane: Yes (container)\n");
        }
        for info in self.tools.iter().filter(|info| info.available) {
            summary.push_str(&format!("{}: {}\n", info.name, info.version));
        }
        let missing = self.tools.missing_tools();
        if !missing.is_empty() {
            let names: Vec<_> = missing.iter().map(|kind| kind.display_name()).collect();
            summary.push_str(&format!("\nMissing: {}", names.join(", ")));
        }
        summary
    }
}

/// Finds each tracked tool by trying, in order: host PATH, bridge PATH, a deep scan of
/// well-known install directories inside the bridge, and finally a container image.
pub struct ToolchainDetector {
    runner: Arc<dyn ProcessRunner>,
    bridge: Arc<BridgeEnvironment>,
    probe_timeout: Duration,
}

/// Values queried at most once per detection pass.
#[derive(Default)]
struct PassCache {
    home: OnceCell<Option<String>>,
    docker: OnceCell<bool>,
}

impl ToolchainDetector {
    pub fn new(
        runner: Arc<dyn ProcessRunner>,
        bridge: Arc<BridgeEnvironment>,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            runner,
            bridge,
            probe_timeout,
        }
    }

    pub fn bridge(&self) -> &Arc<BridgeEnvironment> {
        &self.bridge
    }

    /// Run a complete detection pass over every tracked tool.
    pub async fn detect(&self) -> DetectionReport {
        let mut narration = Vec::new();
        let cache = PassCache::default();

        let bridge = self.bridge.status().await.clone();
        if bridge.available {
            narration.push(format!("✓ Bridge environment detected: {}", bridge.version));
            if let Some(distro) = &bridge.default_distro {
                narration.push(format!("  Distribution: {}", distro));
            }
        } else {
            narration.push("⚠ Bridge environment not available, checking host PATH only".to_string());
        }
        narration.push(String::new());
        narration.push("Scanning for EDA tools...".to_string());

        let mut tools = DetectedTools::new();
        for kind in ToolKind::ALL {
            let info = self.detect_tool(kind, &cache, &mut narration).await;
            tools.insert(info);
        }

        let docker_available = self.docker_available(&cache).await;
        let mut flow_images = Vec::new();
        if docker_available {
            for image in FLOW_IMAGES {
                if self.bounded(self.bridge.image_exists(image)).await.unwrap_or(false) {
                    narration.push(format!("✓ Container image found: {}", image));
                    flow_images.push(image.to_string());
                }
            }
            if flow_images.is_empty() {
                narration.push(format!(
                    "⚠ No OpenLane container images found (searched {})",
                    FLOW_IMAGES.join(", ")
                ));
            }
        }

        if tools.found_count() == 0 {
            narration.push("⚠ No EDA tools found".to_string());
        }

        let report = DetectionReport {
            tools,
            flow_images,
            bridge,
            docker_available,
            narration,
        };

        let mode = report.mode();
        let mut narration = report.narration.clone();
        narration.push(String::new());
        narration.push(format!("🔧 {}", mode.description()));
        let missing = report.tools.missing_tools();
        if mode == OperationMode::Standard && !missing.is_empty() {
            narration.push("Missing optional tools:".to_string());
            for kind in &missing {
                narration.push(format!("  • {}", kind));
            }
        }

        tracing::info!(
            "Detection finished: {} of {} tools found, mode {}",
            report.tools.found_count(),
            report.tools.total(),
            mode
        );

        DetectionReport {
            narration,
            ..report
        }
    }

    async fn detect_tool(
        &self,
        kind: ToolKind,
        cache: &PassCache,
        narration: &mut Vec<String>,
    ) -> ToolInfo {
        let found = match self.probe_host(kind).await {
            Some(info) => Some(info),
            None => match self.probe_bridge_path(kind).await {
                Some(info) => Some(info),
                None => match self.deep_scan(kind, cache).await {
                    Some(info) => Some(info),
                    None => self.probe_container(kind, cache).await,
                },
            },
        };

        match found {
            Some(info) => {
                narration.push(format!("✓ {}: {}", info.name, info.version));
                if let (Some(location), Some(install)) = (&info.location, info.install_type) {
                    narration.push(format!("  Location: {} ({})", location, install));
                }
                tracing::debug!("{} found via {:?}", kind, info.install_type);
                info
            }
            None => {
                narration.push(format!("⚠ {} not found", kind));
                ToolInfo::missing(kind)
            }
        }
    }

    async fn probe_host(&self, kind: ToolKind) -> Option<ToolInfo> {
        let request = ProcessRequest::new(kind.command()).arg(kind.version_flag());
        let result = self
            .bounded(self.runner.run(request, None, CancellationToken::new()))
            .await?;
        answers_version_probe(&result).then(|| {
            ToolInfo::found(
                kind,
                InstallType::PathResident,
                version_or_detected(&result),
                kind.command(),
            )
        })
    }

    async fn probe_bridge_path(&self, kind: ToolKind) -> Option<ToolInfo> {
        if !self.bridge.is_available().await {
            return None;
        }
        let location = self.bounded(self.bridge.command_path(kind.command())).await??;
        let result = self
            .bounded(
                self.bridge
                    .run_quiet(&format!("{} {}", quote(kind.command()), quote(kind.version_flag()))),
            )
            .await?;
        answers_version_probe(&result).then(|| {
            ToolInfo::found(
                kind,
                InstallType::BridgeResident,
                version_or_detected(&result),
                location,
            )
        })
    }

    async fn deep_scan(&self, kind: ToolKind, cache: &PassCache) -> Option<ToolInfo> {
        if !self.bridge.is_available().await {
            return None;
        }

        for search_path in kind.search_paths() {
            let dir = if search_path.contains("$HOME") {
                let Some(home) = self.home_dir(cache).await else {
                    continue;
                };
                search_path.replace("$HOME", &home)
            } else {
                search_path.to_string()
            };

            let mut candidates = vec![format!("{}/{}", dir, kind.command())];
            if !dir.ends_with("/bin") {
                candidates.push(format!("{}/bin/{}", dir, kind.command()));
            }

            for candidate in candidates {
                if !self
                    .bounded(self.bridge.file_exists(&candidate))
                    .await
                    .unwrap_or(false)
                {
                    continue;
                }
                let version = match self
                    .bounded(
                        self.bridge
                            .run_quiet(&format!("{} {}", quote(&candidate), quote(kind.version_flag()))),
                    )
                    .await
                {
                    Some(result) => version_or_detected(&result),
                    None => "detected".to_string(),
                };
                let install = if is_build_location(&candidate) {
                    InstallType::CompiledBuild
                } else {
                    InstallType::BridgeResident
                };
                return Some(ToolInfo::found(kind, install, version, candidate));
            }
        }
        None
    }

    async fn probe_container(&self, kind: ToolKind, cache: &PassCache) -> Option<ToolInfo> {
        let image = kind.container_image()?;
        if !self.docker_available(cache).await {
            return None;
        }
        let exists = self.bounded(self.bridge.image_exists(image)).await?;
        exists.then(|| {
            ToolInfo::found(
                kind,
                InstallType::ContainerImage,
                "container image",
                format!("docker:{}", image),
            )
        })
    }

    async fn home_dir(&self, cache: &PassCache) -> Option<String> {
        cache
            .home
            .get_or_init(|| async { self.bounded(self.bridge.home_dir()).await.flatten() })
            .await
            .clone()
    }

    async fn docker_available(&self, cache: &PassCache) -> bool {
        *cache
            .docker
            .get_or_init(|| async {
                if !self.bridge.is_available().await {
                    return false;
                }
                self.bounded(self.bridge.command_exists("docker"))
                    .await
                    .unwrap_or(false)
            })
            .await
    }

    /// Bound a probe by the configured timeout; `None` when it ran out.
    async fn bounded<F, T>(&self, probe: F) -> Option<T>
    where
        F: Future<Output = T>,
    {
        match tokio::time::timeout(self.probe_timeout, probe).await {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!("Detection probe timed out after {:?}", self.probe_timeout);
                None
            }
        }
    }
}

/// Some tools exit 1 after printing their version.
fn answers_version_probe(result: &ToolResult) -> bool {
    matches!(result.exit_code, Some(0) | Some(1))
}

fn version_or_detected(result: &ToolResult) -> String {
    result.first_line().unwrap_or("detected").to_string()
}

/// True when a path component marks a source build tree (`build`, `build-release`, ...).
pub fn is_build_location(path: &str) -> bool {
    path.split('/')
        .any(|segment| segment == "build" || segment.starts_with("build-"))
}
