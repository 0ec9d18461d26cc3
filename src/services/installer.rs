// Bridge-side toolchain installation.
//
// Every installation is a fixed plan of shell steps run inside the bridge environment.
// Plans are plain data and can be inspected without a bridge. The installer walks a plan,
// narrates through the StateManager and stops at the first step that has to succeed.
//
// Source builds land in `$HOME/yosys` and `$HOME/OpenROAD/build`, the home-relative build
// locations the detector's deep scan looks at first.

use crate::models::{OutputLine, OutputStream, ToolKind, ToolResult, ToolchainConfig};
use crate::services::bridge::{BridgeEnvironment, quote};
use crate::services::process::OutputSink;
use crate::state::StateManager;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub const YOSYS_REPO: &str = "https://github.com/YosysHQ/yosys.git";
pub const OPENROAD_REPO: &str = "https://github.com/The-OpenROAD-Project/OpenROAD.git";

const YOSYS_BUILD_DEPS: &str = "build-essential clang bison flex libreadline-dev gawk tcl-dev \
libffi-dev git graphviz xdot pkg-config python3 libboost-system-dev libboost-python-dev \
libboost-filesystem-dev zlib1g-dev";

const OPENROAD_BUILD_DEPS: &str = "build-essential cmake clang gcc-multilib libomp-dev python3 \
python3-dev python3-pip swig libboost-all-dev libeigen3-dev qtbase5-dev qtchooser qt5-qmake \
qtbase5-dev-tools libqt5charts5-dev tcl-dev tk-dev flex bison libfl-dev liblemon-dev \
libcairo2-dev libglu1-mesa-dev libspdlog-dev";

/// What `kairos setup` can install.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupTarget {
    /// Docker engine inside the bridge
    Docker,
    /// Yosys built from source under `$HOME/yosys`
    Yosys,
    /// OpenROAD built from source under `$HOME/OpenROAD`
    OpenRoad,
    /// The OpenROAD container image
    OpenRoadImage,
    /// The configured all-in-one flow image
    FlowImage,
    /// Yosys, then OpenROAD, both from source
    Complete,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown setup target: {0}")]
pub struct SetupParseError(pub String);

impl SetupTarget {
    pub const ALL: [SetupTarget; 6] = [
        SetupTarget::Docker,
        SetupTarget::Yosys,
        SetupTarget::OpenRoad,
        SetupTarget::OpenRoadImage,
        SetupTarget::FlowImage,
        SetupTarget::Complete,
    ];

    pub fn name(self) -> &'static str {
        match self {
            SetupTarget::Docker => "docker",
            SetupTarget::Yosys => "yosys",
            SetupTarget::OpenRoad => "openroad",
            SetupTarget::OpenRoadImage => "openroad-image",
            SetupTarget::FlowImage => "flow-image",
            SetupTarget::Complete => "all",
        }
    }

    /// Plans to run for this target, in order.
    pub fn plans(self, config: &ToolchainConfig) -> Vec<InstallPlan> {
        match self {
            SetupTarget::Docker => vec![docker_plan()],
            SetupTarget::Yosys => vec![yosys_source_plan()],
            SetupTarget::OpenRoad => vec![openroad_source_plan()],
            SetupTarget::OpenRoadImage => ToolKind::OpenRoad
                .container_image()
                .map(|image| image_plan("OpenROAD", image))
                .into_iter()
                .collect(),
            SetupTarget::FlowImage => vec![image_plan("Flow", config.container_image.trim())],
            SetupTarget::Complete => vec![yosys_source_plan(), openroad_source_plan()],
        }
    }
}

impl fmt::Display for SetupTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SetupTarget {
    type Err = SetupParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        SetupTarget::ALL
            .into_iter()
            .find(|target| target.name() == wanted)
            .ok_or_else(|| SetupParseError(s.to_string()))
    }
}

/// What happens when a step's command fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OnFailure {
    /// Log this at Error and stop the plan
    Abort(&'static str),
    /// Log this at Warning and carry on
    Warn(&'static str),
    /// Log the warning and run `command` instead; stop the plan if that fails too
    Fallback {
        warning: &'static str,
        command: String,
    },
    /// Carry on silently
    Ignore,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallStep {
    /// Narrated before the command runs
    pub label: &'static str,
    pub command: String,
    pub on_failure: OnFailure,
    /// Forward the command's output as Info lines
    pub stream_output: bool,
    /// Output lines containing this are not forwarded
    pub quiet_marker: Option<&'static str>,
    /// Plan percent once the step is done
    pub percent: u8,
    /// If the command succeeds with non-empty output the plan is already satisfied
    pub satisfied_by_output: Option<&'static str>,
}

impl InstallStep {
    fn new(label: &'static str, command: impl Into<String>, percent: u8) -> Self {
        Self {
            label,
            command: command.into(),
            on_failure: OnFailure::Ignore,
            stream_output: false,
            quiet_marker: None,
            percent,
            satisfied_by_output: None,
        }
    }

    fn abort(mut self, message: &'static str) -> Self {
        self.on_failure = OnFailure::Abort(message);
        self
    }

    fn warn(mut self, message: &'static str) -> Self {
        self.on_failure = OnFailure::Warn(message);
        self
    }

    fn fallback(mut self, warning: &'static str, command: impl Into<String>) -> Self {
        self.on_failure = OnFailure::Fallback {
            warning,
            command: command.into(),
        };
        self
    }

    fn streamed(mut self) -> Self {
        self.stream_output = true;
        self
    }

    fn quiet(mut self, marker: &'static str) -> Self {
        self.quiet_marker = Some(marker);
        self
    }

    fn satisfied_by_output(mut self, message: &'static str) -> Self {
        self.satisfied_by_output = Some(message);
        self
    }
}

/// One installation: narration, ordered steps and an optional version check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallPlan {
    pub title: String,
    pub notes: Vec<&'static str>,
    pub steps: Vec<InstallStep>,
    /// First line is logged at Success, the rest at Info
    pub done: Vec<String>,
    /// Command whose first output line is reported as the installed version
    pub verify: Option<String>,
}

pub fn docker_plan() -> InstallPlan {
    InstallPlan {
        title: "Installing Docker in the bridge environment...".to_string(),
        notes: Vec::new(),
        steps: vec![
            InstallStep::new("Updating package lists...", "sudo -n apt-get update", 30)
                .warn("Package update had warnings, continuing...")
                .streamed(),
            InstallStep::new(
                "Installing Docker packages...",
                "sudo -n apt-get install -y docker.io docker-compose",
                60,
            )
            .abort("Docker installation failed")
            .streamed(),
            InstallStep::new("Starting Docker service...", "sudo -n service docker start", 80)
                .warn("Could not start Docker service automatically, run: sudo service docker start"),
            InstallStep::new(
                "Configuring Docker permissions...",
                "sudo -n usermod -aG docker \"$(whoami)\"",
                100,
            )
            .warn("Could not add the current user to the docker group"),
        ],
        done: vec![
            "Docker installed successfully!".to_string(),
            "  Note: restart the bridge environment for group changes to take effect".to_string(),
        ],
        verify: Some("docker --version".to_string()),
    }
}

pub fn yosys_source_plan() -> InstallPlan {
    InstallPlan {
        title: "Installing Yosys from source...".to_string(),
        notes: vec!["This may take 10-20 minutes depending on your system"],
        steps: vec![
            InstallStep::new(
                "Installing build dependencies...",
                format!("sudo -n apt-get install -y {}", YOSYS_BUILD_DEPS),
                15,
            )
            .warn("Some dependencies failed to install, continuing...")
            .streamed(),
            InstallStep::new(
                "Cloning Yosys repository...",
                format!(
                    "cd \"$HOME\" && (test -d yosys/.git || git clone --recurse-submodules {})",
                    quote(YOSYS_REPO)
                ),
                30,
            )
            .abort("Failed to clone Yosys repository")
            .streamed(),
            InstallStep::new(
                "Building Yosys (this will take a while)...",
                "cd \"$HOME/yosys\" && make -j\"$(nproc)\"",
                70,
            )
            .abort("Yosys build failed")
            .streamed(),
            InstallStep::new(
                "Installing Yosys to system...",
                "cd \"$HOME/yosys\" && sudo -n make install",
                100,
            )
            .fallback(
                "System installation failed, installing to ~/.local/bin",
                "mkdir -p \"$HOME/.local/bin\" && cd \"$HOME/yosys\" && make install PREFIX=\"$HOME/.local\"",
            ),
        ],
        done: vec!["Yosys installed successfully!".to_string()],
        verify: Some("\"$HOME/yosys/yosys\" -V".to_string()),
    }
}

pub fn openroad_source_plan() -> InstallPlan {
    InstallPlan {
        title: "Installing OpenROAD from source...".to_string(),
        notes: vec!["This may take 20-30 minutes depending on your system"],
        steps: vec![
            InstallStep::new(
                "Installing build dependencies and Python...",
                format!("sudo -n apt-get install -y {}", OPENROAD_BUILD_DEPS),
                15,
            )
            .warn("Some dependencies failed to install, continuing...")
            .streamed(),
            InstallStep::new(
                "Cloning OpenROAD repository...",
                format!(
                    "cd \"$HOME\" && (test -d OpenROAD/.git || git clone --recursive {})",
                    quote(OPENROAD_REPO)
                ),
                30,
            )
            .abort("Failed to clone OpenROAD repository")
            .streamed(),
            InstallStep::new(
                "Configuring build with CMake...",
                "mkdir -p \"$HOME/OpenROAD/build\" && cd \"$HOME/OpenROAD/build\" && cmake ..",
                45,
            )
            .abort("CMake configuration failed")
            .streamed(),
            InstallStep::new(
                "Building OpenROAD (this will take a while)...",
                "cd \"$HOME/OpenROAD/build\" && make -j\"$(nproc)\"",
                85,
            )
            .abort("OpenROAD build failed")
            .streamed()
            .quiet("Built target"),
            InstallStep::new(
                "Setting up OpenROAD executable...",
                "mkdir -p \"$HOME/.local/bin\" && ln -sf \"$HOME/OpenROAD/build/src/openroad\" \"$HOME/.local/bin/openroad\"",
                90,
            )
            .warn("Could not link openroad into ~/.local/bin"),
            InstallStep::new(
                "Adding ~/.local/bin to PATH...",
                "grep -q '.local/bin' \"$HOME/.bashrc\" || echo 'export PATH=\"$HOME/.local/bin:$PATH\"' >> \"$HOME/.bashrc\"",
                100,
            )
            .warn("Could not update ~/.bashrc"),
        ],
        done: vec![
            "OpenROAD installed successfully!".to_string(),
            "  Location: $HOME/OpenROAD/build/src/openroad".to_string(),
        ],
        verify: Some("\"$HOME/OpenROAD/build/src/openroad\" -version".to_string()),
    }
}

/// Pull a container image unless it is already present.
pub fn image_plan(label: &'static str, image: &str) -> InstallPlan {
    let repository = image.split(':').next().unwrap_or(image);
    InstallPlan {
        title: format!("Installing {} container image {}...", label, image),
        notes: Vec::new(),
        steps: vec![
            InstallStep::new(
                "Checking for an existing image...",
                format!("docker images -q {}", quote(repository)),
                20,
            )
            .satisfied_by_output("Container image already available"),
            InstallStep::new("Pulling image, this may take a few minutes...", format!("docker pull {}", quote(image)), 100)
                .abort("Could not pull the container image")
                .streamed(),
        ],
        done: vec![format!("{} container image installed!", label)],
        verify: None,
    }
}

/// Whether the bridge itself can be installed, and how.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeInstallCheck {
    pub can_install: bool,
    pub message: String,
    /// Host command that installs the bridge, run from an elevated prompt
    pub command: Option<String>,
}

pub async fn check_bridge_installation(bridge: &BridgeEnvironment) -> BridgeInstallCheck {
    if bridge.is_available().await {
        return BridgeInstallCheck {
            can_install: false,
            message: "The bridge environment is already installed".to_string(),
            command: None,
        };
    }
    if cfg!(windows) {
        BridgeInstallCheck {
            can_install: true,
            message: "WSL2 can be installed automatically. This will require a system restart."
                .to_string(),
            command: Some(format!("{} --install", bridge.launcher())),
        }
    } else {
        BridgeInstallCheck {
            can_install: false,
            message: "The bridge environment is only needed on Windows; install the tools natively"
                .to_string(),
            command: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetupOutcome {
    Completed,
    Failed { reason: String },
    Cancelled,
    /// Not started because something else was running
    Rejected,
}

impl SetupOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SetupOutcome::Completed)
    }
}

/// Runs install plans inside the bridge, narrating through a [`StateManager`].
pub struct ToolchainInstaller<'a> {
    bridge: &'a BridgeEnvironment,
    state: &'a StateManager,
    cancel: &'a CancellationToken,
}

impl<'a> ToolchainInstaller<'a> {
    pub fn new(
        bridge: &'a BridgeEnvironment,
        state: &'a StateManager,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            bridge,
            state,
            cancel,
        }
    }

    pub async fn install(&self, target: SetupTarget, config: &ToolchainConfig) -> SetupOutcome {
        if !self.bridge.is_available().await {
            self.state.error("The bridge environment is not installed");
            if let Some(command) = check_bridge_installation(self.bridge).await.command {
                self.state
                    .error(format!("Run '{}' as Administrator, restart, then run setup again", command));
            }
            return SetupOutcome::Failed {
                reason: "Bridge environment is not available".to_string(),
            };
        }

        if target == SetupTarget::Complete {
            return self.complete_setup(config).await;
        }

        let plans = target.plans(config);
        let share = 100 / plans.len().max(1) as u8;
        for (index, plan) in plans.iter().enumerate() {
            let start = share * index as u8;
            let outcome = self.run_plan(plan, start, start + share).await;
            if !outcome.is_success() {
                return outcome;
            }
        }
        SetupOutcome::Completed
    }

    /// Yosys, then OpenROAD, both from source.
    async fn complete_setup(&self, config: &ToolchainConfig) -> SetupOutcome {
        let state = self.state;
        state.info("Starting complete EDA toolchain setup...");
        state.setup_progress(0);
        state.success("Bridge environment detected");
        state.setup_progress(10);

        let steps = [
            ("Step 1/2: Installing Yosys synthesis tool...", "Yosys installation failed", 10, 50),
            ("Step 2/2: Installing OpenROAD place & route tool...", "OpenROAD installation failed", 50, 100),
        ];
        for (plan, (announce, failure, from, to)) in SetupTarget::Complete.plans(config).iter().zip(steps) {
            state.info(announce);
            match self.run_plan(plan, from, to).await {
                SetupOutcome::Completed => {}
                SetupOutcome::Failed { reason } => {
                    state.error(failure);
                    return SetupOutcome::Failed { reason };
                }
                other => return other,
            }
        }

        state.success("Setup completed successfully!");
        state.info("Installed tools:");
        state.info("  • Yosys - Synthesis tool");
        state.info("  • OpenROAD - Place & Route, Timing, Power");
        state.info("Tools are available at:");
        state.info("  - $HOME/yosys");
        state.info("  - $HOME/OpenROAD/build/src/openroad");
        SetupOutcome::Completed
    }

    /// Run one plan, mapping its 0-100 progress onto `from..=to`.
    pub async fn run_plan(&self, plan: &InstallPlan, from: u8, to: u8) -> SetupOutcome {
        let state = self.state;
        let scale = |percent: u8| from + ((to.saturating_sub(from)) as u16 * percent as u16 / 100) as u8;

        state.info(plan.title.clone());
        for note in &plan.notes {
            state.info(*note);
        }
        state.setup_progress(from);

        for step in &plan.steps {
            if self.cancel.is_cancelled() {
                return self.cancelled();
            }
            state.info(step.label);

            let result = self.run_command(&step.command, step).await;
            if result.is_cancelled() {
                return self.cancelled();
            }

            if result.success {
                if let Some(message) = step.satisfied_by_output {
                    if !result.stdout.trim().is_empty() {
                        state.success(message);
                        state.setup_progress(to);
                        return SetupOutcome::Completed;
                    }
                }
            } else {
                match &step.on_failure {
                    OnFailure::Abort(message) => {
                        state.error(*message);
                        return SetupOutcome::Failed {
                            reason: format!("{}: {}", message, result.error_message()),
                        };
                    }
                    OnFailure::Warn(message) => state.warning(*message),
                    OnFailure::Fallback { warning, command } => {
                        state.warning(*warning);
                        let retry = self.run_command(command, step).await;
                        if retry.is_cancelled() {
                            return self.cancelled();
                        }
                        if !retry.success {
                            state.error(format!("{} failed: {}", step.label, retry.error_message()));
                            return SetupOutcome::Failed {
                                reason: retry.error_message(),
                            };
                        }
                    }
                    OnFailure::Ignore => {
                        tracing::debug!("Ignoring failed setup step '{}'", step.label)
                    }
                }
            }
            state.setup_progress(scale(step.percent));
        }

        if let Some((first, rest)) = plan.done.split_first() {
            state.success(first.clone());
            for line in rest {
                state.info(line.clone());
            }
        }

        if let Some(verify) = &plan.verify {
            let result = self
                .bridge
                .run(verify, None, None, self.cancel.clone())
                .await;
            if let Some(version) = result.success.then(|| result.first_line()).flatten() {
                state.info(format!("  Version: {}", version));
            }
        }

        SetupOutcome::Completed
    }

    async fn run_command(&self, command: &str, step: &InstallStep) -> ToolResult {
        let sink = step.stream_output.then(|| output_sink(self.state, step.quiet_marker));
        self.bridge
            .run_tool(command, None, sink, self.cancel.clone())
            .await
    }

    fn cancelled(&self) -> SetupOutcome {
        self.state.warning("Setup was cancelled.");
        SetupOutcome::Cancelled
    }
}

fn output_sink(state: &StateManager, quiet_marker: Option<&'static str>) -> OutputSink {
    let state = state.clone();
    Arc::new(move |line: OutputLine| {
        let text = line.text.trim_end();
        if text.trim().is_empty() || quiet_marker.is_some_and(|marker| text.contains(marker)) {
            return;
        }
        match line.stream {
            OutputStream::Stdout => state.info(format!("  {}", text)),
            OutputStream::Stderr => state.warning(format!("  {}", text)),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::bridge::BridgeStatus;
    use crate::services::process::{ProcessRequest, ProcessRunner};
    use crate::state::{LogSeverity, PipelineEvent};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::sync::broadcast;

    /// Bridge-side shell that fails any script containing one of `failing`.
    #[derive(Default)]
    struct ScriptedShell {
        scripts: Mutex<Vec<String>>,
        failing: Vec<&'static str>,
        outputs: Vec<(&'static str, &'static str)>,
    }

    impl ScriptedShell {
        fn failing(failing: Vec<&'static str>) -> Self {
            Self {
                failing,
                ..Self::default()
            }
        }

        fn scripts(&self) -> Vec<String> {
            self.scripts.lock().unwrap().clone()
        }

        fn ran(&self, fragment: &str) -> bool {
            self.scripts().iter().any(|script| script.contains(fragment))
        }
    }

    #[async_trait]
    impl ProcessRunner for ScriptedShell {
        async fn run(
            &self,
            request: ProcessRequest,
            _sink: Option<OutputSink>,
            _cancel: CancellationToken,
        ) -> ToolResult {
            let script = request.args.last().cloned().unwrap_or_default();
            self.scripts.lock().unwrap().push(script.clone());
            if self.failing.iter().any(|fragment| script.contains(fragment)) {
                return ToolResult::from_exit(Some(100), String::new(), "E: failed".to_string());
            }
            let stdout = self
                .outputs
                .iter()
                .find(|(fragment, _)| script.contains(fragment))
                .map(|(_, out)| out.to_string())
                .unwrap_or_default();
            ToolResult::from_exit(Some(0), stdout, String::new())
        }
    }

    fn bridge(shell: Arc<ScriptedShell>) -> BridgeEnvironment {
        let status = BridgeStatus {
            available: true,
            version: "WSL 2".into(),
            default_distro: None,
        };
        BridgeEnvironment::with_status(shell, "wsl", status)
    }

    fn drain(rx: &mut broadcast::Receiver<PipelineEvent>) -> Vec<PipelineEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn logs(events: &[PipelineEvent], wanted: LogSeverity) -> Vec<String> {
        events
            .iter()
            .filter_map(|event| match event {
                PipelineEvent::Log { message, severity } if *severity == wanted => {
                    Some(message.clone())
                }
                _ => None,
            })
            .collect()
    }

    fn last_progress(events: &[PipelineEvent]) -> Option<u8> {
        events.iter().rev().find_map(|event| match event {
            PipelineEvent::SetupProgress { percent } => Some(*percent),
            _ => None,
        })
    }

    async fn install(shell: Arc<ScriptedShell>, target: SetupTarget) -> (SetupOutcome, Vec<PipelineEvent>) {
        let state = StateManager::new();
        let mut rx = state.subscribe();
        let bridge = bridge(shell);
        let cancel = CancellationToken::new();
        let outcome = ToolchainInstaller::new(&bridge, &state, &cancel)
            .install(target, &ToolchainConfig::default())
            .await;
        (outcome, drain(&mut rx))
    }

    #[test]
    fn test_parse_targets() {
        assert_eq!("docker".parse::<SetupTarget>(), Ok(SetupTarget::Docker));
        assert_eq!("OpenROAD".parse::<SetupTarget>(), Ok(SetupTarget::OpenRoad));
        assert_eq!("all".parse::<SetupTarget>(), Ok(SetupTarget::Complete));
        assert_eq!(
            "magic".parse::<SetupTarget>(),
            Err(SetupParseError("magic".to_string()))
        );
        for target in SetupTarget::ALL {
            assert_eq!(target.to_string().parse::<SetupTarget>(), Ok(target));
        }
    }

    #[test]
    fn test_plan_progress_ends_at_100() {
        let config = ToolchainConfig::default();
        for target in SetupTarget::ALL {
            for plan in target.plans(&config) {
                let percents: Vec<_> = plan.steps.iter().map(|step| step.percent).collect();
                assert!(percents.windows(2).all(|w| w[0] <= w[1]), "{}", plan.title);
                assert_eq!(percents.last(), Some(&100), "{}", plan.title);
            }
        }
    }

    #[test]
    fn test_flow_image_uses_configured_image() {
        let mut config = ToolchainConfig::default();
        config.container_image = "efabless/openlane2:2.1".to_string();

        let plans = SetupTarget::FlowImage.plans(&config);
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].steps[0].command, "docker images -q efabless/openlane2");
        assert_eq!(plans[0].steps[1].command, "docker pull 'efabless/openlane2:2.1'");
    }

    #[test]
    fn test_source_builds_land_in_home() {
        let yosys = yosys_source_plan();
        assert!(yosys.steps[1].command.contains(YOSYS_REPO));
        assert!(yosys.steps[2].command.starts_with("cd \"$HOME/yosys\""));

        let openroad = openroad_source_plan();
        assert!(openroad.steps[2].command.contains("$HOME/OpenROAD/build"));
        assert_eq!(openroad.steps[3].quiet_marker, Some("Built target"));
    }

    #[tokio::test]
    async fn test_docker_steps_run_in_order() {
        let shell = Arc::new(ScriptedShell::default());
        let (outcome, events) = install(shell.clone(), SetupTarget::Docker).await;

        assert_eq!(outcome, SetupOutcome::Completed);
        let scripts = shell.scripts();
        let order = ["apt-get update", "docker.io docker-compose", "service docker start", "usermod -aG docker", "docker --version"];
        assert_eq!(scripts.len(), order.len());
        for (script, fragment) in scripts.iter().zip(order) {
            assert!(script.contains(fragment), "{} should contain {}", script, fragment);
        }
        assert_eq!(last_progress(&events), Some(100));
        assert!(logs(&events, LogSeverity::Success).contains(&"Docker installed successfully!".to_string()));
    }

    #[tokio::test]
    async fn test_required_step_failure_stops_plan() {
        let shell = Arc::new(ScriptedShell::failing(vec!["docker.io"]));
        let (outcome, events) = install(shell.clone(), SetupTarget::Docker).await;

        assert!(matches!(outcome, SetupOutcome::Failed { ref reason } if reason.starts_with("Docker installation failed")));
        assert_eq!(shell.scripts().len(), 2);
        assert!(!shell.ran("service docker start"));
        assert_eq!(logs(&events, LogSeverity::Error), vec!["Docker installation failed".to_string()]);
    }

    #[tokio::test]
    async fn test_optional_step_failure_warns_and_continues() {
        let shell = Arc::new(ScriptedShell::failing(vec!["apt-get update"]));
        let (outcome, events) = install(shell.clone(), SetupTarget::Docker).await;

        assert_eq!(outcome, SetupOutcome::Completed);
        assert!(shell.ran("usermod -aG docker"));
        assert!(logs(&events, LogSeverity::Warning)
            .contains(&"Package update had warnings, continuing...".to_string()));
    }

    #[tokio::test]
    async fn test_fallback_installs_to_local_prefix() {
        let shell = Arc::new(ScriptedShell::failing(vec!["sudo -n make install"]));
        let (outcome, events) = install(shell.clone(), SetupTarget::Yosys).await;

        assert_eq!(outcome, SetupOutcome::Completed);
        assert!(shell.ran("make install PREFIX="));
        assert!(logs(&events, LogSeverity::Warning)
            .contains(&"System installation failed, installing to ~/.local/bin".to_string()));
    }

    #[tokio::test]
    async fn test_present_image_is_not_pulled() {
        let shell = Arc::new(ScriptedShell {
            outputs: vec![("docker images -q", "4f1c2a9b\n")],
            ..ScriptedShell::default()
        });
        let (outcome, events) = install(shell.clone(), SetupTarget::OpenRoadImage).await;

        assert_eq!(outcome, SetupOutcome::Completed);
        assert_eq!(shell.scripts().len(), 1);
        assert!(!shell.ran("docker pull"));
        assert_eq!(last_progress(&events), Some(100));
    }

    #[tokio::test]
    async fn test_complete_setup_stops_when_yosys_fails() {
        let shell = Arc::new(ScriptedShell::failing(vec!["git clone --recurse-submodules"]));
        let (outcome, events) = install(shell.clone(), SetupTarget::Complete).await;

        assert!(matches!(outcome, SetupOutcome::Failed { .. }));
        assert!(!shell.ran("OpenROAD"));
        assert_eq!(
            logs(&events, LogSeverity::Error),
            vec![
                "Failed to clone Yosys repository".to_string(),
                "Yosys installation failed".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_complete_setup_builds_both_tools() {
        let shell = Arc::new(ScriptedShell::default());
        let (outcome, events) = install(shell.clone(), SetupTarget::Complete).await;

        assert_eq!(outcome, SetupOutcome::Completed);
        assert!(shell.ran("YosysHQ/yosys.git"));
        assert!(shell.ran("OpenROAD.git"));
        let percents: Vec<_> = events
            .iter()
            .filter_map(|event| match event {
                PipelineEvent::SetupProgress { percent } => Some(*percent),
                _ => None,
            })
            .collect();
        assert!(percents.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(percents.last(), Some(&100));
    }

    #[tokio::test]
    async fn test_unavailable_bridge_runs_nothing() {
        let shell = Arc::new(ScriptedShell::default());
        let bridge = BridgeEnvironment::unavailable(shell.clone());
        let state = StateManager::new();
        let cancel = CancellationToken::new();

        let outcome = ToolchainInstaller::new(&bridge, &state, &cancel)
            .install(SetupTarget::Docker, &ToolchainConfig::default())
            .await;

        assert!(matches!(outcome, SetupOutcome::Failed { .. }));
        assert!(shell.scripts().is_empty());
        let check = check_bridge_installation(&bridge).await;
        assert_eq!(check.command.is_some(), cfg!(windows));
    }

    #[tokio::test]
    async fn test_cancelled_before_start_runs_nothing() {
        let shell = Arc::new(ScriptedShell::default());
        let bridge = bridge(shell.clone());
        let state = StateManager::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = ToolchainInstaller::new(&bridge, &state, &cancel)
            .install(SetupTarget::Yosys, &ToolchainConfig::default())
            .await;

        assert_eq!(outcome, SetupOutcome::Cancelled);
        assert!(shell.scripts().is_empty());
    }

    #[tokio::test]
    async fn test_available_bridge_needs_no_install() {
        let check = check_bridge_installation(&bridge(Arc::new(ScriptedShell::default()))).await;
        assert!(!check.can_install);
        assert_eq!(check.command, None);
    }
}
