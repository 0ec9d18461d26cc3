use crate::models::{ToolFailure, ToolResult};
use crate::services::process::{OutputSink, ProcessRequest, ProcessRunner};
use camino::Utf8Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

/// What the launcher reported about the bridge environment.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BridgeStatus {
    pub available: bool,
    /// e.g. "WSL 2"
    pub version: String,
    pub default_distro: Option<String>,
}

impl BridgeStatus {
    pub fn unavailable() -> Self {
        Self::default()
    }
}

/// Quote a value for interpolation into a bridge-side `bash -c` script.
pub fn quote(value: &str) -> String {
    shell_escape::unix::escape(value.into()).into_owned()
}

/// Translate a host path into the bridge convention (`C:\x\y` becomes `/mnt/c/x/y`).
///
/// Paths without a drive letter only have their separators normalized.
pub fn host_to_bridge_path(host_path: &str) -> String {
    let path = host_path.replace('\\', "/");
    let bytes = path.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        let drive = (bytes[0] as char).to_ascii_lowercase();
        return format!("/mnt/{}{}", drive, &path[2..]);
    }
    path
}

/// Translate a bridge path back to the host convention (`/mnt/c/x/y` becomes `C:\x\y`).
///
/// Anything outside a `/mnt/<drive>` mount is returned unchanged.
pub fn bridge_to_host_path(bridge_path: &str) -> String {
    let Some(rest) = bridge_path.strip_prefix("/mnt/") else {
        return bridge_path.to_string();
    };
    let mut chars = rest.chars();
    match (chars.next(), chars.next()) {
        (Some(drive), None) if drive.is_ascii_alphabetic() => {
            format!("{}:", drive.to_ascii_uppercase())
        }
        (Some(drive), Some('/')) if drive.is_ascii_alphabetic() => {
            format!("{}:{}", drive.to_ascii_uppercase(), rest[1..].replace('/', "\\"))
        }
        _ => bridge_path.to_string(),
    }
}

/// A POSIX environment reachable only through a launcher program (`wsl` by default).
///
/// The launcher is probed at most once per instance. When the bridge is unavailable every
/// operation answers immediately without spawning anything.
pub struct BridgeEnvironment {
    runner: Arc<dyn ProcessRunner>,
    launcher: String,
    status: OnceCell<BridgeStatus>,
    /// Sequence for per-run pid files of tracked tool runs
    tool_runs: AtomicU64,
}

impl BridgeEnvironment {
    pub fn new(runner: Arc<dyn ProcessRunner>, launcher: impl Into<String>) -> Self {
        Self {
            runner,
            launcher: launcher.into(),
            status: OnceCell::new(),
            tool_runs: AtomicU64::new(0),
        }
    }

    /// Use an already known status instead of probing the launcher.
    pub fn with_status(
        runner: Arc<dyn ProcessRunner>,
        launcher: impl Into<String>,
        status: BridgeStatus,
    ) -> Self {
        Self {
            runner,
            launcher: launcher.into(),
            status: OnceCell::new_with(Some(status)),
            tool_runs: AtomicU64::new(0),
        }
    }

    pub fn unavailable(runner: Arc<dyn ProcessRunner>) -> Self {
        Self::with_status(runner, "wsl", BridgeStatus::unavailable())
    }

    pub fn launcher(&self) -> &str {
        &self.launcher
    }

    pub async fn status(&self) -> &BridgeStatus {
        self.status.get_or_init(|| self.probe()).await
    }

    pub async fn is_available(&self) -> bool {
        self.status().await.available
    }

    async fn probe(&self) -> BridgeStatus {
        let status_result = self
            .runner
            .run(
                ProcessRequest::new(&self.launcher).arg("--status"),
                None,
                CancellationToken::new(),
            )
            .await;
        if !status_result.success {
            tracing::info!("Bridge environment not available ({} --status failed)", self.launcher);
            return BridgeStatus::unavailable();
        }

        let version = parse_bridge_version(&strip_nul(&status_result.stdout));

        let list_result = self
            .runner
            .run(
                ProcessRequest::new(&self.launcher).args(["--list", "--quiet"]),
                None,
                CancellationToken::new(),
            )
            .await;
        let default_distro = list_result
            .success
            .then(|| {
                strip_nul(&list_result.stdout)
                    .lines()
                    .map(str::trim)
                    .find(|line| !line.is_empty())
                    .map(str::to_string)
            })
            .flatten();

        tracing::info!(
            "Bridge environment available: {} (default distribution: {})",
            version,
            default_distro.as_deref().unwrap_or("none")
        );

        BridgeStatus {
            available: true,
            version,
            default_distro,
        }
    }

    /// Run a shell command inside the bridge, optionally from a host working directory.
    pub async fn run(
        &self,
        command: &str,
        working_dir: Option<&Utf8Path>,
        sink: Option<OutputSink>,
        cancel: CancellationToken,
    ) -> ToolResult {
        let status = self.status().await;
        if !status.available {
            return ToolResult::failed(ToolFailure::BridgeUnavailable);
        }

        let script = in_dir(command, working_dir);

        let mut request = ProcessRequest::new(&self.launcher);
        if let Some(distro) = &status.default_distro {
            request = request.args(["-d", distro.as_str()]);
        }
        request = request.args(["--", "bash", "-c"]).arg(script);

        self.runner.run(request, sink, cancel).await
    }

    /// Run a tool inside the bridge in a session of its own.
    ///
    /// The launcher is the only process the host can kill, and killing it does not reach
    /// the bridge side. The session leader writes its pid to a file, and cancellation sends
    /// a second bridge command that kills the whole session.
    pub async fn run_tool(
        &self,
        command: &str,
        working_dir: Option<&Utf8Path>,
        sink: Option<OutputSink>,
        cancel: CancellationToken,
    ) -> ToolResult {
        let pid_file = format!(
            "/tmp/kairos-{}-{}.pid",
            std::process::id(),
            self.tool_runs.fetch_add(1, Ordering::Relaxed)
        );
        let tracked = format!(
            "echo $$ > {pid}; trap 'rm -f {pid}' EXIT; {body}",
            pid = pid_file,
            body = in_dir(command, working_dir)
        );
        let script = format!("setsid -w bash -c {}", quote(&tracked));

        let result = self.run(&script, None, sink, cancel).await;
        if result.is_cancelled() {
            self.kill_session(&pid_file).await;
        }
        result
    }

    async fn kill_session(&self, pid_file: &str) {
        let result = self
            .run_quiet(&format!(
                "kill -s KILL -- -\"$(cat {pid})\" 2>/dev/null; rm -f {pid}",
                pid = pid_file
            ))
            .await;
        if !result.success {
            tracing::debug!("Bridge session kill via {} failed: {}", pid_file, result.error_message());
        }
    }

    /// Run a short query command with no working directory or output sink.
    pub async fn run_quiet(&self, command: &str) -> ToolResult {
        self.run(command, None, None, CancellationToken::new()).await
    }

    /// Resolved location of a command on the bridge PATH.
    pub async fn command_path(&self, name: &str) -> Option<String> {
        let result = self.run_quiet(&format!("command -v {}", quote(name))).await;
        if !result.success {
            return None;
        }
        result
            .stdout
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string)
    }

    pub async fn command_exists(&self, name: &str) -> bool {
        self.command_path(name).await.is_some()
    }

    pub async fn image_exists(&self, image: &str) -> bool {
        let result = self.run_quiet(&format!("docker images -q {}", quote(image))).await;
        result.success && !result.stdout.trim().is_empty()
    }

    /// First line of `<command> <flag>` output, or empty when the command fails.
    pub async fn version(&self, command: &str, flag: &str) -> String {
        let result = self
            .run_quiet(&format!("{} {}", quote(command), quote(flag)))
            .await;
        if !result.success {
            return String::new();
        }
        result.first_line().unwrap_or_default().to_string()
    }

    pub async fn home_dir(&self) -> Option<String> {
        let result = self.run_quiet("printf '%s' \"$HOME\"").await;
        let home = result.stdout.trim();
        (result.success && !home.is_empty()).then(|| home.to_string())
    }

    pub async fn file_exists(&self, path: &str) -> bool {
        self.run_quiet(&format!("test -f {}", quote(path))).await.success
    }
}

/// Prefix `command` with a `cd` into the bridge form of `working_dir`.
fn in_dir(command: &str, working_dir: Option<&Utf8Path>) -> String {
    match working_dir {
        Some(dir) => format!(
            "cd {} && {}",
            quote(&host_to_bridge_path(dir.as_str())),
            command
        ),
        None => command.to_string(),
    }
}

fn strip_nul(text: &str) -> String {
    text.replace('\0', "")
}

fn parse_bridge_version(status_output: &str) -> String {
    status_output
        .lines()
        .find_map(|line| {
            let (_, value) = line.split_once("Default Version:")?;
            let value = value.trim();
            (!value.is_empty()).then(|| format!("WSL {}", value))
        })
        .unwrap_or_else(|| "WSL".to_string())
}
