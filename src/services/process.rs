use crate::models::{OutputLine, OutputStream, ToolFailure, ToolResult};
use async_trait::async_trait;
use camino::Utf8PathBuf;
use std::fmt;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Per-invocation receiver for streamed output lines.
pub type OutputSink = Arc<dyn Fn(OutputLine) + Send + Sync>;

/// One external program to start: executable, argument vector and working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRequest {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<Utf8PathBuf>,
}

impl ProcessRequest {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

impl fmt::Display for ProcessRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Starts external programs and reports how they finished.
///
/// Implementations never return an error: spawn failures, non-zero exits and cancellation
/// are all carried inside the returned [`ToolResult`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(
        &self,
        request: ProcessRequest,
        sink: Option<OutputSink>,
        cancel: CancellationToken,
    ) -> ToolResult;
}

/// [`ProcessRunner`] backed by real operating-system processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcessRunner;

impl SystemProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProcessRunner for SystemProcessRunner {
    async fn run(
        &self,
        request: ProcessRequest,
        sink: Option<OutputSink>,
        cancel: CancellationToken,
    ) -> ToolResult {
        if cancel.is_cancelled() {
            return ToolResult::failed(ToolFailure::Cancelled);
        }

        tracing::debug!("Executing: {}", request);
        let start = Instant::now();

        let mut command = Command::new(&request.program);
        command
            .args(&request.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &request.working_dir {
            command.current_dir(dir);
        }
        // Own process group so cancellation can take down everything the tool started
        #[cfg(unix)]
        command.process_group(0);
        #[cfg(windows)]
        command.creation_flags(CREATE_NO_WINDOW);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!("Failed to start {}: {}", request.program, e);
                return ToolResult::failed(ToolFailure::SpawnFailure {
                    program: request.program,
                    reason: e.to_string(),
                });
            }
        };

        let pid = child.id();
        let mut stdout_reader =
            spawn_line_reader(child.stdout.take(), OutputStream::Stdout, sink.clone());
        let mut stderr_reader = spawn_line_reader(child.stderr.take(), OutputStream::Stderr, sink);

        let status = tokio::select! {
            status = child.wait() => Some(status),
            _ = cancel.cancelled() => None,
        };

        let Some(status) = status else {
            if let Some(pid) = pid {
                kill_process_tree(pid).await;
            }
            if let Err(e) = child.start_kill() {
                tracing::debug!("start_kill after tree kill: {}", e);
            }
            let _ = child.wait().await;
            stdout_reader.abort();
            stderr_reader.abort();
            tracing::warn!("Cancelled: {}", request.program);
            return ToolResult::failed(ToolFailure::Cancelled);
        };

        // A background grandchild can hold the pipes open after the direct child exits
        let outputs = tokio::select! {
            outputs = async { tokio::join!(&mut stdout_reader, &mut stderr_reader) } => Some(outputs),
            _ = cancel.cancelled() => None,
        };
        let Some((stdout, stderr)) = outputs else {
            if let Some(pid) = pid {
                kill_process_tree(pid).await;
            }
            stdout_reader.abort();
            stderr_reader.abort();
            tracing::warn!("Cancelled while draining output: {}", request.program);
            return ToolResult::failed(ToolFailure::Cancelled);
        };
        let stdout = stdout.unwrap_or_default();
        let stderr = stderr.unwrap_or_default();

        match status {
            Ok(status) => {
                let exit_code = status.code();
                tracing::debug!(
                    "{} completed in {:.2}s with exit code {:?}",
                    request.program,
                    start.elapsed().as_secs_f32(),
                    exit_code
                );
                ToolResult::from_exit(exit_code, stdout, stderr)
            }
            Err(e) => ToolResult::failed(ToolFailure::SpawnFailure {
                program: request.program,
                reason: format!("failed to wait for process: {}", e),
            }),
        }
    }
}

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Read a pipe to the end, forwarding each line to the sink as it arrives.
fn spawn_line_reader<R>(
    pipe: Option<R>,
    stream: OutputStream,
    sink: Option<OutputSink>,
) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut collected = String::new();
        let Some(pipe) = pipe else {
            return collected;
        };
        let mut reader = BufReader::new(pipe);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&buf)
                        .trim_end_matches(['\r', '\n'])
                        .to_string();
                    collected.push_str(&text);
                    collected.push('\n');
                    if let Some(sink) = &sink {
                        sink(OutputLine { stream, text });
                    }
                }
                Err(e) => {
                    tracing::debug!("Stopped reading {:?}: {}", stream, e);
                    break;
                }
            }
        }
        collected
    })
}

async fn kill_process_tree(pid: u32) {
    #[cfg(unix)]
    let mut killer = {
        let mut c = Command::new("kill");
        c.args(["-s", "KILL", "--", &format!("-{}", pid)]);
        c
    };
    #[cfg(windows)]
    let mut killer = {
        let mut c = Command::new("taskkill");
        c.args(["/T", "/F", "/PID", &pid.to_string()]);
        c.creation_flags(CREATE_NO_WINDOW);
        c
    };

    match killer
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
    {
        Ok(status) if !status.success() => {
            tracing::debug!("Process tree kill for {} exited with {}", pid, status)
        }
        Ok(_) => {}
        Err(e) => tracing::debug!("Failed to kill process tree {}: {}", pid, e),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    #[tokio::test]
    async fn test_captures_both_streams() {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let seen = lines.clone();
        let sink: OutputSink = Arc::new(move |line: OutputLine| seen.lock().unwrap().push(line));

        let request = ProcessRequest::new("sh").args(["-c", "echo out1; echo err1 >&2; echo out2"]);
        let result = SystemProcessRunner::new()
            .run(request, Some(sink), CancellationToken::new())
            .await;

        assert!(result.success);
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.stdout, "out1\nout2\n");
        assert_eq!(result.stderr, "err1\n");

        let lines = lines.lock().unwrap();
        assert_eq!(lines.len(), 3);
        assert!(lines.contains(&OutputLine {
            stream: OutputStream::Stderr,
            text: "err1".into()
        }));
    }

    #[tokio::test]
    async fn test_non_zero_exit_uses_stderr() {
        let request = ProcessRequest::new("sh").args(["-c", "echo broken >&2; exit 3"]);
        let result = SystemProcessRunner::new()
            .run(request, None, CancellationToken::new())
            .await;

        assert!(!result.success);
        assert_eq!(result.exit_code, Some(3));
        assert_eq!(result.error_message(), "broken");
    }

    #[tokio::test]
    async fn test_spawn_failure_is_a_result() {
        let request = ProcessRequest::new("definitely-not-a-real-eda-tool-xyz");
        let result = SystemProcessRunner::new()
            .run(request, None, CancellationToken::new())
            .await;

        assert!(!result.success);
        assert_eq!(result.exit_code, None);
        assert!(matches!(result.failure, Some(ToolFailure::SpawnFailure { .. })));
    }

    #[tokio::test]
    async fn test_working_dir_is_applied() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::try_from(dir.path().canonicalize().unwrap()).unwrap();
        let request = ProcessRequest::new("pwd").current_dir(path.clone());
        let result = SystemProcessRunner::new()
            .run(request, None, CancellationToken::new())
            .await;

        assert_eq!(result.stdout.trim(), path.as_str());
    }

    #[tokio::test]
    async fn test_cancel_kills_process_tree() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let request = ProcessRequest::new("sh").args(["-c", "sleep 30 & sleep 30; wait"]);
        let result = tokio::time::timeout(
            Duration::from_secs(10),
            SystemProcessRunner::new().run(request, None, cancel),
        )
        .await
        .expect("cancelled process should not hang");

        assert!(!result.success);
        assert!(result.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_reaches_background_child_holding_pipes() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let request = ProcessRequest::new("sh").args(["-c", "sleep 8 & echo started"]);
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            SystemProcessRunner::new().run(request, None, cancel),
        )
        .await
        .expect("background child kept the run alive");

        assert!(result.is_cancelled());
        assert!(!result.success);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_already_cancelled_never_spawns() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = SystemProcessRunner::new()
            .run(ProcessRequest::new("definitely-not-a-real-eda-tool-xyz"), None, cancel)
            .await;
        assert!(result.is_cancelled());
    }
}
