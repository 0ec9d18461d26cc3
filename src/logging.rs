use anyhow::{Context, Result};
use camino::Utf8Path;
use std::fs;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

/// Directory log files go to when the caller has no preference.
pub const DEFAULT_LOG_DIR: &str = "logs";

/// File name prefix of the daily log files (`kairos.YYYY-MM-DD`).
pub const DEFAULT_LOG_PREFIX: &str = "kairos";

/// Setup logging with a daily rotating file appender.
///
/// `RUST_LOG` takes precedence over `debug_mode` when it is set.
///
/// # Returns
/// A guard that must be held for the duration of the program to keep logging active
pub fn setup_logging(log_dir: &str, log_prefix: &str, debug_mode: bool) -> Result<WorkerGuard> {
    setup_logging_with_console(log_dir, log_prefix, debug_mode, false)
}

/// Setup logging with optional console output.
///
/// The CLI turns the console layer on; pipeline events are printed separately, so the
/// console layer stays quiet below `warn` unless debugging.
pub fn setup_logging_with_console(
    log_dir: &str,
    log_prefix: &str,
    debug_mode: bool,
    console_output: bool,
) -> Result<WorkerGuard> {
    let (non_blocking, guard) = file_writer(log_dir, log_prefix)?;

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false) // No ANSI codes in log files
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    if console_output {
        let console_layer = tracing_subscriber::fmt::layer()
            .with_ansi(true)
            .with_target(false)
            .with_writer(std::io::stderr)
            .with_filter(console_filter(debug_mode));

        tracing_subscriber::registry()
            .with(env_filter(debug_mode))
            .with(file_layer)
            .with(console_layer)
            .try_init()
            .context("Failed to install tracing subscriber")?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter(debug_mode))
            .with(file_layer)
            .try_init()
            .context("Failed to install tracing subscriber")?;
    }

    tracing::info!(
        "Logging initialized: dir={}, prefix={}, debug={}, console={}",
        log_dir,
        log_prefix,
        debug_mode,
        console_output
    );

    Ok(guard)
}

fn file_writer(log_dir: &str, log_prefix: &str) -> Result<(NonBlocking, WorkerGuard)> {
    ensure_log_dir(Utf8Path::new(log_dir))?;
    let file_appender = rolling::daily(log_dir, log_prefix);
    Ok(tracing_appender::non_blocking(file_appender))
}

fn ensure_log_dir(log_dir: &Utf8Path) -> Result<()> {
    if !log_dir.exists() {
        fs::create_dir_all(log_dir)
            .with_context(|| format!("Failed to create log directory: {}", log_dir))?;
    }
    Ok(())
}

fn env_filter(debug_mode: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if debug_mode {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    })
}

fn console_filter(debug_mode: bool) -> EnvFilter {
    if debug_mode {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    }
}
