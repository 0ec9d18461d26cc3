// State management module
//
// This module provides the StateManager which owns the pipeline's single-flight run state
// behind a mutex and broadcasts pipeline events to any number of observers.

use crate::models::StageKind;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Buffered events per subscriber before slow receivers start lagging.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// How a log line should be presented.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogSeverity {
    Info,
    Success,
    /// Stage banner, e.g. "=== Starting placement stage ==="
    Stage,
    Warning,
    Error,
}

impl fmt::Display for LogSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LogSeverity::Info => "INFO",
            LogSeverity::Success => "SUCCESS",
            LogSeverity::Stage => "STAGE",
            LogSeverity::Warning => "WARNING",
            LogSeverity::Error => "ERROR",
        };
        f.write_str(label)
    }
}

/// Events emitted while stages run
///
/// A front end consumes log lines, per-stage progress and stage result records, plus
/// overall progress while the toolchain is being set up.
#[derive(Clone, Debug, PartialEq)]
pub enum PipelineEvent {
    Log {
        message: String,
        severity: LogSeverity,
    },

    /// Percent is 0 to 100
    Progress { stage: StageKind, percent: u8 },

    StageCompleted {
        stage: StageKind,
        metric: String,
        value: String,
        status: String,
    },

    /// Toolchain setup progress, 0 to 100
    SetupProgress { percent: u8 },
}

/// What the pipeline is currently doing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunKind {
    Stage(StageKind),
    CompleteFlow,
    Setup,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RunState {
    #[default]
    Idle,
    Running(RunKind),
}

#[derive(Default)]
struct RunSlot {
    state: RunState,
    cancel: Option<CancellationToken>,
}

/// Thread-safe run state with event emission
///
/// - The Idle/Running check-then-set happens under one mutex acquisition
/// - A [`RunGuard`] returns the state to Idle when dropped, on every exit path
/// - Events fan out through a tokio broadcast channel; sends without subscribers are fine
#[derive(Clone)]
pub struct StateManager {
    slot: Arc<Mutex<RunSlot>>,
    event_tx: broadcast::Sender<PipelineEvent>,
}

impl StateManager {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            slot: Arc::new(Mutex::new(RunSlot::default())),
            event_tx,
        }
    }

    /// Subscribe to pipeline events
    ///
    /// Returns a receiver that will get all future events. Multiple subscribers can
    /// listen simultaneously.
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.event_tx.subscribe()
    }

    pub fn run_state(&self) -> RunState {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .state
    }

    pub fn is_running(&self) -> bool {
        self.run_state() != RunState::Idle
    }

    /// Enter Running with a fresh cancellation token, unless something is already running.
    pub fn try_begin(&self, kind: RunKind) -> Option<RunGuard> {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.state != RunState::Idle {
            return None;
        }
        let token = CancellationToken::new();
        slot.state = RunState::Running(kind);
        slot.cancel = Some(token.clone());
        tracing::debug!("Run state -> Running({:?})", kind);
        Some(RunGuard {
            slot: Arc::clone(&self.slot),
            token,
        })
    }

    /// Cancel the active run's token. Returns false when nothing was running.
    pub fn cancel_active(&self) -> bool {
        let slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        match &slot.cancel {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn emit(&self, event: PipelineEvent) {
        // Ignore send errors - it's OK if no one is listening
        let _ = self.event_tx.send(event);
    }

    /// Emit a log event and mirror it to tracing at the matching level.
    pub fn log(&self, message: impl Into<String>, severity: LogSeverity) {
        let message = message.into();
        match severity {
            LogSeverity::Info | LogSeverity::Success | LogSeverity::Stage => {
                tracing::info!("{}", message)
            }
            LogSeverity::Warning => tracing::warn!("{}", message),
            LogSeverity::Error => tracing::error!("{}", message),
        }
        self.emit(PipelineEvent::Log { message, severity });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(message, LogSeverity::Info);
    }

    pub fn success(&self, message: impl Into<String>) {
        self.log(message, LogSeverity::Success);
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.log(message, LogSeverity::Warning);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(message, LogSeverity::Error);
    }

    pub fn progress(&self, stage: StageKind, percent: u8) {
        self.emit(PipelineEvent::Progress {
            stage,
            percent: percent.min(100),
        });
    }

    pub fn setup_progress(&self, percent: u8) {
        self.emit(PipelineEvent::SetupProgress {
            percent: percent.min(100),
        });
    }

    pub fn stage_completed(
        &self,
        stage: StageKind,
        metric: impl Into<String>,
        value: impl Into<String>,
        status: impl Into<String>,
    ) {
        let (metric, value, status) = (metric.into(), value.into(), status.into());
        tracing::info!("{} {}: {} ({})", stage, metric, value, status);
        self.emit(PipelineEvent::StageCompleted {
            stage,
            metric,
            value,
            status,
        });
    }
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Proof of holding the Running state. Dropping it returns the pipeline to Idle.
pub struct RunGuard {
    slot: Arc<Mutex<RunSlot>>,
    token: CancellationToken,
}

impl RunGuard {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        slot.state = RunState::Idle;
        slot.cancel = None;
        tracing::debug!("Run state -> Idle");
    }
}
