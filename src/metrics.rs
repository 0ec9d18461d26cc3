// Pipeline metrics module
//
// Lightweight counters for stage outcomes, process launches and tool time

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Pipeline run metrics
///
/// Uses atomic operations for thread-safe tracking without locks. Collected over the
/// lifetime of a [`StagePipeline`](crate::pipeline::StagePipeline) and logged on shutdown.
#[derive(Debug)]
pub struct Metrics {
    pub stages_completed: AtomicUsize,

    pub stages_failed: AtomicUsize,

    pub stages_cancelled: AtomicUsize,

    /// Complete flows started
    pub flows_run: AtomicUsize,

    /// External tool processes launched by stages
    pub process_invocations: AtomicU64,

    pub detection_passes: AtomicU64,

    /// Wall-clock time spent inside tool processes, in milliseconds
    pub total_tool_time_ms: AtomicU64,

    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            stages_completed: AtomicUsize::new(0),
            stages_failed: AtomicUsize::new(0),
            stages_cancelled: AtomicUsize::new(0),
            flows_run: AtomicUsize::new(0),
            process_invocations: AtomicU64::new(0),
            detection_passes: AtomicU64::new(0),
            total_tool_time_ms: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn record_stage_completed(&self) {
        self.stages_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stage_failed(&self) {
        self.stages_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stage_cancelled(&self) {
        self.stages_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flow(&self) {
        self.flows_run.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_detection(&self) {
        self.detection_passes.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one tool process and how long it ran
    pub fn record_process(&self, duration: Duration) {
        self.process_invocations.fetch_add(1, Ordering::Relaxed);
        self.total_tool_time_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Average tool process time in milliseconds
    pub fn avg_tool_time_ms(&self) -> f64 {
        let total = self.total_tool_time_ms.load(Ordering::Relaxed);
        let count = self.process_invocations.load(Ordering::Relaxed);
        if count > 0 {
            total as f64 / count as f64
        } else {
            0.0
        }
    }

    pub fn log_summary(&self) {
        let uptime = self.uptime();
        tracing::info!("=== Pipeline Metrics Summary ===");
        tracing::info!("Uptime: {:.2}s", uptime.as_secs_f64());
        tracing::info!(
            "Stages: {} completed, {} failed, {} cancelled ({} complete flows)",
            self.stages_completed.load(Ordering::Relaxed),
            self.stages_failed.load(Ordering::Relaxed),
            self.stages_cancelled.load(Ordering::Relaxed),
            self.flows_run.load(Ordering::Relaxed)
        );
        tracing::info!(
            "Tool processes: {} (total {:.2}s, avg {:.2}ms)",
            self.process_invocations.load(Ordering::Relaxed),
            self.total_tool_time_ms.load(Ordering::Relaxed) as f64 / 1000.0,
            self.avg_tool_time_ms()
        );
        tracing::info!(
            "Detection passes: {}",
            self.detection_passes.load(Ordering::Relaxed)
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new();
        assert_eq!(metrics.stages_completed.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.process_invocations.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_record_stage_outcomes() {
        let metrics = Metrics::new();

        metrics.record_stage_completed();
        metrics.record_stage_completed();
        metrics.record_stage_failed();
        metrics.record_stage_cancelled();
        metrics.record_flow();

        assert_eq!(metrics.stages_completed.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.stages_failed.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.stages_cancelled.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.flows_run.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_record_process_time() {
        let metrics = Metrics::new();

        metrics.record_process(Duration::from_millis(100));
        metrics.record_process(Duration::from_millis(200));

        assert_eq!(metrics.process_invocations.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.total_tool_time_ms.load(Ordering::Relaxed), 300);
        assert_eq!(metrics.avg_tool_time_ms(), 150.0);
    }

    #[test]
    fn test_avg_tool_time_without_processes() {
        assert_eq!(Metrics::new().avg_tool_time_ms(), 0.0);
    }

    #[test]
    fn test_uptime() {
        let metrics = Metrics::new();
        thread::sleep(Duration::from_millis(10));
        assert!(metrics.uptime().as_millis() >= 10);
    }
}
