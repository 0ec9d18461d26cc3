//! Integration tests for StateManager run state and pipeline events
//!
//! These tests verify that the StateManager correctly:
//! - Enforces single-flight across threads
//! - Delivers events to multiple subscribers
//! - Returns to Idle on every exit path

use kairos_eda::state::{LogSeverity, PipelineEvent, RunKind, RunState, StateManager};
use kairos_eda::StageKind;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use tokio::time::{Duration, timeout};

#[tokio::test]
async fn test_multiple_subscribers_receive_events() {
    let state = StateManager::new();
    let mut rx1 = state.subscribe();
    let mut rx2 = state.subscribe();

    state.progress(StageKind::Routing, 60);

    for rx in [&mut rx1, &mut rx2] {
        let event = timeout(Duration::from_millis(100), rx.recv())
            .await
            .expect("Timeout waiting for event")
            .expect("Channel closed");
        assert_eq!(
            event,
            PipelineEvent::Progress {
                stage: StageKind::Routing,
                percent: 60
            }
        );
    }
}

#[tokio::test]
async fn test_events_arrive_in_emission_order() {
    let state = StateManager::new();
    let mut rx = state.subscribe();

    state.success("Routing completed successfully!");
    state.progress(StageKind::Routing, 100);
    state.stage_completed(StageKind::Routing, "Status", "Complete", "✓ Pass");

    let first = rx.recv().await.unwrap();
    let second = rx.recv().await.unwrap();
    let third = rx.recv().await.unwrap();

    assert!(matches!(
        first,
        PipelineEvent::Log {
            severity: LogSeverity::Success,
            ..
        }
    ));
    assert!(matches!(second, PipelineEvent::Progress { percent: 100, .. }));
    assert_eq!(
        third,
        PipelineEvent::StageCompleted {
            stage: StageKind::Routing,
            metric: "Status".to_string(),
            value: "Complete".to_string(),
            status: "✓ Pass".to_string(),
        }
    );
}

#[test]
fn test_emit_without_subscribers_is_fine() {
    let state = StateManager::new();
    state.info("nobody is listening");
    state.error("still fine");
    assert_eq!(state.run_state(), RunState::Idle);
}

#[test]
fn test_single_flight_across_threads() {
    let state = Arc::new(StateManager::new());
    let winners = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(std::sync::Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let state = Arc::clone(&state);
            let winners = Arc::clone(&winners);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let guard = state.try_begin(RunKind::CompleteFlow);
                if guard.is_some() {
                    winners.fetch_add(1, Ordering::SeqCst);
                }
                // Hold the guard until every thread has tried
                barrier.wait();
                drop(guard);
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(winners.load(Ordering::SeqCst), 1);
    assert_eq!(state.run_state(), RunState::Idle);
}

#[tokio::test]
async fn test_cancel_reaches_running_task() {
    let state = StateManager::new();
    let guard = state.try_begin(RunKind::Stage(StageKind::Placement)).unwrap();
    let token = guard.token().clone();

    let task = tokio::spawn(async move {
        token.cancelled().await;
        drop(guard);
    });

    assert!(state.cancel_active());
    timeout(Duration::from_secs(1), task)
        .await
        .expect("task did not observe cancellation")
        .unwrap();
    assert_eq!(state.run_state(), RunState::Idle);
    assert!(!state.cancel_active());
}
