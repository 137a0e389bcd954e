//! Integration tests for the status tracker.

use dispatchq::{CallError, StatusSnapshot, StatusTracker};
use std::sync::Arc;
use std::time::Duration;

#[test]
fn starts_at_zero() {
    let tracker = StatusTracker::new();
    let snap = tracker.snapshot();
    assert_eq!(snap, StatusSnapshot::default());
    assert!(snap.is_settled());
}

#[test]
fn success_path_moves_task_out_of_progress() {
    let tracker = StatusTracker::new();
    tracker.task_started();

    let running = tracker.snapshot();
    assert_eq!(running.num_tasks_started, 1);
    assert_eq!(running.num_tasks_in_progress, 1);
    assert!(!running.is_settled());

    tracker.task_succeeded();
    let done = tracker.snapshot();
    assert_eq!(done.num_tasks_in_progress, 0);
    assert_eq!(done.num_tasks_succeeded, 1);
    assert!(done.is_settled());
}

#[test]
fn errors_are_counted_by_category() {
    let tracker = StatusTracker::new();
    tracker.record_error(&CallError::RateLimited("429".into()));
    tracker.record_error(&CallError::TransientApi("503".into()));
    tracker.record_error(&CallError::Timeout(Duration::from_secs(1)));
    tracker.record_error(&CallError::Other("bad request".into()));
    tracker.record_error(&CallError::Cancelled);

    let snap = tracker.snapshot();
    assert_eq!(snap.num_rate_limit_errors, 1);
    assert_eq!(snap.num_api_errors, 2);
    assert_eq!(snap.num_other_errors, 2);
}

#[test]
fn rejected_task_counts_as_started_and_failed() {
    let tracker = StatusTracker::new();
    tracker.task_rejected(&CallError::QuotaExceeded {
        estimated: 500,
        limit: 100,
    });

    let snap = tracker.snapshot();
    assert_eq!(snap.num_tasks_started, 1);
    assert_eq!(snap.num_tasks_failed, 1);
    assert_eq!(snap.num_other_errors, 1);
    assert!(snap.is_settled());
}

#[test]
fn concurrent_updates_are_not_lost() {
    let tracker = Arc::new(StatusTracker::new());

    let threads: Vec<_> = (0..8)
        .map(|i| {
            let tracker = Arc::clone(&tracker);
            std::thread::spawn(move || {
                for _ in 0..500 {
                    tracker.task_started();
                    if i % 2 == 0 {
                        tracker.task_succeeded();
                    } else {
                        tracker.record_error(&CallError::TransientApi("flaky".into()));
                        tracker.task_failed();
                    }
                    let snap = tracker.snapshot();
                    assert!(
                        snap.num_tasks_started
                            >= snap.num_tasks_in_progress + snap.num_tasks_settled()
                    );
                }
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }

    let snap = tracker.snapshot();
    assert_eq!(snap.num_tasks_started, 4_000);
    assert_eq!(snap.num_tasks_succeeded, 2_000);
    assert_eq!(snap.num_tasks_failed, 2_000);
    assert_eq!(snap.num_api_errors, 2_000);
    assert!(snap.is_settled());
}

#[test]
fn snapshot_serializes_with_counter_names() {
    let tracker = StatusTracker::new();
    tracker.task_started();
    let json = serde_json::to_value(tracker.snapshot()).unwrap();
    assert_eq!(json["num_tasks_started"], 1);
    assert_eq!(json["num_tasks_in_progress"], 1);
    assert_eq!(json["num_other_errors"], 0);
}
