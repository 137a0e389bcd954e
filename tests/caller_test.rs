//! Integration tests for the retrying caller.

mod common;

use common::ScriptedItem;
use dispatchq::{CallError, RetryPolicy, RetryingCaller, StatusTracker, WorkId};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::time::Instant;

fn policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        jitter: false,
        ..RetryPolicy::default()
    }
}

fn caller(policy: RetryPolicy) -> (RetryingCaller, Arc<StatusTracker>) {
    let tracker = Arc::new(StatusTracker::new());
    (RetryingCaller::new(policy, Arc::clone(&tracker)), tracker)
}

#[tokio::test(start_paused = true)]
async fn transient_failures_are_retried_until_success() {
    let (caller, tracker) = caller(policy(3));
    let item = ScriptedItem::failing(vec![
        CallError::TransientApi("502".into()),
        CallError::TransientApi("503".into()),
    ]);
    let attempts = item.attempts_counter();

    let result = caller.call(WorkId::new(), &item).await;

    assert_eq!(result, Ok(3));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    let snap = tracker.snapshot();
    assert_eq!(snap.num_api_errors, 2);
    assert_eq!(snap.num_tasks_succeeded, 1);
    assert_eq!(snap.num_tasks_failed, 0);
    assert!(snap.is_settled());
}

#[tokio::test(start_paused = true)]
async fn non_retryable_failure_returns_immediately() {
    let (caller, tracker) = caller(policy(5));
    let item = ScriptedItem::failing(vec![CallError::Other("invalid model".into())]);
    let attempts = item.attempts_counter();

    let start = Instant::now();
    let result = caller.call(WorkId::new(), &item).await;

    assert_eq!(result, Err(CallError::Other("invalid model".into())));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(start.elapsed(), Duration::ZERO);
    let snap = tracker.snapshot();
    assert_eq!(snap.num_other_errors, 1);
    assert_eq!(snap.num_tasks_failed, 1);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_surface_the_last_error() {
    let (caller, tracker) = caller(policy(3));
    let item = ScriptedItem::failing(vec![
        CallError::RateLimited("first".into()),
        CallError::RateLimited("second".into()),
        CallError::RateLimited("third".into()),
    ]);

    let start = Instant::now();
    let result = caller.call(WorkId::new(), &item).await;

    assert_eq!(result, Err(CallError::RateLimited("third".into())));
    // Backoff of 1s then 2s between the three attempts.
    assert!(start.elapsed() >= Duration::from_secs(3));
    let snap = tracker.snapshot();
    assert_eq!(snap.num_rate_limit_errors, 3);
    assert_eq!(snap.num_tasks_failed, 1);
    assert_eq!(snap.num_tasks_succeeded, 0);
    assert!(snap.is_settled());
}

#[tokio::test(start_paused = true)]
async fn slow_attempts_time_out_and_are_retried() {
    let (caller, tracker) = caller(RetryPolicy {
        timeout: Duration::from_secs(5),
        ..policy(2)
    });
    let item = ScriptedItem::ok(0, 10).latency(Duration::from_secs(30));

    let result = caller.call(WorkId::new(), &item).await;

    assert_eq!(result, Err(CallError::Timeout(Duration::from_secs(5))));
    assert_eq!(item.attempts.load(Ordering::SeqCst), 2);
    let snap = tracker.snapshot();
    assert_eq!(snap.num_api_errors, 2);
    assert_eq!(snap.num_tasks_failed, 1);
}

#[tokio::test(start_paused = true)]
async fn zero_attempts_still_calls_once() {
    let (caller, tracker) = caller(policy(0));
    let item = ScriptedItem::ok(0, 10);

    assert_eq!(caller.call(WorkId::new(), &item).await, Ok(1));
    assert_eq!(tracker.snapshot().num_tasks_succeeded, 1);
}

#[test]
fn backoff_grows_and_is_capped() {
    let policy = RetryPolicy {
        base_delay: Duration::from_millis(500),
        multiplier: 3.0,
        max_delay: Duration::from_secs(10),
        jitter: false,
        ..RetryPolicy::default()
    };
    assert_eq!(policy.delay_for(1), Duration::from_millis(500));
    assert_eq!(policy.delay_for(2), Duration::from_millis(1_500));
    assert_eq!(policy.delay_for(3), Duration::from_millis(4_500));
    assert_eq!(policy.delay_for(4), Duration::from_secs(10));
    assert_eq!(policy.delay_for(60), Duration::from_secs(10));
}

#[test]
fn jitter_adds_at_most_half_again() {
    let policy = RetryPolicy {
        base_delay: Duration::from_secs(2),
        ..RetryPolicy::default()
    };
    for _ in 0..200 {
        let delay = policy.delay_for(1);
        assert!(delay >= Duration::from_secs(2));
        assert!(delay <= Duration::from_secs(3));
    }
}

#[test]
fn classify_maps_status_and_message() {
    assert!(matches!(
        CallError::classify(Some(429), "slow down"),
        CallError::RateLimited(_)
    ));
    assert!(matches!(
        CallError::classify(Some(400), "Rate limit reached for requests"),
        CallError::RateLimited(_)
    ));
    assert!(matches!(
        CallError::classify(Some(503), "unavailable"),
        CallError::TransientApi(_)
    ));
    assert!(matches!(
        CallError::classify(None, "connection reset"),
        CallError::TransientApi(_)
    ));
    let fatal = CallError::classify(Some(401), "bad key");
    assert_eq!(fatal, CallError::Other("bad key".into()));
    assert!(!fatal.is_retryable());
}
