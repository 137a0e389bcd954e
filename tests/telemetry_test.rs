//! Integration tests for telemetry initialization and span helpers.

use dispatchq::WorkId;
use dispatchq::telemetry::{TelemetryConfig, init_telemetry, work};

#[test]
fn telemetry_initializes_without_endpoint() {
    // Note: tracing subscriber can only be set once per process.
    // Using try_init() in the implementation avoids panics if another
    // test already initialized a subscriber.
    let config = TelemetryConfig {
        endpoint: None,
        service_name: "dispatchq-test".to_string(),
        log_level: "debug".to_string(),
    };
    // This may return Err if a global subscriber was already set by
    // another test in this process; that is acceptable.
    let _guard = init_telemetry(config);
}

#[test]
fn call_span_records_attempts_and_transitions() {
    let span = work::start_call_span(WorkId::new(), 1_200);
    work::record_attempt(&span, 1);
    work::record_state_transition(&span, "executing", "backoff");
    work::record_attempt(&span, 2);
    work::record_state_transition(&span, "executing", "succeeded");
}

#[test]
fn metric_instruments_are_usable_without_a_provider() {
    dispatchq::telemetry::metrics::tasks_started().add(1, &[]);
    dispatchq::telemetry::metrics::queue_pending().add(-1, &[]);
    dispatchq::telemetry::metrics::call_duration_ms().record(12.5, &[]);
}
