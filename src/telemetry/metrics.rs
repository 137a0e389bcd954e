//! Metric instrument factories for dispatchq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"dispatchq"` meter. With no
//! provider installed the global meter is a no-op, so recording is always
//! safe.

use opentelemetry::metrics::{Counter, Histogram, Meter, UpDownCounter};

/// Returns the shared meter for dispatchq instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("dispatchq")
}

/// Counter: tasks dispatched to a caller.
pub fn tasks_started() -> Counter<u64> {
    meter()
        .u64_counter("dispatchq.tasks.started")
        .with_description("Number of tasks dispatched")
        .build()
}

/// Counter: tasks that reached a terminal outcome.
/// Labels: `result` ("success" | "failure").
pub fn tasks_finished() -> Counter<u64> {
    meter()
        .u64_counter("dispatchq.tasks.finished")
        .with_description("Number of tasks that reached a terminal outcome")
        .build()
}

/// Counter: failed attempts by classification.
/// Labels: `kind` (see `CallError::kind`).
pub fn call_errors() -> Counter<u64> {
    meter()
        .u64_counter("dispatchq.call.errors")
        .with_description("Number of failed call attempts")
        .build()
}

/// Counter: rate limiter admission decisions.
/// Labels: `result` ("admitted" | "denied").
pub fn admissions() -> Counter<u64> {
    meter()
        .u64_counter("dispatchq.limiter.admissions")
        .with_description("Rate limiter admission decisions")
        .build()
}

/// Up/down counter: items waiting in the queue.
pub fn queue_pending() -> UpDownCounter<i64> {
    meter()
        .i64_up_down_counter("dispatchq.queue.pending")
        .with_description("Items enqueued but not yet dispatched")
        .build()
}

/// Histogram: whole-call duration including retries, in milliseconds.
/// Labels: `result`.
pub fn call_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("dispatchq.call.duration_ms")
        .with_description("Call duration including retries")
        .with_unit("ms")
        .build()
}
