//! Outcome counters shared by every execution task.
//!
//! One mutex guards all seven counters so a snapshot never observes a
//! half-applied terminal transition: `started >= in_progress + succeeded +
//! failed` holds for every snapshot, with equality once tasks settle.

use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::CallError;
use crate::telemetry::metrics;

/// Point-in-time copy of the tracker counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub num_tasks_started: u64,
    pub num_tasks_in_progress: u64,
    pub num_tasks_succeeded: u64,
    pub num_tasks_failed: u64,
    pub num_rate_limit_errors: u64,
    pub num_api_errors: u64,
    pub num_other_errors: u64,
}

impl StatusSnapshot {
    /// Tasks that reached a terminal outcome.
    pub fn num_tasks_settled(&self) -> u64 {
        self.num_tasks_succeeded + self.num_tasks_failed
    }

    /// True once every started task is terminal.
    pub fn is_settled(&self) -> bool {
        self.num_tasks_in_progress == 0
            && self.num_tasks_started == self.num_tasks_settled()
    }
}

/// Internally synchronized counters. Pass it around as `Arc<StatusTracker>`.
#[derive(Debug, Default)]
pub struct StatusTracker {
    counters: Mutex<StatusSnapshot>,
}

impl StatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StatusSnapshot> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A task was dispatched.
    pub fn task_started(&self) {
        let mut c = self.lock();
        c.num_tasks_started += 1;
        c.num_tasks_in_progress += 1;
        metrics::tasks_started().add(1, &[]);
    }

    /// A dispatched task finished successfully.
    pub fn task_succeeded(&self) {
        let mut c = self.lock();
        c.num_tasks_in_progress = c.num_tasks_in_progress.saturating_sub(1);
        c.num_tasks_succeeded += 1;
        metrics::tasks_finished().add(1, &[opentelemetry::KeyValue::new("result", "success")]);
    }

    /// A dispatched task reached a terminal failure.
    pub fn task_failed(&self) {
        let mut c = self.lock();
        c.num_tasks_in_progress = c.num_tasks_in_progress.saturating_sub(1);
        c.num_tasks_failed += 1;
        metrics::tasks_finished().add(1, &[opentelemetry::KeyValue::new("result", "failure")]);
    }

    /// Count one failed attempt under its error category.
    ///
    /// Timeouts count as API errors. Queue-side outcomes (cancelled,
    /// quota exceeded, panicked, abandoned) count as other errors.
    pub fn record_error(&self, error: &CallError) {
        let mut c = self.lock();
        match error {
            CallError::RateLimited(_) => c.num_rate_limit_errors += 1,
            CallError::TransientApi(_) | CallError::Timeout(_) => c.num_api_errors += 1,
            _ => c.num_other_errors += 1,
        }
        metrics::call_errors().add(1, &[opentelemetry::KeyValue::new("kind", error.kind())]);
    }

    /// Terminal failure for a task that never went through a caller:
    /// counted as started and failed in one step.
    pub fn task_rejected(&self, error: &CallError) {
        self.task_started();
        self.record_error(error);
        self.task_failed();
    }

    /// An execution task died without reporting its own outcome.
    pub fn task_panicked(&self) {
        self.record_error(&CallError::Panicked(String::new()));
        self.task_failed();
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        *self.lock()
    }
}
