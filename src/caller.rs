//! One external call with timeout, bounded retries and exponential backoff.
//!
//! The caller owns the item's tracker bookkeeping from dispatch to terminal
//! outcome: `task_started` on entry, one error increment per failed
//! attempt, and exactly one of `task_succeeded` / `task_failed` on exit.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{Instrument, error, warn};

use crate::error::CallError;
use crate::event::{EventBus, EventKind};
use crate::model::{WorkId, WorkItem};
use crate::telemetry::metrics;
use crate::telemetry::work::{record_attempt, record_state_transition, start_call_span};
use crate::tracker::StatusTracker;

/// Retry and timeout policy for a single call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Zero is treated as one.
    pub max_attempts: u32,
    /// Upper bound on a single attempt; expiry counts as a transient error.
    pub timeout: Duration,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Growth factor applied per further retry.
    pub multiplier: f64,
    /// Ceiling for a single backoff delay.
    pub max_delay: Duration,
    /// Add up to 50% random extra delay to spread synchronized retries.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            timeout: Duration::from_secs(60),
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Backoff after the given failed attempt (1-based):
    /// `base_delay * multiplier^(attempt-1)`, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64());
        let delay = Duration::try_from_secs_f64(capped).unwrap_or(self.max_delay);

        if self.jitter && !delay.is_zero() {
            let extra = rand::thread_rng().gen_range(0.0..=0.5);
            delay.mul_f64(1.0 + extra)
        } else {
            delay
        }
    }
}

/// Executes work items under a [`RetryPolicy`] and reports to a shared
/// [`StatusTracker`].
#[derive(Debug, Clone)]
pub struct RetryingCaller {
    policy: RetryPolicy,
    tracker: Arc<StatusTracker>,
    events: Option<Arc<EventBus>>,
}

impl RetryingCaller {
    pub fn new(policy: RetryPolicy, tracker: Arc<StatusTracker>) -> Self {
        Self {
            policy,
            tracker,
            events: None,
        }
    }

    /// Publish retry and terminal events on the given bus.
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn tracker(&self) -> &Arc<StatusTracker> {
        &self.tracker
    }

    fn publish(&self, kind: EventKind) {
        if let Some(ref events) = self.events {
            events.publish(kind);
        }
    }

    /// Run `item` to a terminal outcome.
    ///
    /// Retryable failures are retried while attempts remain; the last error
    /// is returned once they run out. A non-retryable failure returns after
    /// its first attempt without sleeping.
    pub async fn call<I>(&self, id: WorkId, item: &I) -> Result<I::Output, CallError>
    where
        I: WorkItem + ?Sized,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let span = start_call_span(id, item.estimated_tokens());
        let started = Instant::now();
        self.tracker.task_started();

        async {
            let mut attempt = 0;
            loop {
                attempt += 1;
                record_attempt(&span, attempt);

                let result = match tokio::time::timeout(self.policy.timeout, item.perform()).await
                {
                    Ok(result) => result,
                    Err(_) => Err(CallError::Timeout(self.policy.timeout)),
                };

                let error = match result {
                    Ok(output) => {
                        let duration_ms = started.elapsed().as_millis() as u64;
                        self.tracker.task_succeeded();
                        record_state_transition(&span, "executing", "succeeded");
                        metrics::call_duration_ms().record(
                            duration_ms as f64,
                            &[opentelemetry::KeyValue::new("result", "success")],
                        );
                        self.publish(EventKind::Succeeded {
                            id,
                            attempts: attempt,
                            duration_ms,
                        });
                        return Ok(output);
                    }
                    Err(error) => error,
                };

                self.tracker.record_error(&error);

                if error.is_retryable() && attempt < max_attempts {
                    let delay = self.policy.delay_for(attempt);
                    warn!(
                        %id,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "call failed, retrying"
                    );
                    self.publish(EventKind::Retrying {
                        id,
                        attempt,
                        error: error.to_string(),
                        delay_ms: delay.as_millis() as u64,
                    });
                    record_state_transition(&span, "executing", "backoff");
                    tokio::time::sleep(delay).await;
                    continue;
                }

                error!(%id, attempt, error = %error, "call failed");
                self.tracker.task_failed();
                record_state_transition(&span, "executing", "failed");
                metrics::call_duration_ms().record(
                    started.elapsed().as_millis() as f64,
                    &[opentelemetry::KeyValue::new("result", "failure")],
                );
                self.publish(EventKind::Failed {
                    id,
                    error: error.to_string(),
                    attempts: attempt,
                });
                return Err(error);
            }
        }
        .instrument(span.clone())
        .await
    }
}
