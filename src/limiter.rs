//! Request/token rate limiter over a rolling window.
//!
//! Uses the discrete ledger policy: every admitted call is recorded as
//! `(admitted_at, token_cost)` in a FIFO ledger, and its request and token
//! cost are released back only once `now - admitted_at > window`. This
//! gives exact per-call accounting, so a burst admitted at one instant is
//! released at one instant too. Replenishment is lazy: it runs on every
//! admission check and on [`RateLimiter::replenish`], so no background
//! timer task is needed.
//!
//! Time is read from `tokio::time::Instant`, which lets tests drive the
//! window on a paused clock.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::telemetry::metrics;

/// Quota ceilings per rolling window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimits {
    /// Maximum admitted requests per window.
    pub max_requests: u64,
    /// Maximum cumulative estimated tokens per window.
    pub max_tokens: u64,
    /// Length of the rolling window.
    pub window: Duration,
}

impl RateLimits {
    /// Per-minute limits, the shape most inference endpoints publish.
    pub fn per_minute(max_requests: u64, max_tokens: u64) -> Self {
        Self {
            max_requests,
            max_tokens,
            window: Duration::from_secs(60),
        }
    }
}

impl Default for RateLimits {
    fn default() -> Self {
        Self::per_minute(1_000, 100_000)
    }
}

/// Read-only view of limiter state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterSnapshot {
    pub limit_requests: u64,
    pub limit_tokens: u64,
    pub remaining_requests: u64,
    pub remaining_tokens: u64,
    /// Admissions still counted against the current window.
    pub in_window: usize,
}

#[derive(Debug)]
struct Ledger {
    entries: VecDeque<(Instant, u64)>,
    remaining_requests: u64,
    remaining_tokens: u64,
}

impl Ledger {
    fn new(limits: &RateLimits) -> Self {
        Self {
            entries: VecDeque::new(),
            remaining_requests: limits.max_requests,
            remaining_tokens: limits.max_tokens,
        }
    }

    /// Release every entry older than the window. Returns how many were released.
    fn release_expired(&mut self, now: Instant, limits: &RateLimits) -> usize {
        let mut released = 0;
        while let Some(&(admitted_at, tokens)) = self.entries.front() {
            if now.saturating_duration_since(admitted_at) <= limits.window {
                break;
            }
            self.entries.pop_front();
            self.remaining_requests = (self.remaining_requests + 1).min(limits.max_requests);
            self.remaining_tokens = (self.remaining_tokens + tokens).min(limits.max_tokens);
            released += 1;
        }
        released
    }
}

/// Admission gate shared by the queue and its tasks.
#[derive(Debug)]
pub struct RateLimiter {
    limits: RateLimits,
    ledger: Mutex<Ledger>,
}

impl RateLimiter {
    /// A zero request limit is raised to one; otherwise nothing could ever
    /// be admitted.
    pub fn new(limits: RateLimits) -> Self {
        let limits = RateLimits {
            max_requests: limits.max_requests.max(1),
            ..limits
        };
        Self {
            ledger: Mutex::new(Ledger::new(&limits)),
            limits,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn limits(&self) -> &RateLimits {
        &self.limits
    }

    /// Admit one request costing `estimated_tokens` if both budgets cover it.
    ///
    /// On `false` nothing is mutated; the caller waits and asks again.
    pub fn try_admit(&self, estimated_tokens: u64) -> bool {
        let now = Instant::now();
        let mut ledger = self.lock();
        ledger.release_expired(now, &self.limits);

        if ledger.remaining_requests == 0 || ledger.remaining_tokens < estimated_tokens {
            debug!(
                estimated_tokens,
                remaining_requests = ledger.remaining_requests,
                remaining_tokens = ledger.remaining_tokens,
                "admission denied"
            );
            metrics::admissions().add(1, &[opentelemetry::KeyValue::new("result", "denied")]);
            return false;
        }

        ledger.remaining_requests -= 1;
        ledger.remaining_tokens -= estimated_tokens;
        ledger.entries.push_back((now, estimated_tokens));
        metrics::admissions().add(1, &[opentelemetry::KeyValue::new("result", "admitted")]);
        true
    }

    /// Release budget whose window has expired. Returns the number of
    /// admissions released.
    pub fn replenish(&self) -> usize {
        let now = Instant::now();
        self.lock().release_expired(now, &self.limits)
    }

    /// Whether a call of this size could ever be admitted, even into an
    /// empty window.
    pub fn can_ever_admit(&self, estimated_tokens: u64) -> bool {
        estimated_tokens <= self.limits.max_tokens
    }

    /// Time until the oldest admission leaves the window, if any is held.
    pub fn time_until_release(&self) -> Option<Duration> {
        let now = Instant::now();
        let ledger = self.lock();
        ledger.entries.front().map(|&(admitted_at, _)| {
            (admitted_at + self.limits.window).saturating_duration_since(now)
        })
    }

    pub fn snapshot(&self) -> LimiterSnapshot {
        let now = Instant::now();
        let mut ledger = self.lock();
        ledger.release_expired(now, &self.limits);
        LimiterSnapshot {
            limit_requests: self.limits.max_requests,
            limit_tokens: self.limits.max_tokens,
            remaining_requests: ledger.remaining_requests,
            remaining_tokens: ledger.remaining_tokens,
            in_window: ledger.entries.len(),
        }
    }
}
