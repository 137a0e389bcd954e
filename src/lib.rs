//! # dispatchq
//!
//! Admission control for bursts of calls against a rate-limited inference
//! endpoint.
//!
//! Provides a bounded-concurrency work queue, a rolling-window
//! request/token rate limiter, a retry-with-backoff caller, outcome
//! counters, and OpenTelemetry observability. The network call itself is
//! supplied by the caller as a [`WorkItem`].

pub mod caller;
pub mod config;
pub mod error;
pub mod estimate;
pub mod event;
pub mod limiter;
pub mod model;
pub mod queue;
pub mod telemetry;
pub mod tracker;

pub use caller::{RetryPolicy, RetryingCaller};
pub use config::Config;
pub use error::{CallError, Error, Result};
pub use limiter::{RateLimiter, RateLimits};
pub use model::{FnItem, ItemHandle, WorkId, WorkItem};
pub use queue::{QueueSettings, QueueState, WorkQueue};
pub use tracker::{StatusSnapshot, StatusTracker};
