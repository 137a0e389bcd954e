//! Error types for dispatchq.
//!
//! [`Error`] covers the crate's own failures (configuration, a closed
//! queue). [`CallError`] is the classification of a single external call
//! and drives the retry decision.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("queue closed: enqueue after stop")]
    QueueClosed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Why a single call (or the item wrapping it) did not succeed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CallError {
    /// The endpoint refused the call because a quota was hit (429-class).
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Network or 5xx-class failure that may succeed on another attempt.
    #[error("transient api error: {0}")]
    TransientApi(String),

    /// The attempt did not finish within the per-attempt timeout.
    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),

    /// Anything not worth retrying, e.g. a malformed request.
    #[error("{0}")]
    Other(String),

    /// The item's estimated cost exceeds the whole token quota.
    #[error("estimated {estimated} tokens exceeds the per-window limit of {limit}")]
    QuotaExceeded { estimated: u64, limit: u64 },

    /// The queue stopped before the item was dispatched.
    #[error("cancelled before dispatch")]
    Cancelled,

    /// The execution task panicked.
    #[error("execution task panicked: {0}")]
    Panicked(String),

    /// The result channel closed without a value.
    #[error("result abandoned")]
    Abandoned,
}

impl CallError {
    /// Retryable failures are recovered locally up to `max_attempts`.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CallError::RateLimited(_) | CallError::TransientApi(_) | CallError::Timeout(_)
        )
    }

    /// Classify an endpoint failure from its HTTP status (if any) and error
    /// message. 429 or a "rate limit" message is a rate limit, 408/5xx or a
    /// status-less transport failure is transient, anything else is final.
    pub fn classify(status: Option<u16>, message: impl Into<String>) -> Self {
        let message = message.into();
        if status == Some(429) || message.to_lowercase().contains("rate limit") {
            return CallError::RateLimited(message);
        }
        match status {
            None | Some(408) | Some(500..=599) => CallError::TransientApi(message),
            Some(_) => CallError::Other(message),
        }
    }

    /// Short label used for metrics and events.
    pub fn kind(&self) -> &'static str {
        match self {
            CallError::RateLimited(_) => "rate_limited",
            CallError::TransientApi(_) => "transient_api",
            CallError::Timeout(_) => "timeout",
            CallError::Other(_) => "other",
            CallError::QuotaExceeded { .. } => "quota_exceeded",
            CallError::Cancelled => "cancelled",
            CallError::Panicked(_) => "panicked",
            CallError::Abandoned => "abandoned",
        }
    }
}
