//! Structured events emitted by the queue on every lifecycle transition.
//!
//! Consumers subscribe to the event stream to build dashboards, alerting,
//! or audit logs. Publishing never blocks: a lagging subscriber loses the
//! oldest events and can detect the gap from `seq`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

use crate::model::WorkId;

/// A structured event emitted by the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence number. Consumers can detect gaps.
    pub seq: u64,
    /// When this event occurred.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    Enqueued {
        id: WorkId,
        estimated_tokens: u64,
    },
    /// Admission denied; the item went back to the front of the queue.
    Deferred {
        id: WorkId,
        estimated_tokens: u64,
    },
    Dispatched {
        id: WorkId,
    },
    Retrying {
        id: WorkId,
        attempt: u32,
        error: String,
        delay_ms: u64,
    },
    Succeeded {
        id: WorkId,
        attempts: u32,
        duration_ms: u64,
    },
    /// `attempts` is 0 when unknown: the item was rejected before any call,
    /// or its execution task panicked mid-call.
    Failed {
        id: WorkId,
        error: String,
        attempts: u32,
    },
    Cancelled {
        id: WorkId,
    },
    Stopped {
        pending_cancelled: usize,
    },
}

const EVENT_BUFFER: usize = 1024;

/// Broadcast publisher with a shared sequence counter.
#[derive(Debug)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    seq: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            tx,
            seq: AtomicU64::new(1),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn publish(&self, kind: EventKind) {
        let event = Event {
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            timestamp: Utc::now(),
            kind,
        };
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }
}
