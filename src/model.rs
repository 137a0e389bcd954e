//! Core data model.
//!
//! A work item is one external call waiting to be made. It knows how to
//! perform itself and roughly how many tokens it will consume; the queue
//! gives it an identity on enqueue and hands back an [`ItemHandle`] that
//! resolves to the item's terminal outcome.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::CallError;

// ---------------------------------------------------------------------------
// Work Id
// ---------------------------------------------------------------------------

/// Newtype for work item IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkId(pub Uuid);

impl WorkId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for WorkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short display: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl Default for WorkId {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Work Item
// ---------------------------------------------------------------------------

/// A single external call the queue can dispatch.
///
/// `perform` may run more than once when attempts are retried, so it takes
/// `&self` and must rebuild any per-attempt state itself.
#[async_trait]
pub trait WorkItem: Send + Sync + 'static {
    type Output: Send + 'static;

    /// Make the call once.
    async fn perform(&self) -> Result<Self::Output, CallError>;

    /// Estimated token cost, charged against the limiter on admission.
    fn estimated_tokens(&self) -> u64;
}

/// Adapts a closure returning a future into a [`WorkItem`].
pub struct FnItem<F> {
    tokens: u64,
    call: F,
}

impl<F> FnItem<F> {
    pub fn new(estimated_tokens: u64, call: F) -> Self {
        Self {
            tokens: estimated_tokens,
            call,
        }
    }
}

#[async_trait]
impl<F, Fut, O> WorkItem for FnItem<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O, CallError>> + Send + 'static,
    O: Send + 'static,
{
    type Output = O;

    async fn perform(&self) -> Result<O, CallError> {
        (self.call)().await
    }

    fn estimated_tokens(&self) -> u64 {
        self.tokens
    }
}

/// Boxed item as stored by the queue.
pub type BoxedItem<O> = Box<dyn WorkItem<Output = O>>;

// ---------------------------------------------------------------------------
// Item Handle
// ---------------------------------------------------------------------------

/// Resolves to the terminal outcome of one enqueued item.
///
/// Dropping the handle does not cancel the item; the outcome is discarded.
#[derive(Debug)]
pub struct ItemHandle<O> {
    id: WorkId,
    rx: oneshot::Receiver<Result<O, CallError>>,
}

impl<O> ItemHandle<O> {
    pub(crate) fn new(id: WorkId) -> (Self, oneshot::Sender<Result<O, CallError>>) {
        let (tx, rx) = oneshot::channel();
        (Self { id, rx }, tx)
    }

    pub fn id(&self) -> WorkId {
        self.id
    }
}

impl<O> Future for ItemHandle<O> {
    type Output = Result<O, CallError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // A sender dropped without a value means the execution task died.
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(CallError::Abandoned)))
    }
}
