//! Shared fixtures: a scripted work item whose attempts are observable.

#![allow(dead_code)]

use async_trait::async_trait;
use dispatchq::{CallError, WorkItem};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Records when each item first started executing.
#[derive(Debug, Default, Clone)]
pub struct StartLog(Arc<Mutex<Vec<(usize, Instant)>>>);

impl StartLog {
    pub fn entries(&self) -> Vec<(usize, Instant)> {
        self.0.lock().unwrap().clone()
    }
}

/// Tracks how many items are running at once.
#[derive(Debug, Default, Clone)]
pub struct Concurrency {
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl Concurrency {
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Fails with each scripted error in turn, then succeeds with the number
/// of attempts made.
pub struct ScriptedItem {
    pub index: usize,
    pub tokens: u64,
    pub latency: Duration,
    pub script: Mutex<VecDeque<CallError>>,
    pub attempts: Arc<AtomicU32>,
    pub panics: bool,
    pub starts: Option<StartLog>,
    pub concurrency: Option<Concurrency>,
}

impl ScriptedItem {
    pub fn ok(index: usize, tokens: u64) -> Self {
        Self {
            index,
            tokens,
            latency: Duration::ZERO,
            script: Mutex::new(VecDeque::new()),
            attempts: Arc::new(AtomicU32::new(0)),
            panics: false,
            starts: None,
            concurrency: None,
        }
    }

    pub fn failing(errors: Vec<CallError>) -> Self {
        let item = Self::ok(0, 10);
        *item.script.lock().unwrap() = errors.into();
        item
    }

    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn panicking(mut self) -> Self {
        self.panics = true;
        self
    }

    pub fn log_starts(mut self, log: &StartLog) -> Self {
        self.starts = Some(log.clone());
        self
    }

    pub fn track(mut self, concurrency: &Concurrency) -> Self {
        self.concurrency = Some(concurrency.clone());
        self
    }

    pub fn attempts_counter(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.attempts)
    }
}

#[async_trait]
impl WorkItem for ScriptedItem {
    type Output = u32;

    async fn perform(&self) -> Result<u32, CallError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt == 1 {
            if let Some(ref log) = self.starts {
                log.0.lock().unwrap().push((self.index, Instant::now()));
            }
        }
        if self.panics {
            panic!("scripted panic");
        }

        if let Some(ref c) = self.concurrency {
            let now = c.current.fetch_add(1, Ordering::SeqCst) + 1;
            c.peak.fetch_max(now, Ordering::SeqCst);
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if let Some(ref c) = self.concurrency {
            c.current.fetch_sub(1, Ordering::SeqCst);
        }

        match self.script.lock().unwrap().pop_front() {
            Some(error) => Err(error),
            None => Ok(attempt),
        }
    }

    fn estimated_tokens(&self) -> u64 {
        self.tokens
    }
}
