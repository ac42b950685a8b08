//! Bounded retry queue between a session and the operation log.
//!
//! Log appends are fire-and-forget from the session's point of view: the
//! serialized transform/apply step never waits on the durable tier. A
//! worker task drains the queue, retrying with exponential backoff while
//! the log is unreachable. When the bounded queue overflows, the oldest
//! entries are dropped and the owning session is told by message passing —
//! degradation is reported, never silent.
//!
//! ```text
//! session ──enqueue──► [ bounded queue ] ──append──► OperationLog
//!    ▲                       │ overflow: drop oldest
//!    └──── DurabilityEvent ──┘ (Degraded / Recovered)
//! ```
//!
//! One queue per session: a document's persistence trouble stays its own.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::{LoggedOp, OperationLog, TabKey};

/// Retry queue tuning.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Entries held while the log is unreachable before dropping the
    /// oldest (default: 1024).
    pub capacity: usize,
    /// First backoff after a failed append (default: 100ms).
    pub base_backoff: Duration,
    /// Backoff ceiling (default: 5s).
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryConfig {
    /// Tiny queue and fast backoff for tests.
    pub fn for_testing() -> Self {
        Self {
            capacity: 4,
            base_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
        }
    }
}

/// Durability signals reported back to the owning session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurabilityEvent {
    /// The queue overflowed; `dropped` entries were discarded.
    Degraded { dropped: u64 },
    /// The backlog drained after an outage.
    Recovered,
}

/// Handle held by the session; enqueues log appends without blocking.
#[derive(Clone)]
pub struct RetryQueue {
    tx: mpsc::UnboundedSender<LoggedOp>,
}

impl RetryQueue {
    /// Spawn the worker for one tab. Durability events arrive on `events`.
    pub fn spawn(
        key: TabKey,
        log: Arc<dyn OperationLog>,
        config: RetryConfig,
        events: mpsc::UnboundedSender<DurabilityEvent>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(worker(key, log, config, rx, events));
        Self { tx }
    }

    /// Enqueue an append. Returns false if the worker is gone (teardown).
    pub fn enqueue(&self, entry: LoggedOp) -> bool {
        self.tx.send(entry).is_ok()
    }
}

async fn worker(
    key: TabKey,
    log: Arc<dyn OperationLog>,
    config: RetryConfig,
    mut rx: mpsc::UnboundedReceiver<LoggedOp>,
    events: mpsc::UnboundedSender<DurabilityEvent>,
) {
    let mut queue: VecDeque<LoggedOp> = VecDeque::new();
    let mut backoff = config.base_backoff;
    let mut degraded = false;
    let mut inbound_open = true;

    loop {
        if queue.is_empty() {
            if !inbound_open {
                break;
            }
            // Nothing pending: park until the session sends more work.
            match rx.recv().await {
                Some(entry) => queue.push_back(entry),
                None => break,
            }
        }

        // Absorb whatever else has arrived, enforcing the bound.
        let mut dropped = 0u64;
        while let Ok(entry) = rx.try_recv() {
            queue.push_back(entry);
            while queue.len() > config.capacity {
                queue.pop_front();
                dropped += 1;
            }
        }
        if dropped > 0 {
            log::warn!("retry queue for {key} overflowed, dropped {dropped} oldest entries");
            let _ = events.send(DurabilityEvent::Degraded { dropped });
            degraded = true;
        }

        let entry = match queue.front() {
            Some(entry) => entry.clone(),
            None => continue,
        };

        match log.append(&key, &entry) {
            Ok(_) => {
                queue.pop_front();
                backoff = config.base_backoff;
                if degraded && queue.is_empty() {
                    log::info!("operation log for {key} recovered, backlog flushed");
                    let _ = events.send(DurabilityEvent::Recovered);
                    degraded = false;
                }
            }
            Err(e) => {
                if !degraded {
                    log::warn!("operation log append failed for {key}: {e}, retrying");
                }
                degraded = true;
                // Keep accepting (and bounding) new work while backing off.
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    more = rx.recv(), if inbound_open => {
                        match more {
                            Some(entry) => {
                                queue.push_back(entry);
                                let mut dropped = 0u64;
                                while queue.len() > config.capacity {
                                    queue.pop_front();
                                    dropped += 1;
                                }
                                if dropped > 0 {
                                    log::warn!(
                                        "retry queue for {key} overflowed, dropped {dropped} oldest entries"
                                    );
                                    let _ = events.send(DurabilityEvent::Degraded { dropped });
                                }
                            }
                            None => inbound_open = false,
                        }
                    }
                }
                backoff = (backoff * 2).min(config.max_backoff);
            }
        }
    }

    log::debug!("retry worker for {key} stopped");
}
