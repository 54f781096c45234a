//! Rate-limited work queue (C2).
//!
//! A deduplicating, key-addressed FIFO with per-key exponential-backoff requeue.
//! Backoff constants (5ms base, doubling, 1000s cap) match client-go's
//! `workqueue.DefaultControllerRateLimiter`. Bookkeeping is synchronous state behind
//! a `Mutex`, woken via `tokio::sync::Notify`, in the same
//! wrap-a-std-mutex-for-async style as `ContextData::last_action` in the crate this
//! was grounded on.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

pub const BASE_DELAY: Duration = Duration::from_millis(5);
pub const MAX_DELAY: Duration = Duration::from_secs(1000);
pub const MAX_RETRIES: u32 = 5;

#[derive(Default)]
struct State {
    ready: VecDeque<String>,
    queued: HashSet<String>,
    processing: HashSet<String>,
    dirty_while_processing: HashSet<String>,
    requeues: HashMap<String, u32>,
}

/// A rate-limited, deduplicating work queue keyed by cluster name.
pub struct WorkQueue {
    state: AsyncMutex<State>,
    notify: Notify,
    cancel: CancellationToken,
}

impl WorkQueue {
    pub fn new(cancel: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            state: AsyncMutex::new(State::default()),
            notify: Notify::new(),
            cancel,
        })
    }

    /// Inserts `key` if absent. Idempotent. If `key` is currently being
    /// processed, the re-add is deferred until `done` is called for it.
    pub async fn add(&self, key: impl Into<String>) {
        let key = key.into();
        let mut state = self.state.lock().await;
        if state.processing.contains(&key) {
            state.dirty_while_processing.insert(key);
            return;
        }
        if state.queued.insert(key.clone()) {
            state.ready.push_back(key);
            self.notify.notify_one();
        }
    }

    /// Schedules a future insertion of `key`, with delay determined by its
    /// requeue count so far (exponential backoff, capped at [`MAX_DELAY`]).
    pub fn add_rate_limited(self: &Arc<Self>, key: impl Into<String>) {
        let key = key.into();
        let this = self.clone();
        tokio::spawn(async move {
            let attempt = {
                let mut state = this.state.lock().await;
                let count = state.requeues.entry(key.clone()).or_insert(0);
                let attempt = *count;
                *count += 1;
                attempt
            };
            let delay = backoff(attempt);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = this.cancel.cancelled() => return,
            }
            this.add(key).await;
        });
    }

    /// Blocking dequeue. Marks the key as processing so it cannot be handed to
    /// another caller concurrently. Returns `None` once cancellation fires and
    /// no more ready work remains.
    pub async fn get(&self) -> Option<String> {
        loop {
            {
                let mut state = self.state.lock().await;
                if let Some(key) = state.ready.pop_front() {
                    state.queued.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }
            if self.cancel.is_cancelled() {
                return None;
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = self.cancel.cancelled() => {
                    let state = self.state.lock().await;
                    if state.ready.is_empty() {
                        return None;
                    }
                }
            }
        }
    }

    /// Marks processing of `key` complete. If it was re-added while processing,
    /// it becomes ready again immediately.
    pub async fn done(&self, key: &str) {
        let mut state = self.state.lock().await;
        state.processing.remove(key);
        if state.dirty_while_processing.remove(key) && state.queued.insert(key.to_string()) {
            state.ready.push_back(key.to_string());
            self.notify.notify_one();
        }
    }

    /// Clears per-key backoff history.
    pub async fn forget(&self, key: &str) {
        self.state.lock().await.requeues.remove(key);
    }

    pub async fn num_requeues(&self, key: &str) -> u32 {
        self.state
            .lock()
            .await
            .requeues
            .get(key)
            .copied()
            .unwrap_or(0)
    }
}

fn backoff(attempt: u32) -> Duration {
    let base_ms = BASE_DELAY.as_millis() as u64;
    let cap_ms = MAX_DELAY.as_millis() as u64;
    let pow = if attempt >= 63 { u64::MAX } else { 1u64 << attempt };
    let delay_ms = base_ms.saturating_mul(pow).min(cap_ms);
    Duration::from_millis(delay_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_saturates_at_the_cap() {
        assert_eq!(backoff(0), Duration::from_millis(5));
        assert_eq!(backoff(1), Duration::from_millis(10));
        assert_eq!(backoff(2), Duration::from_millis(20));
        assert_eq!(backoff(40), MAX_DELAY);
    }

    #[tokio::test]
    async fn add_then_get_returns_the_key() {
        let q = WorkQueue::new(CancellationToken::new());
        q.add("c1").await;
        assert_eq!(q.get().await.as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn adding_twice_before_get_is_idempotent() {
        let q = WorkQueue::new(CancellationToken::new());
        q.add("c1").await;
        q.add("c1").await;
        assert_eq!(q.get().await.as_deref(), Some("c1"));
        // no second entry queued
        q.done("c1").await;
        let q2 = q.clone();
        tokio::select! {
            _ = async { q2.get().await } => panic!("unexpected second dequeue"),
            _ = tokio::time::sleep(Duration::from_millis(20)) => {}
        }
    }

    #[tokio::test]
    async fn re_add_during_processing_is_deferred_until_done() {
        let q = WorkQueue::new(CancellationToken::new());
        q.add("c1").await;
        assert_eq!(q.get().await.as_deref(), Some("c1"));
        q.add("c1").await; // arrives while c1 is "processing"
        q.done("c1").await;
        assert_eq!(q.get().await.as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn forget_clears_requeue_count() {
        let q = WorkQueue::new(CancellationToken::new());
        q.add_rate_limited("c1");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(q.num_requeues("c1").await, 1);
        q.forget("c1").await;
        assert_eq!(q.num_requeues("c1").await, 0);
    }

    #[tokio::test]
    async fn get_returns_none_after_cancellation_drains_ready_queue() {
        let cancel = CancellationToken::new();
        let q = WorkQueue::new(cancel.clone());
        q.add("c1").await;
        cancel.cancel();
        assert_eq!(q.get().await.as_deref(), Some("c1"));
        assert_eq!(q.get().await, None);
    }
}
