//! In-process coordinator for tests and standalone deployments.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::{Coordinator, Result};

/// Coordinator backed by in-process maps.
///
/// Locks and stash entries expire lazily: a stale entry is reclaimed by
/// the next operation that touches its key.
#[derive(Debug, Default)]
pub struct MemoryCoordinator {
    queues: Mutex<HashMap<String, VecDeque<String>>>,
    signals: Mutex<HashMap<String, Arc<Notify>>>,
    locks: Mutex<HashMap<String, Instant>>,
    stash: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryCoordinator {
    /// Creates an empty coordinator.
    pub fn new() -> Self {
        Self::default()
    }

    async fn signal(&self, queue: &str) -> Arc<Notify> {
        let mut signals = self.signals.lock().await;
        Arc::clone(signals.entry(queue.to_owned()).or_default())
    }

    async fn acquire(&self, lock_key: &str, expires: Duration) -> bool {
        let now = Instant::now();
        let mut locks = self.locks.lock().await;
        match locks.get(lock_key) {
            Some(expiry) if *expiry > now => false,
            _ => {
                locks.insert(lock_key.to_owned(), now + expires);
                true
            }
        }
    }
}

fn lock_key(namespace: &str, key: &str) -> String {
    format!("{namespace}:{key}")
}

#[async_trait::async_trait]
impl Coordinator for MemoryCoordinator {
    async fn queue_push(&self, queue: &str, capacity: usize, value: &str) -> Result<()> {
        {
            let mut queues = self.queues.lock().await;
            let entries = queues.entry(queue.to_owned()).or_default();
            entries.push_front(value.to_owned());
            // Oldest entries sit at the back.
            while entries.len() > capacity {
                entries.pop_back();
            }
        }
        self.signal(queue).await.notify_one();
        Ok(())
    }

    async fn queue_pop(&self, queue: &str) -> Result<String> {
        let signal = self.signal(queue).await;
        loop {
            let notified = signal.notified();
            {
                let mut queues = self.queues.lock().await;
                if let Some(value) = queues.get_mut(queue).and_then(VecDeque::pop_back) {
                    return Ok(value);
                }
            }
            notified.await;
        }
    }

    async fn try_lock(
        &self,
        namespace: &str,
        key: &str,
        expires: Duration,
        wait: Duration,
    ) -> Result<bool> {
        let lock_key = lock_key(namespace, key);
        let deadline = Instant::now() + wait;
        loop {
            if self.acquire(&lock_key, expires).await {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    async fn unlock(&self, namespace: &str, key: &str) -> Result<()> {
        self.locks.lock().await.remove(&lock_key(namespace, key));
        Ok(())
    }

    async fn stash_put(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let expiry = Instant::now() + ttl;
        self.stash
            .lock()
            .await
            .insert(key.to_owned(), (value.to_owned(), expiry));
        Ok(())
    }

    async fn stash_get(&self, key: &str) -> Result<Option<String>> {
        let mut stash = self.stash.lock().await;
        match stash.get(key) {
            Some((value, expiry)) if *expiry > Instant::now() => Ok(Some(value.clone())),
            Some(_) => {
                stash.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }
}
