//! Coordination primitives shared by the registry and its diff workers.
//!
//! The [`Coordinator`] trait models the small slice of a key-value
//! coordination service the registry needs:
//!
//! - a **capped FIFO queue** (push drops the oldest entry on overflow,
//!   pop blocks until an entry is available),
//! - a **per-key expiring lock** acquired with a configurable wait,
//! - a **stash** of short-lived values carrying the computed checksum
//!   candidates between the two upload requests.
//!
//! [`MemoryCoordinator`] keeps everything in-process for tests and
//! standalone deployments; [`RedisCoordinator`] speaks to a shared redis
//! instance so separate worker processes can coordinate.

#![allow(clippy::missing_docs_in_private_items)]

mod memory;
mod redis_backend;

use std::time::Duration;

pub use memory::MemoryCoordinator;
pub use redis_backend::RedisCoordinator;

/// Result type for coordinator operations.
pub type Result<T> = std::result::Result<T, QueueError>;

/// Errors from the coordination service.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The backing service failed or is unreachable.
    #[error("coordinator: {0}")]
    Backend(String),
}

/// Key-value coordination service contract.
#[async_trait::async_trait]
pub trait Coordinator: Send + Sync {
    /// Appends `value` to the capped FIFO `queue`. When the queue holds
    /// more than `capacity` entries the oldest pending entry is dropped.
    async fn queue_push(&self, queue: &str, capacity: usize, value: &str) -> Result<()>;

    /// Pops the oldest entry from `queue`, waiting until one exists.
    async fn queue_pop(&self, queue: &str) -> Result<String>;

    /// Tries to take the lock `namespace`/`key` for `expires`, retrying
    /// for at most `wait`. Returns `false` when another holder wins. An
    /// unreleased lock frees itself once `expires` passes.
    async fn try_lock(
        &self,
        namespace: &str,
        key: &str,
        expires: Duration,
        wait: Duration,
    ) -> Result<bool>;

    /// Releases the lock `namespace`/`key`.
    async fn unlock(&self, namespace: &str, key: &str) -> Result<()>;

    /// Stores a short-lived value under `key` for `ttl`.
    async fn stash_put(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Reads a stashed value; expired or absent keys yield `None`.
    async fn stash_get(&self, key: &str) -> Result<Option<String>>;
}
