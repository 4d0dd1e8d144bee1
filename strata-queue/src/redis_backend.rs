//! Redis-backed coordinator.
//!
//! Maps the [`Coordinator`](crate::Coordinator) contract onto plain
//! redis commands: `LPUSH`+`LTRIM` for the capped queue (newest on the
//! left, oldest trimmed off the right), `BRPOP` for the blocking pop,
//! `SET NX PX` for expiring locks, and `SET`/`GET` with a ttl for the
//! stash. Matches what the diff workers expect from a shared instance.

use std::time::Duration;

use redis::aio::ConnectionManager;
use tokio::time::Instant;

use crate::{Coordinator, QueueError, Result};

/// How long a single `BRPOP` blocks before the pop loop re-arms.
const POP_POLL_SECS: u64 = 5;

/// Coordinator talking to a shared redis instance.
#[derive(Clone)]
pub struct RedisCoordinator {
    conn: ConnectionManager,
}

impl std::fmt::Debug for RedisCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCoordinator").finish_non_exhaustive()
    }
}

fn backend(err: redis::RedisError) -> QueueError {
    QueueError::Backend(err.to_string())
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl RedisCoordinator {
    /// Connects to `host:port`, selecting `db` and authenticating when a
    /// password is given.
    pub async fn connect(
        host: &str,
        port: u16,
        db: i64,
        password: Option<&str>,
    ) -> Result<Self> {
        let url = match password {
            Some(password) => format!("redis://:{password}@{host}:{port}/{db}"),
            None => format!("redis://{host}:{port}/{db}"),
        };
        let client = redis::Client::open(url).map_err(backend)?;
        let conn = client.get_connection_manager().await.map_err(backend)?;
        Ok(Self { conn })
    }
}

#[async_trait::async_trait]
impl Coordinator for RedisCoordinator {
    async fn queue_push(&self, queue: &str, capacity: usize, value: &str) -> Result<()> {
        let trim_end = i64::try_from(capacity).unwrap_or(i64::MAX) - 1;
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .cmd("LPUSH")
            .arg(queue)
            .arg(value)
            .ignore()
            .cmd("LTRIM")
            .arg(queue)
            .arg(0)
            .arg(trim_end)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(backend)
    }

    async fn queue_pop(&self, queue: &str) -> Result<String> {
        let mut conn = self.conn.clone();
        loop {
            let popped: Option<(String, String)> = redis::cmd("BRPOP")
                .arg(queue)
                .arg(POP_POLL_SECS)
                .query_async(&mut conn)
                .await
                .map_err(backend)?;
            if let Some((_, value)) = popped {
                return Ok(value);
            }
        }
    }

    async fn try_lock(
        &self,
        namespace: &str,
        key: &str,
        expires: Duration,
        wait: Duration,
    ) -> Result<bool> {
        let lock_key = format!("{namespace}:{key}");
        let deadline = Instant::now() + wait;
        let mut conn = self.conn.clone();
        loop {
            let claimed: Option<String> = redis::cmd("SET")
                .arg(&lock_key)
                .arg("1")
                .arg("NX")
                .arg("PX")
                .arg(millis(expires))
                .query_async(&mut conn)
                .await
                .map_err(backend)?;
            if claimed.is_some() {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    async fn unlock(&self, namespace: &str, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(format!("{namespace}:{key}"))
            .query_async::<()>(&mut conn)
            .await
            .map_err(backend)
    }

    async fn stash_put(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(millis(ttl))
            .query_async::<()>(&mut conn)
            .await
            .map_err(backend)
    }

    async fn stash_get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(backend)
    }
}
