//! Distributed lock and cache primitives backed by Redis

use crate::error::{SubmitError, SubmitResult};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

/// Compare-and-delete so a holder never releases a lock it no longer owns
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Get/set-with-expiry, a token lock with bounded hold, and a health ping
#[async_trait]
pub trait CoordinationBackend: Send + Sync {
    async fn get_u64(&self, key: &str) -> SubmitResult<Option<u64>>;

    async fn set_u64_with_expiry(&self, key: &str, value: u64, ttl: Duration) -> SubmitResult<()>;

    /// Take `lock` for `token` if free; the lock expires after `hold`
    async fn try_acquire(&self, lock: &str, token: &str, hold: Duration) -> SubmitResult<bool>;

    /// Release `lock` if still held by `token`
    async fn release(&self, lock: &str, token: &str) -> SubmitResult<bool>;

    async fn ping(&self) -> SubmitResult<()>;
}

/// Redis implementation over a multiplexed, auto-reconnecting connection
#[derive(Clone)]
pub struct RedisBackend {
    conn: ConnectionManager,
}

impl RedisBackend {
    pub async fn connect(url: &str) -> SubmitResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl CoordinationBackend for RedisBackend {
    async fn get_u64(&self, key: &str) -> SubmitResult<Option<u64>> {
        let mut conn = self.conn.clone();
        let value: Option<u64> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set_u64_with_expiry(&self, key: &str, value: u64, ttl: Duration) -> SubmitResult<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn try_acquire(&self, lock: &str, token: &str, hold: Duration) -> SubmitResult<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(lock)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(hold.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn release(&self, lock: &str, token: &str) -> SubmitResult<bool> {
        let mut conn = self.conn.clone();
        let script = redis::Script::new(RELEASE_SCRIPT);
        let deleted: i64 = script
            .key(lock)
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    async fn ping(&self) -> SubmitResult<()> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        if pong != "PONG" {
            return Err(SubmitError::StoreUnavailable(format!(
                "unexpected PING reply: {}",
                pong
            )));
        }
        Ok(())
    }
}

/// Held distributed lock.
///
/// `release` should be awaited on every path; if the guard is dropped
/// instead (early return, panic, cancelled future) release is spawned onto
/// the current runtime. The lock's hold time bounds it either way.
pub struct LockGuard {
    backend: Arc<dyn CoordinationBackend>,
    name: String,
    token: String,
    released: bool,
}

impl LockGuard {
    /// Acquire `name`, polling until `wait` elapses
    pub async fn acquire(
        backend: Arc<dyn CoordinationBackend>,
        name: String,
        wait: Duration,
        hold: Duration,
        retry_interval: Duration,
    ) -> SubmitResult<Self> {
        let token = Uuid::new_v4().to_string();
        let deadline = Instant::now() + wait;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match timeout(remaining, backend.try_acquire(&name, &token, hold)).await {
                Ok(Ok(true)) => {
                    debug!("Acquired lock {}", name);
                    return Ok(Self {
                        backend,
                        name,
                        token,
                        released: false,
                    });
                }
                Ok(Ok(false)) => {}
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    // The service itself did not answer, which is not contention.
                    return Err(SubmitError::StoreUnavailable(format!(
                        "no reply acquiring lock {} within {:?}",
                        name, wait
                    )));
                }
            }

            if Instant::now() + retry_interval >= deadline {
                break;
            }
            sleep(retry_interval).await;
        }

        warn!("Timed out after {:?} waiting for lock {}", wait, name);
        Err(SubmitError::LockTimeout {
            lock: name,
            operation: "acquire".to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn release(mut self) -> SubmitResult<()> {
        self.released = true;
        let released = self.backend.release(&self.name, &self.token).await?;
        if !released {
            warn!("Lock {} expired before release", self.name);
        }
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let backend = self.backend.clone();
        let name = std::mem::take(&mut self.name);
        let token = std::mem::take(&mut self.token);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = backend.release(&name, &token).await {
                        warn!("Failed to release dropped lock {}: {}", name, e);
                    }
                });
            }
            Err(_) => {
                warn!("Lock {} dropped outside a runtime; it expires after its hold time", name);
            }
        }
    }
}
