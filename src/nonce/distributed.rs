//! Distributed nonce store: per-address lock plus a cached "next nonce"

use super::lock::{CoordinationBackend, LockGuard};
use super::{NonceReservation, NonceStore, StoreKind};
use crate::chain::ChainClient;
use crate::config::NonceConfig;
use crate::error::{SubmitError, SubmitResult};

use async_trait::async_trait;
use chrono::Utc;
use ethers::types::Address;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Nonce store coordinated through a shared lock/cache service
pub struct DistributedNonceStore {
    backend: Arc<dyn CoordinationBackend>,
    chain: Arc<dyn ChainClient>,
    key_prefix: String,
    cache_ttl: Duration,
    lock_wait: Duration,
    lock_hold: Duration,
    lock_retry_interval: Duration,
}

impl DistributedNonceStore {
    pub fn new(
        backend: Arc<dyn CoordinationBackend>,
        chain: Arc<dyn ChainClient>,
        config: &NonceConfig,
    ) -> Self {
        Self {
            backend,
            chain,
            key_prefix: config.key_prefix.clone(),
            cache_ttl: config.cache_ttl(),
            lock_wait: config.lock_wait(),
            lock_hold: config.lock_hold(),
            lock_retry_interval: config.lock_retry_interval(),
        }
    }

    fn cache_key(&self, address: Address) -> String {
        format!("{}:nonce:{}:{:?}", self.key_prefix, self.chain.chain_id(), address)
    }

    fn lock_key(&self, address: Address) -> String {
        format!("{}:lock:nonce:{}:{:?}", self.key_prefix, self.chain.chain_id(), address)
    }

    /// PING the coordination service, bounded by the lock wait
    pub async fn ping(&self) -> SubmitResult<()> {
        match timeout(self.lock_wait, self.backend.ping()).await {
            Ok(result) => result,
            Err(_) => Err(SubmitError::StoreUnavailable(format!(
                "no PING reply within {:?}",
                self.lock_wait
            ))),
        }
    }

    /// Cached next nonce for `address`, read without the lock
    pub async fn cached_next(&self, address: Address) -> SubmitResult<Option<u64>> {
        self.backend.get_u64(&self.cache_key(address)).await
    }

    /// Run `work` while holding the address lock, bounded by the hold time.
    ///
    /// The lock is released on success, on error and on hold timeout; if the
    /// caller's future is dropped mid-way the guard's drop releases it.
    async fn with_lock<T, F, Fut>(&self, address: Address, work: F) -> SubmitResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = SubmitResult<T>>,
    {
        let guard = LockGuard::acquire(
            self.backend.clone(),
            self.lock_key(address),
            self.lock_wait,
            self.lock_hold,
            self.lock_retry_interval,
        )
        .await?;
        let lock_name = guard.name().to_string();

        let result = timeout(self.lock_hold, work()).await;

        match timeout(self.lock_wait, guard.release()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Failed to release {}: {}", lock_name, e),
            Err(_) => warn!("Release of {} timed out; it expires on its own", lock_name),
        }

        match result {
            Ok(inner) => inner,
            Err(_) => Err(SubmitError::LockTimeout {
                lock: lock_name,
                operation: "hold".to_string(),
            }),
        }
    }

    async fn allocate(&self, address: Address) -> SubmitResult<u64> {
        let key = self.cache_key(address);

        let pending = self.chain.pending_nonce(address).await?;
        let cached = self.backend.get_u64(&key).await?;
        let nonce = cached.map_or(pending, |c| c.max(pending));

        self.backend
            .set_u64_with_expiry(&key, nonce + 1, self.cache_ttl)
            .await?;

        debug!(
            "Allocated nonce {} for {:?} (pending {}, cached {:?})",
            nonce, address, pending, cached
        );
        Ok(nonce)
    }
}

#[async_trait]
impl NonceStore for DistributedNonceStore {
    fn active_kind(&self) -> StoreKind {
        StoreKind::Distributed
    }

    async fn reserve(&self, address: Address) -> SubmitResult<NonceReservation> {
        let nonce = self.with_lock(address, || self.allocate(address)).await?;
        let lease = chrono::Duration::from_std(self.cache_ttl).ok();

        Ok(NonceReservation {
            address,
            nonce,
            store: StoreKind::Distributed,
            lease_expires_at: lease.map(|ttl| Utc::now() + ttl),
        })
    }

    async fn release(&self, address: Address, nonce: u64) -> SubmitResult<bool> {
        let key = self.cache_key(address);
        self.with_lock(address, || async {
            match self.backend.get_u64(&key).await? {
                Some(cached) if cached == nonce + 1 => {
                    self.backend
                        .set_u64_with_expiry(&key, nonce, self.cache_ttl)
                        .await?;
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
        .await
    }
}
