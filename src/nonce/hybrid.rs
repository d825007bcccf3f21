//! Hybrid nonce store: distributed first, in-process once the store is unhealthy

use super::distributed::DistributedNonceStore;
use super::local::InProcessNonceStore;
use super::{NonceReservation, NonceStore, StoreKind};
use crate::chain::ChainClient;
use crate::error::{SubmitError, SubmitResult};

use async_trait::async_trait;
use dashmap::DashMap;
use ethers::types::Address;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, warn};

/// Routes to the distributed store until a health check fails, then stays local
pub struct HybridNonceStore {
    distributed: DistributedNonceStore,
    local: InProcessNonceStore,
    /// Next nonce after the last distributed reservation, per address
    issued: DashMap<Address, u64>,
    /// Sticky for the life of the process
    degraded: AtomicBool,
}

impl HybridNonceStore {
    pub fn new(distributed: DistributedNonceStore, chain: Arc<dyn ChainClient>) -> Self {
        Self {
            distributed,
            local: InProcessNonceStore::with_chain(chain),
            issued: DashMap::new(),
            degraded: AtomicBool::new(false),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    fn enter_degraded(&self, cause: &SubmitError) {
        if !self.degraded.swap(true, Ordering::AcqRel) {
            error!(
                "Distributed nonce store unavailable ({}), running in degraded in-process mode",
                cause
            );
            crate::metrics::record_store_fallback();
        }
    }

    async fn reserve_distributed(&self, address: Address) -> SubmitResult<NonceReservation> {
        self.distributed.ping().await?;
        let reservation = self.distributed.reserve(address).await?;
        self.issued.insert(address, reservation.nonce + 1);
        Ok(reservation)
    }
}

#[async_trait]
impl NonceStore for HybridNonceStore {
    fn active_kind(&self) -> StoreKind {
        if self.is_degraded() {
            StoreKind::InProcess
        } else {
            StoreKind::Distributed
        }
    }

    async fn reserve(&self, address: Address) -> SubmitResult<NonceReservation> {
        if !self.is_degraded() {
            match self.reserve_distributed(address).await {
                Ok(reservation) => return Ok(reservation),
                // Contention and chain errors say nothing about store health.
                Err(e) if !e.is_store_failure() => return Err(e),
                Err(e) => self.enter_degraded(&e),
            }
        }

        // Nonces this process took from the distributed store may not be
        // pending on chain yet, so the local counter starts above them. The
        // local store also reads the pending nonce under its lock.
        if let Some(next) = self.issued.get(&address).map(|n| *n) {
            self.local.sync_floor(address, next).await;
        }
        self.local.reserve(address).await
    }

    async fn release(&self, address: Address, nonce: u64) -> SubmitResult<bool> {
        if self.is_degraded() {
            return self.local.release(address, nonce).await;
        }

        match self.distributed.release(address, nonce).await {
            Ok(true) => {
                self.issued.alter(&address, |_, next| if next == nonce + 1 { nonce } else { next });
                Ok(true)
            }
            Err(e) if e.is_store_failure() => {
                warn!("Release of nonce {} for {:?} skipped: {}", nonce, address, e);
                self.enter_degraded(&e);
                Ok(false)
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NonceConfig;
    use crate::testing::{FakeChain, MemoryBackend};

    fn hybrid(chain: Arc<FakeChain>, backend: Arc<MemoryBackend>) -> HybridNonceStore {
        let config = NonceConfig {
            lock_retry_interval_ms: 1,
            ..NonceConfig::default()
        };
        let distributed = DistributedNonceStore::new(backend, chain.clone(), &config);
        HybridNonceStore::new(distributed, chain)
    }

    #[tokio::test]
    async fn test_healthy_store_uses_distributed_path() {
        let chain = Arc::new(FakeChain::new(1));
        let backend = Arc::new(MemoryBackend::new());
        let addr = Address::random();
        let store = hybrid(chain, backend);

        let r = store.reserve(addr).await.unwrap();
        assert_eq!(r.store, StoreKind::Distributed);
        assert!(!store.is_degraded());
    }

    #[tokio::test]
    async fn test_ping_failure_falls_back_without_regressing() {
        let chain = Arc::new(FakeChain::new(1));
        let backend = Arc::new(MemoryBackend::new());
        let addr = Address::random();
        chain.set_pending_nonce(addr, 5);
        let store = hybrid(chain.clone(), backend.clone());

        assert_eq!(store.reserve(addr).await.unwrap().nonce, 5);
        assert_eq!(store.reserve(addr).await.unwrap().nonce, 6);

        // Two transactions now pending on chain; the store goes away.
        chain.set_pending_nonce(addr, 7);
        backend.set_available(false);

        let r = store.reserve(addr).await.unwrap();
        assert!(store.is_degraded());
        assert_eq!(r.store, StoreKind::InProcess);
        assert!(r.nonce >= 7);
        assert_eq!(store.reserve(addr).await.unwrap().nonce, r.nonce + 1);
    }

    #[tokio::test]
    async fn test_fallback_starts_above_unbroadcast_reservations() {
        let chain = Arc::new(FakeChain::new(1));
        let backend = Arc::new(MemoryBackend::new());
        let addr = Address::random();
        chain.set_pending_nonce(addr, 5);
        let store = hybrid(chain, backend.clone());

        assert_eq!(store.reserve(addr).await.unwrap().nonce, 5);
        assert_eq!(store.reserve(addr).await.unwrap().nonce, 6);

        // Neither transaction has reached the chain; pending is still 5.
        backend.set_available(false);
        let r = store.reserve(addr).await.unwrap();
        assert_eq!(r.store, StoreKind::InProcess);
        assert_eq!(r.nonce, 7);
    }

    #[tokio::test]
    async fn test_hung_store_triggers_fallback() {
        let chain = Arc::new(FakeChain::new(1));
        let backend = Arc::new(MemoryBackend::new());
        let addr = Address::random();
        let config = NonceConfig {
            lock_wait_ms: 20,
            lock_retry_interval_ms: 1,
            ..NonceConfig::default()
        };
        let distributed = DistributedNonceStore::new(backend.clone(), chain.clone(), &config);
        let store = HybridNonceStore::new(distributed, chain);

        backend.set_hanging(true);
        let r = tokio::time::timeout(std::time::Duration::from_secs(2), store.reserve(addr))
            .await
            .expect("reserve must not block on a hung store")
            .unwrap();

        assert!(store.is_degraded());
        assert_eq!(r.store, StoreKind::InProcess);
    }

    #[tokio::test]
    async fn test_degraded_flag_is_sticky() {
        let chain = Arc::new(FakeChain::new(1));
        let backend = Arc::new(MemoryBackend::new());
        let addr = Address::random();
        let store = hybrid(chain, backend.clone());

        backend.set_available(false);
        store.reserve(addr).await.unwrap();
        backend.set_available(true);

        assert_eq!(store.reserve(addr).await.unwrap().store, StoreKind::InProcess);
        assert_eq!(store.active_kind(), StoreKind::InProcess);
    }

    #[tokio::test]
    async fn test_chain_failure_does_not_trigger_fallback() {
        let chain = Arc::new(FakeChain::new(1));
        let backend = Arc::new(MemoryBackend::new());
        let store = hybrid(chain.clone(), backend);

        chain.fail_pending_nonce(true);
        let err = store.reserve(Address::random()).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(!store.is_degraded());
    }

    #[tokio::test]
    async fn test_release_routes_to_active_store() {
        let chain = Arc::new(FakeChain::new(1));
        let backend = Arc::new(MemoryBackend::new());
        let addr = Address::random();
        let store = hybrid(chain, backend.clone());

        let r = store.reserve(addr).await.unwrap();
        assert!(store.release(addr, r.nonce).await.unwrap());

        backend.set_available(false);
        let r = store.reserve(addr).await.unwrap();
        assert!(store.release(addr, r.nonce).await.unwrap());
        assert!(!store.release(addr, r.nonce + 5).await.unwrap());
    }
}
