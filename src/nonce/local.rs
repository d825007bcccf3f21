//! In-process nonce store
//!
//! Correct only within one process. Used for tests, single-instance
//! deployments and as the hybrid store's fallback.

use super::{NonceReservation, NonceStore, StoreKind};
use crate::chain::ChainClient;
use crate::error::SubmitResult;

use async_trait::async_trait;
use dashmap::DashMap;
use ethers::types::Address;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Per-address counters, each behind its own lock
pub struct InProcessNonceStore {
    /// Authoritative pending-nonce view; without it counters start at zero
    chain: Option<Arc<dyn ChainClient>>,
    /// Next nonce to hand out, per address
    counters: DashMap<Address, Arc<Mutex<u64>>>,
}

impl InProcessNonceStore {
    /// Counters seeded from zero
    pub fn new() -> Self {
        Self {
            chain: None,
            counters: DashMap::new(),
        }
    }

    /// Counters that never fall below the chain's pending nonce
    pub fn with_chain(chain: Arc<dyn ChainClient>) -> Self {
        Self {
            chain: Some(chain),
            counters: DashMap::new(),
        }
    }

    fn slot(&self, address: Address) -> Arc<Mutex<u64>> {
        self.counters
            .entry(address)
            .or_insert_with(|| Arc::new(Mutex::new(0)))
            .clone()
    }

    /// Raise the counter for `address` to at least `floor`
    pub async fn sync_floor(&self, address: Address, floor: u64) {
        let slot = self.slot(address);
        let mut next = slot.lock().await;
        if *next < floor {
            debug!("Raising local nonce for {:?} from {} to {}", address, *next, floor);
            *next = floor;
        }
    }

    /// Next nonce that would be issued, if the address has been seen
    #[cfg(test)]
    pub async fn peek(&self, address: Address) -> Option<u64> {
        let slot = self.counters.get(&address).map(|s| s.clone())?;
        let next = *slot.lock().await;
        Some(next)
    }
}

impl Default for InProcessNonceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NonceStore for InProcessNonceStore {
    fn active_kind(&self) -> StoreKind {
        StoreKind::InProcess
    }

    async fn reserve(&self, address: Address) -> SubmitResult<NonceReservation> {
        let slot = self.slot(address);
        let mut next = slot.lock().await;

        if let Some(chain) = &self.chain {
            let pending = chain.pending_nonce(address).await?;
            if pending > *next {
                debug!(
                    "Local nonce for {:?} behind chain ({} < {}), resyncing",
                    address, *next, pending
                );
                *next = pending;
            }
        }

        let nonce = *next;
        *next += 1;

        Ok(NonceReservation {
            address,
            nonce,
            store: StoreKind::InProcess,
            lease_expires_at: None,
        })
    }

    async fn release(&self, address: Address, nonce: u64) -> SubmitResult<bool> {
        let slot = self.slot(address);
        let mut next = slot.lock().await;

        if *next == nonce + 1 {
            *next = nonce;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}
