//! Nonce manager: the single entry point for reserving and releasing nonces

use super::{NonceReservation, NonceStore, StoreKind};
use crate::error::SubmitResult;

use ethers::types::Address;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Hands out nonce reservations from the configured store
pub struct NonceManager {
    store: Arc<dyn NonceStore>,
}

impl NonceManager {
    pub fn new(store: Arc<dyn NonceStore>) -> Self {
        Self { store }
    }

    /// Store currently answering reservations
    pub fn active_store(&self) -> StoreKind {
        self.store.active_kind()
    }

    /// Reserve the next nonce for `address`.
    ///
    /// A reservation that is never sent is not rolled back automatically;
    /// callers that fail before reaching the node may call [`release`].
    ///
    /// [`release`]: NonceManager::release
    pub async fn reserve(&self, address: Address) -> SubmitResult<NonceReservation> {
        let reservation = self.store.reserve(address).await.map_err(|e| {
            warn!("Nonce reservation for {:?} failed: {}", address, e);
            e
        })?;

        crate::metrics::record_nonce_reserved(reservation.store);
        debug!(
            "Reserved nonce {} for {:?} via {}",
            reservation.nonce, reservation.address, reservation.store
        );
        Ok(reservation)
    }

    /// Best-effort release.
    ///
    /// Rewinds only when `nonce` is the most recently issued value; any other
    /// value is a silent no-op so a concurrently issued nonce is never reused.
    pub async fn release(&self, address: Address, nonce: u64) -> bool {
        match self.store.release(address, nonce).await {
            Ok(true) => {
                info!("Released nonce {} for {:?}", nonce, address);
                true
            }
            Ok(false) => {
                debug!("Release of nonce {} for {:?} was a no-op", nonce, address);
                false
            }
            Err(e) => {
                warn!("Release of nonce {} for {:?} failed: {}", nonce, address, e);
                false
            }
        }
    }
}
