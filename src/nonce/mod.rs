//! Nonce coordination for concurrent and distributed callers
//!
//! Handles:
//! - Per-address nonce allocation behind a pluggable store
//! - Cross-process mutual exclusion through a distributed lock
//! - Degraded-mode fallback to in-process allocation
//! - Conservative release of the most recently issued nonce

mod distributed;
mod hybrid;
mod local;
pub mod lock;
mod manager;

pub use distributed::DistributedNonceStore;
pub use hybrid::HybridNonceStore;
pub use local::InProcessNonceStore;
pub use lock::{CoordinationBackend, RedisBackend};
pub use manager::NonceManager;

use crate::error::SubmitResult;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::Address;
use serde::Serialize;
use std::fmt;

/// Which store issued a nonce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    InProcess,
    Distributed,
}

impl StoreKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreKind::InProcess => "in_process",
            StoreKind::Distributed => "distributed",
        }
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A nonce handed out for one address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonceReservation {
    pub address: Address,
    pub nonce: u64,
    pub store: StoreKind,
    /// When the cached counter backing this reservation expires, if it has a TTL
    pub lease_expires_at: Option<DateTime<Utc>>,
}

/// Storage and locking strategy for per-address nonce allocation
#[async_trait]
pub trait NonceStore: Send + Sync {
    /// Store currently answering reservations
    fn active_kind(&self) -> StoreKind;

    /// Allocate the next nonce for `address`
    async fn reserve(&self, address: Address) -> SubmitResult<NonceReservation>;

    /// Rewind the counter if `nonce` is the last value issued; returns whether it rewound
    async fn release(&self, address: Address, nonce: u64) -> SubmitResult<bool>;
}
