//! Chain module - the narrow RPC surface the submission core consumes
//!
//! This module provides:
//! - The `ChainClient` seam (pending nonce, base fee, gas estimation, raw submission)
//! - An ethers-backed provider with multi-RPC failover
//! - Classification of node error messages into typed errors

pub mod provider;

pub use provider::ChainProvider;

use crate::error::SubmitResult;

use async_trait::async_trait;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, H256, U256};

/// Outcome of a mined transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiptStatus {
    pub block_number: u64,
    pub success: bool,
}

/// Chain RPC operations used by nonce stores, gas policy, builder, signers and sender
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Chain ID this client talks to
    fn chain_id(&self) -> u64;

    /// Transaction count for `address` including pending transactions
    async fn pending_nonce(&self, address: Address) -> SubmitResult<u64>;

    /// Base fee of the latest block; `None` on chains without EIP-1559
    async fn latest_base_fee(&self) -> SubmitResult<Option<U256>>;

    /// Legacy gas price
    async fn gas_price(&self) -> SubmitResult<U256>;

    /// Estimate gas for a transaction
    async fn estimate_gas(&self, tx: &TypedTransaction) -> SubmitResult<U256>;

    /// Submit a signed, RLP-encoded transaction
    async fn send_raw_transaction(&self, raw: Bytes) -> SubmitResult<H256>;

    /// Receipt status, `None` while the transaction is not mined
    async fn transaction_receipt(&self, tx_hash: H256) -> SubmitResult<Option<ReceiptStatus>>;

    /// Best-effort revert reason for a mined, failed transaction
    async fn revert_reason(&self, tx_hash: H256) -> SubmitResult<Option<String>>;

    /// Liveness check
    async fn health_check(&self) -> bool;
}
