//! Fee-market transaction assembly

use super::gas::GasQuote;
use crate::chain::ChainClient;
use crate::config::SenderConfig;

use ethers::prelude::*;
use ethers::types::transaction::eip2718::TypedTransaction;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// What the caller wants executed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallParams {
    pub to: Address,
    #[serde(default)]
    pub data: Bytes,
    #[serde(default)]
    pub value: U256,
}

/// Assembles EIP-1559 transactions with a buffered gas limit
pub struct TxBuilder {
    chain: Arc<dyn ChainClient>,
    /// Buffer percentage for gas limit (e.g., 20 = 20% buffer)
    gas_limit_buffer_percent: u64,
    /// Used when estimation fails
    fallback_gas_limit: U256,
}

impl TxBuilder {
    pub fn new(chain: Arc<dyn ChainClient>, config: &SenderConfig) -> Self {
        Self {
            chain,
            gas_limit_buffer_percent: config.gas_limit_buffer_percent,
            fallback_gas_limit: U256::from(config.fallback_gas_limit),
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.chain.chain_id()
    }

    /// Build an unsigned transaction. Always succeeds; estimation failures
    /// fall back to the fixed limit.
    pub async fn build(
        &self,
        from: Address,
        call: &CallParams,
        nonce: u64,
        quote: &GasQuote,
    ) -> TypedTransaction {
        let mut tx: TypedTransaction = Eip1559TransactionRequest::new()
            .from(from)
            .to(call.to)
            .data(call.data.clone())
            .value(call.value)
            .nonce(nonce)
            .chain_id(self.chain.chain_id())
            .max_fee_per_gas(quote.max_fee_per_gas)
            .max_priority_fee_per_gas(quote.max_priority_fee_per_gas)
            .into();

        let gas_limit = self.gas_limit(&tx).await;
        tx.set_gas(gas_limit);

        debug!(
            "Built tx from {:?} to {:?}: nonce {}, gas {}, max fee {}",
            from, call.to, nonce, gas_limit, quote.max_fee_per_gas
        );
        tx
    }

    async fn gas_limit(&self, tx: &TypedTransaction) -> U256 {
        match self.chain.estimate_gas(tx).await {
            Ok(estimate) => {
                let buffer = estimate.saturating_mul(U256::from(self.gas_limit_buffer_percent)) / 100;
                estimate.saturating_add(buffer)
            }
            Err(e) => {
                warn!(
                    "Gas estimation failed, using fallback limit {}: {}",
                    self.fallback_gas_limit, e
                );
                self.fallback_gas_limit
            }
        }
    }
}

/// Copy of `tx` carrying new fee fields; nonce, gas and payload are unchanged
pub fn with_fees(tx: &TypedTransaction, quote: &GasQuote) -> TypedTransaction {
    let mut request = Eip1559TransactionRequest::new();
    if let Some(from) = tx.from() {
        request = request.from(*from);
    }
    if let Some(NameOrAddress::Address(to)) = tx.to() {
        request = request.to(*to);
    }
    if let Some(data) = tx.data() {
        request = request.data(data.clone());
    }
    if let Some(value) = tx.value() {
        request = request.value(*value);
    }
    if let Some(nonce) = tx.nonce() {
        request = request.nonce(*nonce);
    }
    if let Some(gas) = tx.gas() {
        request = request.gas(*gas);
    }
    if let Some(chain_id) = tx.chain_id() {
        request = request.chain_id(chain_id);
    }

    request
        .max_fee_per_gas(quote.max_fee_per_gas)
        .max_priority_fee_per_gas(quote.max_priority_fee_per_gas)
        .into()
}

/// Fee fields of an EIP-1559 transaction
pub fn fees_of(tx: &TypedTransaction) -> Option<GasQuote> {
    match tx {
        TypedTransaction::Eip1559(inner) => Some(GasQuote {
            max_fee_per_gas: inner.max_fee_per_gas?,
            max_priority_fee_per_gas: inner.max_priority_fee_per_gas?,
            source: super::gas::QuoteSource::FeeMarket,
        }),
        _ => None,
    }
}
