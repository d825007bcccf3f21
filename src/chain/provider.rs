//! Chain provider with multi-RPC support and automatic failover

use super::{ChainClient, ReceiptStatus};
use crate::config::ChainConfig;
use crate::error::{SubmitError, SubmitResult};

use async_trait::async_trait;
use ethers::abi::{self, ParamType, Token};
use ethers::prelude::*;
use ethers::providers::{Http, Provider, ProviderError, RpcError};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, warn};

/// `Error(string)` selector
const ERROR_STRING_SELECTOR: [u8; 4] = [0x08, 0xc3, 0x79, 0xa0];
/// `Panic(uint256)` selector
const PANIC_SELECTOR: [u8; 4] = [0x4e, 0x48, 0x7b, 0x71];

/// Multi-provider wrapper with automatic failover
pub struct ChainProvider {
    /// Chain configuration
    config: ChainConfig,
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
    /// Per-request timeout
    request_timeout: Duration,
}

impl ChainProvider {
    /// Create a new chain provider
    pub fn new(config: ChainConfig) -> SubmitResult<Self> {
        let mut http_providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(Duration::from_millis(100));
                    http_providers.push(provider);
                    debug!("Added HTTP provider for chain {}: {}", config.chain_id, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(SubmitError::Config(format!(
                "No valid RPC providers for chain {}",
                config.chain_id
            )));
        }

        let request_timeout = Duration::from_secs(config.request_timeout_secs.max(1));

        Ok(Self {
            config,
            http_providers,
            current_provider: AtomicUsize::new(0),
            request_timeout,
        })
    }

    /// Get the active HTTP provider
    pub fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    pub fn failover(&self) {
        if self.http_providers.len() < 2 {
            return;
        }
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to provider {}", self.config.chain_id, next);
    }

    /// Run a request against each provider in turn until one answers.
    ///
    /// Only transient failures rotate providers; a definitive node answer
    /// (rejection, revert) is returned immediately.
    async fn with_failover<T, F, Fut>(&self, operation: &str, request: F) -> SubmitResult<T>
    where
        F: Fn(Provider<Http>) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let chain_id = self.config.chain_id;
        let mut last_error = None;

        for _ in 0..self.http_providers.len() {
            match timeout(self.request_timeout, request(self.http().clone())).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => {
                    let classified = classify_provider_error(chain_id, &e);
                    if !classified.is_retryable() {
                        return Err(classified);
                    }
                    warn!("{} failed on chain {}: {}", operation, chain_id, e);
                    last_error = Some(classified);
                }
                Err(_) => {
                    warn!("{} timed out on chain {}", operation, chain_id);
                    last_error = Some(SubmitError::TransientRpc {
                        chain_id,
                        message: format!("{} timed out", operation),
                    });
                }
            }
            self.failover();
        }

        Err(last_error.unwrap_or_else(|| SubmitError::TransientRpc {
            chain_id,
            message: format!("All providers failed: {}", operation),
        }))
    }
}

#[async_trait]
impl ChainClient for ChainProvider {
    fn chain_id(&self) -> u64 {
        self.config.chain_id
    }

    async fn pending_nonce(&self, address: Address) -> SubmitResult<u64> {
        let count = self
            .with_failover("eth_getTransactionCount", |p| async move {
                p.get_transaction_count(address, Some(BlockNumber::Pending.into()))
                    .await
            })
            .await?;
        Ok(count.as_u64())
    }

    async fn latest_base_fee(&self) -> SubmitResult<Option<U256>> {
        let block = self
            .with_failover("eth_getBlockByNumber", |p| async move {
                p.get_block(BlockNumber::Latest).await
            })
            .await?
            .ok_or_else(|| SubmitError::TransientRpc {
                chain_id: self.config.chain_id,
                message: "No latest block".to_string(),
            })?;

        Ok(block.base_fee_per_gas)
    }

    async fn gas_price(&self) -> SubmitResult<U256> {
        self.with_failover("eth_gasPrice", |p| async move { p.get_gas_price().await })
            .await
    }

    async fn estimate_gas(&self, tx: &TypedTransaction) -> SubmitResult<U256> {
        self.with_failover("eth_estimateGas", |p| {
            let tx = tx.clone();
            async move { p.estimate_gas(&tx, None).await }
        })
        .await
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> SubmitResult<H256> {
        self.with_failover("eth_sendRawTransaction", |p| {
            let raw = raw.clone();
            async move {
                let pending = p.send_raw_transaction(raw).await?;
                Ok(pending.tx_hash())
            }
        })
        .await
    }

    async fn transaction_receipt(&self, tx_hash: H256) -> SubmitResult<Option<ReceiptStatus>> {
        let receipt = self
            .with_failover("eth_getTransactionReceipt", |p| async move {
                p.get_transaction_receipt(tx_hash).await
            })
            .await?;

        Ok(receipt.and_then(|r| {
            r.block_number.map(|block| ReceiptStatus {
                block_number: block.as_u64(),
                success: r.status == Some(1u64.into()),
            })
        }))
    }

    async fn revert_reason(&self, tx_hash: H256) -> SubmitResult<Option<String>> {
        let tx = match self
            .with_failover("eth_getTransactionByHash", |p| async move {
                p.get_transaction(tx_hash).await
            })
            .await?
        {
            Some(tx) => tx,
            None => return Ok(None),
        };
        let Some(block) = tx.block_number else {
            return Ok(None);
        };

        let mut call = Eip1559TransactionRequest::new()
            .from(tx.from)
            .data(tx.input.clone())
            .value(tx.value)
            .gas(tx.gas);
        if let Some(to) = tx.to {
            call = call.to(to);
        }
        let call: TypedTransaction = call.into();
        let at = BlockId::Number(BlockNumber::Number(block.saturating_sub(1.into())));

        match self.http().call(&call, Some(at)).await {
            Ok(_) => Ok(None),
            Err(e) => Ok(revert_reason_from_error(&e)),
        }
    }

    async fn health_check(&self) -> bool {
        match self
            .with_failover("eth_blockNumber", |p| async move { p.get_block_number().await })
            .await
        {
            Ok(_) => true,
            Err(e) => {
                error!("Health check failed for chain {}: {}", self.config.chain_id, e);
                false
            }
        }
    }
}

/// Map a node error onto the submission error taxonomy.
///
/// Unknown failures are treated as transient so the sender's backoff loop
/// gets a chance at them.
pub fn classify_provider_error(chain_id: u64, err: &ProviderError) -> SubmitError {
    let rpc_message = RpcError::as_error_response(err)
        .map(|e| e.message.clone())
        .unwrap_or_else(|| err.to_string());
    classify_node_message(chain_id, &rpc_message, revert_reason_from_error(err))
}

fn classify_node_message(chain_id: u64, message: &str, revert: Option<String>) -> SubmitError {
    let lower = message.to_lowercase();

    if lower.contains("already known") || lower.contains("known transaction") {
        SubmitError::AlreadyKnown
    } else if lower.contains("nonce too low") {
        SubmitError::NonceTooLow(message.to_string())
    } else if lower.contains("insufficient funds") {
        SubmitError::InsufficientFunds(message.to_string())
    } else if lower.contains("execution reverted") {
        SubmitError::Reverted {
            tx_hash: None,
            reason: revert.or_else(|| {
                lower
                    .split_once("execution reverted:")
                    .map(|(_, reason)| reason.trim().to_string())
            }),
        }
    } else if lower.contains("underpriced")
        || lower.contains("fee cap less than block base fee")
        || lower.contains("max fee per gas less than block base fee")
        || lower.contains("intrinsic gas too low")
        || lower.contains("exceeds block gas limit")
        || lower.contains("invalid sender")
    {
        SubmitError::Rejected(message.to_string())
    } else {
        SubmitError::TransientRpc {
            chain_id,
            message: message.to_string(),
        }
    }
}

fn revert_reason_from_error(err: &ProviderError) -> Option<String> {
    let response = RpcError::as_error_response(err)?;
    if let Some(data) = response.as_revert_data() {
        if let Some(reason) = decode_revert_reason(&data[..]) {
            return Some(reason);
        }
    }
    response
        .message
        .split_once("execution reverted:")
        .map(|(_, reason)| reason.trim().to_string())
}

/// Decode `Error(string)` and `Panic(uint256)` revert payloads
pub fn decode_revert_reason(data: &[u8]) -> Option<String> {
    if data.len() < 4 {
        return None;
    }
    let (selector, payload) = data.split_at(4);

    if selector == ERROR_STRING_SELECTOR {
        match abi::decode(&[ParamType::String], payload).ok()?.pop()? {
            Token::String(reason) => Some(reason),
            _ => None,
        }
    } else if selector == PANIC_SELECTOR {
        match abi::decode(&[ParamType::Uint(256)], payload).ok()?.pop()? {
            Token::Uint(code) => Some(format!("panic code {:#x}", code)),
            _ => None,
        }
    } else {
        Some(format!("custom error 0x{}", hex::encode(selector)))
    }
}
