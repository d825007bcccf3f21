//! Transaction sender with idempotent, retrying submission and receipt tracking

use super::builder::{fees_of, with_fees};
use super::gas::{GasPolicy, GasQuote};
use crate::chain::ChainClient;
use crate::config::SenderConfig;
use crate::error::{SubmitError, SubmitResult};
use crate::signer::{SignedTransaction, TransactionSigner};
use crate::state::{ClaimedPayload, IntentStatus, IntentStore};

use dashmap::DashMap;
use ethers::types::H256;
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Result of a send for one request id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "tx_hash", rename_all = "snake_case")]
pub enum SendOutcome {
    /// Submitted by this call
    Sent(H256),
    /// A hash was already on record; nothing was submitted
    AlreadySent(H256),
}

impl SendOutcome {
    pub fn tx_hash(&self) -> H256 {
        match self {
            SendOutcome::Sent(hash) | SendOutcome::AlreadySent(hash) => *hash,
        }
    }

    pub fn is_replay(&self) -> bool {
        matches!(self, SendOutcome::AlreadySent(_))
    }
}

/// A fee-bumped replacement and how its send went
#[derive(Debug, Clone)]
pub struct Replacement {
    pub signed: SignedTransaction,
    pub quote: GasQuote,
    pub outcome: SendOutcome,
}

/// Transaction sender enforcing at most one transaction hash per request id
pub struct TransactionSender {
    chain: Arc<dyn ChainClient>,
    intents: Arc<dyn IntentStore>,
    /// Serialises same-id sends inside this process
    in_flight: DashMap<String, Arc<Mutex<()>>>,
    send_timeout: Duration,
    receipt_poll_interval: Duration,
    receipt_timeout: Duration,
}

impl TransactionSender {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        intents: Arc<dyn IntentStore>,
        config: &SenderConfig,
    ) -> Self {
        Self {
            chain,
            intents,
            in_flight: DashMap::new(),
            send_timeout: Duration::from_secs(config.send_timeout_secs.max(1)),
            receipt_poll_interval: Duration::from_millis(config.receipt_poll_interval_ms.max(1)),
            receipt_timeout: Duration::from_secs(config.receipt_timeout_secs),
        }
    }

    /// Send `signed` under `request_id`.
    ///
    /// If the id already has a hash on record, that hash is returned and
    /// nothing is submitted. Otherwise transient failures are retried up to
    /// `max_retries` times with exponential backoff and jitter, and the hash
    /// is recorded before returning. The last error propagates on exhaustion.
    pub async fn send_with_retry(
        &self,
        signed: &SignedTransaction,
        request_id: &str,
        max_retries: u32,
        base_backoff: Duration,
    ) -> SubmitResult<SendOutcome> {
        let lock = self
            .in_flight
            .entry(request_id.to_string())
            .or_default()
            .clone();

        let result = {
            let _guard = lock.lock().await;
            self.send_locked(signed, request_id, max_retries, base_backoff)
                .await
        };

        drop(lock);
        self.in_flight
            .remove_if(request_id, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    async fn send_locked(
        &self,
        signed: &SignedTransaction,
        request_id: &str,
        max_retries: u32,
        base_backoff: Duration,
    ) -> SubmitResult<SendOutcome> {
        let chain_id = self.chain.chain_id();
        let intent = self.intents.begin(request_id).await?;

        if let Some(hash) = intent.tx_hash {
            info!("Request {} already sent as {:?}, not resubmitting", request_id, hash);
            crate::metrics::record_tx_replayed(chain_id);
            return Ok(SendOutcome::AlreadySent(hash));
        }
        if intent.status == IntentStatus::Failed {
            return Err(SubmitError::IntentClosed {
                request_id: request_id.to_string(),
                status: intent.status.to_string(),
            });
        }

        let nonce = signed
            .nonce()
            .ok_or_else(|| SubmitError::Internal("signed transaction has no nonce".into()))?;
        let resuming = intent.payload.is_some();

        // Bind the payload before anything reaches the node. Whoever claimed
        // first decides the bytes; everyone else resends those.
        let claimed = self
            .intents
            .claim(
                request_id,
                ClaimedPayload {
                    tx_hash: signed.hash,
                    nonce,
                    raw: signed.raw.clone(),
                },
            )
            .await?;
        let replay = claimed.tx_hash != signed.hash;
        let restored;
        let payload = if replay {
            info!(
                "Request {} already claimed by {:?}, resending that payload instead of {:?}",
                request_id, claimed.tx_hash, signed.hash
            );
            restored = SignedTransaction::from_raw(claimed.raw.clone())?;
            &restored
        } else {
            signed
        };

        let max_attempts = max_retries.saturating_add(1);
        let started = Instant::now();
        let mut attempt = 0;

        loop {
            attempt += 1;

            let result = match self.submit_once(payload).await {
                Err(SubmitError::NonceTooLow(message)) if resuming || replay => {
                    self.already_mined(payload, message).await
                }
                other => other,
            };

            match result {
                Ok(_) => {
                    let recorded = self
                        .intents
                        .record_sent(request_id, payload.hash, claimed.nonce)
                        .await?;
                    if recorded != payload.hash {
                        error!(
                            "Request {} is recorded as {:?} but {:?} was sent",
                            request_id, recorded, payload.hash
                        );
                        return Err(SubmitError::HashConflict {
                            request_id: request_id.to_string(),
                            recorded,
                            sent: payload.hash,
                        });
                    }

                    info!(
                        "Request {} sent as {:?} with nonce {} (attempt {}/{})",
                        request_id, recorded, claimed.nonce, attempt, max_attempts
                    );
                    if replay {
                        crate::metrics::record_tx_replayed(chain_id);
                        return Ok(SendOutcome::AlreadySent(recorded));
                    }
                    crate::metrics::record_tx_submitted(chain_id);
                    crate::metrics::record_send_latency(chain_id, started.elapsed().as_secs_f64());
                    return Ok(SendOutcome::Sent(recorded));
                }
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    warn!(
                        "Send for request {} failed (attempt {}/{}): {}",
                        request_id, attempt, max_attempts, e
                    );
                    if let Err(store_err) = self.intents.record_attempt(request_id, &e.to_string()).await {
                        warn!("Could not record attempt for {}: {}", request_id, store_err);
                    }
                    crate::metrics::record_tx_retry(chain_id);
                    tokio::time::sleep(backoff_delay(base_backoff, attempt)).await;
                }
                Err(e) => {
                    error!(
                        "Send for request {} failed after {} attempt(s): {}",
                        request_id, attempt, e
                    );
                    if let Err(store_err) = self.intents.record_attempt(request_id, &e.to_string()).await {
                        warn!("Could not record attempt for {}: {}", request_id, store_err);
                    }
                    if let Err(store_err) = self.intents.mark_failed(request_id, &e.to_string()).await {
                        warn!("Could not mark {} failed: {}", request_id, store_err);
                    }
                    crate::metrics::record_tx_failed(chain_id, failure_label(&e));
                    return Err(e);
                }
            }
        }
    }

    /// A resent payload whose nonce is used up may simply be mined already
    async fn already_mined(&self, payload: &SignedTransaction, message: String) -> SubmitResult<H256> {
        match self.chain.transaction_receipt(payload.hash).await? {
            Some(receipt) => {
                debug!(
                    "Payload {:?} already mined in block {}",
                    payload.hash, receipt.block_number
                );
                Ok(payload.hash)
            }
            None => Err(SubmitError::NonceTooLow(message)),
        }
    }

    /// One submission with a timeout. A node that already holds these exact
    /// bytes counts as success.
    async fn submit_once(&self, signed: &SignedTransaction) -> SubmitResult<H256> {
        let result = timeout(
            self.send_timeout,
            self.chain.send_raw_transaction(signed.raw.clone()),
        )
        .await;

        match result {
            Ok(Ok(hash)) => {
                if hash != signed.hash {
                    warn!("Node returned {:?}, computed {:?}", hash, signed.hash);
                }
                Ok(hash)
            }
            Ok(Err(SubmitError::AlreadyKnown)) => {
                debug!("Node already knows {:?}", signed.hash);
                Ok(signed.hash)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(SubmitError::Timeout {
                operation: "send_raw_transaction".to_string(),
            }),
        }
    }

    /// Replace `previous` with a copy at bumped fees, same nonce.
    ///
    /// Both fee fields rise by `percent` (capped). Fails with `GasCapReached`
    /// when the cap leaves no room. The replacement is sent under
    /// `replacement_request_id` so the original record stays untouched.
    #[allow(clippy::too_many_arguments)]
    pub async fn bump_and_retry(
        &self,
        signer: &dyn TransactionSigner,
        policy: &GasPolicy,
        previous: &SignedTransaction,
        percent: u64,
        replacement_request_id: &str,
        max_retries: u32,
        base_backoff: Duration,
    ) -> SubmitResult<Replacement> {
        let current = fees_of(&previous.tx).ok_or_else(|| {
            SubmitError::Internal("only EIP-1559 transactions can be replaced".into())
        })?;
        let quote = policy.bump_quote(&current, percent)?;

        let tx = with_fees(&previous.tx, &quote);
        let signed = signer.sign(&tx).await?;
        info!(
            "Replacing {:?} (nonce {:?}): max fee {} -> {}",
            previous.hash,
            previous.nonce(),
            current.max_fee_per_gas,
            quote.max_fee_per_gas
        );

        let outcome = self
            .send_with_retry(&signed, replacement_request_id, max_retries, base_backoff)
            .await?;
        crate::metrics::record_tx_replaced(self.chain.chain_id());

        Ok(Replacement {
            signed,
            quote,
            outcome,
        })
    }

    /// Check the receipt once and advance the intent.
    ///
    /// Returns the status after the check. A revert marks the intent FAILED
    /// and returns `Reverted` with the decoded reason when available.
    pub async fn confirm(&self, request_id: &str) -> SubmitResult<IntentStatus> {
        let intent = self
            .intents
            .get(request_id)
            .await?
            .ok_or_else(|| SubmitError::IntentNotFound {
                request_id: request_id.to_string(),
            })?;

        if intent.status.is_terminal() {
            return Ok(intent.status);
        }
        let tx_hash = intent.tx_hash.ok_or_else(|| SubmitError::InvalidStateTransition {
            from: intent.status.to_string(),
            to: IntentStatus::Confirmed.to_string(),
        })?;

        let chain_id = self.chain.chain_id();
        match self.chain.transaction_receipt(tx_hash).await? {
            None => Ok(IntentStatus::Sent),
            Some(receipt) if receipt.success => {
                self.intents.mark_confirmed(request_id).await?;
                info!(
                    "Request {} confirmed in block {} ({:?})",
                    request_id, receipt.block_number, tx_hash
                );
                crate::metrics::record_tx_confirmed(chain_id);
                Ok(IntentStatus::Confirmed)
            }
            Some(receipt) => {
                let reason = match self.chain.revert_reason(tx_hash).await {
                    Ok(reason) => reason,
                    Err(e) => {
                        debug!("Revert reason lookup for {:?} failed: {}", tx_hash, e);
                        None
                    }
                };
                let err = SubmitError::Reverted {
                    tx_hash: Some(tx_hash),
                    reason,
                };
                warn!(
                    "Request {} reverted in block {}: {}",
                    request_id, receipt.block_number, err
                );
                self.intents.mark_failed(request_id, &err.to_string()).await?;
                crate::metrics::record_tx_failed(chain_id, failure_label(&err));
                Err(err)
            }
        }
    }

    /// Poll [`confirm`](Self::confirm) until the intent leaves SENT
    pub async fn wait_for_confirmation(&self, request_id: &str) -> SubmitResult<IntentStatus> {
        let deadline = Instant::now() + self.receipt_timeout;

        loop {
            let status = self.confirm(request_id).await?;
            if status != IntentStatus::Sent {
                return Ok(status);
            }
            if Instant::now() >= deadline {
                return Err(SubmitError::Timeout {
                    operation: format!("receipt for request {}", request_id),
                });
            }
            tokio::time::sleep(self.receipt_poll_interval).await;
        }
    }
}

/// base × 2^(attempt-1), plus up to half of base as jitter
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(10);
    let delay = base.saturating_mul(1u32 << exp);
    let jitter_ms = (base.as_millis() as u64) / 2;
    let jitter = if jitter_ms > 0 {
        Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    } else {
        Duration::ZERO
    };
    delay + jitter
}

fn failure_label(err: &SubmitError) -> &'static str {
    match err {
        SubmitError::Reverted { .. } => "reverted",
        SubmitError::NonceTooLow(_) => "nonce_too_low",
        SubmitError::InsufficientFunds(_) => "insufficient_funds",
        SubmitError::Rejected(_) => "rejected",
        SubmitError::Timeout { .. } => "timeout",
        SubmitError::TransientRpc { .. } => "transient",
        _ => "other",
    }
}
