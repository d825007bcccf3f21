//! Submission pipeline: reserve → quote → build → sign → send

use super::builder::{fees_of, CallParams, TxBuilder};
use super::gas::{GasPolicy, GasQuote};
use super::sender::{Replacement, SendOutcome, TransactionSender};
use crate::config::SenderConfig;
use crate::error::{SubmitError, SubmitResult};
use crate::nonce::{NonceManager, StoreKind};
use crate::signer::{SignedTransaction, TransactionSigner};
use crate::state::{ClaimedPayload, IntentStatus, IntentStore};

use dashmap::DashMap;
use ethers::types::Address;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// What a pipeline run produced
#[derive(Debug, Clone, Serialize)]
pub struct Submission {
    pub request_id: String,
    #[serde(flatten)]
    pub outcome: SendOutcome,
    /// Set when this call reserved the nonce
    pub nonce: Option<u64>,
    pub quote: Option<GasQuote>,
}

pub struct TransactionPipeline {
    nonces: Arc<NonceManager>,
    gas: Arc<GasPolicy>,
    builder: TxBuilder,
    signer: Arc<dyn TransactionSigner>,
    sender: Arc<TransactionSender>,
    intents: Arc<dyn IntentStore>,
    in_flight: DashMap<String, Arc<Mutex<()>>>,
    /// Payloads this process signed and got accepted, kept for replacement
    payloads: DashMap<String, SignedTransaction>,
    max_retries: u32,
    base_backoff: Duration,
}

impl TransactionPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        nonces: Arc<NonceManager>,
        gas: Arc<GasPolicy>,
        builder: TxBuilder,
        signer: Arc<dyn TransactionSigner>,
        sender: Arc<TransactionSender>,
        intents: Arc<dyn IntentStore>,
        config: &SenderConfig,
    ) -> Self {
        Self {
            nonces,
            gas,
            builder,
            signer,
            sender,
            intents,
            in_flight: DashMap::new(),
            payloads: DashMap::new(),
            max_retries: config.max_retries,
            base_backoff: config.base_backoff(),
        }
    }

    pub fn signer_address(&self) -> Address {
        self.signer.address()
    }

    pub fn signer_backend(&self) -> &'static str {
        self.signer.backend()
    }

    pub fn nonce_store(&self) -> StoreKind {
        self.nonces.active_store()
    }

    pub fn intents(&self) -> &Arc<dyn IntentStore> {
        &self.intents
    }

    /// Run the whole submission for `request_id`.
    ///
    /// A request id that already has a hash is answered from the record
    /// without reserving a nonce. When a step fails before anything reaches
    /// the node, the reserved nonce is released.
    pub async fn submit(&self, request_id: &str, call: &CallParams) -> SubmitResult<Submission> {
        let lock = self
            .in_flight
            .entry(request_id.to_string())
            .or_default()
            .clone();

        let result = {
            let _guard = lock.lock().await;
            self.submit_locked(request_id, call).await
        };

        drop(lock);
        self.in_flight
            .remove_if(request_id, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    async fn submit_locked(&self, request_id: &str, call: &CallParams) -> SubmitResult<Submission> {
        if let Some(intent) = self.intents.get(request_id).await? {
            if let Some(hash) = intent.tx_hash {
                crate::metrics::record_tx_replayed(self.builder.chain_id());
                return Ok(Submission {
                    request_id: request_id.to_string(),
                    outcome: SendOutcome::AlreadySent(hash),
                    nonce: intent.nonce,
                    quote: None,
                });
            }
            if intent.status == IntentStatus::Failed {
                return Err(SubmitError::IntentClosed {
                    request_id: request_id.to_string(),
                    status: intent.status.to_string(),
                });
            }
            if let Some(payload) = intent.payload {
                return self.resume(request_id, payload).await;
            }
        }

        let from = self.signer.address();
        let reservation = self.nonces.reserve(from).await?;
        let nonce = reservation.nonce;

        let quote = self.gas.quote().await;
        let tx = self.builder.build(from, call, nonce, &quote).await;

        let signed = match self.signer.sign(&tx).await {
            Ok(signed) => signed,
            Err(e) => {
                warn!("Signing for request {} failed: {}", request_id, e);
                self.nonces.release(from, nonce).await;
                return Err(e);
            }
        };

        let outcome = self
            .sender
            .send_with_retry(&signed, request_id, self.max_retries, self.base_backoff)
            .await?;

        if outcome.is_replay() {
            // Another process recorded this id first; our transaction never went out.
            self.nonces.release(from, nonce).await;
        } else {
            self.payloads.insert(request_id.to_string(), signed);
        }

        info!(
            "Request {} -> {:?} (nonce {}, store {})",
            request_id,
            outcome.tx_hash(),
            nonce,
            reservation.store
        );

        Ok(Submission {
            request_id: request_id.to_string(),
            outcome,
            nonce: Some(nonce),
            quote: Some(quote),
        })
    }

    /// Resend a payload that was claimed but never recorded. Its nonce was
    /// reserved by the run that claimed it, so nothing is reserved or signed.
    async fn resume(&self, request_id: &str, payload: ClaimedPayload) -> SubmitResult<Submission> {
        let signed = SignedTransaction::from_raw(payload.raw)?;
        warn!(
            "Request {} has unrecorded payload {:?} (nonce {}), resending it",
            request_id, signed.hash, payload.nonce
        );

        let outcome = self
            .sender
            .send_with_retry(&signed, request_id, self.max_retries, self.base_backoff)
            .await?;

        let quote = fees_of(&signed.tx);
        if !outcome.is_replay() {
            self.payloads.insert(request_id.to_string(), signed);
        }

        Ok(Submission {
            request_id: request_id.to_string(),
            outcome,
            nonce: Some(payload.nonce),
            quote,
        })
    }

    /// Re-send the payload behind `request_id` at bumped fees under
    /// `replacement_request_id`, keeping its nonce.
    ///
    /// Only payloads signed by this process can be replaced.
    pub async fn replace(
        &self,
        request_id: &str,
        replacement_request_id: &str,
    ) -> SubmitResult<Replacement> {
        let previous = self
            .payloads
            .get(request_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| SubmitError::IntentNotFound {
                request_id: request_id.to_string(),
            })?;

        let replacement = self
            .sender
            .bump_and_retry(
                self.signer.as_ref(),
                &self.gas,
                &previous,
                self.gas.bump_percent(),
                replacement_request_id,
                self.max_retries,
                self.base_backoff,
            )
            .await?;

        if !replacement.outcome.is_replay() {
            self.payloads
                .insert(replacement_request_id.to_string(), replacement.signed.clone());
        }
        Ok(replacement)
    }

    /// Check the receipt for `request_id`, polling until it leaves SENT when `wait` is set
    pub async fn confirm(&self, request_id: &str, wait: bool) -> SubmitResult<IntentStatus> {
        let status = if wait {
            self.sender.wait_for_confirmation(request_id).await?
        } else {
            self.sender.confirm(request_id).await?
        };

        if status.is_terminal() {
            self.payloads.remove(request_id);
        }
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        test_pipeline as pipeline, test_pipeline_with_intents, test_signer, FakeChain,
        FlakyIntentStore, SendFailure,
    };
    use async_trait::async_trait;
    use ethers::types::transaction::eip2718::TypedTransaction;
    use ethers::types::{Bytes, H256, U256};
    use ethers::utils::keccak256;
    use ethers::utils::rlp::Rlp;

    struct RefusingSigner(Address);

    #[async_trait]
    impl TransactionSigner for RefusingSigner {
        fn address(&self) -> Address {
            self.0
        }

        fn backend(&self) -> &'static str {
            "refusing"
        }

        async fn sign(&self, _tx: &TypedTransaction) -> SubmitResult<SignedTransaction> {
            Err(SubmitError::Signing("KMS throttled".into()))
        }
    }

    fn call() -> CallParams {
        CallParams {
            to: Address::repeat_byte(0x22),
            data: Bytes::from(vec![0xde, 0xad]),
            value: U256::zero(),
        }
    }

    #[tokio::test]
    async fn test_submit_runs_every_step() {
        let chain = Arc::new(FakeChain::new(1));
        let signer = Arc::new(test_signer());
        chain.set_pending_nonce(signer.address(), 4);
        let pipeline = pipeline(chain.clone(), signer.clone());

        let submission = pipeline.submit("req-1", &call()).await.unwrap();

        assert_eq!(submission.nonce, Some(4));
        assert!(!submission.outcome.is_replay());
        let quote = submission.quote.unwrap();
        assert_eq!(quote.max_fee_per_gas, U256::from(3_600_000_000u64));

        let sent = chain.sent();
        assert_eq!(sent.len(), 1);
        let (tx, sig) = TypedTransaction::decode_signed(&Rlp::new(&sent[0])).unwrap();
        assert_eq!(tx.nonce(), Some(&U256::from(4u64)));
        assert_eq!(tx.gas(), Some(&U256::from(25_200u64)));
        assert_eq!(sig.recover(tx.sighash()).unwrap(), signer.address());
    }

    #[tokio::test]
    async fn test_duplicate_request_does_not_reserve() {
        let chain = Arc::new(FakeChain::new(1));
        let signer = Arc::new(test_signer());
        let pipeline = pipeline(chain.clone(), signer);

        let first = pipeline.submit("req-1", &call()).await.unwrap();
        let again = pipeline.submit("req-1", &call()).await.unwrap();
        let next = pipeline.submit("req-2", &call()).await.unwrap();

        assert_eq!(again.outcome, SendOutcome::AlreadySent(first.outcome.tx_hash()));
        assert_eq!(again.nonce, Some(0));
        assert_eq!(next.nonce, Some(1));
        assert_eq!(chain.send_calls(), 2);
    }

    #[tokio::test]
    async fn test_signing_failure_releases_nonce() {
        let chain = Arc::new(FakeChain::new(1));
        let address = test_signer().address();
        chain.set_pending_nonce(address, 9);

        let refusing = pipeline(chain.clone(), Arc::new(RefusingSigner(address)));
        let err = refusing.submit("req-1", &call()).await.unwrap_err();
        assert!(matches!(err, SubmitError::Signing(_)));
        assert_eq!(chain.send_calls(), 0);

        // Same store instance, so the rewind is visible to the next reservation.
        let nonce = refusing.nonces.reserve(address).await.unwrap().nonce;
        assert_eq!(nonce, 9);
    }

    #[tokio::test]
    async fn test_send_failure_keeps_nonce_consumed() {
        let chain = Arc::new(FakeChain::new(1));
        let signer = Arc::new(test_signer());
        let pipeline = pipeline(chain.clone(), signer.clone());

        chain.fail_all_sends(Some(SendFailure::Transient));
        assert!(pipeline.submit("req-1", &call()).await.is_err());
        assert_eq!(chain.send_calls(), 2);

        chain.fail_all_sends(None);
        let next = pipeline.submit("req-2", &call()).await.unwrap();
        assert_eq!(next.nonce, Some(1));

        let closed = pipeline.submit("req-1", &call()).await.unwrap_err();
        assert!(matches!(closed, SubmitError::IntentClosed { .. }));
    }

    #[tokio::test]
    async fn test_unrecorded_send_is_resent_not_rebuilt() {
        let chain = Arc::new(FakeChain::new(1));
        let signer = Arc::new(test_signer());
        let intents = Arc::new(FlakyIntentStore::new());
        let pipeline = test_pipeline_with_intents(chain.clone(), signer, intents.clone());

        intents.fail_record_sent(1);
        let err = pipeline.submit("req-1", &call()).await.unwrap_err();
        assert!(matches!(err, SubmitError::Internal(_)));

        // Gas moved in between; the retry must still carry the first bytes.
        chain.set_gas_estimate(Some(U256::from(90_000u64)));
        let retried = pipeline.submit("req-1", &call()).await.unwrap();

        let sent = chain.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], sent[1]);
        assert_eq!(retried.nonce, Some(0));
        assert_eq!(
            retried.outcome,
            SendOutcome::Sent(H256::from(keccak256(&sent[0])))
        );

        let record = pipeline.intents().get("req-1").await.unwrap().unwrap();
        assert_eq!(record.tx_hash, Some(retried.outcome.tx_hash()));

        let next = pipeline.submit("req-2", &call()).await.unwrap();
        assert_eq!(next.nonce, Some(1));
    }

    #[tokio::test]
    async fn test_replace_keeps_nonce_and_raises_fees() {
        let chain = Arc::new(FakeChain::new(1));
        let signer = Arc::new(test_signer());
        chain.set_pending_nonce(signer.address(), 3);
        let pipeline = pipeline(chain.clone(), signer.clone());

        let first = pipeline.submit("req-1", &call()).await.unwrap();
        let replacement = pipeline.replace("req-1", "req-1-r1").await.unwrap();

        assert_eq!(replacement.signed.nonce(), Some(3));
        assert_ne!(replacement.outcome.tx_hash(), first.outcome.tx_hash());
        assert!(replacement.quote.max_fee_per_gas > first.quote.unwrap().max_fee_per_gas);

        let sent = chain.sent();
        assert_eq!(sent.len(), 2);
        let (tx, _) = TypedTransaction::decode_signed(&Rlp::new(&sent[1])).unwrap();
        assert_eq!(tx.nonce(), Some(&U256::from(3u64)));

        let record = pipeline.intents().get("req-1-r1").await.unwrap().unwrap();
        assert_eq!(record.tx_hash, Some(replacement.outcome.tx_hash()));
    }

    #[tokio::test]
    async fn test_replace_unknown_payload() {
        let pipeline = pipeline(Arc::new(FakeChain::new(1)), Arc::new(test_signer()));
        let err = pipeline.replace("nope", "nope-r1").await.unwrap_err();
        assert!(matches!(err, SubmitError::IntentNotFound { .. }));
    }

    #[tokio::test]
    async fn test_confirm_advances_intent() {
        let chain = Arc::new(FakeChain::new(1));
        let pipeline = pipeline(chain.clone(), Arc::new(test_signer()));

        let submission = pipeline.submit("req-1", &call()).await.unwrap();
        assert_eq!(
            pipeline.confirm("req-1", false).await.unwrap(),
            IntentStatus::Sent
        );

        chain.set_receipt(submission.outcome.tx_hash(), 100, true);
        assert_eq!(
            pipeline.confirm("req-1", true).await.unwrap(),
            IntentStatus::Confirmed
        );
        assert!(pipeline.replace("req-1", "req-1-r1").await.is_err());
    }
}
