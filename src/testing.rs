//! In-memory fakes for the chain and coordination seams

use crate::chain::{ChainClient, ReceiptStatus};
use crate::config::{GasConfig, SenderConfig};
use crate::error::{SubmitError, SubmitResult};
use crate::nonce::{CoordinationBackend, InProcessNonceStore, NonceManager};
use crate::signer::{LocalKeySigner, SignedTransaction, TransactionSigner};
use crate::state::{ClaimedPayload, IntentStore, MemoryIntentStore, TransactionIntent};
use crate::tx::{GasPolicy, TransactionPipeline, TransactionSender, TxBuilder};

use async_trait::async_trait;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, Eip1559TransactionRequest, H256, U256};
use ethers::utils::keccak256;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// How a scripted submission fails
#[derive(Debug, Clone, Copy)]
pub enum SendFailure {
    Transient,
    AlreadyKnown,
    NonceTooLow,
    Underpriced,
}

impl SendFailure {
    fn to_error(self, chain_id: u64) -> SubmitError {
        match self {
            SendFailure::Transient => SubmitError::TransientRpc {
                chain_id,
                message: "429 Too Many Requests".to_string(),
            },
            SendFailure::AlreadyKnown => SubmitError::AlreadyKnown,
            SendFailure::NonceTooLow => SubmitError::NonceTooLow("nonce too low".to_string()),
            SendFailure::Underpriced => {
                SubmitError::Rejected("replacement transaction underpriced".to_string())
            }
        }
    }
}

pub struct FakeChain {
    chain_id: u64,
    pending: Mutex<HashMap<Address, u64>>,
    fail_pending: AtomicBool,
    base_fee: Mutex<Option<U256>>,
    gas_price: Mutex<U256>,
    fail_fee_reads: AtomicBool,
    gas_estimate: Mutex<Option<U256>>,
    scripted_failures: Mutex<VecDeque<SendFailure>>,
    always_fail: Mutex<Option<SendFailure>>,
    send_calls: AtomicUsize,
    sent: Mutex<Vec<Bytes>>,
    receipts: Mutex<HashMap<H256, ReceiptStatus>>,
    revert_reasons: Mutex<HashMap<H256, String>>,
    pending_delay: Mutex<Duration>,
    send_delay: Mutex<Duration>,
}

impl FakeChain {
    pub fn new(chain_id: u64) -> Self {
        Self {
            chain_id,
            pending: Mutex::new(HashMap::new()),
            fail_pending: AtomicBool::new(false),
            base_fee: Mutex::new(Some(U256::from(1_000_000_000u64))),
            gas_price: Mutex::new(U256::from(1_000_000_000u64)),
            fail_fee_reads: AtomicBool::new(false),
            gas_estimate: Mutex::new(Some(U256::from(21_000u64))),
            scripted_failures: Mutex::new(VecDeque::new()),
            always_fail: Mutex::new(None),
            send_calls: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
            receipts: Mutex::new(HashMap::new()),
            revert_reasons: Mutex::new(HashMap::new()),
            pending_delay: Mutex::new(Duration::ZERO),
            send_delay: Mutex::new(Duration::ZERO),
        }
    }

    /// Latency added to every pending-nonce read
    pub fn set_pending_delay(&self, delay: Duration) {
        *self.pending_delay.lock().unwrap() = delay;
    }

    /// Latency added to every submission
    pub fn set_send_delay(&self, delay: Duration) {
        *self.send_delay.lock().unwrap() = delay;
    }

    pub fn set_pending_nonce(&self, address: Address, nonce: u64) {
        self.pending.lock().unwrap().insert(address, nonce);
    }

    pub fn fail_pending_nonce(&self, fail: bool) {
        self.fail_pending.store(fail, Ordering::SeqCst);
    }

    pub fn set_base_fee(&self, base_fee: Option<U256>) {
        *self.base_fee.lock().unwrap() = base_fee;
    }

    pub fn set_gas_price(&self, price: U256) {
        *self.gas_price.lock().unwrap() = price;
    }

    pub fn fail_fee_reads(&self, fail: bool) {
        self.fail_fee_reads.store(fail, Ordering::SeqCst);
    }

    /// `None` makes estimation fail
    pub fn set_gas_estimate(&self, estimate: Option<U256>) {
        *self.gas_estimate.lock().unwrap() = estimate;
    }

    /// Fail the next submissions in order, then succeed
    pub fn script_send_failures(&self, failures: impl IntoIterator<Item = SendFailure>) {
        self.scripted_failures.lock().unwrap().extend(failures);
    }

    pub fn fail_all_sends(&self, failure: Option<SendFailure>) {
        *self.always_fail.lock().unwrap() = failure;
    }

    pub fn send_calls(&self) -> usize {
        self.send_calls.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().unwrap().clone()
    }

    pub fn set_receipt(&self, tx_hash: H256, block_number: u64, success: bool) {
        self.receipts.lock().unwrap().insert(
            tx_hash,
            ReceiptStatus {
                block_number,
                success,
            },
        );
    }

    pub fn set_revert_reason(&self, tx_hash: H256, reason: &str) {
        self.revert_reasons
            .lock()
            .unwrap()
            .insert(tx_hash, reason.to_string());
    }

    fn transient(&self, what: &str) -> SubmitError {
        SubmitError::TransientRpc {
            chain_id: self.chain_id,
            message: format!("{} unavailable", what),
        }
    }
}

#[async_trait]
impl ChainClient for FakeChain {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn pending_nonce(&self, address: Address) -> SubmitResult<u64> {
        let delay = *self.pending_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_pending.load(Ordering::SeqCst) {
            return Err(self.transient("eth_getTransactionCount"));
        }
        Ok(self
            .pending
            .lock()
            .unwrap()
            .get(&address)
            .copied()
            .unwrap_or(0))
    }

    async fn latest_base_fee(&self) -> SubmitResult<Option<U256>> {
        if self.fail_fee_reads.load(Ordering::SeqCst) {
            return Err(self.transient("eth_getBlockByNumber"));
        }
        Ok(*self.base_fee.lock().unwrap())
    }

    async fn gas_price(&self) -> SubmitResult<U256> {
        if self.fail_fee_reads.load(Ordering::SeqCst) {
            return Err(self.transient("eth_gasPrice"));
        }
        Ok(*self.gas_price.lock().unwrap())
    }

    async fn estimate_gas(&self, _tx: &TypedTransaction) -> SubmitResult<U256> {
        self.gas_estimate
            .lock()
            .unwrap()
            .ok_or_else(|| self.transient("eth_estimateGas"))
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> SubmitResult<H256> {
        self.send_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.send_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if let Some(failure) = *self.always_fail.lock().unwrap() {
            return Err(failure.to_error(self.chain_id));
        }
        if let Some(failure) = self.scripted_failures.lock().unwrap().pop_front() {
            return Err(failure.to_error(self.chain_id));
        }

        let hash = H256::from(keccak256(&raw));
        self.sent.lock().unwrap().push(raw);
        Ok(hash)
    }

    async fn transaction_receipt(&self, tx_hash: H256) -> SubmitResult<Option<ReceiptStatus>> {
        Ok(self.receipts.lock().unwrap().get(&tx_hash).copied())
    }

    async fn revert_reason(&self, tx_hash: H256) -> SubmitResult<Option<String>> {
        Ok(self.revert_reasons.lock().unwrap().get(&tx_hash).cloned())
    }

    async fn health_check(&self) -> bool {
        true
    }
}

/// Lock/cache service held in memory, with an outage switch
pub struct MemoryBackend {
    values: Mutex<HashMap<String, (u64, Instant)>>,
    locks: Mutex<HashMap<String, (String, Instant)>>,
    available: AtomicBool,
    hanging: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            values: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            hanging: AtomicBool::new(false),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Accept connections but never answer
    pub fn set_hanging(&self, hanging: bool) {
        self.hanging.store(hanging, Ordering::SeqCst);
    }

    pub fn is_locked(&self, lock: &str) -> bool {
        self.locks
            .lock()
            .unwrap()
            .get(lock)
            .map(|(_, expires)| *expires > Instant::now())
            .unwrap_or(false)
    }

    async fn check(&self) -> SubmitResult<()> {
        if self.hanging.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SubmitError::StoreUnavailable("connection refused".to_string()))
        }
    }
}

#[async_trait]
impl CoordinationBackend for MemoryBackend {
    async fn get_u64(&self, key: &str) -> SubmitResult<Option<u64>> {
        self.check().await?;
        let values = self.values.lock().unwrap();
        Ok(values
            .get(key)
            .filter(|(_, expires)| *expires > Instant::now())
            .map(|(value, _)| *value))
    }

    async fn set_u64_with_expiry(&self, key: &str, value: u64, ttl: Duration) -> SubmitResult<()> {
        self.check().await?;
        self.values
            .lock()
            .unwrap()
            .insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn try_acquire(&self, lock: &str, token: &str, hold: Duration) -> SubmitResult<bool> {
        self.check().await?;
        let mut locks = self.locks.lock().unwrap();
        let now = Instant::now();
        match locks.get(lock) {
            Some((_, expires)) if *expires > now => Ok(false),
            _ => {
                locks.insert(lock.to_string(), (token.to_string(), now + hold));
                Ok(true)
            }
        }
    }

    async fn release(&self, lock: &str, token: &str) -> SubmitResult<bool> {
        self.check().await?;
        let mut locks = self.locks.lock().unwrap();
        match locks.get(lock) {
            Some((holder, _)) if holder == token => {
                locks.remove(lock);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ping(&self) -> SubmitResult<()> {
        self.check().await
    }
}

/// Well-known development key (address 0xf39f...2266)
pub const TEST_PRIVATE_KEY: &str =
    "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

pub fn test_signer() -> LocalKeySigner {
    LocalKeySigner::from_hex(TEST_PRIVATE_KEY, 1).unwrap()
}

/// A signed chain-1 transfer at `nonce` with 3.6 / 2 Gwei fees
pub async fn signed_tx(nonce: u64) -> SignedTransaction {
    let signer = test_signer();
    let tx: TypedTransaction = Eip1559TransactionRequest::new()
        .from(signer.address())
        .to(Address::repeat_byte(0x11))
        .value(U256::from(1u64))
        .nonce(nonce)
        .gas(21_000u64)
        .chain_id(1u64)
        .max_fee_per_gas(U256::from(3_600_000_000u64))
        .max_priority_fee_per_gas(U256::from(2_000_000_000u64))
        .into();
    signer.sign(&tx).await.unwrap()
}

/// Pipeline over `chain` with an in-process nonce store, an in-memory intent
/// store, one retry and a 1 ms backoff
pub fn test_pipeline(
    chain: Arc<FakeChain>,
    signer: Arc<dyn TransactionSigner>,
) -> TransactionPipeline {
    test_pipeline_with_intents(chain, signer, Arc::new(MemoryIntentStore::new()))
}

pub fn test_pipeline_with_intents(
    chain: Arc<FakeChain>,
    signer: Arc<dyn TransactionSigner>,
    intents: Arc<dyn IntentStore>,
) -> TransactionPipeline {
    let config = SenderConfig {
        max_retries: 1,
        base_backoff_ms: 1,
        ..SenderConfig::default()
    };
    let nonces = Arc::new(NonceManager::new(Arc::new(InProcessNonceStore::with_chain(
        chain.clone(),
    ))));
    let gas = Arc::new(GasPolicy::new(chain.clone(), &GasConfig::default()));
    let builder = TxBuilder::new(chain.clone(), &config);
    let sender = Arc::new(TransactionSender::new(chain, intents.clone(), &config));

    TransactionPipeline::new(nonces, gas, builder, signer, sender, intents, &config)
}

/// Intent store whose hash write can be made to fail
#[derive(Default)]
pub struct FlakyIntentStore {
    inner: MemoryIntentStore,
    failing_record_sent: AtomicUsize,
}

impl FlakyIntentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` calls to `record_sent`
    pub fn fail_record_sent(&self, times: usize) {
        self.failing_record_sent.store(times, Ordering::SeqCst);
    }
}

#[async_trait]
impl IntentStore for FlakyIntentStore {
    async fn begin(&self, request_id: &str) -> SubmitResult<TransactionIntent> {
        self.inner.begin(request_id).await
    }

    async fn get(&self, request_id: &str) -> SubmitResult<Option<TransactionIntent>> {
        self.inner.get(request_id).await
    }

    async fn claim(&self, request_id: &str, payload: ClaimedPayload) -> SubmitResult<ClaimedPayload> {
        self.inner.claim(request_id, payload).await
    }

    async fn record_sent(&self, request_id: &str, tx_hash: H256, nonce: u64) -> SubmitResult<H256> {
        let failing = self
            .failing_record_sent
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SubmitError::Internal("db write failed".to_string()));
        }
        self.inner.record_sent(request_id, tx_hash, nonce).await
    }

    async fn record_attempt(&self, request_id: &str, error: &str) -> SubmitResult<()> {
        self.inner.record_attempt(request_id, error).await
    }

    async fn mark_confirmed(&self, request_id: &str) -> SubmitResult<()> {
        self.inner.mark_confirmed(request_id).await
    }

    async fn mark_failed(&self, request_id: &str, reason: &str) -> SubmitResult<()> {
        self.inner.mark_failed(request_id, reason).await
    }

    async fn health_check(&self) -> SubmitResult<()> {
        self.inner.health_check().await
    }
}
