//! Signer module - one address, one backend, fixed at construction
//!
//! Two backends are supported:
//! - `local`: a secp256k1 key held in process memory
//! - `remote`: a key that never leaves a KMS; only digests are sent out

mod local;
mod remote;

pub use local::LocalKeySigner;
pub use remote::{AwsKmsClient, KmsClient, RemoteKmsSigner};

use crate::chain::ChainClient;
use crate::config::{SignerBackend, SignerConfig};
use crate::error::{SubmitError, SubmitResult};

use async_trait::async_trait;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, H256};
use ethers::utils::keccak256;
use ethers::utils::rlp::Rlp;
use std::sync::Arc;
use tracing::info;

/// A signed transaction ready for `eth_sendRawTransaction`
#[derive(Debug, Clone)]
pub struct SignedTransaction {
    /// The unsigned form, kept so a replacement can be built from it
    pub tx: TypedTransaction,
    pub raw: Bytes,
    pub hash: H256,
}

impl SignedTransaction {
    pub fn new(tx: TypedTransaction, raw: Bytes) -> Self {
        let hash = H256::from(keccak256(&raw));
        Self { tx, raw, hash }
    }

    /// Rebuild from stored raw bytes
    pub fn from_raw(raw: Bytes) -> SubmitResult<Self> {
        let (tx, _) = TypedTransaction::decode_signed(&Rlp::new(&raw))
            .map_err(|e| SubmitError::Internal(format!("stored payload does not decode: {}", e)))?;
        Ok(Self::new(tx, raw))
    }

    pub fn nonce(&self) -> Option<u64> {
        self.tx.nonce().map(|n| n.as_u64())
    }
}

#[async_trait]
pub trait TransactionSigner: Send + Sync {
    /// Signing address; never changes after construction
    fn address(&self) -> Address;

    /// Backend name for logs and the API
    fn backend(&self) -> &'static str;

    async fn sign(&self, tx: &TypedTransaction) -> SubmitResult<SignedTransaction>;

    /// Sign and submit in one step, without idempotency tracking
    async fn sign_and_send(
        &self,
        tx: &TypedTransaction,
        chain: &dyn ChainClient,
    ) -> SubmitResult<H256> {
        let signed = self.sign(tx).await?;
        match chain.send_raw_transaction(signed.raw.clone()).await {
            Err(SubmitError::AlreadyKnown) => Ok(signed.hash),
            other => other,
        }
    }
}

/// The configured signer
pub enum AnySigner {
    Local(LocalKeySigner),
    Remote(RemoteKmsSigner),
}

#[async_trait]
impl TransactionSigner for AnySigner {
    fn address(&self) -> Address {
        match self {
            AnySigner::Local(s) => s.address(),
            AnySigner::Remote(s) => s.address(),
        }
    }

    fn backend(&self) -> &'static str {
        match self {
            AnySigner::Local(s) => s.backend(),
            AnySigner::Remote(s) => s.backend(),
        }
    }

    async fn sign(&self, tx: &TypedTransaction) -> SubmitResult<SignedTransaction> {
        match self {
            AnySigner::Local(s) => s.sign(tx).await,
            AnySigner::Remote(s) => s.sign(tx).await,
        }
    }
}

/// Build the signer named by `config`.
///
/// Fails with a configuration error when key material or the remote key id
/// is missing, and with a signing error when the remote public key cannot be
/// fetched.
pub async fn from_config(config: &SignerConfig, chain_id: u64) -> SubmitResult<AnySigner> {
    let signer = match config.backend {
        SignerBackend::Local => {
            let key = config.local_key_material().ok_or_else(|| {
                SubmitError::Config(
                    "local signer requires signer.private_key or signer.private_key_env".into(),
                )
            })?;
            AnySigner::Local(LocalKeySigner::from_hex(&key, chain_id)?)
        }
        SignerBackend::Remote => {
            let (key_id, region) = config.remote_key().ok_or_else(|| {
                SubmitError::Config(
                    "remote signer requires signer.kms_key_id and signer.kms_region".into(),
                )
            })?;
            let client = Arc::new(AwsKmsClient::new(region)?);
            AnySigner::Remote(RemoteKmsSigner::connect(client, key_id).await?)
        }
    };

    info!(
        "Signer ready: {} backend, address {:?}",
        signer.backend(),
        signer.address()
    );
    Ok(signer)
}
