//! KMS-backed signer: the key stays remote, digests go out, signatures come back DER-encoded

use super::{SignedTransaction, TransactionSigner};
use crate::error::{SubmitError, SubmitResult};

use async_trait::async_trait;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Signature, H256, U256};
use ethers::utils::public_key_to_address;
use k256::ecdsa::{RecoveryId, Signature as K256Signature, VerifyingKey};
use k256::pkcs8::DecodePublicKey;
use rusoto_core::Region;
use rusoto_kms::{GetPublicKeyRequest, Kms, KmsClient as RusotoKmsClient, SignRequest};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

const SIGNING_ALGORITHM: &str = "ECDSA_SHA_256";
const MESSAGE_TYPE_DIGEST: &str = "DIGEST";

/// The two calls made against the key-management service
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KmsClient: Send + Sync {
    /// DER-encoded SubjectPublicKeyInfo for `key_id`
    async fn get_public_key(&self, key_id: &str) -> SubmitResult<Vec<u8>>;

    /// DER-encoded ECDSA signature over a 32-byte digest
    async fn sign_digest(&self, key_id: &str, digest: [u8; 32]) -> SubmitResult<Vec<u8>>;
}

/// AWS KMS through rusoto
pub struct AwsKmsClient {
    client: RusotoKmsClient,
}

impl AwsKmsClient {
    pub fn new(region: &str) -> SubmitResult<Self> {
        let region = Region::from_str(region)
            .map_err(|e| SubmitError::Config(format!("invalid KMS region {}: {}", region, e)))?;
        Ok(Self {
            client: RusotoKmsClient::new(region),
        })
    }
}

#[async_trait]
impl KmsClient for AwsKmsClient {
    async fn get_public_key(&self, key_id: &str) -> SubmitResult<Vec<u8>> {
        let request = GetPublicKeyRequest {
            key_id: key_id.to_string(),
            ..Default::default()
        };
        let response = self
            .client
            .get_public_key(request)
            .await
            .map_err(|e| SubmitError::Signing(format!("KMS GetPublicKey failed: {}", e)))?;

        response
            .public_key
            .map(|key| key.to_vec())
            .ok_or_else(|| SubmitError::Signing("KMS returned no public key".into()))
    }

    async fn sign_digest(&self, key_id: &str, digest: [u8; 32]) -> SubmitResult<Vec<u8>> {
        let request = SignRequest {
            key_id: key_id.to_string(),
            message: bytes::Bytes::copy_from_slice(&digest),
            message_type: Some(MESSAGE_TYPE_DIGEST.to_string()),
            signing_algorithm: SIGNING_ALGORITHM.to_string(),
            ..Default::default()
        };
        let response = self
            .client
            .sign(request)
            .await
            .map_err(|e| SubmitError::Signing(format!("KMS Sign failed: {}", e)))?;

        response
            .signature
            .map(|sig| sig.to_vec())
            .ok_or_else(|| SubmitError::Signing("KMS returned no signature".into()))
    }
}

/// Signer whose address is derived once from the remote public key
pub struct RemoteKmsSigner {
    client: Arc<dyn KmsClient>,
    key_id: String,
    verifying_key: VerifyingKey,
    address: Address,
}

impl RemoteKmsSigner {
    /// Fetch the public key and bind the address
    pub async fn connect(client: Arc<dyn KmsClient>, key_id: &str) -> SubmitResult<Self> {
        let der = client.get_public_key(key_id).await?;
        let verifying_key = VerifyingKey::from_public_key_der(&der)
            .map_err(|e| SubmitError::Signing(format!("KMS key {} is not secp256k1: {}", key_id, e)))?;
        let address = public_key_to_address(&verifying_key);

        info!("Bound remote key {} to address {:?}", key_id, address);
        Ok(Self {
            client,
            key_id: key_id.to_string(),
            verifying_key,
            address,
        })
    }

    /// Turn a DER signature into an Ethereum signature with EIP-155 `v`
    fn to_eth_signature(&self, der: &[u8], digest: H256, chain_id: u64) -> SubmitResult<Signature> {
        let signature = K256Signature::from_der(der)
            .map_err(|e| SubmitError::Signing(format!("malformed KMS signature: {}", e)))?;
        // KMS does not enforce low-s; Ethereum rejects high-s.
        let signature = signature.normalize_s().unwrap_or(signature);

        let recovery_id = self.recovery_id(digest, &signature)?;
        let (r, s) = signature.split_bytes();

        Ok(Signature {
            r: U256::from_big_endian(r.as_slice()),
            s: U256::from_big_endian(s.as_slice()),
            v: recovery_id as u64 + 35 + chain_id * 2,
        })
    }

    fn recovery_id(&self, digest: H256, signature: &K256Signature) -> SubmitResult<u8> {
        for byte in 0u8..=1 {
            let Ok(recovery_id) = RecoveryId::try_from(byte) else {
                continue;
            };
            if let Ok(recovered) =
                VerifyingKey::recover_from_prehash(digest.as_bytes(), signature, recovery_id)
            {
                if recovered == self.verifying_key {
                    return Ok(byte);
                }
            }
        }
        Err(SubmitError::Signing(
            "KMS signature does not recover to the bound key".into(),
        ))
    }
}

#[async_trait]
impl TransactionSigner for RemoteKmsSigner {
    fn address(&self) -> Address {
        self.address
    }

    fn backend(&self) -> &'static str {
        "remote"
    }

    async fn sign(&self, tx: &TypedTransaction) -> SubmitResult<SignedTransaction> {
        let chain_id = tx
            .chain_id()
            .map(|id| id.as_u64())
            .ok_or_else(|| SubmitError::Signing("transaction has no chain id".into()))?;

        let mut tx = tx.clone();
        tx.set_from(self.address);
        let digest = tx.sighash();

        let der = self.client.sign_digest(&self.key_id, digest.0).await?;
        let signature = self.to_eth_signature(&der, digest, chain_id)?;
        debug!("KMS signed digest {:?} with key {}", digest, self.key_id);

        let raw = tx.rlp_signed(&signature);
        Ok(SignedTransaction::new(tx, raw))
    }
}
