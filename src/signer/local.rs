use super::{SignedTransaction, TransactionSigner};
use crate::error::{SubmitError, SubmitResult};

use async_trait::async_trait;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::Address;
use std::str::FromStr;

/// Signs with a key held in process memory
pub struct LocalKeySigner {
    wallet: LocalWallet,
}

impl LocalKeySigner {
    /// Parse a hex private key, with or without `0x`
    pub fn from_hex(key: &str, chain_id: u64) -> SubmitResult<Self> {
        let wallet = LocalWallet::from_str(key.trim())
            .map_err(|_| SubmitError::Config("invalid local private key".into()))?
            .with_chain_id(chain_id);
        Ok(Self { wallet })
    }
}

#[async_trait]
impl TransactionSigner for LocalKeySigner {
    fn address(&self) -> Address {
        self.wallet.address()
    }

    fn backend(&self) -> &'static str {
        "local"
    }

    async fn sign(&self, tx: &TypedTransaction) -> SubmitResult<SignedTransaction> {
        let mut tx = tx.clone();
        if tx.chain_id().is_none() {
            tx.set_chain_id(self.wallet.chain_id());
        }

        let signature = self
            .wallet
            .sign_transaction(&tx)
            .await
            .map_err(|e| SubmitError::Signing(e.to_string()))?;
        let raw = tx.rlp_signed(&signature);
        Ok(SignedTransaction::new(tx, raw))
    }
}
